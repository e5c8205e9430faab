use std::net::SocketAddr;

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotkeeper_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotkeeper_query_duration_seconds";

/// Counter: bookings rejected because the span overlaps an existing booking.
pub const BOOKING_CONFLICTS_TOTAL: &str = "slotkeeper_booking_conflicts_total";

// ── Connection metrics ──────────────────────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "slotkeeper_connections_active";

pub const CONNECTIONS_TOTAL: &str = "slotkeeper_connections_total";

/// Counter: connections refused at the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotkeeper_connections_rejected_total";

// ── WAL metrics ─────────────────────────────────────────────────

/// Histogram: group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotkeeper_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotkeeper_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metric label for a statement.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertPractitioner { .. } => "insert_practitioner",
        Command::DeletePractitioner { .. } => "delete_practitioner",
        Command::UpsertWorkingHours { .. } => "upsert_working_hours",
        Command::DeleteWorkingHours { .. } => "delete_working_hours",
        Command::BlockDate { .. } => "block_date",
        Command::BlockRange { .. } => "block_range",
        Command::UnblockDate { .. } => "unblock_date",
        Command::InsertService { .. } => "insert_service",
        Command::DeleteService { .. } => "delete_service",
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectBookableDays { .. } => "select_bookable_days",
        Command::SelectPractitioners => "select_practitioners",
        Command::SelectServices => "select_services",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectBlockedDates { .. } => "select_blocked_dates",
        Command::SelectWorkingHours { .. } => "select_working_hours",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
