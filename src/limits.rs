//! Hard limits enforced by the engine and the wire layer.

pub const MAX_PRACTITIONERS: usize = 10_000;
pub const MAX_SERVICES: usize = 10_000;
pub const MAX_BOOKINGS_PER_PRACTITIONER: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LABEL_LEN: usize = 1024;
pub const MAX_REASON_LEN: usize = 1024;

/// Longest single appointment, in minutes.
pub const MAX_BOOKING_MINUTES: i64 = 24 * 60;
/// Most services that can be combined into one appointment.
pub const MAX_SERVICES_PER_BOOKING: usize = 32;

/// Longest range `block_range` will expand, in days (inclusive).
pub const MAX_BLOCK_RANGE_DAYS: i64 = 366;
/// Longest range `bookable_days` will scan, in days (inclusive).
pub const MAX_QUERY_DAYS: i64 = 93;

/// Max bytes in one request line.
pub const MAX_LINE_LEN: usize = 64 * 1024;
