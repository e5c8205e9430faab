use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, Length};

const CHANNEL_PREFIX: &str = "practitioner_";

/// One JSON reply line.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Complete {
        tag: &'static str,
        rows: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        failed: Option<usize>,
    },
    Rows {
        rows: Vec<serde_json::Value>,
    },
    Error {
        code: &'static str,
        message: String,
    },
    Notification {
        channel: String,
        payload: String,
    },
}

impl Reply {
    fn complete(tag: &'static str, rows: usize) -> Self {
        Reply::Complete { tag, rows, failed: None }
    }

    fn rows<T: Serialize>(items: impl IntoIterator<Item = T>) -> Self {
        Reply::Rows {
            rows: items
                .into_iter()
                .map(|item| serde_json::to_value(item).unwrap_or_default())
                .collect(),
        }
    }

    fn error(code: &'static str, message: impl ToString) -> Self {
        Reply::Error { code, message: message.to_string() }
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","code":"XX000","message":"reply encoding failed"}"#.into())
    }
}

/// SQLSTATE-style code for an engine error.
pub fn error_code(err: &EngineError) -> &'static str {
    match err {
        EngineError::InvalidRange { .. }
        | EngineError::InvalidInterval { .. }
        | EngineError::InvalidDuration(_)
        | EngineError::InvalidWindow(_) => "22023",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Conflict(_) => "23P01",
        EngineError::DateBlocked(_)
        | EngineError::OutsideWorkingHours(_)
        | EngineError::OffSlotGrid(_) => "23514",
        EngineError::HasBookings(_) => "23503",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn resolve_length(engine: &Engine, length: Length) -> Result<Minutes, EngineError> {
    match length {
        Length::Minutes(m) => Ok(m),
        Length::Services(ids) => engine.aggregate_duration(&ids),
    }
}

/// Run a data statement against the engine. LISTEN/UNLISTEN are
/// connection-scoped and handled by `Session`.
pub async fn execute(engine: &Engine, cmd: Command) -> Result<Reply, EngineError> {
    match cmd {
        Command::InsertPractitioner { id, name } => {
            engine.create_practitioner(id, name).await?;
            Ok(Reply::complete("INSERT", 1))
        }
        Command::DeletePractitioner { id } => {
            engine.delete_practitioner(id).await?;
            Ok(Reply::complete("DELETE", 1))
        }
        Command::UpsertWorkingHours { practitioner_id, window } => {
            engine.set_working_window(practitioner_id, window).await?;
            Ok(Reply::complete("INSERT", 1))
        }
        Command::DeleteWorkingHours { practitioner_id, day_of_week } => {
            engine.clear_working_window(practitioner_id, day_of_week).await?;
            Ok(Reply::complete("DELETE", 1))
        }
        Command::BlockDate { practitioner_id, day, reason } => {
            engine.block_date(practitioner_id, day, reason).await?;
            Ok(Reply::complete("INSERT", 1))
        }
        Command::BlockRange { practitioner_id, from, to, reason } => {
            let outcome = engine.block_range(practitioner_id, from, to, reason).await?;
            Ok(Reply::Complete {
                tag: "INSERT",
                rows: outcome.inserted,
                failed: Some(outcome.failed),
            })
        }
        Command::UnblockDate { practitioner_id, day } => {
            engine.unblock_date(practitioner_id, day).await?;
            Ok(Reply::complete("DELETE", 1))
        }
        Command::InsertService { id, name, duration } => {
            engine.create_service(id, name, duration).await?;
            Ok(Reply::complete("INSERT", 1))
        }
        Command::DeleteService { id } => {
            engine.remove_service(id).await?;
            Ok(Reply::complete("DELETE", 1))
        }
        Command::InsertBooking { id, practitioner_id, start, length, label } => {
            let duration = resolve_length(engine, length)?;
            engine.confirm_booking(id, practitioner_id, start, duration, label).await?;
            Ok(Reply::complete("INSERT", 1))
        }
        Command::DeleteBooking { id } => {
            engine.cancel_booking(id).await?;
            Ok(Reply::complete("DELETE", 1))
        }
        Command::SelectSlots { practitioner_id, day, length } => {
            let duration = resolve_length(engine, length)?;
            let slots = engine.available_slots(practitioner_id, day, duration).await?;
            Ok(Reply::rows(slots))
        }
        Command::SelectBookableDays { practitioner_id, from, to, length } => {
            let duration = resolve_length(engine, length)?;
            let days = engine.bookable_days(practitioner_id, from, to, duration).await?;
            Ok(Reply::rows(days.into_iter().map(|day| json!({ "day": day }))))
        }
        Command::SelectPractitioners => Ok(Reply::rows(engine.list_practitioners().await)),
        Command::SelectServices => Ok(Reply::rows(engine.list_services())),
        Command::SelectBookings { practitioner_id, day } => {
            Ok(Reply::rows(engine.get_bookings(practitioner_id, day).await?))
        }
        Command::SelectBlockedDates { practitioner_id } => {
            Ok(Reply::rows(engine.get_blocked_dates(practitioner_id).await?))
        }
        Command::SelectWorkingHours { practitioner_id } => {
            Ok(Reply::rows(engine.get_working_hours(practitioner_id).await?))
        }
        Command::Listen { .. } | Command::Unlisten { .. } | Command::UnlistenAll => Ok(Reply::error(
            "0A000",
            "LISTEN/UNLISTEN need a connection",
        )),
    }
}

fn parse_channel(channel: &str) -> Result<Ulid, Reply> {
    let id = channel.strip_prefix(CHANNEL_PREFIX).ok_or_else(|| {
        Reply::error("42000", format!("invalid channel: {channel} (expected {CHANNEL_PREFIX}{{id}})"))
    })?;
    Ulid::from_string(id).map_err(|e| Reply::error("42000", format!("bad ULID in channel: {e}")))
}

/// Per-connection state: the engine plus the channels this client listens on.
pub struct Session {
    engine: Arc<Engine>,
    outbox: mpsc::Sender<Reply>,
    listeners: HashMap<Ulid, JoinHandle<()>>,
}

impl Session {
    pub fn new(engine: Arc<Engine>, outbox: mpsc::Sender<Reply>) -> Self {
        Self {
            engine,
            outbox,
            listeners: HashMap::new(),
        }
    }

    /// Parse and run one request line.
    pub async fn handle_line(&mut self, line: &str) -> Reply {
        let cmd = match sql::parse_sql(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(QUERIES_TOTAL, "command" => "parse", "status" => "error").increment(1);
                return Reply::error("42601", e);
            }
        };

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let reply = match cmd {
            Command::Listen { channel } => self.listen(channel),
            Command::Unlisten { channel } => self.unlisten(&channel),
            Command::UnlistenAll => {
                self.unlisten_all();
                Reply::complete("UNLISTEN", 0)
            }
            cmd => execute(&self.engine, cmd)
                .await
                .unwrap_or_else(|e| Reply::error(error_code(&e), e)),
        };
        let status = if matches!(reply, Reply::Error { .. }) { "error" } else { "ok" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        reply
    }

    fn listen(&mut self, channel: String) -> Reply {
        let practitioner_id = match parse_channel(&channel) {
            Ok(id) => id,
            Err(reply) => return reply,
        };
        if self.listeners.contains_key(&practitioner_id) {
            return Reply::complete("LISTEN", 0);
        }

        let mut rx = self.engine.notify.subscribe(practitioner_id);
        let outbox = self.outbox.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Ok(payload) = serde_json::to_string(&event) else { continue };
                        let note = Reply::Notification { channel: channel.clone(), payload };
                        if outbox.send(note).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("listener on {channel} dropped {n} notifications");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.listeners.insert(practitioner_id, handle);
        Reply::complete("LISTEN", 0)
    }

    fn unlisten(&mut self, channel: &str) -> Reply {
        let practitioner_id = match parse_channel(channel) {
            Ok(id) => id,
            Err(reply) => return reply,
        };
        if let Some(handle) = self.listeners.remove(&practitioner_id) {
            handle.abort();
        }
        Reply::complete("UNLISTEN", 0)
    }

    fn unlisten_all(&mut self) {
        for (_, handle) in self.listeners.drain() {
            handle.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.unlisten_all();
    }
}

/// Serve one client until it disconnects. Replies and notifications are
/// interleaved on the same line stream.
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>) -> Result<(), LinesCodecError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (outbox, mut inbox) = mpsc::channel::<Reply>(256);
    let mut session = Session::new(engine, outbox);

    loop {
        tokio::select! {
            line = framed.next() => match line {
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let reply = session.handle_line(&line).await;
                    framed.send(reply.to_line()).await?;
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    let reply = Reply::error("54000", "line too long");
                    framed.send(reply.to_line()).await?;
                }
                Some(Err(e)) => return Err(e),
                None => break,
            },
            Some(note) = inbox.recv() => {
                framed.send(note.to_line()).await?;
            }
        }
    }
    Ok(())
}
