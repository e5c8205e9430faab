use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use ulid::Ulid;

use crate::model::{Minutes, Span};

#[derive(Debug)]
pub enum EngineError {
    /// Date range with `from > to`.
    InvalidRange { from: NaiveDate, to: NaiveDate },
    /// Interval with `start >= end`.
    InvalidInterval { start: NaiveDateTime, end: NaiveDateTime },
    /// Non-positive aggregate service duration.
    InvalidDuration(Minutes),
    InvalidWindow(&'static str),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    Conflict(Ulid),
    DateBlocked(NaiveDate),
    OutsideWorkingHours(Span),
    OffSlotGrid(NaiveTime),
    HasBookings(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRange { from, to } => {
                write!(f, "invalid range: {from} is after {to}")
            }
            EngineError::InvalidInterval { start, end } => {
                write!(f, "invalid interval: [{start}, {end}) is empty or reversed")
            }
            EngineError::InvalidDuration(m) => {
                write!(f, "invalid duration: {m} minutes (must be positive)")
            }
            EngineError::InvalidWindow(msg) => write!(f, "invalid working window: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(id) => write!(f, "conflict with booking: {id}"),
            EngineError::DateBlocked(day) => write!(f, "date is blocked: {day}"),
            EngineError::OutsideWorkingHours(span) => write!(
                f,
                "[{}, {}) is outside working hours",
                span.start, span.end
            ),
            EngineError::OffSlotGrid(t) => {
                write!(f, "{} is not on the slot grid", t.format("%H:%M"))
            }
            EngineError::HasBookings(id) => {
                write!(f, "cannot delete practitioner {id}: has bookings")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
