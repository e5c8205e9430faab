use chrono::NaiveDateTime;

use crate::model::*;

use super::EngineError;

/// True if `[start, end)` overlaps any booked interval.
///
/// Half-open: a booking ending exactly at `start`, or starting exactly at
/// `end`, does not conflict.
pub fn overlaps(start: NaiveDateTime, end: NaiveDateTime, booked: &[Span]) -> bool {
    booked.iter().any(|b| start < b.end && b.start < end)
}

/// Fails with the id of the first existing booking that overlaps `span`.
pub(crate) fn check_no_conflict(ps: &PractitionerState, span: &Span) -> Result<(), EngineError> {
    match ps.overlapping(span).next() {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}
