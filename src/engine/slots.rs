use chrono::{Duration, NaiveDate};

use crate::model::*;

use super::EngineError;
use super::conflict::overlaps;

// ── Slot computation ─────────────────────────────────────────────

/// Candidate start times for an appointment of `duration` minutes.
///
/// Starts at `window.start` and steps by the window's slot interval. A start is
/// offered only if the whole appointment ends by `window.end`. Each slot is
/// marked unavailable when it overlaps any of `booked`. Blocked days and
/// inactive windows yield no slots. `duration` must lie in
/// `1..=MAX_BOOKING_MINUTES`.
pub fn compute_slots(
    day: NaiveDate,
    window: &WorkingWindow,
    duration: Minutes,
    booked: &[Span],
    is_blocked: bool,
) -> Result<Vec<CandidateSlot>, EngineError> {
    check_duration(duration)?;
    if window.slot_interval_minutes == 0 {
        return Err(EngineError::InvalidWindow("slot interval must be positive"));
    }
    if is_blocked || !window.is_active {
        return Ok(Vec::new());
    }

    let open = window.on(day);
    let step = Duration::minutes(window.slot_interval_minutes as Minutes);
    let length = Duration::minutes(duration);

    let mut slots = Vec::new();
    let mut cursor = open.start;
    while let Some(end) = cursor.checked_add_signed(length)
        && end <= open.end
    {
        slots.push(CandidateSlot {
            time: cursor.time(),
            available: !overlaps(cursor, end, booked),
        });
        let Some(next) = cursor.checked_add_signed(step) else { break };
        cursor = next;
    }
    Ok(slots)
}

/// Total duration of the selected services.
pub fn aggregate_duration(durations: &[Minutes]) -> Result<Minutes, EngineError> {
    let total = durations
        .iter()
        .try_fold(0 as Minutes, |acc, d| acc.checked_add(*d))
        .ok_or(EngineError::LimitExceeded("total duration overflows"))?;
    if total <= 0 {
        return Err(EngineError::InvalidDuration(total));
    }
    Ok(total)
}

/// True if `start` is one of the start times the window generates.
pub(crate) fn on_slot_grid(window: &WorkingWindow, start: chrono::NaiveTime) -> bool {
    if start < window.start {
        return false;
    }
    let step_secs = window.slot_interval_minutes as i64 * 60;
    (start - window.start).num_seconds() % step_secs == 0
}
