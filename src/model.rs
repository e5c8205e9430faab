use std::collections::BTreeMap;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::MAX_BOOKING_MINUTES;

/// Whole minutes. Durations and slot intervals use this unit.
pub type Minutes = i64;

/// Half-open interval `[start, end)` of local wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Span {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for intervals arriving from outside the engine.
    pub fn try_new(start: NaiveDateTime, end: NaiveDateTime) -> Result<Self, EngineError> {
        if start >= end {
            return Err(EngineError::InvalidInterval { start, end });
        }
        Ok(Self { start, end })
    }

    /// `[start, start + minutes)` with `minutes` in `1..=MAX_BOOKING_MINUTES`.
    pub fn try_starting_at(start: NaiveDateTime, minutes: Minutes) -> Result<Self, EngineError> {
        check_duration(minutes)?;
        let end = start
            .checked_add_signed(Duration::minutes(minutes))
            .ok_or(EngineError::LimitExceeded("booking ends past the calendar range"))?;
        Ok(Self::new(start, end))
    }

    /// The whole calendar day `[00:00, next 00:00)`. Saturates on the last
    /// representable day.
    pub fn whole_day(day: NaiveDate) -> Self {
        let start = day.and_time(NaiveTime::MIN);
        let end = start
            .checked_add_signed(Duration::days(1))
            .unwrap_or(NaiveDateTime::MAX);
        Self::new(start, end)
    }

    pub fn duration_minutes(&self) -> Minutes {
        (self.end - self.start).num_minutes()
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Appointment length must be positive and at most `MAX_BOOKING_MINUTES`.
pub fn check_duration(minutes: Minutes) -> Result<(), EngineError> {
    if minutes <= 0 {
        return Err(EngineError::InvalidDuration(minutes));
    }
    if minutes > MAX_BOOKING_MINUTES {
        return Err(EngineError::LimitExceeded("duration too long"));
    }
    Ok(())
}

/// A practitioner's hours for one weekday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingWindow {
    /// 0 = Sunday … 6 = Saturday.
    pub day_of_week: u8,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub slot_interval_minutes: u32,
    pub is_active: bool,
}

impl WorkingWindow {
    pub fn new(
        day_of_week: u8,
        start: NaiveTime,
        end: NaiveTime,
        slot_interval_minutes: u32,
        is_active: bool,
    ) -> Result<Self, EngineError> {
        let window = Self {
            day_of_week,
            start,
            end,
            slot_interval_minutes,
            is_active,
        };
        window.validate()?;
        Ok(window)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.day_of_week > 6 {
            return Err(EngineError::InvalidWindow("day_of_week must be 0-6"));
        }
        if self.start >= self.end {
            return Err(EngineError::InvalidWindow("start must be before end"));
        }
        if self.slot_interval_minutes == 0 {
            return Err(EngineError::InvalidWindow("slot interval must be positive"));
        }
        Ok(())
    }

    /// The window laid onto a concrete date.
    pub fn on(&self, day: NaiveDate) -> Span {
        Span::new(day.and_time(self.start), day.and_time(self.end))
    }
}

/// 0 = Sunday … 6 = Saturday.
pub fn day_of_week(day: NaiveDate) -> u8 {
    day.weekday().num_days_from_sunday() as u8
}

/// One selectable start time in the booking UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSlot {
    #[serde(with = "hhmm")]
    pub time: NaiveTime,
    pub available: bool,
}

/// `HH:MM` text form for times of day.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&time.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let s = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&s, FORMAT).map_err(serde::de::Error::custom)
    }
}

/// A confirmed appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub span: Span,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub duration_minutes: Minutes,
}

#[derive(Debug, Clone)]
pub struct PractitionerState {
    pub id: Ulid,
    pub name: Option<String>,
    /// Indexed by day of week, 0 = Sunday.
    pub week: [Option<WorkingWindow>; 7],
    /// Blocked calendar dates with optional reason.
    pub blocked: BTreeMap<NaiveDate, Option<String>>,
    /// Confirmed bookings, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl PractitionerState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            week: [None; 7],
            blocked: BTreeMap::new(),
            bookings: Vec::new(),
        }
    }

    pub fn window_for(&self, day: NaiveDate) -> Option<&WorkingWindow> {
        self.week[day_of_week(day) as usize].as_ref()
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    /// Return only bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// Booked intervals touching the given calendar day.
    pub fn booked_on(&self, day: NaiveDate) -> Vec<Span> {
        self.overlapping(&Span::whole_day(day)).map(|b| b.span).collect()
    }
}

/// Flat event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PractitionerCreated {
        id: Ulid,
        name: Option<String>,
    },
    PractitionerDeleted {
        id: Ulid,
    },
    WindowSet {
        practitioner_id: Ulid,
        window: WorkingWindow,
    },
    WindowCleared {
        practitioner_id: Ulid,
        day_of_week: u8,
    },
    DateBlocked {
        practitioner_id: Ulid,
        day: NaiveDate,
        reason: Option<String>,
    },
    DateUnblocked {
        practitioner_id: Ulid,
        day: NaiveDate,
    },
    ServiceCreated {
        id: Ulid,
        name: String,
        duration_minutes: Minutes,
    },
    ServiceRemoved {
        id: Ulid,
    },
    BookingConfirmed {
        id: Ulid,
        practitioner_id: Ulid,
        span: Span,
        label: Option<String>,
    },
    BookingCancelled {
        id: Ulid,
        practitioner_id: Ulid,
    },
}

impl Event {
    /// The practitioner this event belongs to, if any.
    pub fn practitioner_id(&self) -> Option<Ulid> {
        match self {
            Event::PractitionerCreated { id, .. } | Event::PractitionerDeleted { id } => Some(*id),
            Event::WindowSet { practitioner_id, .. }
            | Event::WindowCleared { practitioner_id, .. }
            | Event::DateBlocked { practitioner_id, .. }
            | Event::DateUnblocked { practitioner_id, .. }
            | Event::BookingConfirmed { practitioner_id, .. }
            | Event::BookingCancelled { practitioner_id, .. } => Some(*practitioner_id),
            Event::ServiceCreated { .. } | Event::ServiceRemoved { .. } => None,
        }
    }
}

/// Result of a bulk insert that tolerates per-row failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkOutcome {
    pub inserted: usize,
    pub failed: usize,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PractitionerInfo {
    pub id: Ulid,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingInfo {
    pub id: Ulid,
    pub practitioner_id: Ulid,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedDateInfo {
    pub practitioner_id: Ulid,
    pub day: NaiveDate,
    pub reason: Option<String>,
}
