use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::blocked::is_blocked;
use super::slots::{self, compute_slots};
use super::{Engine, EngineError};

fn slots_for_day(
    ps: &PractitionerState,
    day: NaiveDate,
    duration: Minutes,
) -> Result<Vec<CandidateSlot>, EngineError> {
    let Some(window) = ps.window_for(day) else {
        return Ok(Vec::new());
    };
    let booked = ps.booked_on(day);
    compute_slots(day, window, duration, &booked, is_blocked(&day, &ps.blocked))
}

impl Engine {
    /// Candidate start times for `duration` minutes on `day`, in ascending order.
    /// An unknown practitioner or a weekday without hours yields no slots.
    pub async fn available_slots(
        &self,
        practitioner_id: Ulid,
        day: NaiveDate,
        duration: Minutes,
    ) -> Result<Vec<CandidateSlot>, EngineError> {
        check_duration(duration)?;
        let Some(ps) = self.get_practitioner(&practitioner_id) else {
            return Ok(Vec::new());
        };
        let guard = ps.read().await;
        slots_for_day(&guard, day, duration)
    }

    /// Days in `[from, to]` that offer at least one available slot.
    pub async fn bookable_days(
        &self,
        practitioner_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        duration: Minutes,
    ) -> Result<Vec<NaiveDate>, EngineError> {
        if from > to {
            return Err(EngineError::InvalidRange { from, to });
        }
        if (to - from).num_days() + 1 > MAX_QUERY_DAYS {
            return Err(EngineError::LimitExceeded("query range too long"));
        }
        check_duration(duration)?;
        let Some(ps) = self.get_practitioner(&practitioner_id) else {
            return Ok(Vec::new());
        };
        let guard = ps.read().await;

        let mut days = Vec::new();
        for day in from.iter_days().take_while(|d| *d <= to) {
            if slots_for_day(&guard, day, duration)?.iter().any(|s| s.available) {
                days.push(day);
            }
        }
        Ok(days)
    }

    /// Total duration of the selected catalog services.
    pub fn aggregate_duration(&self, service_ids: &[Ulid]) -> Result<Minutes, EngineError> {
        if service_ids.len() > MAX_SERVICES_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        let durations = service_ids
            .iter()
            .map(|id| {
                self.services
                    .get(id)
                    .map(|s| s.duration_minutes)
                    .ok_or(EngineError::NotFound(*id))
            })
            .collect::<Result<Vec<_>, _>>()?;
        slots::aggregate_duration(&durations)
    }

    // ── Listings ─────────────────────────────────────────────────

    pub async fn list_practitioners(&self) -> Vec<PractitionerInfo> {
        let all: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut result = Vec::with_capacity(all.len());
        for ps in all {
            let guard = ps.read().await;
            result.push(PractitionerInfo {
                id: guard.id,
                name: guard.name.clone(),
            });
        }
        result.sort_by_key(|p| p.id);
        result
    }

    pub fn list_services(&self) -> Vec<Service> {
        let mut result: Vec<Service> = self.services.iter().map(|e| e.value().clone()).collect();
        result.sort_by_key(|s| s.id);
        result
    }

    /// Bookings of one practitioner, optionally only those touching `day`.
    pub async fn get_bookings(
        &self,
        practitioner_id: Ulid,
        day: Option<NaiveDate>,
    ) -> Result<Vec<BookingInfo>, EngineError> {
        let ps = self.require_practitioner(practitioner_id)?;
        let guard = ps.read().await;
        let info = |b: &Booking| BookingInfo {
            id: b.id,
            practitioner_id,
            start: b.span.start,
            end: b.span.end,
            label: b.label.clone(),
        };
        Ok(match day {
            Some(day) => guard.overlapping(&Span::whole_day(day)).map(info).collect(),
            None => guard.bookings.iter().map(info).collect(),
        })
    }

    pub async fn get_blocked_dates(&self, practitioner_id: Ulid) -> Result<Vec<BlockedDateInfo>, EngineError> {
        let ps = self.require_practitioner(practitioner_id)?;
        let guard = ps.read().await;
        Ok(guard
            .blocked
            .iter()
            .map(|(day, reason)| BlockedDateInfo {
                practitioner_id,
                day: *day,
                reason: reason.clone(),
            })
            .collect())
    }

    /// Configured weekday windows, Sunday first.
    pub async fn get_working_hours(&self, practitioner_id: Ulid) -> Result<Vec<WorkingWindow>, EngineError> {
        let ps = self.require_practitioner(practitioner_id)?;
        let guard = ps.read().await;
        Ok(guard.week.iter().flatten().copied().collect())
    }
}
