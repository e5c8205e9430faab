use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use dashmap::mapref::entry::Entry;
use tokio::sync::{RwLock, oneshot};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::blocked::expand_range;
use super::conflict::check_no_conflict;
use super::slots::on_slot_grid;
use super::{Engine, EngineError, WalCommand};

fn check_name(name: &Option<String>, what: &'static str) -> Result<(), EngineError> {
    if let Some(n) = name
        && n.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded(what));
        }
    Ok(())
}

fn check_reason(reason: &Option<String>) -> Result<(), EngineError> {
    if let Some(r) = reason
        && r.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
    Ok(())
}

impl Engine {
    // ── Practitioners ────────────────────────────────────────────

    pub async fn create_practitioner(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        check_name(&name, "practitioner name too long")?;
        let _gate = self.compaction_gate.read().await;
        if self.state.len() >= MAX_PRACTITIONERS {
            return Err(EngineError::LimitExceeded("too many practitioners"));
        }

        // Reserve the id with the new state write-locked; readers wait until
        // the create is durable or rolled back.
        let ps = Arc::new(RwLock::new(PractitionerState::new(id, name.clone())));
        let guard = ps.clone().write_owned().await;
        match self.state.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(ps);
            }
        }

        let event = Event::PractitionerCreated { id, name };
        if let Err(e) = self.wal_append(&event).await {
            self.state.remove(&id);
            return Err(e);
        }
        drop(guard);
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn delete_practitioner(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        let ps = self.require_practitioner(id)?;
        let guard = ps.write().await;
        // A concurrent delete may have won the lock first.
        if !self.state.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if !guard.bookings.is_empty() {
            return Err(EngineError::HasBookings(id));
        }

        let event = Event::PractitionerDeleted { id };
        self.wal_append(&event).await?;
        self.state.remove(&id);
        drop(guard);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        Ok(())
    }

    // ── Weekly schedule ──────────────────────────────────────────

    pub async fn set_working_window(
        &self,
        practitioner_id: Ulid,
        window: WorkingWindow,
    ) -> Result<(), EngineError> {
        window.validate()?;
        let ps = self.require_practitioner(practitioner_id)?;
        let mut guard = ps.write().await;
        let event = Event::WindowSet { practitioner_id, window };
        self.persist_and_apply(practitioner_id, &mut guard, &event).await
    }

    pub async fn clear_working_window(
        &self,
        practitioner_id: Ulid,
        day_of_week: u8,
    ) -> Result<(), EngineError> {
        if day_of_week > 6 {
            return Err(EngineError::InvalidWindow("day_of_week must be 0-6"));
        }
        let ps = self.require_practitioner(practitioner_id)?;
        let mut guard = ps.write().await;
        if guard.week[day_of_week as usize].is_none() {
            return Err(EngineError::NotFound(practitioner_id));
        }
        let event = Event::WindowCleared { practitioner_id, day_of_week };
        self.persist_and_apply(practitioner_id, &mut guard, &event).await
    }

    // ── Blocked dates ────────────────────────────────────────────

    pub async fn block_date(
        &self,
        practitioner_id: Ulid,
        day: NaiveDate,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        check_reason(&reason)?;
        let ps = self.require_practitioner(practitioner_id)?;
        let mut guard = ps.write().await;
        if guard.blocked.contains_key(&day) {
            return Err(EngineError::AlreadyExists(practitioner_id));
        }
        let event = Event::DateBlocked { practitioner_id, day, reason };
        self.persist_and_apply(practitioner_id, &mut guard, &event).await
    }

    /// Block every date in `[from, to]`. Dates that are already blocked, or
    /// whose WAL write fails, are counted as failed and the rest still apply.
    pub async fn block_range(
        &self,
        practitioner_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        reason: Option<String>,
    ) -> Result<BulkOutcome, EngineError> {
        check_reason(&reason)?;
        let days = expand_range(from, to)?;
        let ps = self.require_practitioner(practitioner_id)?;
        let mut guard = ps.write().await;

        let mut outcome = BulkOutcome::default();
        for day in days {
            if guard.blocked.contains_key(&day) {
                outcome.failed += 1;
                continue;
            }
            let event = Event::DateBlocked {
                practitioner_id,
                day,
                reason: reason.clone(),
            };
            match self.persist_and_apply(practitioner_id, &mut guard, &event).await {
                Ok(()) => outcome.inserted += 1,
                Err(e) => {
                    tracing::warn!("block_range: {practitioner_id} {day}: {e}");
                    outcome.failed += 1;
                }
            }
        }
        if outcome.failed > 0 {
            tracing::warn!(
                "block_range {from}..={to} for {practitioner_id}: {} inserted, {} failed",
                outcome.inserted,
                outcome.failed
            );
        }
        Ok(outcome)
    }

    pub async fn unblock_date(&self, practitioner_id: Ulid, day: NaiveDate) -> Result<(), EngineError> {
        let ps = self.require_practitioner(practitioner_id)?;
        let mut guard = ps.write().await;
        if !guard.blocked.contains_key(&day) {
            return Err(EngineError::NotFound(practitioner_id));
        }
        let event = Event::DateUnblocked { practitioner_id, day };
        self.persist_and_apply(practitioner_id, &mut guard, &event).await
    }

    // ── Service catalog ──────────────────────────────────────────

    pub async fn create_service(
        &self,
        id: Ulid,
        name: String,
        duration_minutes: Minutes,
    ) -> Result<(), EngineError> {
        if duration_minutes <= 0 {
            return Err(EngineError::InvalidDuration(duration_minutes));
        }
        if duration_minutes > MAX_BOOKING_MINUTES {
            return Err(EngineError::LimitExceeded("service too long"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("service name too long"));
        }
        let _gate = self.compaction_gate.read().await;
        if self.services.len() >= MAX_SERVICES {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        match self.services.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(Service { id, name: name.clone(), duration_minutes });
            }
        }

        let event = Event::ServiceCreated { id, name, duration_minutes };
        if let Err(e) = self.wal_append(&event).await {
            self.services.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    pub async fn remove_service(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        let (_, service) = self.services.remove(&id).ok_or(EngineError::NotFound(id))?;
        let event = Event::ServiceRemoved { id };
        if let Err(e) = self.wal_append(&event).await {
            self.services.insert(id, service);
            return Err(e);
        }
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────────────

    /// Check-and-insert under the practitioner's write lock. Two concurrent
    /// confirmations for overlapping spans serialize here; the second one
    /// sees the first and fails with `Conflict`.
    pub async fn confirm_booking(
        &self,
        id: Ulid,
        practitioner_id: Ulid,
        start: NaiveDateTime,
        duration: Minutes,
        label: Option<String>,
    ) -> Result<(), EngineError> {
        if duration <= 0 {
            return Err(EngineError::InvalidDuration(duration));
        }
        if let Some(ref l) = label
            && l.len() > MAX_LABEL_LEN {
                return Err(EngineError::LimitExceeded("label too long"));
            }
        let span = Span::try_starting_at(start, duration)?;

        let ps = self.require_practitioner(practitioner_id)?;
        let mut guard = ps.write().await;
        if self.booking_to_practitioner.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let day = start.date();
        if guard.blocked.contains_key(&day) {
            return Err(EngineError::DateBlocked(day));
        }
        let window = match guard.window_for(day) {
            Some(w) if w.is_active && w.on(day).contains_span(&span) => *w,
            _ => return Err(EngineError::OutsideWorkingHours(span)),
        };
        if !on_slot_grid(&window, start.time()) {
            return Err(EngineError::OffSlotGrid(start.time()));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_PRACTITIONER {
            return Err(EngineError::LimitExceeded("too many bookings on practitioner"));
        }

        if let Err(e) = check_no_conflict(&guard, &span) {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            tracing::debug!("booking {id} on {practitioner_id} rejected: {e}");
            return Err(e);
        }

        let event = Event::BookingConfirmed { id, practitioner_id, span, label };
        self.persist_and_apply(practitioner_id, &mut guard, &event).await
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (practitioner_id, mut guard) = self.resolve_booking_write(&id).await?;
        let event = Event::BookingCancelled { id, practitioner_id };
        self.persist_and_apply(practitioner_id, &mut guard, &event).await?;
        Ok(practitioner_id)
    }

    // ── WAL maintenance ──────────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact(&self) -> Result<(), EngineError> {
        // No practitioner or service can appear or vanish until the swap.
        let _gate = self.compaction_gate.write().await;
        let mut events = Vec::new();

        for entry in self.services.iter() {
            let s = entry.value();
            events.push(Event::ServiceCreated {
                id: s.id,
                name: s.name.clone(),
                duration_minutes: s.duration_minutes,
            });
        }

        // Read guards stay held until the compacted file is swapped in, so no
        // booking, window or blocked-date write lands in the old WAL after its
        // practitioner was snapshotted.
        let practitioners: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(practitioners.len());
        for ps in practitioners {
            let guard = ps.read_owned().await;
            let practitioner_id = guard.id;
            if !self.state.contains_key(&practitioner_id) {
                continue;
            }
            events.push(Event::PractitionerCreated {
                id: practitioner_id,
                name: guard.name.clone(),
            });
            for window in guard.week.iter().flatten() {
                events.push(Event::WindowSet { practitioner_id, window: *window });
            }
            for (day, reason) in &guard.blocked {
                events.push(Event::DateBlocked {
                    practitioner_id,
                    day: *day,
                    reason: reason.clone(),
                });
            }
            for b in &guard.bookings {
                events.push(Event::BookingConfirmed {
                    id: b.id,
                    practitioner_id,
                    span: b.span,
                    label: b.label.clone(),
                });
            }
            guards.push(guard);
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        tracing::info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
