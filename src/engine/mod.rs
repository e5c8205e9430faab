mod blocked;
mod conflict;
mod error;
mod mutations;
mod queries;
mod slots;

pub use blocked::{BlockedDates, CalendarDay, expand_range, is_blocked};
pub use conflict::overlaps;
pub use error::EngineError;
pub use slots::{aggregate_duration, compute_slots};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedPractitionerState = Arc<RwLock<PractitionerState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush what we have first, then handle the non-append command
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedPractitionerState>,
    pub services: DashMap<Ulid, Service>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking id → practitioner id
    pub(super) booking_to_practitioner: DashMap<Ulid, Ulid>,
    /// Shared by writes that add or remove practitioners and services,
    /// exclusive in `compact`.
    pub(super) compaction_gate: RwLock<()>,
}

/// Apply an event directly to a PractitionerState (caller holds the lock).
fn apply_to_practitioner(ps: &mut PractitionerState, event: &Event, booking_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::WindowSet { window, .. } => {
            ps.week[window.day_of_week as usize] = Some(*window);
        }
        Event::WindowCleared { day_of_week, .. } => {
            ps.week[*day_of_week as usize] = None;
        }
        Event::DateBlocked { day, reason, .. } => {
            ps.blocked.insert(*day, reason.clone());
        }
        Event::DateUnblocked { day, .. } => {
            ps.blocked.remove(day);
        }
        Event::BookingConfirmed {
            id,
            practitioner_id,
            span,
            label,
        } => {
            ps.insert_booking(Booking {
                id: *id,
                span: *span,
                label: label.clone(),
            });
            booking_map.insert(*id, *practitioner_id);
        }
        Event::BookingCancelled { id, .. } => {
            ps.remove_booking(*id);
            booking_map.remove(id);
        }
        // Practitioner and service lifecycle is handled at the map level, not here
        Event::PractitionerCreated { .. }
        | Event::PractitionerDeleted { .. }
        | Event::ServiceCreated { .. }
        | Event::ServiceRemoved { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            services: DashMap::new(),
            wal_tx,
            notify,
            booking_to_practitioner: DashMap::new(),
            compaction_gate: RwLock::new(()),
        };

        // Replay events. We are the sole owner of these Arcs, so try_write
        // always succeeds instantly. Never use blocking_write here because
        // this runs inside an async context.
        for event in &events {
            match event {
                Event::PractitionerCreated { id, name } => {
                    let ps = PractitionerState::new(*id, name.clone());
                    engine.state.insert(*id, Arc::new(RwLock::new(ps)));
                }
                Event::PractitionerDeleted { id } => {
                    engine.state.remove(id);
                }
                Event::ServiceCreated { id, name, duration_minutes } => {
                    engine.services.insert(
                        *id,
                        Service {
                            id: *id,
                            name: name.clone(),
                            duration_minutes: *duration_minutes,
                        },
                    );
                }
                Event::ServiceRemoved { id } => {
                    engine.services.remove(id);
                }
                other => {
                    if let Some(practitioner_id) = other.practitioner_id()
                        && let Some(entry) = engine.state.get(&practitioner_id) {
                            let ps_arc = entry.clone();
                            let mut guard = ps_arc
                                .try_write()
                                .map_err(|_| io::Error::other("replay: contended practitioner lock"))?;
                            apply_to_practitioner(&mut guard, other, &engine.booking_to_practitioner);
                        }
                }
            }
        }

        tracing::info!(
            "replayed {} events: {} practitioners, {} services",
            events.len(),
            engine.state.len(),
            engine.services.len()
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_practitioner(&self, id: &Ulid) -> Option<SharedPractitionerState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_practitioner_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_practitioner.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        practitioner_id: Ulid,
        ps: &mut PractitionerState,
        event: &Event,
    ) -> Result<(), EngineError> {
        // A waiter may acquire the lock after the practitioner was deleted.
        if !self.state.contains_key(&practitioner_id) {
            return Err(EngineError::NotFound(practitioner_id));
        }
        self.wal_append(event).await?;
        apply_to_practitioner(ps, event, &self.booking_to_practitioner);
        self.notify.send(practitioner_id, event);
        Ok(())
    }

    /// Lookup booking → practitioner, get practitioner, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<PractitionerState>), EngineError> {
        let practitioner_id = self
            .get_practitioner_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let ps = self
            .get_practitioner(&practitioner_id)
            .ok_or(EngineError::NotFound(practitioner_id))?;
        let guard = ps.write_owned().await;
        Ok((practitioner_id, guard))
    }

    /// Fetch a practitioner or fail with `NotFound`.
    pub(super) fn require_practitioner(&self, id: Ulid) -> Result<SharedPractitionerState, EngineError> {
        self.get_practitioner(&id).ok_or(EngineError::NotFound(id))
    }
}
