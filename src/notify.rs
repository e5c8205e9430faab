use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-practitioner broadcast channels backing LISTEN/NOTIFY.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a practitioner's events. Creates the channel on first use.
    pub fn subscribe(&self, practitioner_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(practitioner_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, practitioner_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&practitioner_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop the channel; open receivers see `Closed`.
    pub fn remove(&self, practitioner_id: &Ulid) {
        self.channels.remove(practitioner_id);
    }
}
