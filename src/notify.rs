use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::BookingChanged;

const CHANNEL_CAPACITY: usize = 256;

/// Fan-out of committed booking changes, per staff member and salon-wide.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<BookingChanged>>,
    salon: broadcast::Sender<BookingChanged>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            salon: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Changes touching one resource, including moves away from it.
    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<BookingChanged> {
        self.channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<BookingChanged> {
        self.salon.subscribe()
    }

    /// Deliver to the salon channel and to the old and new resource. No-op without listeners.
    pub fn send(&self, change: &BookingChanged) {
        let _ = self.salon.send(change.clone());
        let mut targets = [change.resource_id, change.previous_resource_id];
        if targets[0] == targets[1] {
            targets[1] = None;
        }
        for rid in targets.into_iter().flatten() {
            if let Some(sender) = self.channels.get(&rid) {
                let _ = sender.send(change.clone());
            }
        }
    }
}
