use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::info;
use ulid::Ulid;

use crate::model::{Event, SlotInfo};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for live availability subscribers, one channel per slot.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self { channels: DashMap::new() }
    }

    /// Subscribe to events for a slot. Creates the channel if needed.
    pub fn subscribe(&self, slot_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(slot_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, slot_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&slot_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel (e.g. when a slot is deleted).
    pub fn remove(&self, slot_id: &Ulid) {
        self.channels.remove(slot_id);
    }
}

/// Outbound confirmation side-channel. Called fire-and-forget after a
/// booking or cancellation has committed — never inside the slot lock, and
/// a failure here never affects the booking outcome.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn booking_confirmed(&self, candidate_id: Ulid, slot: &SlotInfo) -> std::io::Result<()>;
    async fn booking_cancelled(&self, candidate_id: Ulid, slot: &SlotInfo) -> std::io::Result<()>;
}

/// Default mailer: structured log records instead of real delivery.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn booking_confirmed(&self, candidate_id: Ulid, slot: &SlotInfo) -> std::io::Result<()> {
        info!(%candidate_id, slot_id = %slot.id, start = slot.start, "booking confirmation sent");
        Ok(())
    }

    async fn booking_cancelled(&self, candidate_id: Ulid, slot: &SlotInfo) -> std::io::Result<()> {
        info!(%candidate_id, slot_id = %slot.id, start = slot.start, "cancellation notice sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Location, Span};

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let slot_id = Ulid::new();
        let mut rx = hub.subscribe(slot_id);

        let event = Event::SlotCreated {
            id: slot_id,
            span: Span::new(1_000, 2_000),
            capacity: 1,
            location: Location::Remote,
            created_at: 0,
        };
        hub.send(slot_id, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let slot_id = Ulid::new();
        // No subscriber — should not panic
        hub.send(slot_id, &Event::SlotDeleted { id: slot_id });
    }
}
