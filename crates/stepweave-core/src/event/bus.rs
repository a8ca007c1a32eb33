//! Broadcast channel for `EngineEvent`s.
//!
//! Publishing never blocks and never fails: with no receivers the event is
//! dropped, and a receiver that falls more than `capacity` events behind gets
//! `RecvError::Lagged` on its next `recv`.

use stepweave_types::event::EngineEvent;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// `capacity` must be non-zero; `EngineConfig::sanitized` guarantees it.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receiver for every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!(execution_id = event.execution_id(), ?event, "engine event");
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paused(id: &str) -> EngineEvent {
        EngineEvent::ExecutionPaused {
            execution_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn every_subscriber_receives_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(paused("exec-1"));

        assert_eq!(rx1.recv().await.unwrap(), paused("exec-1"));
        assert_eq!(rx2.recv().await.unwrap().execution_id(), "exec-1");
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new(4);
        bus.publish(paused("a"));
        bus.publish(paused("b"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn slow_subscriber_lags() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish(paused(&format!("exec-{i}")));
        }
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(3))
        ));
        assert_eq!(rx.try_recv().unwrap().execution_id(), "exec-3");
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let bus = EventBus::new(0);
        let mut rx = bus.subscribe();
        bus.publish(paused("x"));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn clones_share_channel() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.clone().publish(paused("shared"));
        assert!(rx.try_recv().is_ok());
        assert!(format!("{bus:?}").contains("subscribers"));
    }
}
