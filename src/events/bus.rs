//! # Kernel event bus.
//!
//! Operation contexts, the service container, the container monitor and boot
//! all publish to one [`Bus`]. The controller's listener is the usual
//! receiver; it forwards to the [`SubscriberSet`](crate::SubscriberSet) and
//! turns a lagged receive into a `SubscriberOverflow` event.
//!
//! ```text
//!   OperationContext ──┐
//!   ServiceContainer ──┼──► Bus (broadcast ring) ──► listener ──► SubscriberSet
//!   ContainerMonitor ──┤                          └─► ModelController::subscribe()
//!   boot             ──┘
//! ```
//!
//! Publishing never blocks and never fails: an event sent while nobody is
//! subscribed is gone, and a receiver that falls more than `capacity` events
//! behind skips the oldest.

use tokio::sync::broadcast;

use super::event::Event;

/// Cloneable handle to the kernel's broadcast channel.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Ring buffer of `capacity` events (at least 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel::<Event>(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Receiver for events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    #[tokio::test]
    async fn test_publish_reaches_receivers() {
        let bus = Bus::new(0);
        let mut rx = bus.subscribe();
        bus.publish(Event::new(EventKind::BootCompleted));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::BootCompleted);
    }

    #[tokio::test]
    async fn test_slow_receiver_skips_oldest() {
        let bus = Bus::new(2);
        let mut rx = bus.subscribe();
        bus.publish(Event::new(EventKind::ServiceStarted));
        bus.publish(Event::new(EventKind::ServiceFailed));
        bus.publish(Event::new(EventKind::ServiceRemoved));

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::ServiceFailed);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::ServiceRemoved);
    }
}
