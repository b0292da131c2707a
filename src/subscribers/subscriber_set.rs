//! # Event fan-out to subscribers.
//!
//! [`SubscriberSet`] hands each kernel event to every subscriber that
//! [`accepts`](Subscribe::accepts) it, without ever blocking the publisher.
//!
//! ```text
//! emit(event)
//!     ├─ accepts? ──► [queue 1] ──► worker 1 ──► on_event()  (panic → SubscriberPanicked)
//!     ├─ accepts? ──► [queue 2] ──► worker 2 ──► on_event()
//!     └─ rejected: skipped, not counted
//! ```
//!
//! A full or closed queue drops the event for that subscriber only. Each
//! drop bumps the subscriber's counter and publishes `SubscriberOverflow`
//! naming the dropped kind, except for drops of subscriber events
//! themselves, which would otherwise feed back into the same queues.
//!
//! Workers run `on_event` under `AssertUnwindSafe`; a subscriber that panics
//! while holding its own lock may leave that state poisoned.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use futures::FutureExt;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::events::{Bus, Event};
use crate::subscribers::Subscribe;

struct SubscriberChannel {
    subscriber: Arc<dyn Subscribe>,
    name: &'static str,
    sender: mpsc::Sender<Arc<Event>>,
    dropped: AtomicU64,
}

impl SubscriberChannel {
    /// Counts a drop and reports it unless it was a subscriber event.
    fn record_drop(&self, event: &Event, cause: &'static str, bus: &Bus) {
        let total = self.dropped.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        if !event.kind.is_subscriber_event() {
            bus.publish(Event::subscriber_overflow(self.name, event.kind, cause, total));
        }
    }
}

/// Per-subscriber queues and workers fed from the controller's listener.
pub struct SubscriberSet {
    channels: Vec<SubscriberChannel>,
    workers: Vec<JoinHandle<()>>,
    bus: Bus,
}

impl SubscriberSet {
    /// Spawns one worker per subscriber; must run inside a tokio runtime.
    #[must_use]
    pub fn new(subs: Vec<Arc<dyn Subscribe>>, bus: Bus) -> Self {
        let mut channels = Vec::with_capacity(subs.len());
        let mut workers = Vec::with_capacity(subs.len());

        for sub in subs {
            let name = sub.name();
            let (tx, mut rx) = mpsc::channel::<Arc<Event>>(sub.queue_capacity().max(1));
            let worker_sub = Arc::clone(&sub);
            let worker_bus = bus.clone();
            workers.push(tokio::spawn(async move {
                while let Some(ev) = rx.recv().await {
                    let fut = worker_sub.on_event(ev.as_ref());
                    if let Err(panic) = std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                        worker_bus.publish(Event::subscriber_panicked(name, panic_message(&*panic)));
                    }
                }
            }));
            channels.push(SubscriberChannel {
                subscriber: sub,
                name,
                sender: tx,
                dropped: AtomicU64::new(0),
            });
        }
        Self {
            channels,
            workers,
            bus,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Queues `event` for every accepting subscriber; never blocks.
    pub fn emit(&self, event: Event) {
        let event = Arc::new(event);
        for channel in &self.channels {
            if !channel.subscriber.accepts(&event) {
                continue;
            }
            match channel.sender.try_send(Arc::clone(&event)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => channel.record_drop(&event, "full", &self.bus),
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    channel.record_drop(&event, "closed", &self.bus)
                }
            }
        }
    }

    /// Closes the queues and waits for workers to drain them.
    pub async fn shutdown(self) {
        drop(self.channels);
        for h in self.workers {
            let _ = h.await;
        }
    }
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, Severity};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Recorder {
        seen: Arc<Mutex<Vec<EventKind>>>,
        min: Severity,
    }

    #[async_trait]
    impl Subscribe for Recorder {
        async fn on_event(&self, ev: &Event) {
            self.seen.lock().unwrap().push(ev.kind);
        }
        fn accepts(&self, ev: &Event) -> bool {
            ev.severity() >= self.min
        }
        fn name(&self) -> &'static str {
            "recorder"
        }
    }

    struct Panicker;

    #[async_trait]
    impl Subscribe for Panicker {
        async fn on_event(&self, _ev: &Event) {
            panic!("boom");
        }
        fn name(&self) -> &'static str {
            "panicker"
        }
    }

    /// Blocks on its first event until released; queue of one.
    struct Stuck(Arc<Notify>);

    #[async_trait]
    impl Subscribe for Stuck {
        async fn on_event(&self, _ev: &Event) {
            self.0.notified().await;
        }
        fn name(&self) -> &'static str {
            "stuck"
        }
        fn queue_capacity(&self) -> usize {
            1
        }
    }

    #[tokio::test]
    async fn test_fan_out_and_panic_isolation() {
        let bus = Bus::new(16);
        let mut rx = bus.subscribe();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let set = SubscriberSet::new(
            vec![
                Arc::new(Recorder {
                    seen: seen.clone(),
                    min: Severity::Info,
                }),
                Arc::new(Panicker),
            ],
            bus.clone(),
        );

        set.emit(Event::new(EventKind::BootCompleted));
        set.emit(Event::new(EventKind::ServiceStarted));
        set.shutdown().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventKind::BootCompleted, EventKind::ServiceStarted]
        );
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::SubscriberPanicked);
        assert_eq!(ev.service.as_deref(), Some("panicker"));
        assert_eq!(ev.reason.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_rejected_events_are_not_queued() {
        let bus = Bus::new(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let set = SubscriberSet::new(
            vec![Arc::new(Recorder {
                seen: seen.clone(),
                min: Severity::Error,
            })],
            bus,
        );

        set.emit(Event::new(EventKind::OperationFailed));
        set.emit(Event::new(EventKind::OperationFailed).with_booting(true));
        set.emit(Event::new(EventKind::PersistenceFailed));
        set.shutdown().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventKind::OperationFailed, EventKind::PersistenceFailed]
        );
    }

    #[tokio::test]
    async fn test_overflow_names_dropped_kind() {
        let bus = Bus::new(16);
        let mut rx = bus.subscribe();
        let release = Arc::new(Notify::new());
        let set = SubscriberSet::new(vec![Arc::new(Stuck(release.clone()))], bus);

        set.emit(Event::new(EventKind::BootCompleted));
        tokio::time::sleep(Duration::from_millis(20)).await;
        set.emit(Event::new(EventKind::ServiceStarted));
        set.emit(Event::new(EventKind::PersistenceFailed));
        set.emit(Event::subscriber_panicked("other", "boom".into()));

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::SubscriberOverflow);
        assert_eq!(ev.service.as_deref(), Some("stuck"));
        assert_eq!(
            ev.reason.as_deref(),
            Some("dropped persistence-failed (full); 1 dropped so far")
        );
        assert!(rx.try_recv().is_err());

        release.notify_one();
        release.notify_one();
        set.shutdown().await;
    }
}
