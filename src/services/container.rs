//! # Service container.
//!
//! [`ServiceContainer`] installs, removes and restarts named [`Service`]s and
//! publishes every state transition onto the monitor's lifecycle stream.
//!
//! ## Lifecycle
//! ```text
//! install ──► New ──► Waiting ──(deps up)──► Starting ──► Up ──► Stopping ──► Removed
//!                  └─────(deps up)─────────►    │                    │
//!                                               └──► Failed          └──► Waiting (dependency removed)
//! ```
//!
//! ## Rules
//! - Transitions are published while the entry lock is held, so the monitor
//!   sees them in the order they happened.
//! - `start`/`stop` run on spawned tasks; panics are caught and treated as
//!   start failures.
//! - Each install issues a fresh [`ServiceId`].
//! - Removing a service that is `Starting` or `Stopping` takes effect once that
//!   transition finishes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::ServiceError;
use crate::events::{Bus, Event, EventKind};
use crate::services::monitor::LifecycleSink;
use crate::services::{ServiceEvent, ServiceId, ServiceRef, ServiceState};
use crate::subscribers::panic_message;

/// What to do once a stop finishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AfterStop {
    Remove,
    Wait,
    Restart,
}

struct Entry {
    id: ServiceId,
    name: Arc<str>,
    service: ServiceRef,
    dependencies: Vec<String>,
    state: ServiceState,
    token: CancellationToken,
    remove_requested: bool,
}

struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    next_id: AtomicU64,
    sink: LifecycleSink,
    bus: Bus,
    removed: Notify,
}

/// Named set of supervised runtime services.
///
/// Cheap to clone; clones share the same services.
#[derive(Clone)]
pub struct ServiceContainer {
    inner: Arc<Inner>,
}

impl ServiceContainer {
    /// Creates an empty container publishing to `sink`.
    pub fn new(sink: LifecycleSink, bus: Bus) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                sink,
                bus,
                removed: Notify::new(),
            }),
        }
    }

    /// Installs a service and starts it once `dependencies` are up.
    pub fn install(
        &self,
        name: impl Into<String>,
        service: ServiceRef,
        dependencies: Vec<String>,
    ) -> Result<ServiceId, ServiceError> {
        let name = name.into();
        let mut entries = self.inner.lock();
        if entries.contains_key(&name) {
            return Err(ServiceError::Duplicate { name });
        }
        let id = ServiceId(self.inner.next_id.fetch_add(1, AtomicOrdering::Relaxed));
        let mut entry = Entry {
            id,
            name: Arc::from(name.as_str()),
            service,
            dependencies,
            state: ServiceState::New,
            token: CancellationToken::new(),
            remove_requested: false,
        };
        let missing = missing_dependencies(&entries, &entry.dependencies);
        if missing.is_empty() {
            self.inner.transition(&mut entry, ServiceState::Starting, Vec::new());
            self.spawn_start(&entry);
        } else {
            self.inner.transition(&mut entry, ServiceState::Waiting, missing);
        }
        entries.insert(name, entry);
        Ok(id)
    }

    /// Waits until no service named `name` is installed, then installs.
    ///
    /// Used when a handler replaces a service whose removal is still in flight.
    pub async fn install_after_removal(
        &self,
        name: impl Into<String>,
        service: ServiceRef,
        dependencies: Vec<String>,
    ) -> Result<ServiceId, ServiceError> {
        let name = name.into();
        self.await_removal(&name).await;
        self.install(name, service, dependencies)
    }

    /// Stops and removes a service; running dependents go back to `Waiting`.
    pub fn remove(&self, name: &str) -> Result<ServiceId, ServiceError> {
        let mut entries = self.inner.lock();
        let entry = entries.get_mut(name).ok_or_else(|| ServiceError::NotFound {
            name: name.to_string(),
        })?;
        let id = entry.id;
        match entry.state {
            ServiceState::Up => {
                self.inner.transition(entry, ServiceState::Stopping, Vec::new());
                self.spawn_stop(entry, AfterStop::Remove);
            }
            ServiceState::Starting | ServiceState::Stopping => entry.remove_requested = true,
            _ => {
                self.inner.transition(entry, ServiceState::Removed, Vec::new());
                entries.remove(name);
                self.inner.bus.publish(Event::new(EventKind::ServiceRemoved).with_service(name));
                self.inner.removed.notify_waiters();
            }
        }

        let dependents: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.state == ServiceState::Up && e.dependencies.iter().any(|d| d == name))
            .map(|(n, _)| n.clone())
            .collect();
        for dependent in dependents {
            if let Some(e) = entries.get_mut(&dependent) {
                self.inner.transition(e, ServiceState::Stopping, Vec::new());
                self.spawn_stop(e, AfterStop::Wait);
            }
        }
        Ok(id)
    }

    /// Restarts a running service, or retries a failed one.
    pub fn restart(&self, name: &str) -> Result<ServiceId, ServiceError> {
        let mut entries = self.inner.lock();
        let missing = match entries.get(name) {
            Some(e) => missing_dependencies(&entries, &e.dependencies),
            None => {
                return Err(ServiceError::NotFound {
                    name: name.to_string(),
                });
            }
        };
        let Some(entry) = entries.get_mut(name) else {
            return Err(ServiceError::NotFound {
                name: name.to_string(),
            });
        };
        match entry.state {
            ServiceState::Up => {
                self.inner.transition(entry, ServiceState::Stopping, Vec::new());
                self.spawn_stop(entry, AfterStop::Restart);
            }
            ServiceState::Failed if missing.is_empty() => {
                entry.token = CancellationToken::new();
                self.inner.transition(entry, ServiceState::Starting, Vec::new());
                self.spawn_start(entry);
            }
            _ => {}
        }
        Ok(entry.id)
    }

    /// Current state of a service.
    pub fn state(&self, name: &str) -> Option<ServiceState> {
        self.inner.lock().get(name).map(|e| e.state)
    }

    /// Id of an installed service.
    pub fn id(&self, name: &str) -> Option<ServiceId> {
        self.inner.lock().get(name).map(|e| e.id)
    }

    /// Sorted names of installed services.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Waits until `name` is no longer installed.
    pub async fn await_removal(&self, name: &str) {
        loop {
            let notified = self.inner.removed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.inner.lock().contains_key(name) {
                return;
            }
            notified.await;
        }
    }

    fn spawn_start(&self, entry: &Entry) {
        let me = self.clone();
        let (name, id) = (entry.name.to_string(), entry.id);
        let service = Arc::clone(&entry.service);
        let token = entry.token.clone();
        tokio::spawn(async move {
            let result = match std::panic::AssertUnwindSafe(service.start(token))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => Err(ServiceError::StartFailed {
                    error: panic_message(&*panic),
                }),
            };
            me.finish_start(&name, id, result);
        });
    }

    fn spawn_stop(&self, entry: &Entry, then: AfterStop) {
        entry.token.cancel();
        let me = self.clone();
        let (name, id) = (entry.name.to_string(), entry.id);
        let service = Arc::clone(&entry.service);
        tokio::spawn(async move {
            let _ = std::panic::AssertUnwindSafe(service.stop()).catch_unwind().await;
            me.finish_stop(&name, id, then);
        });
    }

    fn finish_start(&self, name: &str, id: ServiceId, result: Result<(), ServiceError>) {
        let mut entries = self.inner.lock();
        let Some(entry) = entries.get_mut(name).filter(|e| e.id == id) else {
            return;
        };
        match result {
            Ok(()) => {
                self.inner.transition(entry, ServiceState::Up, Vec::new());
                self.inner.bus.publish(Event::new(EventKind::ServiceStarted).with_service(name));
                if entry.remove_requested {
                    self.inner.transition(entry, ServiceState::Stopping, Vec::new());
                    self.spawn_stop(entry, AfterStop::Remove);
                    return;
                }
                self.start_ready_dependents(&mut entries);
            }
            Err(err) => {
                self.inner.transition(entry, ServiceState::Failed, Vec::new());
                self.inner.bus.publish(
                    Event::new(EventKind::ServiceFailed)
                        .with_service(name)
                        .with_reason(err.to_string()),
                );
                if entry.remove_requested {
                    self.inner.transition(entry, ServiceState::Removed, Vec::new());
                    entries.remove(name);
                    self.inner.removed.notify_waiters();
                }
            }
        }
    }

    fn finish_stop(&self, name: &str, id: ServiceId, then: AfterStop) {
        let mut entries = self.inner.lock();
        let missing = match entries.get(name).filter(|e| e.id == id) {
            Some(e) => missing_dependencies(&entries, &e.dependencies),
            None => return,
        };
        let Some(entry) = entries.get_mut(name) else {
            return;
        };
        let then = if entry.remove_requested { AfterStop::Remove } else { then };
        match then {
            AfterStop::Remove => {
                self.inner.transition(entry, ServiceState::Removed, Vec::new());
                entries.remove(name);
                self.inner.bus.publish(Event::new(EventKind::ServiceRemoved).with_service(name));
                self.inner.removed.notify_waiters();
            }
            AfterStop::Wait | AfterStop::Restart if !missing.is_empty() => {
                self.inner.transition(entry, ServiceState::Waiting, missing);
            }
            AfterStop::Wait | AfterStop::Restart => {
                entry.token = CancellationToken::new();
                self.inner.transition(entry, ServiceState::Starting, Vec::new());
                self.spawn_start(entry);
            }
        }
    }

    /// Starts every waiting service whose dependencies are now all up.
    fn start_ready_dependents(&self, entries: &mut HashMap<String, Entry>) {
        let view: &HashMap<String, Entry> = entries;
        let ready: Vec<String> = view
            .iter()
            .filter(|(_, e)| e.state == ServiceState::Waiting)
            .filter(|(_, e)| missing_dependencies(view, &e.dependencies).is_empty())
            .map(|(n, _)| n.clone())
            .collect();
        for name in ready {
            if let Some(entry) = entries.get_mut(&name) {
                entry.token = CancellationToken::new();
                self.inner.transition(entry, ServiceState::Starting, Vec::new());
                self.spawn_start(entry);
            }
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, entry: &mut Entry, to: ServiceState, missing: Vec<String>) {
        let from = std::mem::replace(&mut entry.state, to);
        self.sink.publish(ServiceEvent {
            id: entry.id,
            name: Arc::clone(&entry.name),
            from,
            to,
            missing,
        });
    }
}

fn missing_dependencies(entries: &HashMap<String, Entry>, deps: &[String]) -> Vec<String> {
    deps.iter()
        .filter(|d| entries.get(d.as_str()).map(|e| e.state) != Some(ServiceState::Up))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{ContainerMonitor, ServiceFn};

    fn container() -> (ServiceContainer, Arc<ContainerMonitor>) {
        let bus = Bus::new(64);
        let monitor = ContainerMonitor::spawn(bus.clone(), CancellationToken::new());
        (ServiceContainer::new(monitor.sink(), bus), monitor)
    }

    fn ok_service(name: &'static str) -> ServiceRef {
        ServiceFn::arc(name, |_ctx| async { Ok(()) })
    }

    #[tokio::test]
    async fn test_install_starts_and_settles() {
        let (c, monitor) = container();
        c.install("a", ok_service("a"), vec![]).unwrap();
        monitor.await_stability(0, None).await.unwrap();
        assert_eq!(c.state("a"), Some(ServiceState::Up));
        assert!(matches!(
            c.install("a", ok_service("a"), vec![]),
            Err(ServiceError::Duplicate { .. })
        ));
    }

    #[tokio::test]
    async fn test_dependent_waits_then_starts() {
        let (c, monitor) = container();
        c.install("app", ok_service("app"), vec!["db".into()]).unwrap();
        monitor.await_stability(0, None).await.unwrap();
        assert_eq!(c.state("app"), Some(ServiceState::Waiting));

        c.install("db", ok_service("db"), vec![]).unwrap();
        monitor.await_stability(0, None).await.unwrap();
        assert_eq!(c.state("db"), Some(ServiceState::Up));
        assert_eq!(c.state("app"), Some(ServiceState::Up));

        c.remove("db").unwrap();
        monitor.await_stability(0, None).await.unwrap();
        assert_eq!(c.state("db"), None);
        assert_eq!(c.state("app"), Some(ServiceState::Waiting));
    }

    #[tokio::test]
    async fn test_failed_start_is_reported() {
        let (c, monitor) = container();
        let bad: ServiceRef = ServiceFn::arc("bad", |_ctx| async {
            Err(ServiceError::StartFailed {
                error: "bind: address in use".into(),
            })
        });
        let id = c.install("bad", bad, vec![]).unwrap();
        let report = monitor.await_change_report().await.unwrap();
        assert_eq!(c.state("bad"), Some(ServiceState::Failed));
        assert_eq!(report.failed[0].id, id);
    }

    #[tokio::test]
    async fn test_reinstall_after_removal_gets_new_id() {
        let (c, monitor) = container();
        let first = c.install("a", ok_service("a"), vec![]).unwrap();
        monitor.await_stability(0, None).await.unwrap();
        c.remove("a").unwrap();
        let second = c
            .install_after_removal("a", ok_service("a"), vec![])
            .await
            .unwrap();
        assert_ne!(first, second);
        monitor.await_stability(0, None).await.unwrap();
        assert_eq!(c.state("a"), Some(ServiceState::Up));
    }
}
