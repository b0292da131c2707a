//! # Container monitor: quiescence tracking and change reports.
//!
//! The [`ContainerMonitor`] consumes the service container's lifecycle stream
//! and folds it into one "busy" counter plus the sets of failed services and
//! services waiting on missing dependencies.
//!
//! ## Architecture
//! ```text
//! ServiceContainer ── ServiceEvent ──► [unbounded mpsc] ──► consumer loop
//!                                            ▲                  │ apply()
//! await_stability() ── Fence(oneshot) ───────┘                  ▼
//!        │                                     MonitorState { busy, failed, missing }
//!        └──────────── waits on Notify ◄──── notify_waiters() when busy drops
//!                                                               │ busy == 0
//!                                                               ▼
//!                                          ContainerStateReport ──► Bus(ContainerStateChanged)
//! ```
//!
//! ## Rules
//! - `busy` goes up when a service leaves a rest state and down when it returns to one.
//! - Counter, failed set and missing set share one lock.
//! - [`ContainerMonitor::await_stability`] first pushes a fence through the stream,
//!   so every transition published before the call is accounted for.
//! - A report only lists deltas versus the previous report; an empty delta
//!   produces no report.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::cancel::cancellable;
use crate::error::OperationError;
use crate::events::{Bus, Event, EventKind};
use crate::model::ModelNode;
use crate::services::{ServiceEvent, ServiceId, ServiceState};

pub(crate) enum MonitorMsg {
    Lifecycle(ServiceEvent),
    Fence(oneshot::Sender<()>),
}

/// Publishing end of the lifecycle stream, held by the service container.
#[derive(Clone)]
pub struct LifecycleSink {
    tx: mpsc::UnboundedSender<MonitorMsg>,
}

impl LifecycleSink {
    pub(crate) fn publish(&self, ev: ServiceEvent) {
        let _ = self.tx.send(MonitorMsg::Lifecycle(ev));
    }
}

/// A service named in a report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReportedService {
    pub id: ServiceId,
    pub name: String,
}

/// A service waiting on dependencies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MissingDependencies {
    pub id: ServiceId,
    pub name: String,
    pub missing: Vec<String>,
}

/// Point-in-time delta of container problems.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ContainerStateReport {
    /// Report number, starting at 1.
    pub seq: u64,
    /// Services that failed since the previous report.
    pub failed: Vec<ReportedService>,
    /// Services newly waiting on missing dependencies.
    pub missing_dependencies: Vec<MissingDependencies>,
    /// Previously reported waiting services whose dependencies are now resolved.
    pub no_longer_missing: Vec<ReportedService>,
}

impl ContainerStateReport {
    pub fn is_empty(&self) -> bool {
        self.failed.is_empty()
            && self.missing_dependencies.is_empty()
            && self.no_longer_missing.is_empty()
    }

    /// Renders the report as a document.
    pub fn to_model_node(&self) -> ModelNode {
        serde_json::to_value(self).unwrap_or(ModelNode::Null)
    }
}

impl fmt::Display for ContainerStateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sections = Vec::new();
        if !self.failed.is_empty() {
            let names: Vec<&str> = self.failed.iter().map(|s| s.name.as_str()).collect();
            sections.push(format!("new failures: [{}]", names.join(", ")));
        }
        if !self.missing_dependencies.is_empty() {
            let entries: Vec<String> = self
                .missing_dependencies
                .iter()
                .map(|m| format!("{} (missing {})", m.name, m.missing.join(", ")))
                .collect();
            sections.push(format!("newly waiting: [{}]", entries.join(", ")));
        }
        if !self.no_longer_missing.is_empty() {
            let names: Vec<&str> = self.no_longer_missing.iter().map(|s| s.name.as_str()).collect();
            sections.push(format!("no longer waiting: [{}]", names.join(", ")));
        }
        write!(f, "{}", sections.join("; "))
    }
}

#[derive(Default)]
struct MonitorState {
    busy: usize,
    failed: BTreeMap<ServiceId, String>,
    missing: BTreeMap<ServiceId, (String, Vec<String>)>,
    reported_failed: BTreeMap<ServiceId, String>,
    reported_missing: BTreeMap<ServiceId, (String, Vec<String>)>,
    last_report: Option<ContainerStateReport>,
    report_seq: u64,
}

impl MonitorState {
    fn apply(&mut self, ev: &ServiceEvent) {
        match (ev.from.is_rest(), ev.to.is_rest()) {
            (true, false) => self.busy += 1,
            (false, true) => self.busy = self.busy.saturating_sub(1),
            _ => {}
        }
        if ev.to == ServiceState::Failed {
            self.failed.insert(ev.id, ev.name.to_string());
        } else {
            self.failed.remove(&ev.id);
        }
        if ev.to == ServiceState::Waiting {
            self.missing
                .insert(ev.id, (ev.name.to_string(), ev.missing.clone()));
        } else {
            self.missing.remove(&ev.id);
        }
    }

    /// Computes the delta against the previous report and records the new baseline.
    fn next_report(&mut self) -> Option<ContainerStateReport> {
        let failed: Vec<ReportedService> = self
            .failed
            .iter()
            .filter(|(id, _)| !self.reported_failed.contains_key(id))
            .map(|(id, name)| ReportedService {
                id: *id,
                name: name.clone(),
            })
            .collect();
        let missing_dependencies: Vec<MissingDependencies> = self
            .missing
            .iter()
            .filter(|(id, _)| !self.reported_missing.contains_key(id))
            .map(|(id, (name, missing))| MissingDependencies {
                id: *id,
                name: name.clone(),
                missing: missing.clone(),
            })
            .collect();
        let no_longer_missing: Vec<ReportedService> = self
            .reported_missing
            .iter()
            .filter(|(id, _)| !self.missing.contains_key(id))
            .map(|(id, (name, _))| ReportedService {
                id: *id,
                name: name.clone(),
            })
            .collect();

        self.reported_failed = self.failed.clone();
        self.reported_missing = self.missing.clone();

        let mut report = ContainerStateReport {
            seq: 0,
            failed,
            missing_dependencies,
            no_longer_missing,
        };
        if report.is_empty() {
            return None;
        }
        self.report_seq += 1;
        report.seq = self.report_seq;
        self.last_report = Some(report.clone());
        Some(report)
    }
}

/// Aggregates service lifecycle transitions into a quiescence signal.
pub struct ContainerMonitor {
    tx: mpsc::UnboundedSender<MonitorMsg>,
    state: Mutex<MonitorState>,
    settled: Notify,
    bus: Bus,
}

impl ContainerMonitor {
    /// Creates the monitor and spawns its consumer loop.
    ///
    /// The loop ends when `token` is cancelled. Must be called inside a tokio runtime.
    pub fn spawn(bus: Bus, token: CancellationToken) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let me = Arc::new(Self {
            tx,
            state: Mutex::new(MonitorState::default()),
            settled: Notify::new(),
            bus,
        });

        let monitor = Arc::clone(&me);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(MonitorMsg::Lifecycle(ev)) => monitor.apply(&ev),
                        Some(MonitorMsg::Fence(done)) => {
                            let _ = done.send(());
                        }
                        None => break,
                    }
                }
            }
        });
        me
    }

    /// Returns the sink the service container publishes transitions to.
    pub fn sink(&self) -> LifecycleSink {
        LifecycleSink {
            tx: self.tx.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, ev: &ServiceEvent) {
        let report = {
            let mut st = self.lock();
            st.apply(ev);
            if st.busy == 0 { st.next_report() } else { None }
        };
        self.settled.notify_waiters();
        if let Some(report) = report {
            self.bus.publish(
                Event::new(EventKind::ContainerStateChanged).with_reason(report.to_string()),
            );
        }
    }

    /// Number of services currently between rest states.
    pub fn busy(&self) -> usize {
        self.lock().busy
    }

    /// Waits until the busy count is at most `target`.
    ///
    /// With a token the wait is cancellable and returns
    /// [`OperationError::Cancelled`]; without one it runs to completion.
    pub async fn await_stability(
        &self,
        target: usize,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), OperationError> {
        let (fence, fenced) = oneshot::channel();
        if self.tx.send(MonitorMsg::Fence(fence)).is_ok() {
            let _ = cancellable(fenced, cancel).await?;
        }
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.busy() <= target {
                return Ok(());
            }
            cancellable(notified, cancel).await?;
        }
    }

    /// Most recent non-empty change report.
    pub fn last_report(&self) -> Option<ContainerStateReport> {
        self.lock().last_report.clone()
    }

    /// Waits for quiescence and returns the most recent change report.
    pub async fn await_change_report(&self) -> Option<ContainerStateReport> {
        let _ = self.await_stability(0, None).await;
        self.last_report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ev(id: u64, name: &str, from: ServiceState, to: ServiceState) -> ServiceEvent {
        ServiceEvent {
            id: ServiceId(id),
            name: name.into(),
            from,
            to,
            missing: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_await_unblocks_when_all_settle() {
        use ServiceState::*;

        let monitor = ContainerMonitor::spawn(Bus::new(16), CancellationToken::new());
        let sink = monitor.sink();
        for (id, name) in [(1, "a"), (2, "b"), (3, "c")] {
            sink.publish(ev(id, name, New, Starting));
        }
        monitor.await_stability(3, None).await.unwrap();
        assert_eq!(monitor.busy(), 3);

        let waiter = {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move { monitor.await_stability(0, None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        sink.publish(ev(1, "a", Starting, Up));
        sink.publish(ev(2, "b", Starting, Up));
        sink.publish(ev(3, "c", Starting, Failed));

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should unblock")
            .unwrap()
            .unwrap();
        assert_eq!(monitor.busy(), 0);

        let report = monitor.last_report().unwrap();
        assert_eq!(report.seq, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].name, "c");
    }

    #[tokio::test]
    async fn test_reports_contain_only_deltas() {
        use ServiceState::*;

        let monitor = ContainerMonitor::spawn(Bus::new(16), CancellationToken::new());
        let sink = monitor.sink();

        sink.publish(ev(1, "a", New, Starting));
        sink.publish(ev(1, "a", Starting, Failed));
        let first = monitor.await_change_report().await.unwrap();
        assert_eq!(first.failed, vec![ReportedService { id: ServiceId(1), name: "a".into() }]);

        sink.publish(ev(2, "b", New, Starting));
        sink.publish(ev(2, "b", Starting, Failed));
        let second = monitor.await_change_report().await.unwrap();
        assert_eq!(second.seq, 2);
        assert_eq!(second.failed, vec![ReportedService { id: ServiceId(2), name: "b".into() }]);
    }

    #[tokio::test]
    async fn test_missing_dependencies_resolve() {
        use ServiceState::*;

        let monitor = ContainerMonitor::spawn(Bus::new(16), CancellationToken::new());
        let sink = monitor.sink();

        let mut waiting = ev(1, "app", New, Waiting);
        waiting.missing = vec!["db".into()];
        sink.publish(waiting);
        let first = monitor.await_change_report().await.unwrap();
        assert_eq!(first.missing_dependencies[0].missing, vec!["db".to_string()]);

        sink.publish(ev(1, "app", Waiting, Starting));
        sink.publish(ev(1, "app", Starting, Up));
        let second = monitor.await_change_report().await.unwrap();
        assert!(second.missing_dependencies.is_empty());
        assert_eq!(second.no_longer_missing[0].name, "app");
    }

    #[tokio::test]
    async fn test_cancellable_wait() {
        use ServiceState::*;

        let monitor = ContainerMonitor::spawn(Bus::new(16), CancellationToken::new());
        monitor.sink().publish(ev(1, "slow", New, Starting));

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            monitor.await_stability(0, Some(&cancel)).await,
            Err(OperationError::Cancelled)
        );
    }
}
