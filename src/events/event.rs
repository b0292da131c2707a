//! # Diagnostic events emitted by the kernel.
//!
//! The [`EventKind`] enum classifies event types across four categories:
//! - **Operation events**: failures and warnings raised while a context runs steps
//! - **Container events**: service lifecycle and container state reports
//! - **Boot events**: boot operation failures and boot completion
//! - **Subscriber events**: fan-out problems (panic, overflow)
//!
//! Events are diagnostics only: the response document is the authoritative
//! result of an operation. The [`Event`] struct carries the metadata
//! (operation name, address, service, reason).
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//! Use `seq` to restore the exact order when events are delivered out of order.
//!
//! ## Example
//! ```rust
//! use opkernel::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::OperationFailed)
//!     .with_operation("add")
//!     .with_address("/subsystem=web")
//!     .with_reason("duplicate resource");
//!
//! assert_eq!(ev.kind, EventKind::OperationFailed);
//! assert_eq!(ev.operation.as_deref(), Some("add"));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

use crate::context::Stage;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of kernel events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets:
    /// - `service`: subscriber name
    /// - `reason`: panic info/message
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets:
    /// - `service`: subscriber name
    /// - `reason`: reason string (e.g., "full", "closed")
    SubscriberOverflow,

    // === Operation events ===
    /// A step reported an expected failure before completing.
    ///
    /// Sets:
    /// - `operation`, `address`, `operation_id`, `stage`
    /// - `reason`: failure description
    /// - `booting`: whether the failure happened during boot (log at error level)
    OperationFailed,

    /// A step handler returned an unexpected error before completing.
    ///
    /// Sets:
    /// - `operation`, `address`, `operation_id`, `stage`
    /// - `reason`: error message
    StepHandlerFailed,

    /// A step handler returned an error after completing; ignored.
    ///
    /// Sets:
    /// - `operation`, `address`, `operation_id`, `stage`
    /// - `reason`: error message
    StepFailedAfterCompletion,

    /// A step handler returned without completing its step.
    ///
    /// Sets:
    /// - `operation`, `address`, `operation_id`, `stage`
    StepIncomplete,

    /// A rollback or result handler failed; the failure is not propagated.
    ///
    /// Sets:
    /// - `operation`, `address`, `operation_id`
    /// - `reason`: error message
    RollbackHandlerFailed,

    /// The configuration persister rejected the new model.
    ///
    /// Sets:
    /// - `operation_id`
    /// - `reason`: persister error
    PersistenceFailed,

    /// The operation observed cancellation and rolled back.
    ///
    /// Sets:
    /// - `operation_id`
    OperationCancelled,

    // === Container events ===
    /// Container settled with changes versus the previous report.
    ///
    /// Sets:
    /// - `reason`: rendered report
    ContainerStateChanged,

    /// A service reached `Up`.
    ///
    /// Sets:
    /// - `service`: service name
    ServiceStarted,

    /// A service failed to start.
    ///
    /// Sets:
    /// - `service`: service name
    /// - `reason`: start error
    ServiceFailed,

    /// A service was removed from the container.
    ///
    /// Sets:
    /// - `service`: service name
    ServiceRemoved,

    // === Boot events ===
    /// A boot operation produced a failure description.
    ///
    /// Sets:
    /// - `operation`, `address`
    /// - `reason`: failure description
    BootOperationFailed,

    /// Boot committed and the process is running.
    BootCompleted,
}

/// How loudly an event should be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl EventKind {
    /// Stable kebab-case label for logs and overflow reports.
    pub fn as_label(self) -> &'static str {
        match self {
            EventKind::SubscriberPanicked => "subscriber-panicked",
            EventKind::SubscriberOverflow => "subscriber-overflow",
            EventKind::OperationFailed => "operation-failed",
            EventKind::StepHandlerFailed => "step-handler-failed",
            EventKind::StepFailedAfterCompletion => "step-failed-after-completion",
            EventKind::StepIncomplete => "step-incomplete",
            EventKind::RollbackHandlerFailed => "rollback-handler-failed",
            EventKind::PersistenceFailed => "persistence-failed",
            EventKind::OperationCancelled => "operation-cancelled",
            EventKind::ContainerStateChanged => "container-state-changed",
            EventKind::ServiceStarted => "service-started",
            EventKind::ServiceFailed => "service-failed",
            EventKind::ServiceRemoved => "service-removed",
            EventKind::BootOperationFailed => "boot-operation-failed",
            EventKind::BootCompleted => "boot-completed",
        }
    }

    /// Default severity; [`Event::severity`] raises operation failures seen
    /// during boot to `Error`.
    pub fn severity(self) -> Severity {
        match self {
            EventKind::StepHandlerFailed
            | EventKind::StepIncomplete
            | EventKind::RollbackHandlerFailed
            | EventKind::PersistenceFailed
            | EventKind::BootOperationFailed => Severity::Error,
            EventKind::StepFailedAfterCompletion
            | EventKind::ServiceFailed
            | EventKind::SubscriberPanicked
            | EventKind::SubscriberOverflow => Severity::Warn,
            EventKind::OperationFailed
            | EventKind::OperationCancelled
            | EventKind::ContainerStateChanged
            | EventKind::ServiceStarted
            | EventKind::ServiceRemoved
            | EventKind::BootCompleted => Severity::Info,
        }
    }

    /// Events about the fan-out itself; never reported as overflow again.
    pub fn is_subscriber_event(self) -> bool {
        matches!(
            self,
            EventKind::SubscriberPanicked | EventKind::SubscriberOverflow
        )
    }
}

/// Kernel event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Operation name, if applicable.
    pub operation: Option<Arc<str>>,
    /// Rendered target address, if applicable.
    pub address: Option<Arc<str>>,
    /// Id of the operation that emitted the event.
    pub operation_id: Option<u32>,
    /// Stage the step was executing in.
    pub stage: Option<Stage>,
    /// Service or subscriber name.
    pub service: Option<Arc<str>>,
    /// Human-readable reason (errors, overflow details, etc.).
    pub reason: Option<Arc<str>>,
    /// Emitted while the controller was booting.
    pub booting: bool,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            operation: None,
            address: None,
            operation_id: None,
            stage: None,
            service: None,
            reason: None,
            booting: false,
        }
    }

    /// Severity of this occurrence.
    pub fn severity(&self) -> Severity {
        match self.kind {
            EventKind::OperationFailed if self.booting => Severity::Error,
            kind => kind.severity(),
        }
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[inline]
    pub fn with_operation(mut self, name: impl Into<Arc<str>>) -> Self {
        self.operation = Some(name.into());
        self
    }

    #[inline]
    pub fn with_address(mut self, address: impl Into<Arc<str>>) -> Self {
        self.address = Some(address.into());
        self
    }

    #[inline]
    pub fn with_operation_id(mut self, id: u32) -> Self {
        self.operation_id = Some(id);
        self
    }

    #[inline]
    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    #[inline]
    pub fn with_service(mut self, service: impl Into<Arc<str>>) -> Self {
        self.service = Some(service.into());
        self
    }

    #[inline]
    pub fn with_booting(mut self, booting: bool) -> Self {
        self.booting = booting;
        self
    }

    /// Creates a subscriber overflow event for a dropped event of kind `dropped`.
    pub fn subscriber_overflow(
        subscriber: &'static str,
        dropped: EventKind,
        cause: &'static str,
        total: u64,
    ) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_service(subscriber)
            .with_reason(format!(
                "dropped {} ({cause}); {total} dropped so far",
                dropped.as_label()
            ))
    }

    /// Creates the event published when the listener lags behind the bus.
    pub fn listener_lagged(skipped: u64) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_service("listener")
            .with_reason(format!("listener skipped {skipped} events"))
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_service(subscriber)
            .with_reason(info)
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_failures_are_errors() {
        let ev = Event::new(EventKind::OperationFailed);
        assert_eq!(ev.severity(), Severity::Info);
        assert_eq!(ev.with_booting(true).severity(), Severity::Error);
    }

    #[test]
    fn test_overflow_reason_names_dropped_kind() {
        let ev = Event::subscriber_overflow("audit", EventKind::PersistenceFailed, "full", 3);
        assert_eq!(ev.service.as_deref(), Some("audit"));
        assert_eq!(
            ev.reason.as_deref(),
            Some("dropped persistence-failed (full); 3 dropped so far")
        );
        assert!(ev.kind.is_subscriber_event());
    }
}
