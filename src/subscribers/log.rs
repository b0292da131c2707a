//! # LogWriter: simple event printer
//!
//! A minimal subscriber that prints incoming [`Event`]s to stdout.
//! Use it for tests or demos.
//!
//! ## Example output
//! ```text
//! [operation-failed] op=add address=/subsystem=web id=17 stage=MODEL reason="duplicate resource /subsystem=web"
//! ERROR [boot-operation-failed] op=add address=/subsystem=io reason="No operation named 'add' exists at address /subsystem=io"
//! WARN [service-failed] name=web.connector reason="bind: address in use"
//! [container-state-changed] new failures: [web.connector]
//! [boot-completed]
//! ```
//!
//! The prefix follows [`Event::severity`].

use async_trait::async_trait;

use crate::events::{Event, EventKind, Severity};
use crate::subscribers::Subscribe;

/// Event writer subscriber.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    /// Construct a new [`LogWriter`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn op_fields(e: &Event) -> String {
    format!(
        "op={} address={} id={} stage={}",
        e.operation.as_deref().unwrap_or("-"),
        e.address.as_deref().unwrap_or("-"),
        e.operation_id.map_or_else(|| "-".to_string(), |id| id.to_string()),
        e.stage.map_or_else(|| "-".to_string(), |s| s.to_string()),
    )
}

fn level(severity: Severity) -> &'static str {
    match severity {
        Severity::Info => "",
        Severity::Warn => "WARN ",
        Severity::Error => "ERROR ",
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let reason = e.reason.as_deref().unwrap_or("");
        let fields = match e.kind {
            EventKind::OperationFailed
            | EventKind::StepHandlerFailed
            | EventKind::StepFailedAfterCompletion
            | EventKind::StepIncomplete
            | EventKind::RollbackHandlerFailed => format!("{} reason={reason:?}", op_fields(e)),
            EventKind::PersistenceFailed | EventKind::OperationCancelled => {
                format!("id={:?} reason={reason:?}", e.operation_id)
            }
            EventKind::BootOperationFailed => format!(
                "op={} address={} reason={reason:?}",
                e.operation.as_deref().unwrap_or("-"),
                e.address.as_deref().unwrap_or("-"),
            ),
            EventKind::ServiceStarted
            | EventKind::ServiceFailed
            | EventKind::ServiceRemoved
            | EventKind::SubscriberOverflow
            | EventKind::SubscriberPanicked => format!(
                "name={} reason={reason:?}",
                e.service.as_deref().unwrap_or("-")
            ),
            EventKind::ContainerStateChanged => reason.to_string(),
            EventKind::BootCompleted => String::new(),
        };
        println!("{}[{}] {fields}", level(e.severity()), e.kind.as_label());
    }

    fn name(&self) -> &'static str {
        "log-writer"
    }
}
