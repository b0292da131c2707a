//! Nested contexts used by the parallel boot scheduler.
//!
//! A nested context runs on a worker task. It carries an explicit
//! [`ParentCapability`] (the primary's lock permit and cancellation) instead
//! of any ambient "controlling task" state, and a [`NestedLink`] through
//! which it hands its prepared state to the primary and receives the
//! primary's decision.
//!
//! ```text
//! worker: execute_operation ─► commit point ─► prepared.send(Prepared) ─► decision.await ─► finalize
//! primary:                                     prepared_rx.await ◄──┘      decision_tx.send(action)
//! ```

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, oneshot};
use tokio_util::sync::CancellationToken;

use crate::context::{ContextType, ResponseId, ResultAction, Stage, StepHandlerRef};
use crate::controller::OperationId;
use crate::model::{ModelNode, Resource};

/// Authority a nested context inherits from the context that spawned it.
#[derive(Clone)]
pub(crate) struct ParentCapability {
    pub(crate) permit: OperationId,
    pub(crate) cancel: CancellationToken,
    pub(crate) booting: bool,
    pub(crate) rollback_on_runtime_failure: bool,
    pub(crate) context_type: ContextType,
}

/// A RUNTIME/VERIFY step captured by a MODEL-only nested context.
pub(crate) struct DeferredStep {
    pub(crate) response: ResponseId,
    pub(crate) operation: Arc<ModelNode>,
    pub(crate) handler: StepHandlerRef,
    pub(crate) stage: Stage,
}

/// What a worker hands to the primary at its commit point.
pub(crate) struct Prepared {
    /// The worker rolled back or recorded a failure description.
    pub(crate) failed: bool,
    pub(crate) responses: Vec<ModelNode>,
    /// The worker's `subsystem=<name>` subtree, if it wrote one.
    pub(crate) subtree: Option<Resource>,
    pub(crate) deferred: Vec<DeferredStep>,
}

impl Prepared {
    /// Stand-in for a worker that ended without signalling.
    pub(crate) fn aborted(reason: &str) -> Self {
        Self {
            failed: true,
            responses: vec![serde_json::json!({
                (crate::model::node::FAILURE_DESCRIPTION): reason,
            })],
            subtree: None,
            deferred: Vec::new(),
        }
    }
}

/// Worker side of the rendezvous.
pub(crate) struct NestedLink {
    pub(crate) subsystem: String,
    /// Capture RUNTIME/VERIFY steps instead of running them.
    pub(crate) defer_runtime: bool,
    pub(crate) prepared: Option<oneshot::Sender<Prepared>>,
    pub(crate) decision: Option<oneshot::Receiver<ResultAction>>,
    pub(crate) deferred: Vec<DeferredStep>,
    /// Boot pool slot; released once the worker has prepared.
    pub(crate) slot: Option<OwnedSemaphorePermit>,
}

impl NestedLink {
    pub(crate) fn new(
        subsystem: String,
        defer_runtime: bool,
        prepared: oneshot::Sender<Prepared>,
        decision: oneshot::Receiver<ResultAction>,
        slot: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            subsystem,
            defer_runtime,
            prepared: Some(prepared),
            decision: Some(decision),
            deferred: Vec::new(),
            slot,
        }
    }
}
