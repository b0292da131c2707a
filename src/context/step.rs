use std::sync::Arc;

use crate::context::{ResultHandler, Stage, StepHandlerRef};
use crate::error::StepError;
use crate::model::{ModelNode, PathAddress};

/// Index of a response document owned by an [`OperationContext`](crate::OperationContext).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResponseId(pub(crate) usize);

impl ResponseId {
    /// The operation's root response.
    pub const ROOT: ResponseId = ResponseId(0);
}

pub(crate) enum Completion {
    /// The handler has not completed the step yet.
    Pending,
    /// Completed; the handler (if any) runs at finalization.
    Completed(Option<Box<dyn ResultHandler>>),
    Finalized,
}

impl Completion {
    pub(crate) fn is_pending(&self) -> bool {
        matches!(self, Completion::Pending)
    }
}

/// One scheduled unit of work.
pub(crate) struct Step {
    pub(crate) handler: StepHandlerRef,
    pub(crate) operation: Arc<ModelNode>,
    pub(crate) address: PathAddress,
    pub(crate) response: ResponseId,
    /// Stage the step executed in (set when it runs).
    pub(crate) stage: Stage,
    pub(crate) completion: Completion,
}

impl Step {
    pub(crate) fn new(
        handler: StepHandlerRef,
        operation: Arc<ModelNode>,
        address: PathAddress,
        response: ResponseId,
        stage: Stage,
    ) -> Self {
        Self {
            handler,
            operation,
            address,
            response,
            stage,
            completion: Completion::Pending,
        }
    }

    pub(crate) fn operation_name(&self) -> &str {
        crate::model::operation_name(&self.operation).unwrap_or("")
    }
}

/// How a step's execution ended.
#[derive(Debug)]
pub(crate) enum StepExecution {
    /// The handler completed the step and returned normally.
    Completed { failed: bool },
    /// The handler returned an error after completing; reported, otherwise ignored.
    AlreadyFinalized { error: StepError },
    /// The handler returned an error (or panicked) before completing.
    Aborted { error: StepError },
    /// The handler returned without completing.
    Incomplete,
}

impl StepExecution {
    pub(crate) fn classify(completed: bool, outcome: Result<(), StepError>, failed: bool) -> Self {
        match (completed, outcome) {
            (true, Ok(())) => StepExecution::Completed { failed },
            (false, Ok(())) => StepExecution::Incomplete,
            (true, Err(error)) => StepExecution::AlreadyFinalized { error },
            (false, Err(error)) => StepExecution::Aborted { error },
        }
    }
}
