//! # Handler traits.
//!
//! - [`OperationStepHandler`]: the work of one step.
//! - [`ResultHandler`]: registered when a step completes; called once with
//!   the operation's final [`ResultAction`]. Closures are adapted by
//!   [`OperationContext::complete_step_with_rollback`] and
//!   [`OperationContext::complete_step_with_result`].
//! - [`TransactionControl`]: the external voter consulted at the commit point.
//! - [`OperationMessageHandler`]: receives progress reports.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::{OperationContext, ResultAction};
use crate::error::StepError;
use crate::model::ModelNode;

/// # One unit of operation work.
///
/// A handler must complete its step before returning `Ok(())`, by calling one
/// of the `complete_step*` methods on the context. Returning without
/// completing is a handler bug and rolls the operation back.
///
/// ```
/// use async_trait::async_trait;
/// use opkernel::{ModelNode, OperationContext, OperationStepHandler, StepError};
///
/// struct ReadName;
///
/// #[async_trait]
/// impl OperationStepHandler for ReadName {
///     async fn execute(&self, ctx: &mut OperationContext, _op: &ModelNode) -> Result<(), StepError> {
///         let name = ctx.read_resource(&Default::default())?.model()["name"].clone();
///         *ctx.result_mut() = name;
///         ctx.complete_step();
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait OperationStepHandler: Send + Sync + 'static {
    /// Executes the step against the context.
    async fn execute(
        &self,
        context: &mut OperationContext,
        operation: &ModelNode,
    ) -> Result<(), StepError>;
}

/// Shared step handler.
pub type StepHandlerRef = Arc<dyn OperationStepHandler>;

/// Completion callback of a step; consumed on use.
#[async_trait]
pub trait ResultHandler: Send + Sync + 'static {
    async fn handle_result(
        self: Box<Self>,
        action: ResultAction,
        context: &mut OperationContext,
        operation: &ModelNode,
    ) -> Result<(), StepError>;
}

pub(crate) struct RollbackFn<F>(pub(crate) F);

#[async_trait]
impl<F> ResultHandler for RollbackFn<F>
where
    F: FnOnce(&mut OperationContext, &ModelNode) -> Result<(), StepError> + Send + Sync + 'static,
{
    async fn handle_result(
        self: Box<Self>,
        action: ResultAction,
        context: &mut OperationContext,
        operation: &ModelNode,
    ) -> Result<(), StepError> {
        match action {
            ResultAction::Rollback => (self.0)(context, operation),
            ResultAction::Keep => Ok(()),
        }
    }
}

pub(crate) struct ResultFn<F>(pub(crate) F);

#[async_trait]
impl<F> ResultHandler for ResultFn<F>
where
    F: FnOnce(ResultAction, &mut OperationContext, &ModelNode) -> Result<(), StepError>
        + Send
        + Sync
        + 'static,
{
    async fn handle_result(
        self: Box<Self>,
        action: ResultAction,
        context: &mut OperationContext,
        operation: &ModelNode,
    ) -> Result<(), StepError> {
        (self.0)(action, context, operation)
    }
}

/// Transaction handle given to a [`TransactionControl`].
///
/// The vote starts as ROLLBACK; the voter must call [`commit`](Self::commit).
#[derive(Debug)]
pub struct OperationTransaction {
    vote: ResultAction,
}

impl OperationTransaction {
    pub(crate) fn new() -> Self {
        Self {
            vote: ResultAction::Rollback,
        }
    }

    pub fn commit(&mut self) {
        self.vote = ResultAction::Keep;
    }

    pub fn rollback(&mut self) {
        self.vote = ResultAction::Rollback;
    }

    pub(crate) fn vote(&self) -> ResultAction {
        self.vote
    }
}

/// External voter consulted once the operation is prepared.
#[async_trait]
pub trait TransactionControl: Send + Sync + 'static {
    /// Called with the prepared response; decide by calling `commit()` or `rollback()`.
    async fn operation_prepared(&self, transaction: &mut OperationTransaction, result: &ModelNode);
}

/// Severity of a progress report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Warn,
    Error,
}

/// Receives reports emitted by handlers through [`OperationContext::report`].
pub trait OperationMessageHandler: Send + Sync + 'static {
    fn handle_report(&self, severity: MessageSeverity, message: &str);
}
