//! Root steps that turn an operation document into its registered handler.

use async_trait::async_trait;

use crate::context::{OperationContext, OperationStepHandler, Stage};
use crate::controller::registry::{OperationEntry, OperationRegistry};
use crate::error::StepError;
use crate::model::{ModelNode, node};

/// Looks up the handler for `operation`.
pub(crate) fn resolve(
    registry: &dyn OperationRegistry,
    operation: &ModelNode,
) -> Result<OperationEntry, StepError> {
    let address = node::operation_address(operation)?;
    let name = node::operation_name(operation).unwrap_or_default();
    if let Some(entry) = registry.operation_handler(&address, name) {
        return Ok(entry);
    }
    if registry.has_resource(&address) {
        Err(StepError::failed(format!(
            "No operation named '{name}' exists at address {address}"
        )))
    } else {
        Err(StepError::failed(format!(
            "No resource definition is registered for address {address}"
        )))
    }
}

/// First step of every `execute`: schedules the registered handler.
pub(crate) struct PrepareStep;

#[async_trait]
impl OperationStepHandler for PrepareStep {
    async fn execute(
        &self,
        ctx: &mut OperationContext,
        operation: &ModelNode,
    ) -> Result<(), StepError> {
        let entry = resolve(ctx.kernel().registry.as_ref(), operation)?;
        ctx.add_step(operation.clone(), entry.handler, entry.stage)?;
        ctx.complete_step();
        Ok(())
    }
}

/// Boot step; resolves its handler only when it runs, after earlier boot
/// operations (extensions) had the chance to register it.
pub(crate) struct BootOperationHandler;

#[async_trait]
impl OperationStepHandler for BootOperationHandler {
    async fn execute(
        &self,
        ctx: &mut OperationContext,
        operation: &ModelNode,
    ) -> Result<(), StepError> {
        match resolve(ctx.kernel().registry.as_ref(), operation) {
            Ok(entry) => {
                let stage = match entry.stage {
                    Stage::Model => Stage::Immediate,
                    other => other,
                };
                ctx.add_step(operation.clone(), entry.handler, stage)?;
            }
            Err(err) => {
                ctx.set_failure_description(err.as_message());
                ctx.set_rollback_only();
            }
        }
        ctx.complete_step();
        Ok(())
    }
}
