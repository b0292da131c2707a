//! Shared fixtures for controller and scheduler tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;

use crate::context::{
    OperationContext, OperationStepHandler, ResultAction, ResultHandler, Stage, StepHandlerRef,
};
use crate::controller::{ControllerConfig, InMemoryPersister, ManagementRegistry, ModelController};
use crate::error::StepError;
use crate::model::{ModelNode, PathAddress, operation, operation_address};
use crate::services::{ServiceFn, ServiceRef};

/// Ordered record of what handlers did.
#[derive(Clone, Default)]
pub(crate) struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub(crate) fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

pub(crate) fn addr(s: &str) -> PathAddress {
    s.parse().unwrap()
}

pub(crate) fn op(name: &str, address: &str) -> ModelNode {
    operation(name, &addr(address))
}

/// `add` with a `value` parameter.
pub(crate) fn add(address: &str, value: i64) -> ModelNode {
    let mut op = op("add", address);
    op["value"] = json!(value);
    op
}

pub(crate) struct Harness {
    pub(crate) controller: Arc<ModelController>,
    pub(crate) registry: Arc<ManagementRegistry>,
    pub(crate) persister: InMemoryPersister,
    pub(crate) journal: Journal,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }

    /// Controller with `subsystem=*`, `subsystem=*/child=*` and `extension=*`
    /// declared and an `add` handler at both subsystem levels.
    pub(crate) fn with_config(cfg: ControllerConfig) -> Self {
        let registry = ManagementRegistry::new();
        let persister = InMemoryPersister::default();
        let journal = Journal::default();
        registry.register_resource(&addr("/subsystem=*/child=*"));
        registry.register_resource(&addr("/extension=*"));
        let add: StepHandlerRef = Arc::new(Add {
            journal: journal.clone(),
        });
        registry.register_operation(&addr("/subsystem=*"), "add", Arc::clone(&add));
        registry.register_operation(&addr("/subsystem=*/child=*"), "add", add);
        registry.register_operation(&addr("/subsystem=*"), "read", Arc::new(Read));

        let controller = ModelController::builder(cfg)
            .with_registry(Arc::clone(&registry) as _)
            .with_persister(Arc::new(persister.clone()))
            .build();
        Self {
            controller,
            registry,
            persister,
            journal,
        }
    }

    /// Registers a MODEL-stage handler for `name` on every subsystem.
    pub(crate) fn register(&self, name: &str, handler: impl OperationStepHandler) {
        self.registry
            .register_operation(&addr("/subsystem=*"), name, Arc::new(handler));
    }
}

/// Creates the addressed resource, storing the `value` parameter.
pub(crate) struct Add {
    pub(crate) journal: Journal,
}

#[async_trait]
impl OperationStepHandler for Add {
    async fn execute(&self, ctx: &mut OperationContext, op: &ModelNode) -> Result<(), StepError> {
        let address = operation_address(op)?;
        let resource = ctx.create_resource(&address).await?;
        if let Some(value) = op.get("value") {
            resource.write_model(json!({ "value": value }));
        }
        let journal = self.journal.clone();
        ctx.complete_step_with_rollback(move |_, _| {
            journal.push(format!("rollback add {address}"));
            Ok(())
        });
        Ok(())
    }
}

pub(crate) struct Read;

#[async_trait]
impl OperationStepHandler for Read {
    async fn execute(&self, ctx: &mut OperationContext, op: &ModelNode) -> Result<(), StepError> {
        let model = ctx.read_model(&operation_address(op)?, true)?;
        ctx.set_result(model);
        ctx.complete_step();
        Ok(())
    }
}

/// Sets a failure description, then completes.
pub(crate) struct FailDescription(pub(crate) &'static str);

#[async_trait]
impl OperationStepHandler for FailDescription {
    async fn execute(&self, ctx: &mut OperationContext, _: &ModelNode) -> Result<(), StepError> {
        ctx.set_failure_description(self.0);
        ctx.complete_step();
        Ok(())
    }
}

/// Returns the error without completing.
pub(crate) struct Fail(pub(crate) StepError);

#[async_trait]
impl OperationStepHandler for Fail {
    async fn execute(&self, _: &mut OperationContext, _: &ModelNode) -> Result<(), StepError> {
        Err(self.0.clone())
    }
}

pub(crate) struct FailAfterComplete;

#[async_trait]
impl OperationStepHandler for FailAfterComplete {
    async fn execute(&self, ctx: &mut OperationContext, _: &ModelNode) -> Result<(), StepError> {
        ctx.complete_step();
        Err(StepError::unexpected("late failure"))
    }
}

/// Returns without completing its step.
pub(crate) struct Forget;

#[async_trait]
impl OperationStepHandler for Forget {
    async fn execute(&self, _: &mut OperationContext, _: &ModelNode) -> Result<(), StepError> {
        Ok(())
    }
}

/// Optionally creates the addressed resource, then schedules `steps` with
/// the same operation.
pub(crate) struct Chain {
    pub(crate) create: bool,
    pub(crate) steps: Vec<(Stage, StepHandlerRef)>,
}

#[async_trait]
impl OperationStepHandler for Chain {
    async fn execute(&self, ctx: &mut OperationContext, op: &ModelNode) -> Result<(), StepError> {
        if self.create {
            ctx.create_resource(&operation_address(op)?).await?;
        }
        for (stage, handler) in &self.steps {
            ctx.add_step(op.clone(), Arc::clone(handler), *stage)?;
        }
        ctx.complete_step();
        Ok(())
    }
}

/// Journals the stage it runs in and the action it is finalized with.
pub(crate) struct Record {
    pub(crate) journal: Journal,
    pub(crate) label: &'static str,
}

#[async_trait]
impl OperationStepHandler for Record {
    async fn execute(&self, ctx: &mut OperationContext, _: &ModelNode) -> Result<(), StepError> {
        self.journal
            .push(format!("{}:{}", self.label, ctx.current_stage()));
        let journal = self.journal.clone();
        let label = self.label;
        ctx.complete_step_with_result(move |action, _, _| {
            journal.push(format!("final {label} {action:?}"));
            Ok(())
        });
        Ok(())
    }
}

/// Creates the addressed resource, then waits for `release` or cancellation.
#[derive(Clone, Default)]
pub(crate) struct Hold {
    pub(crate) entered: Arc<Notify>,
    pub(crate) release: Arc<Notify>,
}

#[async_trait]
impl OperationStepHandler for Hold {
    async fn execute(&self, ctx: &mut OperationContext, op: &ModelNode) -> Result<(), StepError> {
        ctx.create_resource(&operation_address(op)?).await?;
        let token = ctx.cancellation_token().clone();
        self.entered.notify_one();
        tokio::select! {
            _ = self.release.notified() => {}
            _ = token.cancelled() => return Err(StepError::Cancelled),
        }
        ctx.complete_step();
        Ok(())
    }
}

/// RUNTIME step installing a service; removes it on rollback.
pub(crate) struct Install(pub(crate) &'static str);

pub(crate) fn ok_service(name: &'static str) -> ServiceRef {
    ServiceFn::arc(name, |_token| async { Ok(()) })
}

#[async_trait]
impl OperationStepHandler for Install {
    async fn execute(&self, ctx: &mut OperationContext, _: &ModelNode) -> Result<(), StepError> {
        let target = ctx.service_target().await?;
        target
            .install(self.0, ok_service(self.0), Vec::new())
            .map_err(|err| StepError::failed(err.to_string()))?;
        ctx.complete_step_with(Box::new(RemoveOnRollback(self.0)));
        Ok(())
    }
}

struct RemoveOnRollback(&'static str);

#[async_trait]
impl ResultHandler for RemoveOnRollback {
    async fn handle_result(
        self: Box<Self>,
        action: ResultAction,
        ctx: &mut OperationContext,
        _: &ModelNode,
    ) -> Result<(), StepError> {
        if action == ResultAction::Rollback {
            let target = ctx.service_target().await?;
            target
                .remove(self.0)
                .map_err(|err| StepError::unexpected(err.to_string()))?;
        }
        Ok(())
    }
}
