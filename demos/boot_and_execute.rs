//! # Example: boot_and_execute
//!
//! Boots a controller with a few subsystems in parallel, then runs
//! operations against the committed model.
//!
//! Shows how to:
//! - Register resources and [`OperationStepHandler`]s in a [`ManagementRegistry`].
//! - Install services from a RUNTIME step and undo them on rollback.
//! - Watch kernel events through the built-in [`LogWriter`].
//!
//! ## Flow
//! ```text
//! boot([extension add, subsystem adds...])
//!   ├─► extension add (registers nothing new here, runs first)
//!   ├─► subsystem adds on 2 workers ──► MODEL: create resource
//!   │                                  └─► RUNTIME: install "<name>.service"
//!   └─► BootCompleted
//! execute(add /subsystem=web)     ──► fails: duplicate resource, rolled back
//! execute(write-port ...)         ──► success, reload required
//! ```
//!
//! ## Run
//! ```bash
//! cargo run --example boot_and_execute --features logging
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opkernel::services::{ServiceFn, ServiceRef};
use opkernel::{
    ControllerConfig, LogWriter, ManagementRegistry, ModelController, ModelNode, OperationContext,
    OperationStepHandler, PathAddress, ResultAction, ResultHandler, Stage, StepError, Subscribe,
    model::operation, operation_address,
};

/// Creates the subsystem resource and schedules its service.
struct AddSubsystem;

#[async_trait]
impl OperationStepHandler for AddSubsystem {
    async fn execute(&self, ctx: &mut OperationContext, op: &ModelNode) -> Result<(), StepError> {
        let address = operation_address(op)?;
        let port = op.get("port").cloned().unwrap_or(ModelNode::Null);
        ctx.create_resource(&address)
            .await?
            .write_model(serde_json::json!({ "port": port }));
        ctx.add_step(op.clone(), Arc::new(InstallService), Stage::Runtime)?;
        ctx.complete_step();
        Ok(())
    }
}

struct InstallService;

#[async_trait]
impl OperationStepHandler for InstallService {
    async fn execute(&self, ctx: &mut OperationContext, op: &ModelNode) -> Result<(), StepError> {
        let name = service_name(op)?;
        let service: ServiceRef = ServiceFn::arc(name.clone(), |_token| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        });
        ctx.service_target()
            .await?
            .install(name.clone(), service, Vec::new())
            .map_err(|err| StepError::failed(err.to_string()))?;
        ctx.complete_step_with(Box::new(RemoveService(name)));
        Ok(())
    }
}

struct RemoveService(String);

#[async_trait]
impl ResultHandler for RemoveService {
    async fn handle_result(
        self: Box<Self>,
        action: ResultAction,
        ctx: &mut OperationContext,
        _: &ModelNode,
    ) -> Result<(), StepError> {
        if action == ResultAction::Rollback {
            let _ = ctx.service_target().await?.remove(&self.0);
        }
        Ok(())
    }
}

/// Changes the port attribute; takes effect after a reload.
struct WritePort;

#[async_trait]
impl OperationStepHandler for WritePort {
    async fn execute(&self, ctx: &mut OperationContext, op: &ModelNode) -> Result<(), StepError> {
        let address = operation_address(op)?;
        let port = op["value"].clone();
        ctx.read_resource_for_update(&address).await?.model_mut()["port"] = port;
        ctx.reload_required();
        ctx.complete_step_with_rollback(|ctx, _| {
            ctx.revert_reload_required();
            Ok(())
        });
        Ok(())
    }
}

/// Extension `add`: only records the resource.
struct AddExtension;

#[async_trait]
impl OperationStepHandler for AddExtension {
    async fn execute(&self, ctx: &mut OperationContext, op: &ModelNode) -> Result<(), StepError> {
        ctx.create_resource(&operation_address(op)?).await?;
        ctx.complete_step();
        Ok(())
    }
}

fn service_name(op: &ModelNode) -> Result<String, StepError> {
    let address = operation_address(op)?;
    let name = address
        .last()
        .map(|e| e.value().to_string())
        .ok_or_else(|| StepError::unexpected("subsystem address is empty"))?;
    Ok(format!("{name}.service"))
}

fn subsystem_add(name: &str, port: u16) -> Result<ModelNode, Box<dyn std::error::Error>> {
    let mut op = operation("add", &format!("/subsystem={name}").parse()?);
    op["port"] = port.into();
    Ok(op)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let registry = ManagementRegistry::new();
    let subsystems: PathAddress = "/subsystem=*".parse()?;
    let extensions: PathAddress = "/extension=*".parse()?;
    registry.register_resource(&subsystems);
    registry.register_resource(&extensions);
    registry.register_operation(&subsystems, "add", Arc::new(AddSubsystem));
    registry.register_operation(&subsystems, "write-port", Arc::new(WritePort));
    registry.register_operation(&extensions, "add", Arc::new(AddExtension));

    let subs: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter::new())];
    let cfg = ControllerConfig {
        boot_workers: 2,
        ..ControllerConfig::default()
    };
    let controller = ModelController::builder(cfg)
        .with_registry(registry)
        .with_subscribers(subs)
        .build();

    let boot = vec![
        subsystem_add("web", 8080)?,
        operation("add", &"/extension=org.example.web".parse()?),
        subsystem_add("io", 0)?,
        subsystem_add("logging", 0)?,
    ];
    for response in controller.boot(boot).await? {
        println!("[boot] {response}");
    }
    println!("[model] {:#}", controller.read_model(true));
    println!("[services] {:?}", controller.services().names());

    let response = controller.execute(subsystem_add("web", 9090)?).await;
    println!("[duplicate] {response}");

    let mut write = operation("write-port", &"/subsystem=web".parse()?);
    write["value"] = 8443.into();
    let response = controller.execute(write).await;
    println!("[write-port] {response}");
    println!("[process] {}", controller.process_state());

    // Let the subscriber drain before exiting.
    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.shutdown();
    Ok(())
}
