use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use serde_json::json;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cancel::cancellable;
use crate::context::{
    ContextOptions, OperationContext, OperationMessageHandler, ResponseId, ResultAction, Stage,
    TransactionControl,
};
use crate::controller::boot::BootPlan;
use crate::controller::kernel::Kernel;
use crate::controller::prepare::PrepareStep;
use crate::controller::{ControllerConfig, ModelControllerBuilder, ProcessState};
use crate::error::ControllerError;
use crate::events::{Event, EventKind};
use crate::model::node::{self, child_mut, is_defined};
use crate::model::{ModelNode, Resource};
use crate::services::{ContainerMonitor, ContainerStateReport, ServiceContainer};

/// Per-call options of [`ModelController::execute_with`].
#[derive(Default)]
pub struct ExecuteOptions {
    /// Receives [`OperationContext::report`] messages.
    pub message_handler: Option<Arc<dyn OperationMessageHandler>>,
    /// External voter consulted at the commit point; `None` auto-commits.
    pub transaction_control: Option<Arc<dyn TransactionControl>>,
    /// Input streams readable through [`OperationContext::attachment`].
    pub attachments: Vec<Vec<u8>>,
    /// Caller-side cancellation; defaults to a child of the controller's token.
    pub cancel: Option<CancellationToken>,
}

/// Handle to an operation started with [`ModelController::execute_async`].
pub struct OperationHandle {
    cancel: CancellationToken,
    join: JoinHandle<ModelNode>,
}

impl OperationHandle {
    /// Requests cancellation; the operation rolls back at its next wait or step.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the operation's response.
    pub async fn response(self) -> Result<ModelNode, ControllerError> {
        self.join.await.map_err(|err| ControllerError::Aborted {
            reason: err.to_string(),
        })
    }
}

/// # Transactional management controller.
///
/// Owns the committed resource tree and runs operations against it, one
/// writer at a time. Build it with [`ModelController::builder`].
///
/// ```text
/// execute(op) ─► OperationContext(committed snapshot)
///                   └─ PrepareStep ─► registered handler ─► ... ─► response
/// boot(ops)   ─► boot context ─► BootPlan (extensions, parallel subsystems, rest)
/// ```
pub struct ModelController {
    kernel: Arc<Kernel>,
    runtime_token: CancellationToken,
    semaphore: Option<Arc<Semaphore>>,
    booted: AtomicBool,
}

impl ModelController {
    /// Creates a builder with the given configuration.
    pub fn builder(cfg: ControllerConfig) -> ModelControllerBuilder {
        ModelControllerBuilder::new(cfg)
    }

    pub(crate) fn new_internal(
        kernel: Arc<Kernel>,
        runtime_token: CancellationToken,
        semaphore: Option<Arc<Semaphore>>,
    ) -> Self {
        Self {
            kernel,
            runtime_token,
            semaphore,
            booted: AtomicBool::new(false),
        }
    }

    /// Runs the boot operations in a single boot context.
    ///
    /// Returns one response per boot operation, in declaration order.
    /// Failures are published as [`EventKind::BootOperationFailed`]; a boot
    /// that ends with ROLLBACK leaves the model untouched and fails.
    pub async fn boot(&self, operations: Vec<ModelNode>) -> Result<Vec<ModelNode>, ControllerError> {
        if self.booted.swap(true, AtomicOrdering::AcqRel) {
            return Err(ControllerError::AlreadyBooted);
        }
        let cfg = &self.kernel.cfg;
        let id = self.kernel.register_operation_id();
        let options = ContextOptions {
            id,
            context_type: cfg.running_mode,
            booting: true,
            rollback_on_runtime_failure: cfg.boot_rollback_on_runtime_failure,
            allow_resource_service_restart: false,
            cancel: self.runtime_token.child_token(),
            control: None,
            messages: None,
            attachments: Vec::new(),
        };
        let mut ctx = OperationContext::new(Arc::clone(&self.kernel), options, self.kernel.model());
        let plan = BootPlan::organize(operations, cfg.boot_parallelism().is_some());
        let ids = plan.schedule(&mut ctx);

        let action = ctx.execute_operation().await;
        let mut responses = ctx.take_responses();
        self.kernel.release_operation_id(id);

        let root = std::mem::take(&mut responses[ResponseId::ROOT.0]);
        let responses: Vec<ModelNode> = ids
            .into_iter()
            .map(|rid| std::mem::take(&mut responses[rid.0]))
            .collect();
        for response in responses.iter().filter(|r| is_defined(r, node::FAILURE_DESCRIPTION)) {
            let reason = node::text(&response[node::FAILURE_DESCRIPTION]);
            self.kernel.bus.publish(
                Event::new(EventKind::BootOperationFailed)
                    .with_operation_id(id.0)
                    .with_booting(true)
                    .with_reason(reason),
            );
        }

        match action {
            ResultAction::Keep => {
                self.kernel.process_state.set_running();
                self.kernel.bus.publish(
                    Event::new(EventKind::BootCompleted)
                        .with_operation_id(id.0)
                        .with_booting(true),
                );
                Ok(responses)
            }
            ResultAction::Rollback => {
                let failure = std::iter::once(&root)
                    .chain(responses.iter())
                    .find(|r| is_defined(r, node::FAILURE_DESCRIPTION))
                    .map(|r| r[node::FAILURE_DESCRIPTION].clone())
                    .unwrap_or_else(|| "Boot rolled back".into());
                Err(ControllerError::BootFailed { failure })
            }
        }
    }

    /// Executes one operation with default options.
    pub async fn execute(&self, operation: ModelNode) -> ModelNode {
        self.execute_with(operation, ExecuteOptions::default()).await
    }

    /// Executes one operation and returns its response document.
    pub async fn execute_with(&self, operation: ModelNode, options: ExecuteOptions) -> ModelNode {
        let id = self.kernel.register_operation_id();
        let ctx_options = ContextOptions {
            id,
            context_type: self.kernel.cfg.running_mode,
            booting: false,
            rollback_on_runtime_failure: node::rollback_on_runtime_failure(&operation),
            allow_resource_service_restart: node::header_flag(
                &operation,
                node::ALLOW_RESOURCE_SERVICE_RESTART,
            )
            .unwrap_or(false),
            cancel: options
                .cancel
                .unwrap_or_else(|| self.runtime_token.child_token()),
            control: options.transaction_control,
            messages: options.message_handler,
            attachments: options.attachments,
        };
        let mut ctx = OperationContext::new(Arc::clone(&self.kernel), ctx_options, self.kernel.model());
        let scheduled = ctx.schedule(
            ResponseId::ROOT,
            Arc::new(operation),
            Arc::new(PrepareStep),
            Stage::Model,
            false,
        );
        let mut response = match scheduled {
            Ok(()) => {
                ctx.execute_operation().await;
                ctx.take_responses().into_iter().next().unwrap_or_default()
            }
            Err(err) => json!({
                (node::OUTCOME): node::FAILED,
                (node::FAILURE_DESCRIPTION): err.to_string(),
            }),
        };
        drop(ctx);
        self.kernel.release_operation_id(id);

        let state = self.kernel.process_state.state();
        if state.requires_action() {
            let headers = child_mut(&mut response, node::RESPONSE_HEADERS);
            *child_mut(headers, node::PROCESS_STATE) = state.to_string().into();
        }
        response
    }

    /// Starts an operation on its own task.
    ///
    /// With `max_concurrent_operations > 0` the task first waits for an
    /// admission slot; cancelling while it waits yields a cancelled response.
    pub fn execute_async(
        self: &Arc<Self>,
        operation: ModelNode,
        mut options: ExecuteOptions,
    ) -> OperationHandle {
        let cancel = options
            .cancel
            .get_or_insert_with(|| self.runtime_token.child_token())
            .clone();
        let me = Arc::clone(self);
        let admission = cancel.clone();
        let join = tokio::spawn(async move {
            let _permit = match me.semaphore.clone() {
                Some(semaphore) => {
                    match cancellable(semaphore.acquire_owned(), Some(&admission)).await {
                        Ok(Ok(permit)) => Some(permit),
                        _ => return cancelled_response(),
                    }
                }
                None => None,
            };
            me.execute_with(operation, options).await
        });
        OperationHandle { cancel, join }
    }

    /// Snapshot of the committed model.
    pub fn model(&self) -> Arc<Resource> {
        self.kernel.model()
    }

    /// Renders the committed model as a document.
    pub fn read_model(&self, recursive: bool) -> ModelNode {
        self.kernel.model().to_model_node(recursive)
    }

    pub fn process_state(&self) -> ProcessState {
        self.kernel.process_state.state()
    }

    pub fn services(&self) -> &ServiceContainer {
        &self.kernel.services
    }

    pub fn monitor(&self) -> &ContainerMonitor {
        &self.kernel.monitor
    }

    /// Most recent container change report.
    pub fn container_state_report(&self) -> Option<ContainerStateReport> {
        self.kernel.monitor.last_report()
    }

    /// Number of operations currently executing.
    pub fn active_operations(&self) -> usize {
        self.kernel.active_operations()
    }

    /// Subscribes to the event bus.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.kernel.bus.subscribe()
    }

    /// Cancels in-flight operations and stops background tasks.
    pub fn shutdown(&self) {
        self.kernel.process_state.set_stopping();
        self.runtime_token.cancel();
    }
}

impl Drop for ModelController {
    fn drop(&mut self) {
        self.runtime_token.cancel();
    }
}

fn cancelled_response() -> ModelNode {
    json!({
        (node::OUTCOME): node::CANCELLED,
        (node::FAILURE_DESCRIPTION): "Operation cancelled",
        (node::ROLLED_BACK): true,
    })
}
