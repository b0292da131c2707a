use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::context::nested::{DeferredStep, NestedLink, ParentCapability};
use crate::context::step::{Completion, Step};
use crate::context::{
    ContextType, MessageSeverity, OperationMessageHandler, ResponseId, ResultAction,
    ResultHandler, Stage, StepHandlerRef, TransactionControl,
};
use crate::context::handler::{ResultFn, RollbackFn};
use crate::controller::{Kernel, OperationId};
use crate::error::{OperationError, StepError};
use crate::events::{Event, EventKind};
use crate::model::node::{self, child_mut, is_defined};
use crate::model::{ModelNode, PathAddress, PathElement, Resource};
use crate::services::ServiceContainer;

/// Per-operation settings fixed when the context is created.
pub(crate) struct ContextOptions {
    pub(crate) id: OperationId,
    pub(crate) context_type: ContextType,
    pub(crate) booting: bool,
    pub(crate) rollback_on_runtime_failure: bool,
    pub(crate) allow_resource_service_restart: bool,
    pub(crate) cancel: CancellationToken,
    pub(crate) control: Option<Arc<dyn TransactionControl>>,
    pub(crate) messages: Option<Arc<dyn OperationMessageHandler>>,
    pub(crate) attachments: Vec<Vec<u8>>,
}

/// # Transactional state of one management operation.
///
/// Handlers receive `&mut OperationContext` and use it to:
/// - schedule more steps ([`add_step`](Self::add_step)),
/// - read and write the resource tree (MODEL stage only for writes),
/// - reach the service container ([`service_target`](Self::service_target)),
/// - record results and failures on their response,
/// - complete their step, optionally registering a rollback/result callback.
///
/// The first model write clones the committed tree into a private working
/// copy and takes the controller write lock. The working copy is published
/// only if the operation ends with [`ResultAction::Keep`].
pub struct OperationContext {
    pub(super) kernel: Arc<Kernel>,
    pub(super) id: OperationId,
    /// Write lock owner; nested contexts reuse the primary's.
    pub(super) permit: OperationId,
    pub(super) context_type: ContextType,
    pub(super) booting: bool,
    pub(super) rollback_on_runtime_failure: bool,
    pub(super) allow_resource_service_restart: bool,
    pub(super) cancel: CancellationToken,
    pub(super) control: Option<Arc<dyn TransactionControl>>,
    pub(super) messages: Option<Arc<dyn OperationMessageHandler>>,
    pub(super) attachments: Vec<Vec<u8>>,
    pub(super) nested: Option<NestedLink>,

    pub(super) stage: Stage,
    /// MODEL, RUNTIME and VERIFY queues.
    pub(super) queues: [VecDeque<Step>; 3],
    /// Steps in execution order; finalized in reverse.
    pub(super) executed: Vec<Step>,
    pub(super) active: Option<usize>,
    pub(super) responses: Vec<ModelNode>,

    pub(super) result_action: Option<ResultAction>,
    pub(super) rollback_only: bool,
    pub(super) cancelled: bool,

    pub(super) committed: Arc<Resource>,
    pub(super) working: Option<Resource>,
    pub(super) affected: BTreeSet<PathAddress>,
    pub(super) affects_runtime: bool,
    /// Executed index of the step that took the write lock.
    pub(super) lock_step: Option<usize>,
    /// Executed index of the step that first touched the runtime.
    pub(super) runtime_step: Option<usize>,

    reload_stamp: Option<u64>,
    restart_stamp: Option<u64>,
}

impl OperationContext {
    pub(crate) fn new(kernel: Arc<Kernel>, options: ContextOptions, model: Arc<Resource>) -> Self {
        Self {
            kernel,
            id: options.id,
            permit: options.id,
            context_type: options.context_type,
            booting: options.booting,
            rollback_on_runtime_failure: options.rollback_on_runtime_failure,
            allow_resource_service_restart: options.allow_resource_service_restart,
            cancel: options.cancel,
            control: options.control,
            messages: options.messages,
            attachments: options.attachments,
            nested: None,
            stage: Stage::Model,
            queues: Default::default(),
            executed: Vec::new(),
            active: None,
            responses: vec![Value::Object(Map::new())],
            result_action: None,
            rollback_only: false,
            cancelled: false,
            committed: model,
            working: None,
            affected: BTreeSet::new(),
            affects_runtime: false,
            lock_step: None,
            runtime_step: None,
            reload_stamp: None,
            restart_stamp: None,
        }
    }

    /// Context driven by a boot worker on behalf of a primary context.
    pub(crate) fn nested(
        kernel: Arc<Kernel>,
        parent: ParentCapability,
        model: Arc<Resource>,
        link: NestedLink,
    ) -> Self {
        let options = ContextOptions {
            id: parent.permit,
            context_type: parent.context_type,
            booting: parent.booting,
            rollback_on_runtime_failure: parent.rollback_on_runtime_failure,
            allow_resource_service_restart: false,
            cancel: parent.cancel,
            control: None,
            messages: None,
            attachments: Vec::new(),
        };
        let mut ctx = Self::new(kernel, options, model);
        ctx.nested = Some(link);
        ctx
    }

    pub(crate) fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Authority handed to nested contexts spawned from the active step.
    pub(crate) fn capability(&self) -> ParentCapability {
        ParentCapability {
            permit: self.permit,
            cancel: self.cancel.child_token(),
            booting: self.booting,
            rollback_on_runtime_failure: self.rollback_on_runtime_failure,
            context_type: self.context_type,
        }
    }

    // ---------------------------------------------------------------------
    // Flags
    // ---------------------------------------------------------------------

    pub fn operation_id(&self) -> OperationId {
        self.id
    }

    pub fn current_stage(&self) -> Stage {
        self.stage
    }

    pub fn context_type(&self) -> ContextType {
        self.context_type
    }

    /// Address of the executing step's operation.
    pub fn current_address(&self) -> PathAddress {
        self.active_step()
            .map(|step| step.address.clone())
            .unwrap_or_default()
    }

    pub fn is_booting(&self) -> bool {
        self.booting
    }

    pub fn is_normal_server(&self) -> bool {
        self.context_type == ContextType::Normal
    }

    pub fn is_rollback_on_runtime_failure(&self) -> bool {
        self.rollback_on_runtime_failure
    }

    pub fn is_resource_service_restart_allowed(&self) -> bool {
        self.allow_resource_service_restart
    }

    /// Forces the operation to roll back at the next decision point.
    pub fn set_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// `true` while finalization runs with [`ResultAction::Rollback`].
    pub fn is_rolling_back(&self) -> bool {
        self.stage == Stage::Done && self.result_action == Some(ResultAction::Rollback)
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancelled || self.cancel.is_cancelled()
    }

    /// Token that fires when the caller cancels the operation.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    // ---------------------------------------------------------------------
    // Scheduling
    // ---------------------------------------------------------------------

    /// Schedules a step for `stage`, writing to the executing step's response.
    ///
    /// [`Stage::Immediate`] runs the step next, within the current stage.
    pub fn add_step(
        &mut self,
        operation: ModelNode,
        handler: StepHandlerRef,
        stage: Stage,
    ) -> Result<(), OperationError> {
        let response = self.active_response();
        self.schedule(response, Arc::new(operation), handler, stage, false)
    }

    /// Schedules a step at the front of `stage`'s queue.
    pub fn add_step_first(
        &mut self,
        operation: ModelNode,
        handler: StepHandlerRef,
        stage: Stage,
    ) -> Result<(), OperationError> {
        let response = self.active_response();
        self.schedule(response, Arc::new(operation), handler, stage, true)
    }

    /// Schedules a step that writes to `response`.
    pub fn add_step_with_response(
        &mut self,
        response: ResponseId,
        operation: ModelNode,
        handler: StepHandlerRef,
        stage: Stage,
    ) -> Result<(), OperationError> {
        self.schedule(response, Arc::new(operation), handler, stage, false)
    }

    pub(crate) fn schedule(
        &mut self,
        response: ResponseId,
        operation: Arc<ModelNode>,
        handler: StepHandlerRef,
        stage: Stage,
        first: bool,
    ) -> Result<(), OperationError> {
        if self.stage == Stage::Done {
            return Err(OperationError::OperationAlreadyComplete);
        }
        if stage == Stage::Done {
            return Err(OperationError::InvalidStepStage { stage });
        }
        if stage != Stage::Immediate && stage < self.stage {
            return Err(OperationError::StageAlreadyComplete { stage });
        }
        if stage == Stage::Runtime && self.context_type == ContextType::AdminOnly {
            return Err(OperationError::InvalidStage {
                stage,
                context_type: self.context_type,
            });
        }
        let address = node::operation_address(&operation)?;

        if let Some(link) = self.nested.as_mut() {
            if link.defer_runtime && matches!(stage, Stage::Runtime | Stage::Verify) {
                link.deferred.push(DeferredStep {
                    response,
                    operation,
                    handler,
                    stage,
                });
                return Ok(());
            }
        }

        let target = if stage == Stage::Immediate {
            self.stage
        } else {
            stage
        };
        let Some(queue) = target.queue_index() else {
            return Err(OperationError::OperationAlreadyComplete);
        };
        let step = Step::new(handler, operation, address, response, target);
        if first || stage == Stage::Immediate {
            self.queues[queue].push_front(step);
        } else {
            self.queues[queue].push_back(step);
        }
        Ok(())
    }

    /// Completes the executing step with no result callback.
    ///
    /// Calling it again, or outside a step, has no effect.
    pub fn complete_step(&mut self) {
        self.complete_with(None);
    }

    /// Completes the executing step; `rollback` runs only if the operation
    /// ends with [`ResultAction::Rollback`].
    pub fn complete_step_with_rollback<F>(&mut self, rollback: F)
    where
        F: FnOnce(&mut OperationContext, &ModelNode) -> Result<(), StepError>
            + Send
            + Sync
            + 'static,
    {
        self.complete_with(Some(Box::new(RollbackFn(rollback))));
    }

    /// Completes the executing step; `on_result` runs with the final action.
    pub fn complete_step_with_result<F>(&mut self, on_result: F)
    where
        F: FnOnce(ResultAction, &mut OperationContext, &ModelNode) -> Result<(), StepError>
            + Send
            + Sync
            + 'static,
    {
        self.complete_with(Some(Box::new(ResultFn(on_result))));
    }

    pub fn complete_step_with(&mut self, handler: Box<dyn ResultHandler>) {
        self.complete_with(Some(handler));
    }

    fn complete_with(&mut self, handler: Option<Box<dyn ResultHandler>>) {
        if let Some(step) = self.active.and_then(|i| self.executed.get_mut(i)) {
            if step.completion.is_pending() {
                step.completion = Completion::Completed(handler);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Responses
    // ---------------------------------------------------------------------

    /// Allocates an extra response document (e.g. one per composite child).
    pub fn new_response(&mut self) -> ResponseId {
        self.responses.push(Value::Object(Map::new()));
        ResponseId(self.responses.len() - 1)
    }

    /// Response document `id`; unknown ids address the root response.
    pub fn response(&self, id: ResponseId) -> &ModelNode {
        self.responses.get(id.0).unwrap_or(&self.responses[0])
    }

    pub fn response_mut(&mut self, id: ResponseId) -> &mut ModelNode {
        let index = if id.0 < self.responses.len() { id.0 } else { 0 };
        &mut self.responses[index]
    }

    /// Response the executing step writes to.
    pub fn active_response(&self) -> ResponseId {
        self.active_step()
            .map(|step| step.response)
            .unwrap_or(ResponseId::ROOT)
    }

    pub fn result_mut(&mut self) -> &mut ModelNode {
        let id = self.active_response();
        child_mut(self.response_mut(id), node::RESULT)
    }

    pub fn set_result(&mut self, result: impl Into<ModelNode>) {
        *self.result_mut() = result.into();
    }

    pub fn failure_description_mut(&mut self) -> &mut ModelNode {
        let id = self.active_response();
        child_mut(self.response_mut(id), node::FAILURE_DESCRIPTION)
    }

    pub fn set_failure_description(&mut self, description: impl Into<ModelNode>) {
        *self.failure_description_mut() = description.into();
    }

    pub fn has_failure_description(&self) -> bool {
        is_defined(self.response(self.active_response()), node::FAILURE_DESCRIPTION)
    }

    pub fn response_headers_mut(&mut self) -> &mut ModelNode {
        let id = self.active_response();
        child_mut(self.response_mut(id), node::RESPONSE_HEADERS)
    }

    // ---------------------------------------------------------------------
    // Resource tree
    // ---------------------------------------------------------------------

    /// Root of the tree this operation sees: its working copy once it wrote,
    /// otherwise the committed tree it started from.
    pub fn root_resource(&self) -> &Resource {
        self.working.as_ref().unwrap_or(self.committed.as_ref())
    }

    pub fn read_resource(&self, address: &PathAddress) -> Result<&Resource, OperationError> {
        self.root_resource().navigate(address)
    }

    /// Renders the resource at `address` as a document.
    pub fn read_model(
        &self,
        address: &PathAddress,
        recursive: bool,
    ) -> Result<ModelNode, OperationError> {
        Ok(self.read_resource(address)?.to_model_node(recursive))
    }

    /// Mutable access to an existing resource; takes the write lock.
    pub async fn read_resource_for_update(
        &mut self,
        address: &PathAddress,
    ) -> Result<&mut Resource, OperationError> {
        self.writable_root(address).await?.navigate(address)?;
        self.affected.insert(address.clone());
        self.working_resource(address)
    }

    /// Creates an empty resource at `address`.
    pub async fn create_resource(
        &mut self,
        address: &PathAddress,
    ) -> Result<&mut Resource, OperationError> {
        self.add_resource(address, Resource::new()).await
    }

    /// Inserts a caller-built resource at `address`.
    pub async fn add_resource(
        &mut self,
        address: &PathAddress,
        resource: Resource,
    ) -> Result<&mut Resource, OperationError> {
        let Some(last) = address.last().cloned() else {
            return Err(OperationError::DuplicateResource {
                address: address.to_string(),
            });
        };
        let parent = address.parent();
        let kernel = Arc::clone(&self.kernel);
        {
            let root = self.writable_root(address).await?;
            let holder = root.navigate_mut(&parent).map_err(|err| match err {
                OperationError::NoSuchResource { address: ancestor } => {
                    OperationError::MissingAncestor {
                        ancestor,
                        address: address.to_string(),
                    }
                }
                other => other,
            })?;
            if holder.has_child(&last) {
                return Err(OperationError::DuplicateResource {
                    address: address.to_string(),
                });
            }
            if !last.is_wildcard() && !kernel.registry.has_child_type(&parent, last.key()) {
                return Err(OperationError::NoChildType {
                    address: parent.to_string(),
                    child_type: last.key().to_string(),
                });
            }
            holder.register_child(&last, resource)?;
        }
        self.affected.insert(address.clone());
        self.working_resource(address)
    }

    /// Removes the resource at `address` and returns it.
    pub async fn remove_resource(
        &mut self,
        address: &PathAddress,
    ) -> Result<Resource, OperationError> {
        let Some(last) = address.last().cloned() else {
            return Err(OperationError::NoSuchResource {
                address: address.to_string(),
            });
        };
        let root = self.writable_root(address).await?;
        let removed = root
            .navigate_mut(&address.parent())?
            .remove_child(&last)
            .ok_or_else(|| OperationError::NoSuchResource {
                address: address.to_string(),
            })?;
        self.affected.insert(address.clone());
        Ok(removed)
    }

    /// `true` once the operation wrote to the model.
    pub fn is_model_affected(&self) -> bool {
        self.working.is_some()
    }

    /// Takes the controller write lock without touching the model.
    pub async fn acquire_controller_lock(&mut self) -> Result<(), OperationError> {
        let cancel = self.cancel.clone();
        let cancel = (self.stage != Stage::Done).then_some(&cancel);
        self.take_write_lock(cancel).await
    }

    /// Replaces `subsystem=<name>` children of the working root with the
    /// subtrees prepared by boot workers, then restores declaration order.
    pub(crate) async fn graft_subsystems(
        &mut self,
        subtrees: Vec<(String, Resource)>,
        order: &[&str],
    ) -> Result<(), OperationError> {
        let root_address = PathAddress::root();
        let root = self.writable_root(&root_address).await?;
        let mut grafted = Vec::with_capacity(subtrees.len());
        for (name, subtree) in subtrees {
            let element = PathElement::new(node::SUBSYSTEM, name);
            root.remove_child(&element);
            root.register_child(&element, subtree)?;
            grafted.push(root_address.append(element));
        }
        root.reorder_children(node::SUBSYSTEM, order);
        self.affected.extend(grafted);
        Ok(())
    }

    async fn writable_root(&mut self, address: &PathAddress) -> Result<&mut Resource, OperationError> {
        if self.stage != Stage::Model {
            return Err(OperationError::ModelStageComplete { stage: self.stage });
        }
        if address.is_multi_target() {
            return Err(OperationError::WildcardWrite {
                address: address.to_string(),
            });
        }
        let cancel = self.cancel.clone();
        self.take_write_lock(Some(&cancel)).await?;
        // A writer that queued behind another one must start from its commit.
        // Nested contexts keep the tree their primary handed them.
        if self.working.is_none() && self.nested.is_none() {
            self.committed = self.kernel.model();
        }
        let committed = &self.committed;
        Ok(self.working.get_or_insert_with(|| committed.as_ref().clone()))
    }

    fn working_resource(&mut self, address: &PathAddress) -> Result<&mut Resource, OperationError> {
        match self.working.as_mut() {
            Some(root) => root.navigate_mut(address),
            None => Err(OperationError::NoSuchResource {
                address: address.to_string(),
            }),
        }
    }

    pub(super) async fn take_write_lock(
        &mut self,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), OperationError> {
        if self.lock_step.is_some() {
            return Ok(());
        }
        self.kernel.lock.lock(self.permit, cancel).await?;
        self.lock_step = Some(self.active.unwrap_or(0));
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Runtime
    // ---------------------------------------------------------------------

    /// Mutable access to the service container.
    ///
    /// Allowed in RUNTIME and VERIFY, and during rollback. The first call
    /// takes the write lock and waits for the container to settle; the step
    /// that made it waits again for stability when it is finalized.
    pub async fn service_target(&mut self) -> Result<ServiceContainer, OperationError> {
        let rolling_back = self.is_rolling_back();
        if !(matches!(self.stage, Stage::Runtime | Stage::Verify) || rolling_back) {
            return Err(OperationError::RuntimeNotAvailable { stage: self.stage });
        }
        let token = self.cancel.clone();
        let cancel = (self.stage != Stage::Done).then_some(&token);
        self.take_write_lock(cancel).await?;
        if self.runtime_step.is_none() {
            self.runtime_step = Some(self.active.unwrap_or(0));
            self.affects_runtime = true;
            self.kernel.monitor.await_stability(0, cancel).await?;
        }
        Ok(self.kernel.services.clone())
    }

    /// Read-only view of the service container; allowed in any stage.
    pub fn service_registry(&self) -> &ServiceContainer {
        &self.kernel.services
    }

    pub fn is_runtime_affected(&self) -> bool {
        self.affects_runtime
    }

    // ---------------------------------------------------------------------
    // Process state
    // ---------------------------------------------------------------------

    /// Records that the change needs a reload to take effect.
    ///
    /// Escalates to [`restart_required`](Self::restart_required) when the
    /// process does not support reloads.
    pub fn reload_required(&mut self) {
        if !self.kernel.cfg.reload_supported {
            self.restart_required();
            return;
        }
        self.reload_stamp = Some(self.kernel.process_state.set_reload_required());
        *child_mut(self.response_headers_mut(), node::OPERATION_REQUIRES_RELOAD) = true.into();
    }

    pub fn revert_reload_required(&mut self) {
        if !self.kernel.cfg.reload_supported {
            self.revert_restart_required();
            return;
        }
        if let Some(stamp) = self.reload_stamp.take() {
            self.kernel.process_state.revert_reload_required(stamp);
        }
        self.remove_header(node::OPERATION_REQUIRES_RELOAD);
    }

    pub fn restart_required(&mut self) {
        self.restart_stamp = Some(self.kernel.process_state.set_restart_required());
        *child_mut(self.response_headers_mut(), node::OPERATION_REQUIRES_RESTART) = true.into();
    }

    pub fn revert_restart_required(&mut self) {
        if let Some(stamp) = self.restart_stamp.take() {
            self.kernel.process_state.revert_restart_required(stamp);
        }
        self.remove_header(node::OPERATION_REQUIRES_RESTART);
    }

    /// Records that the model changed but the runtime was left alone.
    pub fn runtime_update_skipped(&mut self) {
        *child_mut(self.response_headers_mut(), node::RUNTIME_UPDATE_SKIPPED) = true.into();
    }

    fn remove_header(&mut self, header: &str) {
        let id = self.active_response();
        if let Some(headers) = self
            .response_mut(id)
            .get_mut(node::RESPONSE_HEADERS)
            .and_then(Value::as_object_mut)
        {
            headers.remove(header);
        }
    }

    // ---------------------------------------------------------------------
    // Caller interaction
    // ---------------------------------------------------------------------

    /// Forwards a progress report to the caller's message handler, if any.
    pub fn report(&self, severity: MessageSeverity, message: &str) {
        if let Some(handler) = &self.messages {
            handler.handle_report(severity, message);
        }
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    pub fn attachment(&self, index: usize) -> Option<&[u8]> {
        self.attachments.get(index).map(Vec::as_slice)
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    pub(super) fn active_step(&self) -> Option<&Step> {
        self.active.and_then(|i| self.executed.get(i))
    }

    /// Publishes an event tagged with this operation and its executing step.
    pub(super) fn publish(&self, kind: EventKind, reason: Option<String>) {
        let mut ev = Event::new(kind)
            .with_operation_id(self.id.0)
            .with_stage(self.stage)
            .with_booting(self.booting);
        if let Some(step) = self.active_step() {
            ev = ev
                .with_operation(step.operation_name())
                .with_address(step.address.to_string());
        }
        if let Some(reason) = reason {
            ev = ev.with_reason(reason);
        }
        self.kernel.bus.publish(ev);
    }

    /// The root response, consumed once the operation is done.
    pub(crate) fn take_responses(&mut self) -> Vec<ModelNode> {
        std::mem::take(&mut self.responses)
    }
}
