//! The step loop: execute, decide, commit, finalize.
//!
//! ```text
//! loop:
//!   can_continue? ──no──► (ROLLBACK fixed)
//!   next_step ── queue empty ─► advance stage (await stability before VERIFY)
//!   execute_step ─► classify ─► record failure / fix ROLLBACK
//! reached DONE without ROLLBACK:
//!   persist ─► vote (voter | boot primary | auto-commit) ─► publish model
//! finalize:
//!   never-executed steps ─► executed steps in reverse (result handler, outcome, release locks)
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use crate::context::nested::Prepared;
use crate::context::step::{Completion, Step, StepExecution};
use crate::context::{OperationContext, OperationTransaction, ResponseId, ResultAction, Stage};
use crate::error::StepError;
use crate::events::EventKind;
use crate::model::node::{self, child_mut, is_defined};
use crate::model::{PathElement, Resource};
use crate::subscribers::panic_message;

const HANDLER_FAILED_TO_COMPLETE: &str = "Operation handler failed to complete";
const OPERATION_CANCELLED: &str = "Operation cancelled";

impl OperationContext {
    /// Runs every scheduled step, commits or rolls back, and finalizes.
    ///
    /// Returns the final [`ResultAction`]; responses stay on the context.
    pub(crate) async fn execute_operation(&mut self) -> ResultAction {
        while self.can_continue() {
            match self.next_step().await {
                Some(step) => self.execute_step(step).await,
                None => break,
            }
        }

        if self.result_action.is_none() && self.stage == Stage::Done {
            let action = self.commit().await;
            self.result_action = Some(action);
        }
        let action = *self.result_action.get_or_insert(ResultAction::Rollback);

        if action == ResultAction::Rollback {
            self.signal_failed_prepared();
        }
        self.finalize(action).await;
        action
    }

    /// Decides whether the next step may run; fixes ROLLBACK when not.
    fn can_continue(&mut self) -> bool {
        if self.result_action == Some(ResultAction::Rollback) {
            return false;
        }
        if self.is_cancel_requested() {
            self.mark_cancelled();
            return false;
        }
        let failed = self
            .active_step()
            .is_some_and(|step| is_defined(self.response(step.response), node::FAILURE_DESCRIPTION));
        if failed
            && (self.stage == Stage::Model || self.rollback_on_runtime_failure || self.rollback_only)
        {
            self.result_action = Some(ResultAction::Rollback);
            return false;
        }
        true
    }

    /// Pops the next step, advancing stages as queues drain.
    ///
    /// Entering VERIFY after runtime changes waits for the container to
    /// settle. Returns `None` once the operation reaches DONE.
    async fn next_step(&mut self) -> Option<Step> {
        loop {
            let queue = self.stage.queue_index()?;
            if let Some(step) = self.queues[queue].pop_front() {
                return Some(step);
            }
            let next = self.stage.next();
            if next == Stage::Verify && self.affects_runtime {
                let cancel = self.cancel.clone();
                if self
                    .kernel
                    .monitor
                    .await_stability(0, Some(&cancel))
                    .await
                    .is_err()
                {
                    self.mark_cancelled();
                    return None;
                }
            }
            self.stage = next;
        }
    }

    async fn execute_step(&mut self, mut step: Step) {
        step.stage = self.stage;
        let handler = Arc::clone(&step.handler);
        let operation = Arc::clone(&step.operation);
        let index = self.executed.len();
        self.executed.push(step);
        self.active = Some(index);

        let outcome = match AssertUnwindSafe(handler.execute(self, &operation))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => Err(StepError::unexpected(panic_message(&*panic))),
        };
        let completed = !self.executed[index].completion.is_pending();
        let response = self.executed[index].response;
        let failed = is_defined(self.response(response), node::FAILURE_DESCRIPTION);

        match StepExecution::classify(completed, outcome, failed) {
            StepExecution::Completed { failed } => {
                if failed {
                    let reason = failure_text(self.response(response));
                    self.publish(EventKind::OperationFailed, Some(reason));
                }
            }
            StepExecution::AlreadyFinalized { error } => {
                self.publish(EventKind::StepFailedAfterCompletion, Some(error.as_message()));
            }
            StepExecution::Incomplete => {
                self.publish(EventKind::StepIncomplete, None);
                let outcome = if self.is_cancel_requested() {
                    node::CANCELLED
                } else {
                    node::FAILED
                };
                let doc = self.response_mut(response);
                if !is_defined(doc, node::FAILURE_DESCRIPTION) {
                    *child_mut(doc, node::FAILURE_DESCRIPTION) = HANDLER_FAILED_TO_COMPLETE.into();
                }
                *child_mut(doc, node::OUTCOME) = outcome.into();
                *child_mut(doc, node::ROLLED_BACK) = true.into();
                self.result_action = Some(ResultAction::Rollback);
                self.stage = Stage::Done;
                self.executed[index].completion = Completion::Completed(None);
            }
            StepExecution::Aborted { error } => {
                self.executed[index].completion = Completion::Completed(None);
                match error {
                    StepError::OperationFailed { description } => {
                        self.publish(EventKind::OperationFailed, Some(failure_text(&description)));
                        *child_mut(self.response_mut(response), node::FAILURE_DESCRIPTION) =
                            description;
                    }
                    StepError::Cancelled => {
                        self.cancelled = true;
                    }
                    StepError::Unexpected { error } => {
                        self.publish(EventKind::StepHandlerFailed, Some(error.clone()));
                        let doc = self.response_mut(response);
                        if !is_defined(doc, node::FAILURE_DESCRIPTION) {
                            *child_mut(doc, node::FAILURE_DESCRIPTION) =
                                format!("Operation handler failed: {error}").into();
                        }
                        *child_mut(doc, node::OUTCOME) = node::FAILED.into();
                        *child_mut(doc, node::ROLLED_BACK) = true.into();
                        self.result_action = Some(ResultAction::Rollback);
                    }
                }
            }
        }
    }

    /// Fixes ROLLBACK for a cancelled operation and records it once.
    fn mark_cancelled(&mut self) {
        self.cancelled = true;
        if self.result_action == Some(ResultAction::Rollback) {
            return;
        }
        self.result_action = Some(ResultAction::Rollback);
        let response = self.active_response();
        let doc = self.response_mut(response);
        *child_mut(doc, node::OUTCOME) = node::CANCELLED.into();
        *child_mut(doc, node::FAILURE_DESCRIPTION) = OPERATION_CANCELLED.into();
        *child_mut(doc, node::ROLLED_BACK) = true.into();
        self.publish(EventKind::OperationCancelled, None);
    }

    /// Commit point: persist, collect the vote, publish the working model.
    async fn commit(&mut self) -> ResultAction {
        if self.rollback_only {
            return ResultAction::Rollback;
        }
        if self.nested.is_some() {
            return self.await_boot_decision().await;
        }

        let mut persistence = None;
        if let Some(working) = &self.working {
            let affected: Vec<_> = self.affected.iter().cloned().collect();
            match self
                .kernel
                .persister
                .store(&working.to_model_node(true), &affected)
            {
                Ok(handle) => persistence = Some(handle),
                Err(err) => {
                    let response = self.active_response();
                    *child_mut(self.response_mut(response), node::FAILURE_DESCRIPTION) =
                        format!("Failed to persist configuration change: {err}").into();
                    self.publish(EventKind::PersistenceFailed, Some(err.to_string()));
                    return ResultAction::Rollback;
                }
            }
        }

        let action = match self.control.clone() {
            Some(control) => {
                let mut transaction = OperationTransaction::new();
                control
                    .operation_prepared(&mut transaction, &self.responses[ResponseId::ROOT.0])
                    .await;
                transaction.vote()
            }
            None => ResultAction::Keep,
        };

        if let Some(handle) = persistence {
            match action {
                ResultAction::Keep => handle.commit(),
                ResultAction::Rollback => handle.rollback(),
            }
        }
        if action == ResultAction::Keep {
            if let Some(working) = self.working.take() {
                let published = Arc::new(working);
                self.kernel.publish_model(Arc::clone(&published));
                self.committed = published;
            }
        }
        action
    }

    /// Nested commit point: hand the prepared state to the primary and wait
    /// for its decision. A primary that went away counts as ROLLBACK.
    async fn await_boot_decision(&mut self) -> ResultAction {
        let failed = self
            .responses
            .iter()
            .any(|r| is_defined(r, node::FAILURE_DESCRIPTION));
        let prepared = Prepared {
            failed,
            responses: self.responses.clone(),
            subtree: self.prepared_subtree(),
            deferred: Vec::new(),
        };
        let Some(link) = self.nested.as_mut() else {
            return ResultAction::Keep;
        };
        let prepared = Prepared {
            deferred: std::mem::take(&mut link.deferred),
            ..prepared
        };
        let (Some(tx), Some(decision)) = (link.prepared.take(), link.decision.take()) else {
            return ResultAction::Rollback;
        };
        link.slot = None;
        if tx.send(prepared).is_err() {
            return ResultAction::Rollback;
        }
        decision.await.unwrap_or(ResultAction::Rollback)
    }

    fn prepared_subtree(&self) -> Option<Resource> {
        let link = self.nested.as_ref()?;
        let element = PathElement::new(node::SUBSYSTEM, link.subsystem.as_str());
        self.working.as_ref()?.child(&element).cloned()
    }

    /// A nested context that rolled back before its commit point tells the
    /// primary without waiting for a decision.
    fn signal_failed_prepared(&mut self) {
        let responses = self.responses.clone();
        let Some(link) = self.nested.as_mut() else {
            return;
        };
        if let Some(tx) = link.prepared.take() {
            let _ = tx.send(Prepared {
                failed: true,
                responses,
                subtree: None,
                deferred: Vec::new(),
            });
        }
        link.decision = None;
        link.deferred.clear();
        link.slot = None;
    }

    /// Runs result handlers newest-first and stamps every response's outcome.
    async fn finalize(&mut self, action: ResultAction) {
        self.stage = Stage::Done;

        let unexecuted: Vec<ResponseId> = self
            .queues
            .iter_mut()
            .flat_map(|queue| queue.drain(..))
            .map(|step| step.response)
            .collect();
        for response in unexecuted {
            let doc = self.response_mut(response);
            if !is_defined(doc, node::OUTCOME) {
                *child_mut(doc, node::OUTCOME) = node::CANCELLED.into();
            }
            if action == ResultAction::Rollback {
                *child_mut(doc, node::ROLLED_BACK) = true.into();
            }
        }

        for index in (0..self.executed.len()).rev() {
            self.finalize_step(index, action).await;
        }

        if self.lock_step.take().is_some() {
            self.kernel.lock.unlock(self.permit);
        }
        self.active = None;
    }

    async fn finalize_step(&mut self, index: usize, action: ResultAction) {
        self.active = Some(index);
        let completion = std::mem::replace(
            &mut self.executed[index].completion,
            Completion::Finalized,
        );
        if let Completion::Completed(Some(handler)) = completion {
            let operation = Arc::clone(&self.executed[index].operation);
            let failure = match AssertUnwindSafe(handler.handle_result(action, self, &operation))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.as_message()),
                Err(panic) => Some(panic_message(&*panic)),
            };
            if let Some(reason) = failure {
                self.publish(EventKind::RollbackHandlerFailed, Some(reason));
            }
        }

        let response = self.executed[index].response;
        self.stamp_outcome(response, action);
        self.release_step_locks(index).await;
    }

    pub(crate) fn stamp_outcome(&mut self, response: ResponseId, action: ResultAction) {
        let cancelled = self.is_cancel_requested();
        let doc = self.response_mut(response);
        match action {
            ResultAction::Rollback => {
                if cancelled {
                    *child_mut(doc, node::OUTCOME) = node::CANCELLED.into();
                    if !is_defined(doc, node::FAILURE_DESCRIPTION) {
                        *child_mut(doc, node::FAILURE_DESCRIPTION) = OPERATION_CANCELLED.into();
                    }
                } else {
                    *child_mut(doc, node::OUTCOME) = node::FAILED.into();
                }
                *child_mut(doc, node::ROLLED_BACK) = true.into();
            }
            ResultAction::Keep => {
                let outcome = if is_defined(doc, node::FAILURE_DESCRIPTION) {
                    node::FAILED
                } else {
                    node::SUCCESS
                };
                *child_mut(doc, node::OUTCOME) = outcome.into();
            }
        }
    }

    /// Releases what step `index` acquired: waits for the container to
    /// settle if it touched the runtime, then gives up the write lock.
    async fn release_step_locks(&mut self, index: usize) {
        if self.runtime_step == Some(index) {
            self.runtime_step = None;
            let _ = self.kernel.monitor.await_stability(0, None).await;
        }
        if self.lock_step == Some(index) {
            self.lock_step = None;
            self.kernel.lock.unlock(self.permit);
        }
    }
}

fn failure_text(description: &serde_json::Value) -> String {
    node::text(description.get(node::FAILURE_DESCRIPTION).unwrap_or(description))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;

    use crate::context::{
        ContextType, OperationContext, OperationStepHandler, OperationTransaction, Stage,
        StepHandlerRef, TransactionControl,
    };
    use crate::controller::{ControllerConfig, ExecuteOptions, ManagementRegistry, ModelController};
    use crate::services::ServiceFn;
    use crate::error::StepError;
    use crate::events::EventKind;
    use crate::model::{ModelNode, PathElement, Resource, operation_address};
    use crate::test_support::*;

    fn kinds(rx: &mut tokio::sync::broadcast::Receiver<crate::events::Event>) -> Vec<EventKind> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev.kind);
        }
        out
    }

    fn subsystems(h: &Harness) -> Vec<String> {
        h.controller
            .model()
            .child_names("subsystem")
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_model_failure_description_rolls_back() {
        let h = Harness::new();
        h.register(
            "fail",
            Chain {
                create: true,
                steps: vec![(Stage::Model, Arc::new(FailDescription("bad value")) as StepHandlerRef)],
            },
        );

        let response = h.controller.execute(op("fail", "/subsystem=a")).await;
        assert_eq!(response["outcome"], "failed");
        assert_eq!(response["rolled-back"], true);
        assert_eq!(response["failure-description"], "bad value");
        assert!(subsystems(&h).is_empty());
        assert_eq!(h.persister.commits(), 0);
    }

    #[tokio::test]
    async fn test_runtime_error_runs_earlier_rollback_handlers() {
        let h = Harness::new();
        let journal = h.journal.clone();
        h.register(
            "deploy",
            Chain {
                create: true,
                steps: vec![
                    (
                        Stage::Runtime,
                        Arc::new(Record {
                            journal: journal.clone(),
                            label: "first",
                        }) as StepHandlerRef,
                    ),
                    (Stage::Runtime, Arc::new(Install("web")) as StepHandlerRef),
                    (
                        Stage::Runtime,
                        Arc::new(Fail(StepError::unexpected("boom"))) as StepHandlerRef,
                    ),
                ],
            },
        );

        let response = h.controller.execute(op("deploy", "/subsystem=a")).await;
        assert_eq!(response["outcome"], "failed");
        assert_eq!(response["rolled-back"], true);
        assert_eq!(response["failure-description"], "Operation handler failed: boom");
        assert_eq!(journal.entries(), vec!["first:RUNTIME", "final first Rollback"]);
        assert_eq!(h.controller.services().state("web"), None);
        assert!(subsystems(&h).is_empty());
    }

    #[tokio::test]
    async fn test_error_after_completion_is_only_reported() {
        let h = Harness::new();
        h.register(
            "late",
            Chain {
                create: true,
                steps: vec![(Stage::Model, Arc::new(FailAfterComplete) as StepHandlerRef)],
            },
        );
        let mut rx = h.controller.subscribe();

        let response = h.controller.execute(op("late", "/subsystem=a")).await;
        assert_eq!(response["outcome"], "success");
        assert_eq!(subsystems(&h), vec!["a"]);
        assert!(kinds(&mut rx).contains(&EventKind::StepFailedAfterCompletion));
    }

    #[tokio::test]
    async fn test_handler_that_never_completes_rolls_back() {
        let h = Harness::new();
        h.register("forget", Forget);
        let mut rx = h.controller.subscribe();

        let response = h.controller.execute(op("forget", "/subsystem=a")).await;
        assert_eq!(response["outcome"], "failed");
        assert_eq!(response["failure-description"], "Operation handler failed to complete");
        assert_eq!(response["rolled-back"], true);
        assert!(kinds(&mut rx).contains(&EventKind::StepIncomplete));
    }

    #[tokio::test]
    async fn test_runtime_failure_kept_without_rollback_header() {
        let h = Harness::new();
        h.register(
            "tolerant",
            Chain {
                create: true,
                steps: vec![(
                    Stage::Runtime,
                    Arc::new(Fail(StepError::failed("port in use"))) as StepHandlerRef,
                )],
            },
        );

        let mut kept = op("tolerant", "/subsystem=a");
        kept["operation-headers"] = json!({ "rollback-on-runtime-failure": false });
        let response = h.controller.execute(kept).await;
        assert_eq!(response["outcome"], "failed");
        assert_eq!(response["failure-description"], "port in use");
        assert!(response.get("rolled-back").is_none());
        assert_eq!(subsystems(&h), vec!["a"]);
        assert_eq!(h.persister.commits(), 1);

        let response = h.controller.execute(op("tolerant", "/subsystem=b")).await;
        assert_eq!(response["outcome"], "failed");
        assert_eq!(response["rolled-back"], true);
        assert_eq!(subsystems(&h), vec!["a"]);
    }

    #[tokio::test]
    async fn test_stages_run_in_order_and_finalize_once_in_reverse() {
        let h = Harness::new();
        let journal = h.journal.clone();
        let record = |label| -> StepHandlerRef {
            Arc::new(Record {
                journal: journal.clone(),
                label,
            })
        };
        h.register(
            "stages",
            Chain {
                create: false,
                steps: vec![
                    (Stage::Verify, record("v")),
                    (Stage::Runtime, record("r")),
                    (Stage::Immediate, record("i")),
                    (Stage::Model, record("m")),
                ],
            },
        );

        let response = h.controller.execute(op("stages", "/subsystem=a")).await;
        assert_eq!(response["outcome"], "success");
        assert_eq!(
            journal.entries(),
            vec![
                "i:MODEL",
                "m:MODEL",
                "r:RUNTIME",
                "v:VERIFY",
                "final v Keep",
                "final r Keep",
                "final m Keep",
                "final i Keep",
            ]
        );
    }

    struct LateSchedule(Journal);

    #[async_trait]
    impl OperationStepHandler for LateSchedule {
        async fn execute(&self, ctx: &mut OperationContext, op: &ModelNode) -> Result<(), StepError> {
            for stage in [Stage::Model, Stage::Done] {
                let err = ctx
                    .add_step(op.clone(), Arc::new(Forget), stage)
                    .unwrap_err();
                self.0.push(err.as_label());
            }
            ctx.complete_step();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_steps_cannot_target_finished_stages() {
        let h = Harness::new();
        h.register(
            "late-schedule",
            Chain {
                create: false,
                steps: vec![(
                    Stage::Runtime,
                    Arc::new(LateSchedule(h.journal.clone())) as StepHandlerRef,
                )],
            },
        );

        let response = h.controller.execute(op("late-schedule", "/subsystem=a")).await;
        assert_eq!(response["outcome"], "success");
        assert_eq!(
            h.journal.entries(),
            vec!["op_stage_complete", "op_invalid_step_stage"]
        );
    }

    struct Inspect(Journal);

    #[async_trait]
    impl OperationStepHandler for Inspect {
        async fn execute(&self, ctx: &mut OperationContext, op: &ModelNode) -> Result<(), StepError> {
            let model = ctx.read_model(&operation_address(op)?, false)?;
            self.0.push(format!(
                "affected={} locked={}",
                ctx.is_model_affected(),
                ctx.kernel().lock.holder().is_some()
            ));
            ctx.set_result(model);
            ctx.complete_step();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_reads_neither_clone_nor_lock() {
        let h = Harness::new();
        h.register("inspect", Inspect(h.journal.clone()));
        h.controller.execute(add("/subsystem=a", 7)).await;
        let before = h.controller.model();

        let response = h.controller.execute(op("inspect", "/subsystem=a")).await;
        assert_eq!(response["outcome"], "success");
        assert_eq!(response["result"], json!({ "value": 7 }));
        assert_eq!(h.journal.entries(), vec!["affected=false locked=false"]);
        assert!(Arc::ptr_eq(&before, &h.controller.model()));
        assert_eq!(h.persister.commits(), 1);
    }

    struct RollbackOnly;

    #[async_trait]
    impl OperationStepHandler for RollbackOnly {
        async fn execute(&self, ctx: &mut OperationContext, op: &ModelNode) -> Result<(), StepError> {
            ctx.create_resource(&operation_address(op)?).await?;
            ctx.set_rollback_only();
            ctx.complete_step();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_rollback_only_discards_changes() {
        let h = Harness::new();
        h.register("dry-run", RollbackOnly);

        let response = h.controller.execute(op("dry-run", "/subsystem=a")).await;
        assert_eq!(response["outcome"], "failed");
        assert_eq!(response["rolled-back"], true);
        assert!(subsystems(&h).is_empty());
        assert_eq!(h.persister.commits() + h.persister.rollbacks(), 0);
    }

    #[tokio::test]
    async fn test_persistence_failure_rolls_back() {
        let h = Harness::new();
        h.persister.set_failure(Some("disk full".into()));
        let mut rx = h.controller.subscribe();

        let response = h.controller.execute(add("/subsystem=a", 1)).await;
        assert_eq!(
            response["failure-description"],
            "Failed to persist configuration change: disk full"
        );
        assert_eq!(response["rolled-back"], true);
        assert_eq!(h.journal.entries(), vec!["rollback add /subsystem=a"]);
        assert!(subsystems(&h).is_empty());
        assert!(kinds(&mut rx).contains(&EventKind::PersistenceFailed));
    }

    struct Voter {
        commit: bool,
        journal: Journal,
    }

    #[async_trait]
    impl TransactionControl for Voter {
        async fn operation_prepared(&self, tx: &mut OperationTransaction, result: &ModelNode) {
            self.journal
                .push(format!("prepared outcome={}", result.get("outcome").is_some()));
            if self.commit {
                tx.commit();
            }
        }
    }

    fn voting(commit: bool, journal: &Journal) -> ExecuteOptions {
        ExecuteOptions {
            transaction_control: Some(Arc::new(Voter {
                commit,
                journal: journal.clone(),
            })),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_voter_decides_commit() {
        let h = Harness::new();
        let votes = Journal::default();

        let response = h
            .controller
            .execute_with(add("/subsystem=a", 1), voting(false, &votes))
            .await;
        assert_eq!(response["outcome"], "failed");
        assert_eq!(response["rolled-back"], true);
        assert!(subsystems(&h).is_empty());
        assert_eq!(h.persister.rollbacks(), 1);

        let response = h
            .controller
            .execute_with(add("/subsystem=a", 1), voting(true, &votes))
            .await;
        assert_eq!(response["outcome"], "success");
        assert_eq!(subsystems(&h), vec!["a"]);
        assert_eq!(h.persister.commits(), 1);
        assert_eq!(
            votes.entries(),
            vec!["prepared outcome=false", "prepared outcome=false"]
        );
    }

    #[tokio::test]
    async fn test_unresolvable_operations_fail() {
        let h = Harness::new();

        let response = h.controller.execute(op("nope", "/subsystem=a")).await;
        assert_eq!(
            response["failure-description"],
            "No operation named 'nope' exists at address /subsystem=a"
        );
        assert_eq!(response["outcome"], "failed");

        let response = h.controller.execute(op("add", "/host=x")).await;
        assert_eq!(
            response["failure-description"],
            "No resource definition is registered for address /host=x"
        );
    }

    #[tokio::test]
    async fn test_structural_errors_become_failure_descriptions() {
        let h = Harness::new();

        let response = h.controller.execute(add("/subsystem=a/child=c", 1)).await;
        assert_eq!(response["outcome"], "failed");
        assert!(
            response["failure-description"]
                .as_str()
                .unwrap()
                .contains("cannot be created until all ancestor resources have been added")
        );

        h.controller.execute(add("/subsystem=a", 1)).await;
        let response = h.controller.execute(add("/subsystem=a", 2)).await;
        assert_eq!(response["failure-description"], "duplicate resource /subsystem=a");
        assert_eq!(h.controller.model().navigate(&addr("/subsystem=a")).unwrap().model()["value"], 1);
    }
    struct Adopt(&'static str);

    #[async_trait]
    impl OperationStepHandler for Adopt {
        async fn execute(&self, ctx: &mut OperationContext, _: &ModelNode) -> Result<(), StepError> {
            ctx.create_resource(&addr(self.0)).await?;
            ctx.complete_step();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_duplicate_reported_before_unknown_child_type() {
        let registry = ManagementRegistry::new();
        registry.register_resource(&addr("/subsystem=*"));
        registry.register_operation(&addr("/subsystem=*"), "adopt", Arc::new(Adopt("/legacy=x")));
        registry.register_operation(&addr("/subsystem=*"), "adopt-new", Arc::new(Adopt("/legacy=y")));
        let mut model = Resource::new();
        model
            .register_child(&PathElement::new("legacy", "x"), Resource::new())
            .unwrap();
        let controller = ModelController::builder(ControllerConfig::default())
            .with_registry(registry)
            .with_model(model)
            .build();

        let response = controller.execute(op("adopt", "/subsystem=a")).await;
        assert_eq!(response["failure-description"], "duplicate resource /legacy=x");
        assert_eq!(response["rolled-back"], true);

        let response = controller.execute(op("adopt-new", "/subsystem=a")).await;
        assert!(
            response["failure-description"]
                .as_str()
                .unwrap()
                .contains("no child type legacy")
        );
    }

    /// RUNTIME step installing a service whose start waits for `gate`.
    struct GatedInstall {
        name: &'static str,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl OperationStepHandler for GatedInstall {
        async fn execute(&self, ctx: &mut OperationContext, _: &ModelNode) -> Result<(), StepError> {
            let gate = Arc::clone(&self.gate);
            let service = ServiceFn::arc(self.name, move |_token| {
                let gate = Arc::clone(&gate);
                async move {
                    gate.notified().await;
                    Ok(())
                }
            });
            ctx.service_target()
                .await?
                .install(self.name, service, Vec::new())
                .map_err(|err| StepError::failed(err.to_string()))?;
            let name = self.name;
            ctx.complete_step_with_rollback(move |ctx, _| {
                let _ = ctx.service_registry().remove(name);
                Ok(())
            });
            Ok(())
        }
    }

    /// VERIFY step journaling the state of one service.
    struct Observe(Journal, &'static str);

    #[async_trait]
    impl OperationStepHandler for Observe {
        async fn execute(&self, ctx: &mut OperationContext, _: &ModelNode) -> Result<(), StepError> {
            self.0
                .push(format!("{:?}", ctx.service_registry().state(self.1)));
            ctx.complete_step();
            Ok(())
        }
    }

    fn gated_deploy(h: &Harness, gate: &Arc<Notify>) -> Chain {
        Chain {
            create: true,
            steps: vec![
                (
                    Stage::Runtime,
                    Arc::new(GatedInstall {
                        name: "slow",
                        gate: Arc::clone(gate),
                    }) as StepHandlerRef,
                ),
                (
                    Stage::Verify,
                    Arc::new(Observe(h.journal.clone(), "slow")) as StepHandlerRef,
                ),
            ],
        }
    }

    #[tokio::test]
    async fn test_verify_waits_for_container_to_settle() {
        let h = Harness::new();
        let gate = Arc::new(Notify::new());
        h.register("deploy", gated_deploy(&h, &gate));

        let controller = Arc::clone(&h.controller);
        let running =
            tokio::spawn(async move { controller.execute(op("deploy", "/subsystem=a")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!running.is_finished());
        assert!(h.journal.entries().is_empty());

        gate.notify_one();
        let response = running.await.unwrap();
        assert_eq!(response["outcome"], "success");
        assert_eq!(h.journal.entries(), vec!["Some(Up)"]);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_container_rolls_back() {
        let h = Harness::new();
        let gate = Arc::new(Notify::new());
        h.register("deploy", gated_deploy(&h, &gate));

        let handle = h
            .controller
            .execute_async(op("deploy", "/subsystem=a"), ExecuteOptions::default());
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Rollback removes the service once its start returns.
        gate.notify_one();

        let response = handle.response().await.unwrap();
        assert_eq!(response["outcome"], "cancelled");
        assert_eq!(response["rolled-back"], true);
        assert!(h.journal.entries().is_empty());
        assert!(subsystems(&h).is_empty());
        h.controller.services().await_removal("slow").await;
        assert_eq!(h.controller.services().state("slow"), None);
    }

    #[tokio::test]
    async fn test_admin_only_rejects_runtime_steps() {
        let h = Harness::with_config(ControllerConfig {
            running_mode: ContextType::AdminOnly,
            ..ControllerConfig::default()
        });
        h.register(
            "deploy",
            Chain {
                create: true,
                steps: vec![(Stage::Runtime, Arc::new(Install("web")) as StepHandlerRef)],
            },
        );

        let response = h.controller.execute(op("deploy", "/subsystem=a")).await;
        assert_eq!(response["outcome"], "failed");
        assert_eq!(response["rolled-back"], true);
        assert!(
            response["failure-description"]
                .as_str()
                .unwrap()
                .contains("stage RUNTIME is not valid for context type admin-only")
        );
        assert!(subsystems(&h).is_empty());
        assert_eq!(h.controller.services().state("web"), None);
    }
}
