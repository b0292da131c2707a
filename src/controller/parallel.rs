//! # Parallel boot scheduler.
//!
//! Subsystem boot operations are grouped per subsystem and prepared by a
//! bounded pool of workers, each driving a nested [`OperationContext`].
//!
//! ```text
//! ParallelBootHandler (MODEL step of the boot context)
//!   ├─ spawn worker per subsystem ──► nested ctx: MODEL steps only, RUNTIME/VERIFY deferred
//!   ├─ await every Prepared ─► copy responses, first failure wins
//!   ├─ graft subsystem subtrees ─► restore declaration order
//!   ├─ deferred steps? ─► ParallelRuntimeHandler (RUNTIME step, same fan-out)
//!   └─ complete with Rendezvous ─► decision to workers ─► join ─► stamp outcomes
//! ```
//!
//! Workers mutate only their own `subsystem=<name>` subtree of a private
//! working copy; the primary is the only one that changes the boot model.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinHandle;

use crate::context::nested::{NestedLink, ParentCapability, Prepared};
use crate::context::{
    OperationContext, OperationStepHandler, ResponseId, ResultAction, ResultHandler, Stage,
    StepHandlerRef,
};
use crate::controller::kernel::Kernel;
use crate::controller::prepare::BootOperationHandler;
use crate::error::StepError;
use crate::model::node::{self, child_mut, is_defined};
use crate::model::{ModelNode, PathAddress, Resource};

/// One step a worker runs; `response` is the primary-side response.
#[derive(Clone)]
struct WorkerStep {
    response: ResponseId,
    operation: Arc<ModelNode>,
    handler: StepHandlerRef,
    stage: Stage,
}

/// Steps of one subsystem.
#[derive(Clone)]
struct WorkerJob {
    subsystem: String,
    steps: Vec<WorkerStep>,
}

/// Primary-side ends of a worker.
struct Worker {
    prepared: oneshot::Receiver<Prepared>,
    decision: oneshot::Sender<ResultAction>,
    join: JoinHandle<()>,
}

/// Boot operations of one subsystem, in declaration order.
pub(crate) struct SubsystemBoot {
    pub(crate) name: String,
    pub(crate) operations: Vec<(ResponseId, Arc<ModelNode>)>,
}

/// MODEL step that boots subsystems in parallel.
pub(crate) struct ParallelBootHandler {
    subsystems: Vec<SubsystemBoot>,
}

impl ParallelBootHandler {
    pub(crate) fn new(subsystems: Vec<SubsystemBoot>) -> Self {
        Self { subsystems }
    }

    fn jobs(&self) -> Vec<WorkerJob> {
        let handler: StepHandlerRef = Arc::new(BootOperationHandler);
        self.subsystems
            .iter()
            .map(|subsystem| WorkerJob {
                subsystem: subsystem.name.clone(),
                steps: subsystem
                    .operations
                    .iter()
                    .map(|(response, operation)| WorkerStep {
                        response: *response,
                        operation: Arc::clone(operation),
                        handler: Arc::clone(&handler),
                        stage: Stage::Model,
                    })
                    .collect(),
            })
            .collect()
    }
}

#[async_trait]
impl OperationStepHandler for ParallelBootHandler {
    async fn execute(&self, ctx: &mut OperationContext, _: &ModelNode) -> Result<(), StepError> {
        ctx.acquire_controller_lock().await?;
        let jobs = self.jobs();
        let model = Arc::new(ctx.root_resource().clone());
        let kernel = Arc::clone(ctx.kernel());
        let (workers, prepared) = fan_out(&kernel, ctx.capability(), model, &jobs, true).await;

        let mut failures = Vec::new();
        let mut subtrees = Vec::new();
        let mut runtime_jobs = Vec::new();
        for (job, prepared) in jobs.iter().zip(prepared) {
            for (k, step) in job.steps.iter().enumerate() {
                if let Some(response) = prepared.responses.get(k + 1) {
                    *ctx.response_mut(step.response) = response.clone();
                }
            }
            if prepared.failed {
                failures.push(first_failure(&job.subsystem, &prepared.responses));
            }
            if let Some(subtree) = prepared.subtree {
                subtrees.push((job.subsystem.clone(), subtree));
            }
            let deferred: Vec<WorkerStep> = prepared
                .deferred
                .into_iter()
                .map(|d| WorkerStep {
                    response: primary_response(job, d.response),
                    operation: d.operation,
                    handler: d.handler,
                    stage: d.stage,
                })
                .collect();
            if !deferred.is_empty() {
                runtime_jobs.push(WorkerJob {
                    subsystem: job.subsystem.clone(),
                    steps: deferred,
                });
            }
        }

        if let Some(first) = failures.into_iter().next() {
            ctx.set_failure_description(first);
        } else {
            let order: Vec<&str> = self.subsystems.iter().map(|s| s.name.as_str()).collect();
            ctx.graft_subsystems(subtrees, &order).await?;
            if !runtime_jobs.is_empty() {
                ctx.add_step(
                    node::operation("parallel-boot-runtime", &PathAddress::root()),
                    Arc::new(ParallelRuntimeHandler { jobs: runtime_jobs }),
                    Stage::Runtime,
                )?;
            }
        }

        let stamp = self
            .subsystems
            .iter()
            .flat_map(|s| s.operations.iter().map(|(response, _)| *response))
            .collect();
        ctx.complete_step_with(Box::new(Rendezvous::new(workers, stamp)));
        Ok(())
    }
}

/// RUNTIME step that runs the deferred runtime work of every subsystem.
struct ParallelRuntimeHandler {
    jobs: Vec<WorkerJob>,
}

#[async_trait]
impl OperationStepHandler for ParallelRuntimeHandler {
    async fn execute(&self, ctx: &mut OperationContext, _: &ModelNode) -> Result<(), StepError> {
        ctx.service_target().await?;
        let model = Arc::new(ctx.root_resource().clone());
        let kernel = Arc::clone(ctx.kernel());
        let (workers, prepared) =
            fan_out(&kernel, ctx.capability(), model, &self.jobs, false).await;

        let mut failures = Vec::new();
        for (job, prepared) in self.jobs.iter().zip(prepared) {
            for (k, step) in job.steps.iter().enumerate() {
                let Some(description) = prepared
                    .responses
                    .get(k + 1)
                    .and_then(|r| r.get(node::FAILURE_DESCRIPTION))
                    .filter(|d| !d.is_null())
                else {
                    continue;
                };
                let doc = ctx.response_mut(step.response);
                if !is_defined(doc, node::FAILURE_DESCRIPTION) {
                    *child_mut(doc, node::FAILURE_DESCRIPTION) = description.clone();
                }
            }
            if prepared.failed {
                failures.push(first_failure(&job.subsystem, &prepared.responses));
            }
        }
        if let Some(first) = failures.into_iter().next() {
            ctx.set_failure_description(first);
        }
        ctx.complete_step_with(Box::new(Rendezvous::new(workers, Vec::new())));
        Ok(())
    }
}

/// Spawns one worker per job and waits until each has prepared.
///
/// A worker that ends without signalling counts as failed.
async fn fan_out(
    kernel: &Arc<Kernel>,
    parent: ParentCapability,
    model: Arc<Resource>,
    jobs: &[WorkerJob],
    defer_runtime: bool,
) -> (Vec<Worker>, Vec<Prepared>) {
    let slots = Arc::new(Semaphore::new(kernel.cfg.boot_parallelism().unwrap_or(1)));
    let mut workers = Vec::with_capacity(jobs.len());
    for job in jobs {
        let (prepared_tx, prepared_rx) = oneshot::channel();
        let (decision_tx, decision_rx) = oneshot::channel();
        let kernel = Arc::clone(kernel);
        let parent = parent.clone();
        let model = Arc::clone(&model);
        let slots = Arc::clone(&slots);
        let job = job.clone();

        let join = tokio::spawn(async move {
            let slot = slots.acquire_owned().await.ok();
            let link = NestedLink::new(
                job.subsystem.clone(),
                defer_runtime,
                prepared_tx,
                decision_rx,
                slot,
            );
            let mut nested = OperationContext::nested(kernel, parent, model, link);
            for step in job.steps {
                let response = nested.new_response();
                if let Err(err) =
                    nested.schedule(response, step.operation, step.handler, step.stage, false)
                {
                    *child_mut(nested.response_mut(response), node::FAILURE_DESCRIPTION) =
                        err.to_string().into();
                    nested.set_rollback_only();
                }
            }
            nested.execute_operation().await;
        });
        workers.push(Worker {
            prepared: prepared_rx,
            decision: decision_tx,
            join,
        });
    }

    let mut prepared = Vec::with_capacity(workers.len());
    for (job, worker) in jobs.iter().zip(workers.iter_mut()) {
        let signal = (&mut worker.prepared).await.unwrap_or_else(|_| {
            Prepared::aborted(&format!(
                "Boot of subsystem {} ended before it was prepared",
                job.subsystem
            ))
        });
        prepared.push(signal);
    }
    (workers, prepared)
}

/// Maps a worker-side response id back to the primary's response.
fn primary_response(job: &WorkerJob, nested: ResponseId) -> ResponseId {
    nested
        .0
        .checked_sub(1)
        .and_then(|k| job.steps.get(k))
        .map(|step| step.response)
        .unwrap_or(ResponseId::ROOT)
}

fn first_failure(subsystem: &str, responses: &[ModelNode]) -> ModelNode {
    responses
        .iter()
        .skip(1)
        .chain(responses.first())
        .find(|r| is_defined(r, node::FAILURE_DESCRIPTION))
        .map(|r| r[node::FAILURE_DESCRIPTION].clone())
        .unwrap_or_else(|| format!("Boot of subsystem {subsystem} failed").into())
}

/// Result handler that hands the primary's decision to its workers.
struct Rendezvous {
    decisions: Vec<oneshot::Sender<ResultAction>>,
    joins: Vec<JoinHandle<()>>,
    stamp: Vec<ResponseId>,
}

impl Rendezvous {
    fn new(workers: Vec<Worker>, stamp: Vec<ResponseId>) -> Self {
        let mut decisions = Vec::with_capacity(workers.len());
        let mut joins = Vec::with_capacity(workers.len());
        for worker in workers {
            decisions.push(worker.decision);
            joins.push(worker.join);
        }
        Self {
            decisions,
            joins,
            stamp,
        }
    }
}

#[async_trait]
impl ResultHandler for Rendezvous {
    async fn handle_result(
        self: Box<Self>,
        action: ResultAction,
        ctx: &mut OperationContext,
        _: &ModelNode,
    ) -> Result<(), StepError> {
        let Rendezvous {
            decisions,
            joins,
            stamp,
        } = *self;
        for decision in decisions {
            let _ = decision.send(action);
        }
        let mut lost = None;
        for join in joins {
            if let Err(err) = join.await {
                lost.get_or_insert(err.to_string());
            }
        }
        for response in stamp {
            ctx.stamp_outcome(response, action);
        }
        match lost {
            Some(err) => Err(StepError::unexpected(format!("boot worker failed: {err}"))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::context::{OperationContext, OperationStepHandler, Stage, StepHandlerRef};
    use crate::controller::{ControllerConfig, ManagementRegistry};
    use crate::error::{ControllerError, StepError};
    use crate::model::ModelNode;
    use crate::services::ServiceState;
    use crate::test_support::*;

    fn parallel() -> ControllerConfig {
        ControllerConfig {
            boot_workers: 2,
            ..ControllerConfig::default()
        }
    }

    fn subsystem_ops() -> Vec<ModelNode> {
        let mut ops = Vec::new();
        for (i, name) in ["s3", "s1", "s4", "s0", "s2"].into_iter().enumerate() {
            ops.push(add(&format!("/subsystem={name}"), i as i64));
            ops.push(add(&format!("/subsystem={name}/child=c"), 10 + i as i64));
        }
        ops
    }

    #[tokio::test]
    async fn test_parallel_boot_matches_sequential() {
        let sequential = Harness::new();
        let concurrent = Harness::with_config(parallel());

        let seq = sequential.controller.boot(subsystem_ops()).await.unwrap();
        let par = concurrent.controller.boot(subsystem_ops()).await.unwrap();

        assert_eq!(par.len(), 10);
        assert!(par.iter().all(|r| r["outcome"] == "success"));
        assert!(seq.iter().all(|r| r["outcome"] == "success"));
        assert_eq!(*sequential.controller.model(), *concurrent.controller.model());
        assert_eq!(
            concurrent.controller.model().child_names("subsystem"),
            vec!["s3", "s1", "s4", "s0", "s2"]
        );
        assert_eq!(
            concurrent.controller.read_model(true)["subsystem"]["s4"]["child"]["c"]["value"],
            12
        );
    }

    #[tokio::test]
    async fn test_boot_failure_rolls_back_every_subsystem() {
        for cfg in [ControllerConfig::default(), parallel()] {
            let h = Harness::with_config(cfg);
            let ops = vec![add("/subsystem=s1", 1), op("nope", "/subsystem=s2")];

            let failure = match h.controller.boot(ops).await {
                Err(ControllerError::BootFailed { failure }) => failure,
                other => panic!("unexpected boot result: {other:?}"),
            };
            assert_eq!(failure, "No operation named 'nope' exists at address /subsystem=s2");
            assert!(h.controller.model().child_names("subsystem").is_empty());
            assert_eq!(h.journal.entries(), vec!["rollback add /subsystem=s1"]);
        }
    }

    /// Extension `add` that registers the `enable` operation.
    struct RegisterEnable(Arc<ManagementRegistry>);

    #[async_trait]
    impl OperationStepHandler for RegisterEnable {
        async fn execute(&self, ctx: &mut OperationContext, _: &ModelNode) -> Result<(), StepError> {
            self.0.register_operation(
                &addr("/subsystem=*"),
                "enable",
                Arc::new(Chain {
                    create: true,
                    steps: Vec::new(),
                }),
            );
            ctx.complete_step();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_extensions_register_before_subsystems_resolve() {
        let h = Harness::with_config(parallel());
        h.registry.register_operation(
            &addr("/extension=*"),
            "add",
            Arc::new(RegisterEnable(Arc::clone(&h.registry))),
        );

        let responses = h
            .controller
            .boot(vec![op("enable", "/subsystem=x"), op("add", "/extension=ext")])
            .await
            .unwrap();
        assert_eq!(responses[0]["outcome"], "success");
        assert_eq!(responses[1]["outcome"], "success");
        assert_eq!(h.controller.model().child_names("subsystem"), vec!["x"]);
    }

    #[tokio::test]
    async fn test_deferred_runtime_steps_run_after_model() {
        let h = Harness::with_config(parallel());
        for (name, service) in [("deploy-a", "svc-a"), ("deploy-b", "svc-b")] {
            h.register(
                name,
                Chain {
                    create: true,
                    steps: vec![(Stage::Runtime, Arc::new(Install(service)) as StepHandlerRef)],
                },
            );
        }

        let responses = h
            .controller
            .boot(vec![op("deploy-a", "/subsystem=a"), op("deploy-b", "/subsystem=b")])
            .await
            .unwrap();
        assert!(responses.iter().all(|r| r["outcome"] == "success"));
        assert_eq!(h.controller.services().state("svc-a"), Some(ServiceState::Up));
        assert_eq!(h.controller.services().state("svc-b"), Some(ServiceState::Up));
        assert_eq!(h.controller.model().child_names("subsystem"), vec!["a", "b"]);
    }
}
