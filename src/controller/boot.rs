//! Boot organizer: orders boot operations and groups subsystem operations
//! for the parallel scheduler.
//!
//! ```text
//! declared:  [sub=a op1, extension=x add, other, sub=b op1, sub=a op2]
//! planned:   [extension=x add, Parallel{a: [op1, op2], b: [op1]}, other]
//! ```
//! Extensions go first so the handlers they register exist when the rest
//! resolve. The parallel group takes the slot of the first subsystem op.

use std::sync::Arc;

use crate::context::{OperationContext, ResponseId, Stage};
use crate::controller::parallel::{ParallelBootHandler, SubsystemBoot};
use crate::controller::prepare::BootOperationHandler;
use crate::model::node::{self, child_mut};
use crate::model::{ModelNode, PathAddress};

enum BootEntry {
    Single(usize),
    /// (subsystem, declaration indices)
    Parallel(Vec<(String, Vec<usize>)>),
}

pub(crate) struct BootPlan {
    operations: Vec<Arc<ModelNode>>,
    entries: Vec<BootEntry>,
}

fn is_extension_add(operation: &ModelNode) -> bool {
    node::operation_name(operation) == Some(node::ADD)
        && node::operation_address(operation).is_ok_and(|address| {
            address.len() == 1 && address.first().is_some_and(|e| e.key() == node::EXTENSION)
        })
}

fn subsystem_of(operation: &ModelNode) -> Option<String> {
    let address = node::operation_address(operation).ok()?;
    let first = address.first()?;
    (first.key() == node::SUBSYSTEM && !first.is_wildcard()).then(|| first.value().to_string())
}

impl BootPlan {
    /// Orders `operations`; `parallel` groups subsystem operations.
    pub(crate) fn organize(operations: Vec<ModelNode>, parallel: bool) -> Self {
        let operations: Vec<Arc<ModelNode>> = operations.into_iter().map(Arc::new).collect();
        let mut entries = Vec::with_capacity(operations.len());
        let mut rest = Vec::new();
        for (index, operation) in operations.iter().enumerate() {
            if is_extension_add(operation) {
                entries.push(BootEntry::Single(index));
            } else {
                rest.push(index);
            }
        }

        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        let mut group_slot = None;
        for index in rest {
            let subsystem = parallel
                .then(|| subsystem_of(&operations[index]))
                .flatten();
            match subsystem {
                Some(name) => {
                    group_slot.get_or_insert(entries.len());
                    match groups.iter_mut().find(|(n, _)| *n == name) {
                        Some((_, indices)) => indices.push(index),
                        None => groups.push((name, vec![index])),
                    }
                }
                None => entries.push(BootEntry::Single(index)),
            }
        }
        if let Some(slot) = group_slot {
            entries.insert(slot, BootEntry::Parallel(groups));
        }
        Self {
            operations,
            entries,
        }
    }

    /// Schedules the plan on the boot context.
    ///
    /// Returns one response per declared operation, in declaration order.
    pub(crate) fn schedule(self, ctx: &mut OperationContext) -> Vec<ResponseId> {
        let responses: Vec<ResponseId> = self.operations.iter().map(|_| ctx.new_response()).collect();
        for entry in self.entries {
            match entry {
                BootEntry::Single(index) => {
                    let scheduled = ctx.schedule(
                        responses[index],
                        Arc::clone(&self.operations[index]),
                        Arc::new(BootOperationHandler),
                        Stage::Model,
                        false,
                    );
                    if let Err(err) = scheduled {
                        *child_mut(ctx.response_mut(responses[index]), node::FAILURE_DESCRIPTION) =
                            err.to_string().into();
                        ctx.set_rollback_only();
                    }
                }
                BootEntry::Parallel(groups) => {
                    let subsystems = groups
                        .into_iter()
                        .map(|(name, indices)| SubsystemBoot {
                            name,
                            operations: indices
                                .into_iter()
                                .map(|i| (responses[i], Arc::clone(&self.operations[i])))
                                .collect(),
                        })
                        .collect();
                    let scheduled = ctx.schedule(
                        ResponseId::ROOT,
                        Arc::new(node::operation("parallel-boot", &PathAddress::root())),
                        Arc::new(ParallelBootHandler::new(subsystems)),
                        Stage::Model,
                        false,
                    );
                    if scheduled.is_err() {
                        ctx.set_rollback_only();
                    }
                }
            }
        }
        responses
    }

    #[cfg(test)]
    fn describe(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| match entry {
                BootEntry::Single(i) => i.to_string(),
                BootEntry::Parallel(groups) => groups
                    .iter()
                    .map(|(name, indices)| {
                        let indices: Vec<String> = indices.iter().map(usize::to_string).collect();
                        format!("{name}:{}", indices.join(","))
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(name: &str, address: &str) -> ModelNode {
        node::operation(name, &address.parse().unwrap())
    }

    fn declared() -> Vec<ModelNode> {
        vec![
            op("add", "/subsystem=a"),
            op("add", "/extension=x"),
            op("write", "/interface=public"),
            op("add", "/subsystem=b"),
            op("add", "/subsystem=a/child=c"),
        ]
    }

    #[test]
    fn test_extensions_first_then_declaration_order() {
        let plan = BootPlan::organize(declared(), false);
        assert_eq!(plan.describe(), vec!["1", "0", "2", "3", "4"]);
    }

    #[test]
    fn test_subsystems_grouped_at_first_subsystem_slot() {
        let plan = BootPlan::organize(declared(), true);
        assert_eq!(plan.describe(), vec!["1", "a:0,4 b:3", "2"]);
    }
}
