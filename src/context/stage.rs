use std::fmt;

/// Pipeline stage a step runs in.
///
/// Real stages are totally ordered: `Model < Runtime < Verify < Done`.
/// [`Stage::Immediate`] is a pseudo-stage: "run next, in the current stage".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Immediate,
    /// Model reads and writes; the only stage allowed to change the resource tree.
    Model,
    /// Runtime service changes.
    Runtime,
    /// Post-runtime verification; entered only after the container settles.
    Verify,
    /// Commit point and finalization. No steps run here.
    Done,
}

impl Stage {
    /// Queue index of a real, step-bearing stage.
    pub(crate) fn queue_index(self) -> Option<usize> {
        match self {
            Stage::Model => Some(0),
            Stage::Runtime => Some(1),
            Stage::Verify => Some(2),
            Stage::Immediate | Stage::Done => None,
        }
    }

    /// The stage after this one.
    pub(crate) fn next(self) -> Stage {
        match self {
            Stage::Immediate | Stage::Model => Stage::Runtime,
            Stage::Runtime => Stage::Verify,
            Stage::Verify | Stage::Done => Stage::Done,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Immediate => "IMMEDIATE",
            Stage::Model => "MODEL",
            Stage::Runtime => "RUNTIME",
            Stage::Verify => "VERIFY",
            Stage::Done => "DONE",
        })
    }
}

/// Terminal disposition of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResultAction {
    Keep,
    Rollback,
}

/// Kind of process the context manages.
///
/// `AdminOnly` contexts manage configuration without a live runtime and
/// reject RUNTIME steps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ContextType {
    #[default]
    Normal,
    AdminOnly,
}

impl fmt::Display for ContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContextType::Normal => "normal",
            ContextType::AdminOnly => "admin-only",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        assert!(Stage::Model < Stage::Runtime);
        assert!(Stage::Runtime < Stage::Verify);
        assert!(Stage::Verify < Stage::Done);
        assert_eq!(Stage::Model.next(), Stage::Runtime);
        assert_eq!(Stage::Done.next(), Stage::Done);
        assert_eq!(Stage::Immediate.queue_index(), None);
    }
}
