//! # Operation context and step scheduler.
//!
//! An [`OperationContext`] owns everything one management operation needs:
//! staged step queues, response documents, a lazily cloned working copy of
//! the resource tree and the write lock.
//!
//! ```text
//!   IMMEDIATE (front of current stage)
//!        │
//!   MODEL ──► RUNTIME ──► [await container stability] ──► VERIFY ──► DONE
//!                                                                     │
//!                                        persist ─► vote ─► publish ◄─┘
//!                                                                     │
//!                           finalize executed steps in reverse order ◄┘
//! ```
//!
//! #### Rules
//! - Stages only move forward; steps for a finished stage are rejected.
//! - Only MODEL steps write the tree; the first write takes the write lock.
//! - A failure description in MODEL, with rollback-on-runtime-failure, or
//!   with rollback-only fixes the [`ResultAction`] to ROLLBACK.
//! - Each completed step's [`ResultHandler`] runs exactly once.
//! - A step releases the lock it took only after its own finalization.

mod handler;
pub(crate) mod nested;
mod operation;
mod pipeline;
mod stage;
mod step;

pub use handler::{
    MessageSeverity, OperationMessageHandler, OperationStepHandler, OperationTransaction,
    ResultHandler, StepHandlerRef, TransactionControl,
};
pub(crate) use operation::ContextOptions;
pub use operation::OperationContext;
pub use stage::{ContextType, ResultAction, Stage};
pub use step::ResponseId;
