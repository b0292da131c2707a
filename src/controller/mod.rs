//! # Model controller.
//!
//! [`ModelController`] owns the committed resource tree, the write lock and
//! the runtime collaborators, and drives operations through
//! [`OperationContext`](crate::OperationContext)s.
//!
//! ## Components
//! - [`ControllerConfig`]: sizes and flags.
//! - [`OperationRegistry`] / [`ManagementRegistry`]: address → handler lookup.
//! - [`ConfigurationPersister`]: stores committed changes.
//! - [`ProcessState`]: running / reload-required / restart-required.
//! - boot organizer and parallel boot scheduler (internal).
//!
//! ## Execution
//! ```text
//! execute(op)
//!   ├─ register operation id
//!   ├─ context over committed snapshot ─► PrepareStep ─► handler steps
//!   ├─ commit point: persist ─► vote ─► publish model
//!   └─ release id ─► add process-state header
//! ```

mod boot;
mod builder;
mod config;
mod core;
pub(crate) mod kernel;
mod lock;
mod parallel;
mod persister;
mod prepare;
mod process_state;
mod registry;

pub use builder::ModelControllerBuilder;
pub use config::ControllerConfig;
pub use core::{ExecuteOptions, ModelController, OperationHandle};
pub(crate) use kernel::Kernel;
pub use lock::OperationId;
pub use persister::{ConfigurationPersister, InMemoryPersister, NullPersister, PersistenceResource};
pub use process_state::ProcessState;
pub use registry::{ManagementRegistry, OperationEntry, OperationRegistry};
