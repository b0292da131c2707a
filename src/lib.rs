//! # opkernel
//!
//! **opkernel** is a transactional management kernel for Rust.
//!
//! Management operations (documents such as `{"operation": "add",
//! "address": [{"subsystem": "web"}]}`) run as a sequence of staged steps
//! against a copy-on-write resource tree and a live service container. An
//! operation either commits every model and runtime change it made, or rolls
//! all of them back.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!     ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!     │  execute(op) │   │  execute(op) │   │  boot(ops)   │
//!     └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!            ▼                  ▼                  ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  ModelController                                                  │
//! │  - committed Resource tree (Arc, swapped on commit)               │
//! │  - ControllerLock (one writer at a time, reentrant per operation) │
//! │  - OperationRegistry (address → step handler)                     │
//! │  - ConfigurationPersister                                         │
//! │  - ServiceContainer + ContainerMonitor                            │
//! └──────┬──────────────────┬──────────────────┬───────────────┬──────┘
//!        ▼                  ▼                  ▼               │
//!     ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   │
//!     │ Operation    │   │ Operation    │   │ boot context │   │
//!     │ Context      │   │ Context      │   │ + workers    │   │
//!     └┬─────────────┘   └┬─────────────┘   └┬─────────────┘   │
//!      │ Publishes:       │                  │                 │
//!      │ - OperationFailed│                  │ - BootCompleted │
//!      │ - StepIncomplete │                  │ - BootOp.Failed │
//!      ▼                  ▼                  ▼                 ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                        Bus (broadcast channel)                    │
//! │              (capacity: ControllerConfig::bus_capacity)           │
//! └─────────────────────────────────┬─────────────────────────────────┘
//!                                   ▼
//!                       ┌────────────────────────┐
//!                       │   listener task        │
//!                       └───────────┬────────────┘
//!                                   ▼
//!                            SubscriberSet
//!                          (per-sub queues)
//! ```
//!
//! ### Operation lifecycle
//! ```text
//! OperationContext::execute_operation()
//!
//! MODEL ──► RUNTIME ──► (container settles) ──► VERIFY ──► DONE
//!   │          │                                  │          │
//!   │ steps may add steps for the current or a later stage   │
//!   │ (IMMEDIATE: run next, in the current stage)            │
//!   │                                                        ▼
//!   │                              persist ─► vote ─► publish model (KEEP)
//!   │                                                        │
//!   └── failure in MODEL / rollback-on-runtime-failure ──► ROLLBACK
//!                                                            │
//! finalize: result handlers run newest-first with KEEP or ROLLBACK,
//!           outcomes stamped, locks released
//! ```
//!
//! ## Features
//! | Area              | Description                                                      | Key types / traits                                  |
//! |-------------------|------------------------------------------------------------------|-----------------------------------------------------|
//! | **Controller**    | Boot and execute operations, one writer at a time.               | [`ModelController`], [`ControllerConfig`]          |
//! | **Steps**         | Staged units of work with rollback callbacks.                    | [`OperationStepHandler`], [`OperationContext`]      |
//! | **Model**         | Copy-on-write resource tree addressed by key/value paths.        | [`Resource`], [`PathAddress`], [`ModelNode`]        |
//! | **Runtime**       | Services with dependencies and a settling monitor.               | [`services::ServiceContainer`], [`services::ContainerMonitor`] |
//! | **Registry**      | Address patterns mapped to operation handlers.                   | [`ManagementRegistry`], [`OperationRegistry`]       |
//! | **Persistence**   | Commit-or-rollback storage of the committed model.               | [`ConfigurationPersister`], [`InMemoryPersister`]   |
//! | **Subscriber API**| Hook into kernel events (logging, metrics, custom subscribers).  | [`Subscribe`]                                       |
//! | **Errors**        | Typed errors for context misuse, handlers and the controller.    | [`OperationError`], [`StepError`], [`ControllerError`] |
//!
//! ## Optional features
//! - `logging`: exports a simple built-in [`LogWriter`] _(demo/reference only)_.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use opkernel::{
//!     ControllerConfig, ManagementRegistry, ModelController, ModelNode, OperationContext,
//!     OperationStepHandler, PathAddress, StepError, operation_address,
//! };
//!
//! struct AddSubsystem;
//!
//! #[async_trait]
//! impl OperationStepHandler for AddSubsystem {
//!     async fn execute(&self, ctx: &mut OperationContext, op: &ModelNode) -> Result<(), StepError> {
//!         let address = operation_address(op)?;
//!         ctx.create_resource(&address).await?;
//!         ctx.complete_step();
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = ManagementRegistry::new();
//!     let pattern: PathAddress = "/subsystem=*".parse()?;
//!     registry.register_resource(&pattern);
//!     registry.register_operation(&pattern, "add", Arc::new(AddSubsystem));
//!
//!     let controller = ModelController::builder(ControllerConfig::default())
//!         .with_registry(registry)
//!         .build();
//!     controller.boot(Vec::new()).await?;
//!
//!     let op = opkernel::model::operation("add", &"/subsystem=web".parse()?);
//!     let response = controller.execute(op).await;
//!     assert_eq!(response["outcome"], "success");
//!     Ok(())
//! }
//! ```
mod cancel;
mod context;
mod controller;
mod error;
mod events;
pub mod model;
pub mod services;
mod subscribers;

#[cfg(test)]
mod test_support;

// ---- Public re-exports ----

pub use context::{
    ContextType, MessageSeverity, OperationContext, OperationMessageHandler,
    OperationStepHandler, OperationTransaction, ResponseId, ResultAction, ResultHandler, Stage,
    StepHandlerRef, TransactionControl,
};
pub use controller::{
    ConfigurationPersister, ControllerConfig, ExecuteOptions, InMemoryPersister,
    ManagementRegistry, ModelController, ModelControllerBuilder, NullPersister, OperationEntry,
    OperationHandle, OperationId, OperationRegistry, PersistenceResource, ProcessState,
};
pub use error::{ControllerError, OperationError, PersistenceError, ServiceError, StepError};
pub use events::{Event, EventKind, Severity};
pub use model::{ModelNode, PathAddress, PathElement, Resource, operation_address, operation_name};
pub use subscribers::{Subscribe, SubscriberSet};

// Optional: expose a simple built-in logger subscriber (demo/reference).
// Enable with: `--features logging`
#[cfg(feature = "logging")]
pub use subscribers::LogWriter;
