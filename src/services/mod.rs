//! # Managed runtime.
//!
//! - [`Service`] / [`ServiceFn`]: units of runtime state.
//! - [`ServiceContainer`]: installs and stops services, publishing each
//!   transition as a [`ServiceEvent`].
//! - [`ContainerMonitor`]: folds the transition stream into a busy counter
//!   and [`ContainerStateReport`]s.
//!
//! ```text
//! RUNTIME step ── ServiceContainer::install ──► start task ──► ServiceEvent ──► ContainerMonitor
//!                                                                                    │
//! OperationContext (entering VERIFY) ── await_stability(0) ◄─────────────────────────┘
//! ```

mod container;
mod monitor;
mod service;

pub use container::ServiceContainer;
pub use monitor::{
    ContainerMonitor, ContainerStateReport, LifecycleSink, MissingDependencies, ReportedService,
};
pub use service::{Service, ServiceEvent, ServiceFn, ServiceId, ServiceRef, ServiceState};
