//! # Managed runtime services.
//!
//! A [`Service`] is a unit of runtime state (a listener, a pool, a deployment)
//! that the [`ServiceContainer`](super::ServiceContainer) starts and stops.
//! Handlers install and remove services from RUNTIME-stage steps.
//!
//! [`ServiceFn`] adapts a closure for the common "start only" case.

use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::ServiceError;

/// # Asynchronous, stoppable runtime unit.
///
/// `start` runs until the service is up (not for the service's whole life);
/// long-running work should be spawned and tied to the token, which is
/// cancelled when the service is stopped.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Brings the service up.
    async fn start(&self, ctx: CancellationToken) -> Result<(), ServiceError>;

    /// Tears the service down. The start token is already cancelled.
    async fn stop(&self) {}
}

/// Shared service handle.
pub type ServiceRef = Arc<dyn Service>;

/// Closure-backed [`Service`].
///
/// ```
/// use opkernel::services::{ServiceFn, ServiceRef};
///
/// let svc: ServiceRef = ServiceFn::arc("noop", |_ctx| async { Ok(()) });
/// ```
pub struct ServiceFn<F> {
    name: Cow<'static, str>,
    f: F,
}

impl<F, Fut> ServiceFn<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
{
    pub fn new(name: impl Into<Cow<'static, str>>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }

    pub fn arc(name: impl Into<Cow<'static, str>>, f: F) -> Arc<Self> {
        Arc::new(Self::new(name, f))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl<F, Fut> Service for ServiceFn<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
{
    async fn start(&self, ctx: CancellationToken) -> Result<(), ServiceError> {
        (self.f)(ctx).await
    }
}

/// Stable handle issued when a service is installed.
///
/// Reinstalling a removed name yields a new id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ServiceId(pub(crate) u64);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of an installed service.
///
/// Rest states: `New`, `Waiting`, `Up`, `Failed`, `Removed`.
/// Busy states: `Starting`, `Stopping`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceState {
    /// Installed, not yet scheduled.
    New,
    /// Waiting for dependencies to come up.
    Waiting,
    Starting,
    Up,
    /// `start` returned an error or panicked.
    Failed,
    Stopping,
    Removed,
}

impl ServiceState {
    /// Returns `true` for states the container monitor treats as settled.
    #[inline]
    pub fn is_rest(self) -> bool {
        !matches!(self, ServiceState::Starting | ServiceState::Stopping)
    }
}

/// One lifecycle transition, published by the container in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceEvent {
    pub id: ServiceId,
    pub name: Arc<str>,
    pub from: ServiceState,
    pub to: ServiceState,
    /// Unavailable dependencies (set when `to` is `Waiting`).
    pub missing: Vec<String>,
}
