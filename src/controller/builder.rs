use std::sync::Arc;

use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;

use crate::controller::kernel::Kernel;
use crate::controller::{
    ConfigurationPersister, ControllerConfig, ManagementRegistry, ModelController, NullPersister,
    OperationRegistry,
};
use crate::events::{Bus, Event};
use crate::model::Resource;
use crate::services::{ContainerMonitor, ServiceContainer};
use crate::subscribers::{Subscribe, SubscriberSet};

/// Builder for a [`ModelController`].
pub struct ModelControllerBuilder {
    cfg: ControllerConfig,
    registry: Option<Arc<dyn OperationRegistry>>,
    persister: Option<Arc<dyn ConfigurationPersister>>,
    subscribers: Vec<Arc<dyn Subscribe>>,
    model: Resource,
}

impl ModelControllerBuilder {
    pub fn new(cfg: ControllerConfig) -> Self {
        Self {
            cfg,
            registry: None,
            persister: None,
            subscribers: Vec::new(),
            model: Resource::new(),
        }
    }

    /// Sets the operation registry (default: an empty [`ManagementRegistry`]).
    pub fn with_registry(mut self, registry: Arc<dyn OperationRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the configuration persister (default: [`NullPersister`]).
    pub fn with_persister(mut self, persister: Arc<dyn ConfigurationPersister>) -> Self {
        self.persister = Some(persister);
        self
    }

    /// Sets event subscribers.
    ///
    /// Subscribers receive controller events through dedicated workers with
    /// bounded queues.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Sets the initial committed model.
    pub fn with_model(mut self, model: Resource) -> Self {
        self.model = model;
        self
    }

    /// Builds the controller.
    ///
    /// Spawns the container monitor and the subscriber listener; must be
    /// called inside a tokio runtime.
    pub fn build(self) -> Arc<ModelController> {
        let bus = Bus::new(self.cfg.bus_capacity_clamped());
        let runtime_token = CancellationToken::new();
        let subs = SubscriberSet::new(self.subscribers, bus.clone());
        spawn_listener(subs, bus.clone(), runtime_token.clone());

        let monitor = ContainerMonitor::spawn(bus.clone(), runtime_token.clone());
        let services = ServiceContainer::new(monitor.sink(), bus.clone());
        let semaphore = self
            .cfg
            .concurrency_limit()
            .map(Semaphore::new)
            .map(Arc::new);

        let registry = self
            .registry
            .unwrap_or_else(|| ManagementRegistry::new() as Arc<dyn OperationRegistry>);
        let persister = self
            .persister
            .unwrap_or_else(|| Arc::new(NullPersister) as Arc<dyn ConfigurationPersister>);

        let kernel = Arc::new(Kernel::new(
            self.cfg, bus, monitor, services, registry, persister, self.model,
        ));
        Arc::new(ModelController::new_internal(kernel, runtime_token, semaphore))
    }
}

/// Forwards bus events to the subscriber set until the runtime token fires.
fn spawn_listener(subs: SubscriberSet, bus: Bus, runtime_token: CancellationToken) {
    if subs.is_empty() {
        return;
    }
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = runtime_token.cancelled() => break,
                msg = rx.recv() => match msg {
                    Ok(ev) => subs.emit(ev),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        subs.emit(Event::listener_lagged(skipped));
                    }
                }
            }
        }
        subs.shutdown().await;
    });
}
