//! Shared state behind the controller and every operation context.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::controller::lock::{ControllerLock, OperationId};
use crate::controller::persister::ConfigurationPersister;
use crate::controller::process_state::ProcessStateTracker;
use crate::controller::registry::OperationRegistry;
use crate::controller::ControllerConfig;
use crate::events::Bus;
use crate::model::Resource;
use crate::services::{ContainerMonitor, ServiceContainer};

pub(crate) struct Kernel {
    pub(crate) cfg: ControllerConfig,
    pub(crate) bus: Bus,
    pub(crate) lock: ControllerLock,
    pub(crate) monitor: Arc<ContainerMonitor>,
    pub(crate) services: ServiceContainer,
    pub(crate) registry: Arc<dyn OperationRegistry>,
    pub(crate) persister: Arc<dyn ConfigurationPersister>,
    pub(crate) process_state: ProcessStateTracker,
    /// Committed model; replaced wholesale on publish.
    model: RwLock<Arc<Resource>>,
    active: Mutex<HashSet<OperationId>>,
}

impl Kernel {
    pub(crate) fn new(
        cfg: ControllerConfig,
        bus: Bus,
        monitor: Arc<ContainerMonitor>,
        services: ServiceContainer,
        registry: Arc<dyn OperationRegistry>,
        persister: Arc<dyn ConfigurationPersister>,
        model: Resource,
    ) -> Self {
        Self {
            cfg,
            bus,
            lock: ControllerLock::new(),
            monitor,
            services,
            registry,
            persister,
            process_state: ProcessStateTracker::new(),
            model: RwLock::new(Arc::new(model)),
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Snapshot of the committed model.
    pub(crate) fn model(&self) -> Arc<Resource> {
        Arc::clone(&self.model.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn publish_model(&self, model: Arc<Resource>) {
        *self.model.write().unwrap_or_else(PoisonError::into_inner) = model;
    }

    fn active(&self) -> MutexGuard<'_, HashSet<OperationId>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Draws a random id not used by any in-flight operation.
    pub(crate) fn register_operation_id(&self) -> OperationId {
        let mut active = self.active();
        loop {
            let id = OperationId(rand::random::<u32>());
            if active.insert(id) {
                return id;
            }
        }
    }

    pub(crate) fn release_operation_id(&self, id: OperationId) {
        self.active().remove(&id);
    }

    pub(crate) fn active_operations(&self) -> usize {
        self.active().len()
    }
}
