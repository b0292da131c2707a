//! # Operation registry.
//!
//! Maps resource address patterns to the operations they accept.
//! [`OperationRegistry`] is the seam the kernel consults;
//! [`ManagementRegistry`] is the in-process implementation.
//!
//! ## Resolution
//! ```text
//! /subsystem=web/connector=http
//!    │
//!    ├─ subsystem ─► "web" node, else "*" node
//!    └─ connector ─► "http" node, else "*" node ─► operations["add"]
//! ```
//! A wildcard address (`connector=*`) with no wildcard registration falls
//! back to the handler every registered child of that type shares.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::context::{Stage, StepHandlerRef};
use crate::model::{PathAddress, PathElement, WILDCARD};

/// Handler registered for an operation, with the stage it runs in.
#[derive(Clone)]
pub struct OperationEntry {
    pub handler: StepHandlerRef,
    pub stage: Stage,
}

/// Lookup interface for registered resources and operations.
pub trait OperationRegistry: Send + Sync + 'static {
    /// Handler for operation `name` at `address`, if one is registered.
    fn operation_handler(&self, address: &PathAddress, name: &str) -> Option<OperationEntry>;

    /// `true` if resources of `child_type` may be created under `address`.
    fn has_child_type(&self, address: &PathAddress, child_type: &str) -> bool;

    /// `true` if a resource definition matches `address`.
    fn has_resource(&self, address: &PathAddress) -> bool;
}

#[derive(Default)]
struct Registration {
    operations: HashMap<String, OperationEntry>,
    /// child type -> child value (or `*`) -> registration
    children: BTreeMap<String, BTreeMap<String, Registration>>,
}

impl Registration {
    fn find(&self, address: &PathAddress) -> Option<&Registration> {
        let mut node = self;
        for element in address.iter() {
            let values = node.children.get(element.key())?;
            node = values
                .get(element.value())
                .or_else(|| values.get(WILDCARD))?;
        }
        Some(node)
    }

    fn ensure(&mut self, pattern: &PathAddress) -> &mut Registration {
        let mut node = self;
        for element in pattern.iter() {
            node = node
                .children
                .entry(element.key().to_string())
                .or_default()
                .entry(element.value().to_string())
                .or_default();
        }
        node
    }

    /// Handler shared by every registered `child` of the parent, if identical.
    fn common_child_handler(&self, child: &PathElement, name: &str) -> Option<OperationEntry> {
        let values = self.children.get(child.key())?;
        let mut shared: Option<&OperationEntry> = None;
        for registration in values.values() {
            let entry = registration.operations.get(name)?;
            match shared {
                Some(seen) if !Arc::ptr_eq(&seen.handler, &entry.handler) => return None,
                _ => shared = Some(entry),
            }
        }
        shared.cloned()
    }
}

/// In-process registry of resource definitions and operation handlers.
///
/// Registration takes `&self`, so handlers (e.g. extension `add`) can
/// register further resources while the controller is running.
#[derive(Default)]
pub struct ManagementRegistry {
    root: RwLock<Registration>,
}

impl ManagementRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn read(&self) -> RwLockReadGuard<'_, Registration> {
        self.root.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registration> {
        self.root.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declares a resource at `pattern` (`*` values match any name).
    pub fn register_resource(&self, pattern: &PathAddress) {
        self.write().ensure(pattern);
    }

    /// Registers a MODEL-stage operation at `pattern`.
    pub fn register_operation(&self, pattern: &PathAddress, name: &str, handler: StepHandlerRef) {
        self.register_operation_at_stage(pattern, name, handler, Stage::Model);
    }

    pub fn register_operation_at_stage(
        &self,
        pattern: &PathAddress,
        name: &str,
        handler: StepHandlerRef,
        stage: Stage,
    ) {
        self.write()
            .ensure(pattern)
            .operations
            .insert(name.to_string(), OperationEntry { handler, stage });
    }

    /// Operation names registered at `address`, sorted.
    pub fn operation_names(&self, address: &PathAddress) -> Vec<String> {
        let root = self.read();
        let mut names: Vec<String> = root
            .find(address)
            .map(|r| r.operations.keys().cloned().collect())
            .unwrap_or_default();
        names.sort_unstable();
        names
    }
}

impl OperationRegistry for ManagementRegistry {
    fn operation_handler(&self, address: &PathAddress, name: &str) -> Option<OperationEntry> {
        let root = self.read();
        if let Some(entry) = root.find(address).and_then(|r| r.operations.get(name)) {
            return Some(entry.clone());
        }
        match address.last() {
            Some(last) if last.is_wildcard() => root
                .find(&address.parent())?
                .common_child_handler(last, name),
            _ => None,
        }
    }

    fn has_child_type(&self, address: &PathAddress, child_type: &str) -> bool {
        self.read()
            .find(address)
            .is_some_and(|r| r.children.contains_key(child_type))
    }

    fn has_resource(&self, address: &PathAddress) -> bool {
        let root = self.read();
        if root.find(address).is_some() {
            return true;
        }
        match address.last() {
            Some(last) if last.is_wildcard() => root
                .find(&address.parent())
                .is_some_and(|r| r.children.contains_key(last.key())),
            _ => false,
        }
    }
}
