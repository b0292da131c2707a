//! Configuration persistence.
//!
//! At the commit point the kernel hands the full working model and the
//! addresses the operation touched to a [`ConfigurationPersister`]. The
//! returned [`PersistenceResource`] is committed or rolled back once the
//! final vote is known.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::PersistenceError;
use crate::model::{ModelNode, PathAddress};

/// Pending write produced by [`ConfigurationPersister::store`].
pub trait PersistenceResource: Send {
    fn commit(self: Box<Self>);
    fn rollback(self: Box<Self>);
}

/// Stores configuration changes.
pub trait ConfigurationPersister: Send + Sync + 'static {
    fn store(
        &self,
        model: &ModelNode,
        affected: &[PathAddress],
    ) -> Result<Box<dyn PersistenceResource>, PersistenceError>;
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullPersister;

struct NullResource;

impl PersistenceResource for NullResource {
    fn commit(self: Box<Self>) {}
    fn rollback(self: Box<Self>) {}
}

impl ConfigurationPersister for NullPersister {
    fn store(
        &self,
        _model: &ModelNode,
        _affected: &[PathAddress],
    ) -> Result<Box<dyn PersistenceResource>, PersistenceError> {
        Ok(Box::new(NullResource))
    }
}

#[derive(Debug, Default)]
struct Journal {
    committed: Option<ModelNode>,
    commits: usize,
    rollbacks: usize,
    last_affected: Vec<PathAddress>,
    fail_with: Option<String>,
}

/// Keeps the last committed model in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemoryPersister {
    journal: Arc<Mutex<Journal>>,
}

impl InMemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    fn journal(&self) -> MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every following `store` fail with `reason` (`None` clears).
    pub fn set_failure(&self, reason: Option<String>) {
        self.journal().fail_with = reason;
    }

    pub fn committed(&self) -> Option<ModelNode> {
        self.journal().committed.clone()
    }

    pub fn commits(&self) -> usize {
        self.journal().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.journal().rollbacks
    }

    /// Addresses passed to the most recent `store`.
    pub fn last_affected(&self) -> Vec<PathAddress> {
        self.journal().last_affected.clone()
    }
}

struct PendingWrite {
    journal: Arc<Mutex<Journal>>,
    model: ModelNode,
}

impl PendingWrite {
    fn journal(&self) -> MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PersistenceResource for PendingWrite {
    fn commit(self: Box<Self>) {
        let mut journal = self.journal();
        journal.commits += 1;
        journal.committed = Some(self.model.clone());
    }

    fn rollback(self: Box<Self>) {
        self.journal().rollbacks += 1;
    }
}

impl ConfigurationPersister for InMemoryPersister {
    fn store(
        &self,
        model: &ModelNode,
        affected: &[PathAddress],
    ) -> Result<Box<dyn PersistenceResource>, PersistenceError> {
        let mut journal = self.journal();
        if let Some(reason) = &journal.fail_with {
            return Err(PersistenceError::Store {
                reason: reason.clone(),
            });
        }
        journal.last_affected = affected.to_vec();
        Ok(Box::new(PendingWrite {
            journal: Arc::clone(&self.journal),
            model: model.clone(),
        }))
    }
}
