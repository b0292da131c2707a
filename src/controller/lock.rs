//! Controller write lock.
//!
//! Exclusive across operations, reentrant for the permit that holds it:
//! nested boot contexts reuse the primary operation's permit and stack on
//! its hold count.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::cancel::cancellable;
use crate::error::OperationError;

/// Identifier of an in-flight operation; doubles as its lock permit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u32);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct Holder {
    permit: OperationId,
    count: usize,
}

pub(crate) struct ControllerLock {
    holder: Mutex<Option<Holder>>,
    released: Notify,
}

impl ControllerLock {
    pub(crate) fn new() -> Self {
        Self {
            holder: Mutex::new(None),
            released: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, Option<Holder>> {
        self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_lock(&self, permit: OperationId) -> bool {
        let mut state = self.state();
        match state.as_mut() {
            None => {
                *state = Some(Holder { permit, count: 1 });
                true
            }
            Some(holder) if holder.permit == permit => {
                holder.count += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Acquires the lock for `permit`, waiting while another permit holds it.
    pub(crate) async fn lock(
        &self,
        permit: OperationId,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), OperationError> {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if self.try_lock(permit) {
                return Ok(());
            }
            cancellable(released, cancel).await?;
        }
    }

    /// Drops one hold of `permit`; wakes waiters when the count reaches zero.
    pub(crate) fn unlock(&self, permit: OperationId) {
        let mut state = self.state();
        let free = match state.as_mut() {
            Some(holder) if holder.permit == permit => {
                holder.count -= 1;
                holder.count == 0
            }
            _ => false,
        };
        if free {
            *state = None;
            drop(state);
            self.released.notify_waiters();
        }
    }

    pub(crate) fn holder(&self) -> Option<OperationId> {
        self.state().as_ref().map(|h| h.permit)
    }
}
