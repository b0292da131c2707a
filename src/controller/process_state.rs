use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

/// Lifecycle state of the managed process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessState {
    Starting,
    Running,
    /// A committed change needs a reload to take effect.
    ReloadRequired,
    /// A committed change needs a full restart; dominates `ReloadRequired`.
    RestartRequired,
    Stopping,
}

impl ProcessState {
    /// `true` if the state must be reported to callers.
    pub fn requires_action(self) -> bool {
        matches!(self, ProcessState::ReloadRequired | ProcessState::RestartRequired)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::ReloadRequired => "reload-required",
            ProcessState::RestartRequired => "restart-required",
            ProcessState::Stopping => "stopping",
        })
    }
}

#[derive(Debug)]
struct Inner {
    state: ProcessState,
    /// Bumped on every required-transition; reverts only apply to the latest.
    stamp: u64,
    /// State to return to on revert.
    restore: ProcessState,
}

/// Stamped process-state tracker shared by all operations.
#[derive(Debug)]
pub(crate) struct ProcessStateTracker {
    inner: Mutex<Inner>,
}

impl ProcessStateTracker {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ProcessState::Starting,
                stamp: 0,
                restore: ProcessState::Starting,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> ProcessState {
        self.lock().state
    }

    pub(crate) fn set_running(&self) {
        let mut inner = self.lock();
        if inner.state == ProcessState::Starting {
            inner.state = ProcessState::Running;
        }
        if inner.restore == ProcessState::Starting {
            inner.restore = ProcessState::Running;
        }
    }

    pub(crate) fn set_stopping(&self) {
        self.lock().state = ProcessState::Stopping;
    }

    pub(crate) fn set_reload_required(&self) -> u64 {
        self.require(ProcessState::ReloadRequired)
    }

    pub(crate) fn set_restart_required(&self) -> u64 {
        self.require(ProcessState::RestartRequired)
    }

    pub(crate) fn revert_reload_required(&self, stamp: u64) {
        self.revert(ProcessState::ReloadRequired, stamp);
    }

    pub(crate) fn revert_restart_required(&self, stamp: u64) {
        self.revert(ProcessState::RestartRequired, stamp);
    }

    fn require(&self, target: ProcessState) -> u64 {
        let mut inner = self.lock();
        inner.stamp += 1;
        match (inner.state, target) {
            (ProcessState::RestartRequired, _) | (ProcessState::Stopping, _) => {}
            (ProcessState::ReloadRequired, ProcessState::RestartRequired) => {
                inner.state = target;
            }
            (ProcessState::ReloadRequired, _) => {}
            (current, _) => {
                inner.restore = current;
                inner.state = target;
            }
        }
        inner.stamp
    }

    fn revert(&self, target: ProcessState, stamp: u64) {
        let mut inner = self.lock();
        if inner.stamp == stamp && inner.state == target {
            inner.state = inner.restore;
        }
    }
}
