//! # Controller configuration.
//!
//! [`ControllerConfig`] is passed to [`ModelController::builder`](crate::ModelController::builder).
//!
//! ## Sentinel values
//! - `boot_workers = 0` → subsystem operations boot sequentially
//! - `max_concurrent_operations = 0` → unlimited (no semaphore created)

use crate::context::ContextType;

/// Configuration for the model controller.
///
/// ## Field semantics
/// - `bus_capacity`: event bus ring buffer size (min 1)
/// - `running_mode`: `AdminOnly` contexts reject RUNTIME steps
/// - `boot_workers`: parallel boot pool size (`0` = sequential boot)
/// - `max_concurrent_operations`: admission limit of `execute_async` (`0` = unlimited)
/// - `boot_rollback_on_runtime_failure`: rollback flag of the boot context
/// - `reload_supported`: `false` escalates reload-required to restart-required
///
/// All fields are public; prefer the helper accessors over checking
/// sentinels by hand.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Capacity of the event bus broadcast channel.
    ///
    /// Subscribers lagging behind more than `bus_capacity` events skip older ones.
    pub bus_capacity: usize,

    /// Kind of process every context manages.
    pub running_mode: ContextType,

    /// Number of boot workers for subsystem operations.
    pub boot_workers: usize,

    /// Maximum number of operations `execute_async` runs at once.
    pub max_concurrent_operations: usize,

    /// Whether a runtime failure during boot rolls the boot back.
    pub boot_rollback_on_runtime_failure: bool,

    /// Whether the process can apply changes with a reload.
    pub reload_supported: bool,
}

impl ControllerConfig {
    /// Returns a bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }

    /// Returns the boot worker pool size when parallel boot applies.
    ///
    /// - `None` → sequential boot (no workers, or not a normal server)
    /// - `Some(n)` → at most `n` subsystems prepare at once
    #[inline]
    pub fn boot_parallelism(&self) -> Option<usize> {
        if self.boot_workers == 0 || self.running_mode != ContextType::Normal {
            None
        } else {
            Some(self.boot_workers)
        }
    }

    /// Returns the async admission limit as an `Option`.
    #[inline]
    pub fn concurrency_limit(&self) -> Option<usize> {
        if self.max_concurrent_operations == 0 {
            None
        } else {
            Some(self.max_concurrent_operations)
        }
    }
}

impl Default for ControllerConfig {
    /// Default configuration:
    ///
    /// - `bus_capacity = 1024`
    /// - `running_mode = Normal`
    /// - `boot_workers = 0` (sequential boot)
    /// - `max_concurrent_operations = 0` (unlimited)
    /// - `boot_rollback_on_runtime_failure = true`
    /// - `reload_supported = true`
    fn default() -> Self {
        Self {
            bus_capacity: 1024,
            running_mode: ContextType::Normal,
            boot_workers: 0,
            max_concurrent_operations: 0,
            boot_rollback_on_runtime_failure: true,
            reload_supported: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels() {
        let mut cfg = ControllerConfig::default();
        assert_eq!(cfg.boot_parallelism(), None);
        assert_eq!(cfg.concurrency_limit(), None);

        cfg.boot_workers = 4;
        assert_eq!(cfg.boot_parallelism(), Some(4));
        cfg.running_mode = ContextType::AdminOnly;
        assert_eq!(cfg.boot_parallelism(), None);

        cfg.bus_capacity = 0;
        assert_eq!(cfg.bus_capacity_clamped(), 1);
    }
}
