//! # Event subscriber trait.
//!
//! [`Subscribe`] is how log sinks, metrics or audit trails watch the kernel:
//! operation failures, persistence problems, service lifecycle changes and
//! boot progress all arrive as [`Event`]s.
//!
//! A subscriber declares which events it wants with [`Subscribe::accepts`];
//! the [`SubscriberSet`](super::SubscriberSet) only queues those. Delivery is
//! per-subscriber FIFO on a dedicated worker, so a slow audit sink never
//! delays an operation.
//!
//! ## Example
//! ```rust
//! use async_trait::async_trait;
//! use opkernel::{Event, Severity, Subscribe};
//!
//! /// Pages on anything that went wrong.
//! struct Pager;
//!
//! #[async_trait]
//! impl Subscribe for Pager {
//!     async fn on_event(&self, ev: &Event) {
//!         eprintln!("page: {} {:?}", ev.kind.as_label(), ev.reason);
//!     }
//!
//!     fn accepts(&self, ev: &Event) -> bool {
//!         ev.severity() >= Severity::Warn
//!     }
//!
//!     fn name(&self) -> &'static str { "pager" }
//! }
//! ```

use async_trait::async_trait;

use crate::events::Event;

/// Consumer of kernel events.
///
/// `on_event` runs on the subscriber's own worker task. A panic there is
/// caught and published as `SubscriberPanicked`; the worker keeps going.
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    async fn on_event(&self, event: &Event);

    /// Filters events before they are queued. Rejected events neither use
    /// queue space nor count as overflow.
    fn accepts(&self, _event: &Event) -> bool {
        true
    }

    /// Name used in overflow and panic events.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Queue capacity (clamped to at least 1).
    fn queue_capacity(&self) -> usize {
        1024
    }
}
