//! # Event subscribers.
//!
//! This module provides the [`Subscribe`] trait, the [`SubscriberSet`]
//! fan-out, and (with the `logging` feature) the stdout [`LogWriter`].
//!
//! ## Architecture
//! ```text
//! Event flow:
//!   kernel ── publish(Event) ──► Bus ──► controller listener ──► SubscriberSet::emit
//!                                                                   │
//!                                                      ┌────────────┼────────────┐
//!                                                      ▼            ▼            ▼
//!                                                  LogWriter     Metrics      Custom
//! ```

#[cfg(feature = "logging")]
mod log;
mod subscriber;
mod subscriber_set;

#[cfg(feature = "logging")]
pub use log::LogWriter;
pub use subscriber::Subscribe;
pub use subscriber_set::SubscriberSet;
pub(crate) use subscriber_set::panic_message;
