//! # Kernel diagnostics.
//!
//! - [`Bus`] broadcasts [`Event`]s from every kernel component.
//! - [`EventKind`] classifies them.
//!
//! Subscribers attach through [`Subscribe`](crate::Subscribe); the controller
//! forwards every bus event to its [`SubscriberSet`](crate::SubscriberSet).

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind, Severity};
