//! # Management model: addresses, resources and documents.
//!
//! - [`PathAddress`] / [`PathElement`] identify nodes.
//! - [`Resource`] is the copy-on-write tree the controller publishes.
//! - [`ModelNode`] is the JSON document type used for attribute values,
//!   operations and responses; [`node`] holds its well-known keys.

mod address;
mod resource;

pub mod node;

pub use address::{PathAddress, PathElement, WILDCARD};
pub use node::{ModelNode, operation, operation_address, operation_name};
pub use resource::Resource;
