//! # Operation and response documents.
//!
//! Documents are plain JSON values ([`ModelNode`]). This module holds the
//! well-known keys and a few accessors so the rest of the crate does not
//! sprinkle string literals.
//!
//! ## Operation document
//! ```text
//! { "operation": "add",
//!   "address": [{"subsystem": "web"}],
//!   "operation-headers": { "rollback-on-runtime-failure": false },
//!   ...handler parameters }
//! ```
//!
//! ## Response document
//! ```text
//! { "outcome": "success" | "failed" | "cancelled",
//!   "result": ...,
//!   "failure-description": ...,
//!   "rolled-back": true,
//!   "response-headers": { "process-state": "reload-required", ... } }
//! ```

use serde_json::{Map, Value, json};

use crate::error::OperationError;
use crate::model::PathAddress;

/// A structured document (attribute values, operations, responses).
pub type ModelNode = Value;

pub const OP: &str = "operation";
pub const OP_ADDR: &str = "address";
pub const OPERATION_HEADERS: &str = "operation-headers";
pub const ROLLBACK_ON_RUNTIME_FAILURE: &str = "rollback-on-runtime-failure";
pub const ALLOW_RESOURCE_SERVICE_RESTART: &str = "allow-resource-service-restart";

pub const OUTCOME: &str = "outcome";
pub const SUCCESS: &str = "success";
pub const FAILED: &str = "failed";
pub const CANCELLED: &str = "cancelled";
pub const RESULT: &str = "result";
pub const FAILURE_DESCRIPTION: &str = "failure-description";
pub const ROLLED_BACK: &str = "rolled-back";
pub const RESPONSE_HEADERS: &str = "response-headers";
pub const PROCESS_STATE: &str = "process-state";
pub const OPERATION_REQUIRES_RELOAD: &str = "operation-requires-reload";
pub const OPERATION_REQUIRES_RESTART: &str = "operation-requires-restart";
pub const RUNTIME_UPDATE_SKIPPED: &str = "runtime-update-skipped";

/// Operation names the kernel itself recognizes.
pub const ADD: &str = "add";
pub const REMOVE: &str = "remove";
pub const EXTENSION: &str = "extension";
pub const SUBSYSTEM: &str = "subsystem";

/// Builds a bare operation document.
///
/// ```
/// use opkernel::{PathAddress, model::operation};
///
/// let op = operation("add", &PathAddress::from_pairs(&[("subsystem", "web")]));
/// assert_eq!(op["operation"], "add");
/// ```
pub fn operation(name: &str, address: &PathAddress) -> ModelNode {
    json!({ OP: name, OP_ADDR: address.to_model_node() })
}

/// Returns the operation name, if present.
pub fn operation_name(op: &ModelNode) -> Option<&str> {
    op.get(OP).and_then(Value::as_str)
}

/// Parses the operation's target address (absent = root).
pub fn operation_address(op: &ModelNode) -> Result<PathAddress, OperationError> {
    match op.get(OP_ADDR) {
        Some(node) => PathAddress::from_model_node(node),
        None => Ok(PathAddress::root()),
    }
}

/// Reads a boolean operation header.
pub fn header_flag(op: &ModelNode, header: &str) -> Option<bool> {
    op.get(OPERATION_HEADERS)
        .and_then(|h| h.get(header))
        .and_then(Value::as_bool)
}

/// Returns `true` unless the operation explicitly sets the header to `false`.
pub fn rollback_on_runtime_failure(op: &ModelNode) -> bool {
    header_flag(op, ROLLBACK_ON_RUNTIME_FAILURE).unwrap_or(true)
}

/// Returns `node[key]`, turning `node` into an object first if needed.
pub(crate) fn child_mut<'a>(node: &'a mut ModelNode, key: &str) -> &'a mut ModelNode {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    &mut node[key]
}

/// Renders a value for event reasons: strings verbatim, anything else as JSON.
pub(crate) fn text(value: &ModelNode) -> String {
    match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_string(),
    }
}

/// Returns `true` if `node[key]` is present and not `null`.
pub(crate) fn is_defined(node: &ModelNode, key: &str) -> bool {
    node.get(key).is_some_and(|v| !v.is_null())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_header_defaults_to_true() {
        let addr = PathAddress::root();
        let mut op = operation("write", &addr);
        assert!(rollback_on_runtime_failure(&op));

        op[OPERATION_HEADERS] = json!({ ROLLBACK_ON_RUNTIME_FAILURE: false });
        assert!(!rollback_on_runtime_failure(&op));
    }

    #[test]
    fn test_child_mut_creates_object() {
        let mut node = Value::Null;
        *child_mut(&mut node, "a") = json!(1);
        assert_eq!(node, json!({"a": 1}));
        assert!(is_defined(&node, "a"));
        assert!(!is_defined(&node, "b"));
    }

    #[test]
    fn test_operation_accessors() {
        let addr = PathAddress::from_pairs(&[("subsystem", "web")]);
        let op = operation("add", &addr);
        assert_eq!(operation_name(&op), Some("add"));
        assert_eq!(operation_address(&op).unwrap(), addr);
        assert_eq!(
            operation_address(&json!({"operation": "x"})).unwrap(),
            PathAddress::root()
        );
    }
}
