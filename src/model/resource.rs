//! # Resource tree.
//!
//! A [`Resource`] owns a document of attribute values and, per child type,
//! an insertion-ordered set of named child resources.
//!
//! ```text
//! Resource (root)
//! ├── model: { "name": "server-one" }
//! ├── extension
//! │     └── org.web        -> Resource
//! └── subsystem
//!       ├── web            -> Resource
//!       └── logging        -> Resource
//! ```
//!
//! ## Rules
//! - `Clone` is a deep structural copy; it is how an operation obtains its
//!   private working copy before the first write.
//! - Child order within a type is registration order, and is preserved by
//!   cloning, removal of siblings and [`Resource::reorder_children`].
//! - Navigation never creates nodes.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::OperationError;
use crate::model::{ModelNode, PathAddress, PathElement};

/// A node of the hierarchical configuration model.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Resource {
    model: ModelNode,
    children: BTreeMap<String, Vec<(String, Resource)>>,
}

impl Resource {
    /// Creates a resource with an undefined model and no children.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a resource holding `model`.
    pub fn with_model(model: ModelNode) -> Self {
        Self {
            model,
            children: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn model(&self) -> &ModelNode {
        &self.model
    }

    #[inline]
    pub fn model_mut(&mut self) -> &mut ModelNode {
        &mut self.model
    }

    pub fn write_model(&mut self, model: ModelNode) {
        self.model = model;
    }

    pub fn is_model_defined(&self) -> bool {
        !self.model.is_null()
    }

    pub fn has_child(&self, element: &PathElement) -> bool {
        self.child(element).is_some()
    }

    pub fn child(&self, element: &PathElement) -> Option<&Resource> {
        self.children
            .get(element.key())?
            .iter()
            .find(|(name, _)| name == element.value())
            .map(|(_, r)| r)
    }

    pub fn child_mut(&mut self, element: &PathElement) -> Option<&mut Resource> {
        self.children
            .get_mut(element.key())?
            .iter_mut()
            .find(|(name, _)| name == element.value())
            .map(|(_, r)| r)
    }

    /// Registers a new child; fails if one with the same name exists.
    pub fn register_child(
        &mut self,
        element: &PathElement,
        resource: Resource,
    ) -> Result<(), OperationError> {
        if element.is_wildcard() {
            return Err(OperationError::WildcardWrite {
                address: element.to_string(),
            });
        }
        if self.has_child(element) {
            return Err(OperationError::DuplicateResource {
                address: element.to_string(),
            });
        }
        self.children
            .entry(element.key().to_string())
            .or_default()
            .push((element.value().to_string(), resource));
        Ok(())
    }

    /// Removes and returns the child, if present.
    ///
    /// An emptied child type is dropped so [`child_types`](Self::child_types)
    /// only lists types that have children.
    pub fn remove_child(&mut self, element: &PathElement) -> Option<Resource> {
        let set = self.children.get_mut(element.key())?;
        let idx = set.iter().position(|(name, _)| name == element.value())?;
        let (_, removed) = set.remove(idx);
        if set.is_empty() {
            self.children.remove(element.key());
        }
        Some(removed)
    }

    pub fn child_types(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    pub fn has_children(&self, child_type: &str) -> bool {
        self.children.contains_key(child_type)
    }

    /// Names of the children of one type, in registration order.
    pub fn child_names(&self, child_type: &str) -> Vec<&str> {
        self.children(child_type).map(|(name, _)| name).collect()
    }

    pub fn children(&self, child_type: &str) -> impl Iterator<Item = (&str, &Resource)> {
        self.children
            .get(child_type)
            .into_iter()
            .flatten()
            .map(|(name, r)| (name.as_str(), r))
    }

    /// Reorders children of `child_type`: names in `order` first (in that
    /// order), then any others in their existing order.
    pub fn reorder_children(&mut self, child_type: &str, order: &[&str]) {
        let Some(set) = self.children.get_mut(child_type) else {
            return;
        };
        let mut entries = std::mem::take(set);
        let mut sorted = Vec::with_capacity(entries.len());
        for name in order {
            if let Some(idx) = entries.iter().position(|(n, _)| n == name) {
                sorted.push(entries.remove(idx));
            }
        }
        sorted.append(&mut entries);
        *set = sorted;
    }

    /// Walks down `address` from this node.
    pub fn navigate(&self, address: &PathAddress) -> Result<&Resource, OperationError> {
        let mut current = self;
        for (depth, element) in address.iter().enumerate() {
            current = current
                .child(element)
                .ok_or_else(|| OperationError::NoSuchResource {
                    address: address.prefix(depth + 1).to_string(),
                })?;
        }
        Ok(current)
    }

    /// Mutable variant of [`navigate`](Self::navigate).
    pub fn navigate_mut(&mut self, address: &PathAddress) -> Result<&mut Resource, OperationError> {
        let mut current = self;
        for (depth, element) in address.iter().enumerate() {
            current = current
                .child_mut(element)
                .ok_or_else(|| OperationError::NoSuchResource {
                    address: address.prefix(depth + 1).to_string(),
                })?;
        }
        Ok(current)
    }

    /// Renders the resource as a document.
    ///
    /// Attributes come from the model; each child type becomes an object keyed
    /// by child name. Non-recursive rendering leaves child values undefined.
    pub fn to_model_node(&self, recursive: bool) -> ModelNode {
        let mut out = match &self.model {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        for (child_type, set) in &self.children {
            let mut by_name = Map::new();
            for (name, child) in set {
                let value = if recursive {
                    child.to_model_node(true)
                } else {
                    Value::Null
                };
                by_name.insert(name.clone(), value);
            }
            out.insert(child_type.clone(), Value::Object(by_name));
        }
        Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn el(k: &str, v: &str) -> PathElement {
        PathElement::new(k, v)
    }

    #[test]
    fn test_register_keeps_insertion_order() {
        let mut root = Resource::new();
        for name in ["web", "logging", "io"] {
            root.register_child(&el("subsystem", name), Resource::new())
                .unwrap();
        }
        assert_eq!(root.child_names("subsystem"), vec!["web", "logging", "io"]);

        root.remove_child(&el("subsystem", "logging"));
        assert_eq!(root.child_names("subsystem"), vec!["web", "io"]);
    }

    #[test]
    fn test_duplicate_and_wildcard_rejected() {
        let mut root = Resource::new();
        root.register_child(&el("subsystem", "web"), Resource::new())
            .unwrap();
        assert!(matches!(
            root.register_child(&el("subsystem", "web"), Resource::new()),
            Err(OperationError::DuplicateResource { .. })
        ));
        assert!(matches!(
            root.register_child(&PathElement::wildcard("subsystem"), Resource::new()),
            Err(OperationError::WildcardWrite { .. })
        ));
    }

    #[test]
    fn test_navigate_reports_first_missing_segment() {
        let mut root = Resource::new();
        root.register_child(&el("subsystem", "web"), Resource::new())
            .unwrap();
        let addr = PathAddress::from_pairs(&[("subsystem", "web"), ("connector", "http")]);
        match root.navigate(&addr) {
            Err(OperationError::NoSuchResource { address }) => {
                assert_eq!(address, "/subsystem=web/connector=http")
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(root.navigate(&addr.parent()).is_ok());
    }

    #[test]
    fn test_clone_is_deep() {
        let mut root = Resource::new();
        root.register_child(&el("subsystem", "web"), Resource::with_model(json!({"port": 80})))
            .unwrap();
        let mut copy = root.clone();
        copy.child_mut(&el("subsystem", "web")).unwrap().model_mut()["port"] = json!(8080);

        assert_eq!(root.child(&el("subsystem", "web")).unwrap().model()["port"], 80);
        assert_ne!(root, copy);
    }

    #[test]
    fn test_reorder_children() {
        let mut root = Resource::new();
        for name in ["c", "a", "d", "b"] {
            root.register_child(&el("subsystem", name), Resource::new())
                .unwrap();
        }
        root.reorder_children("subsystem", &["a", "b", "c"]);
        assert_eq!(root.child_names("subsystem"), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_to_model_node() {
        let mut root = Resource::with_model(json!({"name": "srv"}));
        let mut web = Resource::with_model(json!({"port": 80}));
        web.register_child(&el("connector", "http"), Resource::new())
            .unwrap();
        root.register_child(&el("subsystem", "web"), web).unwrap();

        assert_eq!(
            root.to_model_node(true),
            json!({"name": "srv", "subsystem": {"web": {"port": 80, "connector": {"http": {}}}}})
        );
        assert_eq!(
            root.to_model_node(false),
            json!({"name": "srv", "subsystem": {"web": null}})
        );
    }
}
