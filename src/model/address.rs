//! # Resource addresses.
//!
//! A [`PathAddress`] is an ordered list of [`PathElement`] segments, each a
//! `(key, value)` pair such as `subsystem=web`. The value `*` is the wildcard
//! placeholder and matches every child of that type.
//!
//! ```text
//! /subsystem=web/connector=http
//!  └──┬─────────┘└──────┬──────┘
//!   element 0       element 1
//! ```
//!
//! ## Rules
//! - Addresses are immutable; [`PathAddress::append`] returns a new address.
//! - Equality and ordering are structural (segment by segment).
//! - The document form is a list of single-key objects: `[{"subsystem": "web"}]`.

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::error::OperationError;
use crate::model::ModelNode;

/// Wildcard segment value.
pub const WILDCARD: &str = "*";

/// One `(key, value)` segment of an address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathElement {
    key: String,
    value: String,
}

impl PathElement {
    /// Creates a segment.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Creates a wildcard segment for the given child type.
    pub fn wildcard(key: impl Into<String>) -> Self {
        Self::new(key, WILDCARD)
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[inline]
    pub fn value(&self) -> &str {
        &self.value
    }

    #[inline]
    pub fn is_wildcard(&self) -> bool {
        self.value == WILDCARD
    }

    /// Returns `true` if `self` (possibly a wildcard) matches the concrete segment.
    pub fn matches(&self, other: &PathElement) -> bool {
        self.key == other.key && (self.is_wildcard() || self.value == other.value)
    }
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Ordered sequence of segments identifying a node in the resource tree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathAddress {
    elements: Vec<PathElement>,
}

impl PathAddress {
    /// The root address.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_elements(elements: Vec<PathElement>) -> Self {
        Self { elements }
    }

    /// Builds an address from `(key, value)` pairs.
    ///
    /// ```
    /// use opkernel::PathAddress;
    ///
    /// let addr = PathAddress::from_pairs(&[("subsystem", "web"), ("connector", "http")]);
    /// assert_eq!(addr.to_string(), "/subsystem=web/connector=http");
    /// ```
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self {
            elements: pairs.iter().map(|(k, v)| PathElement::new(*k, *v)).collect(),
        }
    }

    /// Returns a new address with `element` appended.
    pub fn append(&self, element: PathElement) -> Self {
        let mut elements = self.elements.clone();
        elements.push(element);
        Self { elements }
    }

    /// Returns a new address with every segment of `suffix` appended.
    pub fn join(&self, suffix: &PathAddress) -> Self {
        let mut elements = self.elements.clone();
        elements.extend(suffix.elements.iter().cloned());
        Self { elements }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathElement> {
        self.elements.iter()
    }

    pub fn elements(&self) -> &[PathElement] {
        &self.elements
    }

    pub fn first(&self) -> Option<&PathElement> {
        self.elements.first()
    }

    pub fn last(&self) -> Option<&PathElement> {
        self.elements.last()
    }

    /// Returns the parent address (the root's parent is the root).
    pub fn parent(&self) -> Self {
        self.prefix(self.elements.len().saturating_sub(1))
    }

    /// Returns the first `len` segments.
    pub fn prefix(&self, len: usize) -> Self {
        let len = len.min(self.elements.len());
        Self {
            elements: self.elements[..len].to_vec(),
        }
    }

    /// Returns `true` if any segment is a wildcard.
    pub fn is_multi_target(&self) -> bool {
        self.elements.iter().any(PathElement::is_wildcard)
    }

    /// Returns `true` if `self` is `other` or one of its ancestors.
    pub fn is_prefix_of(&self, other: &PathAddress) -> bool {
        other.elements.len() >= self.elements.len()
            && self.elements.iter().zip(&other.elements).all(|(a, b)| a == b)
    }

    /// Renders the address as a list of single-key objects.
    pub fn to_model_node(&self) -> ModelNode {
        Value::Array(
            self.elements
                .iter()
                .map(|e| {
                    let mut obj = Map::new();
                    obj.insert(e.key.clone(), Value::String(e.value.clone()));
                    Value::Object(obj)
                })
                .collect(),
        )
    }

    /// Parses the document form produced by [`to_model_node`](Self::to_model_node).
    ///
    /// An undefined (`null`) node is the root address.
    pub fn from_model_node(node: &ModelNode) -> Result<Self, OperationError> {
        let invalid = || OperationError::InvalidAddress {
            address: node.to_string(),
        };
        match node {
            Value::Null => Ok(Self::root()),
            Value::Array(items) => {
                let mut elements = Vec::with_capacity(items.len());
                for item in items {
                    let obj = item.as_object().ok_or_else(invalid)?;
                    if obj.len() != 1 {
                        return Err(invalid());
                    }
                    for (k, v) in obj {
                        let v = v.as_str().ok_or_else(invalid)?;
                        elements.push(PathElement::new(k.as_str(), v));
                    }
                }
                Ok(Self { elements })
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for PathAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.elements.is_empty() {
            return f.write_str("/");
        }
        for e in &self.elements {
            write!(f, "/{e}")?;
        }
        Ok(())
    }
}

impl FromStr for PathAddress {
    type Err = OperationError;

    /// Parses `/key=value/key=value`; `/` and the empty string are the root.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut elements = Vec::new();
        for part in s.split('/').filter(|p| !p.is_empty()) {
            let (k, v) = part
                .split_once('=')
                .filter(|(k, v)| !k.is_empty() && !v.is_empty())
                .ok_or_else(|| OperationError::InvalidAddress {
                    address: s.to_string(),
                })?;
            elements.push(PathElement::new(k, v));
        }
        Ok(Self { elements })
    }
}

impl<'a> FromIterator<&'a PathElement> for PathAddress {
    fn from_iter<T: IntoIterator<Item = &'a PathElement>>(iter: T) -> Self {
        Self {
            elements: iter.into_iter().cloned().collect(),
        }
    }
}
