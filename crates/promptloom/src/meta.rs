//! Side-channel data carried alongside rendered content
//!
//! Metadata, references, used-context records, and ignored-file markers ride
//! through materialization attached to the nodes that declared them, so that
//! pruning a node also drops its side-channel data. Whatever survives is
//! collected by the emitter.

use serde::{Deserialize, Serialize};

/// A keyed metadata record attached to the scope that declared it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    /// Lookup key; global records must be unique by key
    pub key: String,

    /// Arbitrary payload
    pub value: serde_json::Value,

    /// Local records are dropped when their enclosing chunk is pruned;
    /// global records always survive
    #[serde(default)]
    pub local: bool,
}

impl Metadata {
    /// Create a global metadata record.
    pub fn global(key: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            value,
            local: false,
        }
    }

    /// Create a local metadata record that shares its chunk's fate.
    pub fn local(key: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            value,
            local: true,
        }
    }
}

/// A reference to an external variable or resource used by the prompt.
///
/// References are de-duplicated by variable name when collected; references
/// whose content was pruned are reported separately as omitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reference {
    /// Name of the referenced variable
    pub variable_name: String,

    /// Optional payload describing the reference
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl Reference {
    /// Create a reference by variable name.
    pub fn new(variable_name: impl Into<String>) -> Self {
        Self {
            variable_name: variable_name.into(),
            value: None,
        }
    }

    /// Attach a payload to the reference.
    pub fn with_value(mut self, value: serde_json::Value) -> Self {
        self.value = Some(value);
        self
    }
}

/// A record of context consumed while producing the prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsedContext {
    /// Arbitrary description of the consumed context
    pub value: serde_json::Value,
}

impl UsedContext {
    /// Create a used-context record.
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }
}
