//! Attribute values: nodes of the per-component dependency graph.
//!
//! Paths are rooted at `/root`:
//! - `/root/domain/<prop>` user-set inputs, plus `/root/domain` aggregating them
//! - `/root/input_socket/<name>`, `/root/output_socket/<name>` socket values
//! - anything else (e.g. `/root/code`) is a function-derived value

use serde::{Deserialize, Serialize};

use super::ids::{AttributeValueId, ComponentId};

pub const DOMAIN_PATH: &str = "/root/domain";
pub const INPUT_SOCKET_PREFIX: &str = "/root/input_socket/";
pub const OUTPUT_SOCKET_PREFIX: &str = "/root/output_socket/";

/// Path of a domain property value.
pub fn domain_prop_path(prop: &str) -> String {
    format!("{DOMAIN_PATH}/{prop}")
}

/// How a value is (re)computed when its dependencies change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Derivation {
    /// Set directly by user edits; never recomputed.
    Input,
    /// The first dependency's value.
    Copy,
    /// An object keyed by each dependency's name. Later non-null
    /// dependencies override earlier ones under the same key.
    Object,
    /// Computed by a function through the execution pipeline.
    Func { func: String },
}

impl Derivation {
    pub fn func(&self) -> Option<&str> {
        match self {
            Derivation::Func { func } => Some(func),
            _ => None,
        }
    }
}

/// Whether a value reflects its current upstream values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueStatus {
    Resolved,
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeValue {
    pub id: AttributeValueId,
    pub component_id: ComponentId,
    pub path: String,
    pub value: serde_json::Value,
    pub derivation: Derivation,
    pub depends_on: Vec<AttributeValueId>,
    pub status: ValueStatus,
    #[serde(default)]
    pub message: Option<String>,
}

impl AttributeValue {
    pub fn new(
        component_id: ComponentId,
        path: impl Into<String>,
        derivation: Derivation,
        value: serde_json::Value,
    ) -> Self {
        Self {
            id: AttributeValueId::generate(),
            component_id,
            path: path.into(),
            value,
            derivation,
            depends_on: Vec::new(),
            status: ValueStatus::Resolved,
            message: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<AttributeValueId>) -> Self {
        self.depends_on = deps;
        self
    }

    /// Last path segment; the key this value contributes to dependents.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn is_input_socket(&self) -> bool {
        self.path.starts_with(INPUT_SOCKET_PREFIX)
    }

    pub fn is_output_socket(&self) -> bool {
        self.path.starts_with(OUTPUT_SOCKET_PREFIX)
    }

    /// Socket name, if this value backs a socket.
    pub fn socket_name(&self) -> Option<&str> {
        self.path
            .strip_prefix(INPUT_SOCKET_PREFIX)
            .or_else(|| self.path.strip_prefix(OUTPUT_SOCKET_PREFIX))
    }
}

/// Recompute a plain (non-function) derived value from its dependencies, in
/// dependency order. Returns `None` for `Input` and `Func` derivations.
pub fn derive_plain(
    derivation: &Derivation,
    deps: &[(&str, &serde_json::Value)],
) -> Option<serde_json::Value> {
    match derivation {
        Derivation::Input | Derivation::Func { .. } => None,
        Derivation::Copy => Some(
            deps.first()
                .map(|(_, v)| (*v).clone())
                .unwrap_or(serde_json::Value::Null),
        ),
        Derivation::Object => {
            let mut obj = serde_json::Map::new();
            for (name, value) in deps {
                if value.is_null() && obj.contains_key(*name) {
                    continue;
                }
                obj.insert((*name).to_string(), (*value).clone());
            }
            Some(serde_json::Value::Object(obj))
        }
    }
}
