//! Function kinds and the result shapes each kind returns.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FuncKind {
    Qualification,
    CodeGeneration,
    Fix,
    Refresh,
    Attribute,
}

impl FuncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FuncKind::Qualification => "qualification",
            FuncKind::CodeGeneration => "codeGeneration",
            FuncKind::Fix => "fix",
            FuncKind::Refresh => "refresh",
            FuncKind::Attribute => "attribute",
        }
    }
}

impl std::fmt::Display for FuncKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pass/fail check with a diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualificationResult {
    pub qualified: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeFormat {
    Json,
    Yaml,
    Text,
}

/// Generated code. Identical input must yield byte-identical `code`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeGenerationResult {
    pub code: String,
    pub format: CodeFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Ok,
    Error,
}

/// Outcome of a function acting on a real resource (fix or refresh).
///
/// On `Error`, `value` is the last known resource value, unchanged. On `Ok`,
/// a null `value` means the resource no longer exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceResult {
    pub status: ResourceStatus,
    pub value: serde_json::Value,
    #[serde(default)]
    pub message: Option<String>,
}

impl ResourceResult {
    pub fn ok(value: serde_json::Value) -> Self {
        Self {
            status: ResourceStatus::Ok,
            value,
            message: None,
        }
    }

    pub fn error(last_known: serde_json::Value, message: impl Into<String>) -> Self {
        Self {
            status: ResourceStatus::Error,
            value: last_known,
            message: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResourceStatus::Ok
    }
}

/// What a function returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "result", rename_all = "camelCase")]
pub enum FuncResult {
    Qualification(QualificationResult),
    CodeGeneration(CodeGenerationResult),
    Fix(ResourceResult),
    Refresh(ResourceResult),
    Attribute(serde_json::Value),
}

impl FuncResult {
    pub fn kind(&self) -> FuncKind {
        match self {
            FuncResult::Qualification(_) => FuncKind::Qualification,
            FuncResult::CodeGeneration(_) => FuncKind::CodeGeneration,
            FuncResult::Fix(_) => FuncKind::Fix,
            FuncResult::Refresh(_) => FuncKind::Refresh,
            FuncResult::Attribute(_) => FuncKind::Attribute,
        }
    }

    /// The value stored on an attribute value derived by this result.
    pub fn to_value(&self) -> serde_json::Value {
        let value = match self {
            FuncResult::Qualification(r) => serde_json::to_value(r),
            FuncResult::CodeGeneration(r) => serde_json::to_value(r),
            FuncResult::Fix(r) | FuncResult::Refresh(r) => serde_json::to_value(r),
            FuncResult::Attribute(v) => return v.clone(),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}
