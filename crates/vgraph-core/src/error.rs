//! Error types for vgraph-core.

use vgraph_state::{ChangeSetPk, ChangeSetStatus, StorageError};

use crate::domain::{AttributeValueId, ComponentId, ComponentType};
use crate::events::DispatchError;
use crate::func::ExecutionFault;

/// Errors produced by the graph engine.
///
/// Functional failures (a qualification that does not pass, a fix that
/// reports `error`) are not errors; they are ordinary result values.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// The attribute graph contains a cycle. Never retried.
    #[error("dependency cycle among attribute values: {}", join_ids(node_ids))]
    DependencyCycle { node_ids: Vec<AttributeValueId> },

    /// A read or write without a valid tenancy and visibility. Never retried.
    #[error("scope violation: {reason}")]
    ScopeViolation { reason: String },

    #[error("invalid change set transition for {pk}: {from} -> {to}")]
    InvalidStateTransition {
        pk: ChangeSetPk,
        from: ChangeSetStatus,
        to: ChangeSetStatus,
    },

    #[error("execution fault: {0}")]
    ExecutionFault(#[from] ExecutionFault),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("component {component_id} is a {component_type} and cannot act as a frame")]
    InvalidComponentTypeForFrame {
        component_id: ComponentId,
        component_type: ComponentType,
    },

    #[error("component not found: {0}")]
    ComponentNotFound(ComponentId),

    #[error("attribute value not found: {0}")]
    AttributeValueNotFound(String),

    #[error("invalid schema variant {variant}: {reason}")]
    InvalidVariant { variant: String, reason: String },

    #[error("package {name} is already installed")]
    PkgAlreadyInstalled { name: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    TaskFailed(String),
}

impl From<StorageError> for GraphError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ScopeViolation { reason } => GraphError::ScopeViolation { reason },
            StorageError::InvalidStateTransition { pk, from, to } => {
                GraphError::InvalidStateTransition { pk, from, to }
            }
            other => GraphError::Storage(other),
        }
    }
}

impl From<tokio::task::JoinError> for GraphError {
    fn from(err: tokio::task::JoinError) -> Self {
        GraphError::TaskFailed(err.to_string())
    }
}

impl GraphError {
    /// Whether the error is a programming fault that must not be retried.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            GraphError::DependencyCycle { .. } | GraphError::ScopeViolation { .. }
        )
    }
}

fn join_ids(ids: &[AttributeValueId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for graph engine operations.
pub type GraphResult<T> = std::result::Result<T, GraphError>;
