//! Error types for vgraph-state

use thiserror::Error;

use crate::schema::{ChangeSetStatus, EntityTable};
use crate::visibility::ChangeSetPk;

/// Errors that can occur while talking to a database backend
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Transaction failed
    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors produced by the storage traits ([`crate::RowStore`], [`crate::FixLedger`]).
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("row not found: {table}/{id}")]
    RowNotFound { table: EntityTable, id: String },

    #[error("change set not found: {pk}")]
    ChangeSetNotFound { pk: ChangeSetPk },

    #[error("change set {pk} is {status}, expected open")]
    ChangeSetNotOpen {
        pk: ChangeSetPk,
        status: ChangeSetStatus,
    },

    #[error("invalid change set transition for {pk}: {from} -> {to}")]
    InvalidStateTransition {
        pk: ChangeSetPk,
        from: ChangeSetStatus,
        to: ChangeSetStatus,
    },

    #[error("scope violation: {reason}")]
    ScopeViolation { reason: String },

    #[error("row {row_pk} references unknown change set {change_set_pk}")]
    DanglingVisibility {
        row_pk: String,
        change_set_pk: ChangeSetPk,
    },

    #[error("merge of change set {pk} aborted: {reason}")]
    MergeConflict { pk: ChangeSetPk, reason: String },

    #[error("duplicate row pk: {row_pk}")]
    DuplicateRow { row_pk: String },

    #[error("fix batch not found: {batch_id}")]
    FixBatchNotFound { batch_id: String },

    #[error("fix {fix_id} is not a member of batch {batch_id}")]
    FixNotInBatch { batch_id: String, fix_id: String },

    #[error("fix {fix_id} already reported a terminal outcome")]
    FixAlreadyTerminal { fix_id: String },

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Backend(format!("serialization: {err}"))
    }
}
