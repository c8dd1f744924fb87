//! vgraph-state: versioned row persistence for vgraph
//!
//! Every entity row carries a [`Tenancy`] (owning account scope) and a
//! [`Visibility`] (change set or HEAD, plus soft deletion). Branching is
//! row-level copy-on-write; applying a change set re-stamps its rows to HEAD.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: scope integrity and all-or-nothing change-set transitions.
//!
//! ## Key Components
//!
//! - `RowStore` / `FixLedger`: backend-agnostic storage traits
//! - `MemoryRowStore` / `MemoryFixLedger`: in-process backends
//! - `SurrealRowStore` / `SurrealFixLedger`: SurrealDB backends
//! - `ReadFilter`: the deterministic visibility predicate

mod error;
pub mod handle;
pub mod memory;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;
mod tenancy;
mod visibility;

pub use error::{StateError, StorageError};
pub use handle::CloudConfig;
pub use memory::{MemoryFixLedger, MemoryRowStore};
pub use schema::{
    ChangeSetRecord, ChangeSetStatus, EntityTable, FixBatchRecord, FixExecutionRecord, FixOutcome,
    VersionedRow,
};
pub use storage_traits::{FixLedger, RowStore, RowWrite, StorageResult};
pub use surreal_store::{SurrealFixLedger, SurrealRowStore};
pub use tenancy::{BillingAccountPk, OrganizationPk, Tenancy, WorkspacePk};
pub use visibility::{ChangeSetPk, ReadFilter, Visibility};

/// Result type for vgraph-state backend operations
pub type Result<T> = std::result::Result<T, StateError>;
