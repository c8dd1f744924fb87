//! Record types persisted by the storage backends
//!
//! Tables:
//! - change_sets: change-set lifecycle records
//! - components / attribute_values / edges / installed_pkgs: versioned entity rows
//! - fix_batches: fix execution batches with their member executions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;
use crate::tenancy::Tenancy;
use crate::visibility::{ChangeSetPk, Visibility};

// ---------------------------------------------------------------------------
// Change sets
// ---------------------------------------------------------------------------

/// Lifecycle of a change set. `Applied` and `Canceled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeSetStatus {
    Open,
    Applied,
    Canceled,
}

impl ChangeSetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeSetStatus::Open => "open",
            ChangeSetStatus::Applied => "applied",
            ChangeSetStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChangeSetStatus::Open)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(ChangeSetStatus::Open),
            "applied" => Some(ChangeSetStatus::Applied),
            "canceled" => Some(ChangeSetStatus::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeSetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change set record. Only this record remembers a terminal branch; rows
/// written under it are re-stamped or soft-deleted when it closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSetRecord {
    pub pk: ChangeSetPk,
    pub name: String,
    pub status: ChangeSetStatus,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
}

impl ChangeSetRecord {
    /// A fresh, open change set.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            pk: ChangeSetPk::generate(),
            name: name.into(),
            status: ChangeSetStatus::Open,
            created_at: Utc::now(),
            applied_at: None,
            canceled_at: None,
        }
    }

    /// Fail with `ChangeSetNotOpen` unless the change set accepts writes.
    pub fn ensure_open(&self) -> Result<(), StorageError> {
        if self.status != ChangeSetStatus::Open {
            return Err(StorageError::ChangeSetNotOpen {
                pk: self.pk,
                status: self.status,
            });
        }
        Ok(())
    }

    /// Compute the record after moving to a terminal state at `at`.
    ///
    /// Only `Open -> Applied` and `Open -> Canceled` are legal.
    pub fn transition(&self, to: ChangeSetStatus, at: DateTime<Utc>) -> Result<Self, StorageError> {
        if self.status.is_terminal() || !to.is_terminal() {
            return Err(StorageError::InvalidStateTransition {
                pk: self.pk,
                from: self.status,
                to,
            });
        }
        let mut next = self.clone();
        next.status = to;
        match to {
            ChangeSetStatus::Applied => next.applied_at = Some(at),
            ChangeSetStatus::Canceled => next.canceled_at = Some(at),
            ChangeSetStatus::Open => {}
        }
        Ok(next)
    }
}

// ---------------------------------------------------------------------------
// Versioned rows
// ---------------------------------------------------------------------------

/// The versioned entity tables. Every one carries tenancy and visibility columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityTable {
    Components,
    AttributeValues,
    Edges,
    InstalledPkgs,
}

impl EntityTable {
    pub const ALL: [EntityTable; 4] = [
        EntityTable::Components,
        EntityTable::AttributeValues,
        EntityTable::Edges,
        EntityTable::InstalledPkgs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityTable::Components => "components",
            EntityTable::AttributeValues => "attribute_values",
            EntityTable::Edges => "edges",
            EntityTable::InstalledPkgs => "installed_pkgs",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for EntityTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stored version of an entity.
///
/// `entity_id` is stable across change sets; `pk` identifies this particular
/// row. `created_at` is the entity's creation time and is carried over when a
/// row is forked; `updated_at` is when this row was last written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRow {
    pub pk: String,
    pub entity_id: String,
    pub table: EntityTable,
    pub tenancy: Tenancy,
    pub visibility: Visibility,
    pub object: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VersionedRow {
    pub fn new(
        table: EntityTable,
        entity_id: impl Into<String>,
        tenancy: Tenancy,
        visibility: Visibility,
        object: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            pk: Uuid::new_v4().to_string(),
            entity_id: entity_id.into(),
            table,
            tenancy,
            visibility,
            object,
            created_at: now,
            updated_at: now,
        }
    }

    /// Copy-on-write: a new row for the same entity under `visibility`.
    pub fn fork(&self, visibility: Visibility, object: serde_json::Value) -> Self {
        Self {
            pk: Uuid::new_v4().to_string(),
            entity_id: self.entity_id.clone(),
            table: self.table,
            tenancy: self.tenancy.clone(),
            visibility,
            object,
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }

    /// Same row, re-stamped with a new visibility.
    pub fn restamp(&self, visibility: Visibility) -> Self {
        let mut row = self.clone();
        row.visibility = visibility;
        row
    }
}

// ---------------------------------------------------------------------------
// Fix batches
// ---------------------------------------------------------------------------

/// Terminal outcome of one fix execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixOutcome {
    Success,
    Failure,
}

impl std::fmt::Display for FixOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FixOutcome::Success => f.write_str("success"),
            FixOutcome::Failure => f.write_str("failure"),
        }
    }
}

/// One member of a fix batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixExecutionRecord {
    pub fix_id: String,
    pub component_id: String,
    pub action: String,
    pub outcome: Option<FixOutcome>,
    pub message: Option<String>,
    pub attempts: u32,
    pub finished_at: Option<DateTime<Utc>>,
}

impl FixExecutionRecord {
    pub fn new(component_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            fix_id: Uuid::new_v4().to_string(),
            component_id: component_id.into(),
            action: action.into(),
            outcome: None,
            message: None,
            attempts: 0,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }
}

/// A group of fixes tracked to completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixBatchRecord {
    pub batch_id: String,
    pub tenancy: Tenancy,
    pub change_set_pk: ChangeSetPk,
    pub members: Vec<FixExecutionRecord>,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl FixBatchRecord {
    pub fn new(
        tenancy: Tenancy,
        change_set_pk: ChangeSetPk,
        members: Vec<FixExecutionRecord>,
    ) -> Self {
        let now = Utc::now();
        let completed = members.is_empty();
        Self {
            batch_id: Uuid::new_v4().to_string(),
            tenancy,
            change_set_pk,
            members,
            completed,
            created_at: now,
            completed_at: completed.then_some(now),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.members.iter().filter(|m| !m.is_terminal()).count()
    }

    /// Record a member's terminal outcome and recompute `completed`.
    ///
    /// `completed` is true iff no member is still pending.
    pub fn record(
        &mut self,
        fix_id: &str,
        outcome: FixOutcome,
        message: Option<String>,
        attempts: u32,
    ) -> Result<(), StorageError> {
        let member = self
            .members
            .iter_mut()
            .find(|m| m.fix_id == fix_id)
            .ok_or_else(|| StorageError::FixNotInBatch {
                batch_id: self.batch_id.clone(),
                fix_id: fix_id.to_string(),
            })?;
        if member.is_terminal() {
            return Err(StorageError::FixAlreadyTerminal {
                fix_id: fix_id.to_string(),
            });
        }

        let now = Utc::now();
        member.outcome = Some(outcome);
        member.message = message;
        member.attempts = attempts;
        member.finished_at = Some(now);

        self.completed = self.pending_count() == 0;
        if self.completed {
            self.completed_at = Some(now);
        }
        Ok(())
    }
}
