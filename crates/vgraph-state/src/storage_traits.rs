//! Storage trait definitions for vgraph
//!
//! These traits define the persistence seams:
//! - `RowStore`: change-set records and tenancy/visibility-stamped entity rows
//! - `FixLedger`: fix execution batches and their join barrier
//!
//! Both are async and backend-agnostic. `memory` provides in-process
//! implementations; `surreal_store` persists to SurrealDB.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::schema::{
    ChangeSetRecord, ChangeSetStatus, EntityTable, FixBatchRecord, FixExecutionRecord, FixOutcome,
    VersionedRow,
};
use crate::tenancy::Tenancy;
use crate::visibility::{ChangeSetPk, Visibility};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// One row write inside [`RowStore::write_rows`].
#[derive(Debug, Clone, PartialEq)]
pub enum RowWrite {
    Insert(VersionedRow),
    Update(VersionedRow),
}

impl RowWrite {
    pub fn row(&self) -> &VersionedRow {
        match self {
            RowWrite::Insert(row) | RowWrite::Update(row) => row,
        }
    }

    pub fn into_row(self) -> VersionedRow {
        match self {
            RowWrite::Insert(row) | RowWrite::Update(row) => row,
        }
    }
}

// ---------------------------------------------------------------------------
// RowStore: change sets and versioned rows
// ---------------------------------------------------------------------------

/// Versioned row storage.
///
/// Guarantees every conforming backend must uphold:
/// - A row's visibility always references HEAD or an existing change set
///   (`DanglingVisibility` otherwise).
/// - Live rows are only written into `Open` change sets. A soft-deleted row
///   may still be written into a `Canceled` change set so late function
///   results land inert.
/// - `merge_change_set` and `discard_change_set` are all-or-nothing: either the
///   status and every row re-stamp are persisted, or nothing is.
/// - `write_rows` is all-or-nothing in the same way.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Persist a new change set record.
    async fn insert_change_set(&self, record: ChangeSetRecord) -> StorageResult<()>;

    /// Fetch a change set. Returns `ChangeSetNotFound` if absent.
    async fn get_change_set(&self, pk: ChangeSetPk) -> StorageResult<ChangeSetRecord>;

    /// All change sets, oldest first.
    async fn list_change_sets(&self) -> StorageResult<Vec<ChangeSetRecord>>;

    /// Insert a new row. Fails with `DuplicateRow` if the pk is taken.
    async fn insert_row(&self, row: VersionedRow) -> StorageResult<()>;

    /// Replace an existing row (matched by pk). Fails with `RowNotFound` if absent.
    async fn update_row(&self, row: VersionedRow) -> StorageResult<()>;

    /// Apply several inserts and updates as one write. Each is checked the way
    /// `insert_row` / `update_row` check it, in order; any failure writes
    /// nothing.
    async fn write_rows(&self, writes: Vec<RowWrite>) -> StorageResult<()>;

    /// Every stored row of one entity across all visibilities, oldest write first.
    async fn rows_for_entity(
        &self,
        table: EntityTable,
        entity_id: &str,
    ) -> StorageResult<Vec<VersionedRow>>;

    /// Rows of `table` stamped with HEAD or `change_set_pk`.
    async fn rows_for_table(
        &self,
        table: EntityTable,
        change_set_pk: ChangeSetPk,
    ) -> StorageResult<Vec<VersionedRow>>;

    /// Every row stamped with `change_set_pk`, across tables.
    async fn rows_in_change_set(&self, change_set_pk: ChangeSetPk)
        -> StorageResult<Vec<VersionedRow>>;

    /// Apply: re-stamp the change set's rows to HEAD and mark it `Applied`.
    async fn merge_change_set(
        &self,
        pk: ChangeSetPk,
        applied_at: DateTime<Utc>,
    ) -> StorageResult<ChangeSetRecord>;

    /// Cancel: soft-delete the change set's rows and mark it `Canceled`.
    async fn discard_change_set(
        &self,
        pk: ChangeSetPk,
        canceled_at: DateTime<Utc>,
    ) -> StorageResult<ChangeSetRecord>;
}

/// Check a row's visibility against its change set before a write.
pub fn check_row_visibility(row: &VersionedRow, change_set: &ChangeSetRecord) -> StorageResult<()> {
    match change_set.status {
        ChangeSetStatus::Open => Ok(()),
        ChangeSetStatus::Canceled if row.visibility.is_deleted() => Ok(()),
        status => Err(StorageError::ChangeSetNotOpen {
            pk: change_set.pk,
            status,
        }),
    }
}

/// The row writes that merge a change set into HEAD.
///
/// Every change-set row is re-stamped to HEAD (keeping its own `deleted_at`),
/// and the HEAD row it supersedes is re-stamped to
/// `(change set, deleted_at = applied_at)` so history survives without being
/// visible at HEAD. `head_rows` holds the current HEAD rows keyed by
/// `(table, entity_id)`.
///
/// The whole plan is validated before anything is returned: a change-set row
/// whose tenancy differs from the HEAD row it replaces aborts the merge with
/// `MergeConflict`.
pub fn plan_merge(
    pk: ChangeSetPk,
    change_set_rows: &[VersionedRow],
    head_rows: &HashMap<(EntityTable, String), VersionedRow>,
    applied_at: DateTime<Utc>,
) -> StorageResult<Vec<VersionedRow>> {
    let mut writes = Vec::with_capacity(change_set_rows.len() * 2);

    for row in change_set_rows {
        let key = (row.table, row.entity_id.clone());
        if let Some(head) = head_rows.get(&key) {
            if head.tenancy != row.tenancy {
                return Err(StorageError::MergeConflict {
                    pk,
                    reason: format!(
                        "{}/{} changed tenancy inside the change set",
                        row.table, row.entity_id
                    ),
                });
            }
            writes.push(head.restamp(Visibility::new(pk, Some(applied_at))));
        }
        writes.push(row.restamp(Visibility::new(ChangeSetPk::HEAD, row.visibility.deleted_at)));
    }

    Ok(writes)
}

/// The row writes that discard a change set: every live row gets `deleted_at`.
pub fn plan_discard(
    change_set_rows: &[VersionedRow],
    canceled_at: DateTime<Utc>,
) -> Vec<VersionedRow> {
    change_set_rows
        .iter()
        .filter(|r| !r.visibility.is_deleted())
        .map(|r| r.restamp(Visibility::new(r.visibility.change_set_pk, Some(canceled_at))))
        .collect()
}

// ---------------------------------------------------------------------------
// FixLedger: fix batch tracking
// ---------------------------------------------------------------------------

/// Fix batch persistence with a join barrier.
///
/// Guarantees:
/// - `record_outcome` is atomic with respect to other `record_outcome` calls on
///   the same batch; the returned record reflects the write.
/// - `completed` flips to true exactly when the last pending member reports,
///   never earlier, regardless of how many members already failed.
#[async_trait]
pub trait FixLedger: Send + Sync {
    /// Create a batch over the given members.
    async fn create_batch(
        &self,
        tenancy: Tenancy,
        change_set_pk: ChangeSetPk,
        members: Vec<FixExecutionRecord>,
    ) -> StorageResult<FixBatchRecord>;

    /// Record one member's terminal outcome; returns the updated batch.
    async fn record_outcome(
        &self,
        batch_id: &str,
        fix_id: &str,
        outcome: FixOutcome,
        message: Option<String>,
        attempts: u32,
    ) -> StorageResult<FixBatchRecord>;

    /// Fetch a batch. Returns `FixBatchNotFound` if absent.
    async fn get_batch(&self, batch_id: &str) -> StorageResult<FixBatchRecord>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(entity: &str, tenancy: Tenancy, visibility: Visibility) -> VersionedRow {
        VersionedRow::new(
            EntityTable::Components,
            entity,
            tenancy,
            visibility,
            serde_json::json!({}),
        )
    }

    #[test]
    fn test_plan_merge_restamps_both_rows() {
        let cs = ChangeSetPk::generate();
        let t = Tenancy::new_universal();
        let head = row("x", t.clone(), Visibility::new_head());
        let edit = head.fork(Visibility::new_change_set(cs), serde_json::json!({"a": 1}));

        let mut heads = HashMap::new();
        heads.insert((EntityTable::Components, "x".to_string()), head.clone());

        let now = Utc::now();
        let writes = plan_merge(cs, &[edit.clone()], &heads, now).unwrap();
        assert_eq!(writes.len(), 2);

        let old = writes.iter().find(|w| w.pk == head.pk).unwrap();
        assert_eq!(old.visibility, Visibility::new(cs, Some(now)));
        let new = writes.iter().find(|w| w.pk == edit.pk).unwrap();
        assert_eq!(new.visibility, Visibility::new_head());
    }

    #[test]
    fn test_plan_merge_rejects_tenancy_change() {
        let cs = ChangeSetPk::generate();
        let head = row("x", Tenancy::new_universal(), Visibility::new_head());
        let mut edit = head.fork(Visibility::new_change_set(cs), serde_json::json!({}));
        edit.tenancy = Tenancy::new_billing_account(crate::tenancy::BillingAccountPk::generate());

        let mut heads = HashMap::new();
        heads.insert((EntityTable::Components, "x".to_string()), head);

        let err = plan_merge(cs, &[edit], &heads, Utc::now()).unwrap_err();
        assert!(matches!(err, StorageError::MergeConflict { .. }));
    }

    #[test]
    fn test_plan_discard_skips_already_deleted() {
        let cs = ChangeSetPk::generate();
        let t = Tenancy::new_universal();
        let live = row("a", t.clone(), Visibility::new_change_set(cs));
        let gone = row("b", t, Visibility::new(cs, Some(Utc::now())));
        let writes = plan_discard(&[live.clone(), gone], Utc::now());
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].pk, live.pk);
        assert!(writes[0].visibility.is_deleted());
        assert_eq!(writes[0].visibility.change_set_pk, cs);
    }
}
