//! In-memory storage backends
//!
//! Provides `MemoryRowStore` and `MemoryFixLedger`, which satisfy the trait
//! contracts without any external dependencies. A single mutex guards all
//! state of each store, so merges and batch updates are trivially atomic.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::StorageError;
use crate::schema::{
    ChangeSetRecord, ChangeSetStatus, EntityTable, FixBatchRecord, FixExecutionRecord, FixOutcome,
    VersionedRow,
};
use crate::storage_traits::*;
use crate::tenancy::Tenancy;
use crate::visibility::ChangeSetPk;

fn lock<T>(m: &Mutex<T>) -> StorageResult<MutexGuard<'_, T>> {
    m.lock()
        .map_err(|_| StorageError::Backend("in-memory store lock poisoned".into()))
}

// ---------------------------------------------------------------------------
// MemoryRowStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RowState {
    change_sets: HashMap<ChangeSetPk, ChangeSetRecord>,
    rows: HashMap<String, VersionedRow>,
}

impl RowState {
    fn change_set(&self, pk: ChangeSetPk) -> StorageResult<&ChangeSetRecord> {
        self.change_sets
            .get(&pk)
            .ok_or(StorageError::ChangeSetNotFound { pk })
    }

    fn check_visibility(&self, row: &VersionedRow) -> StorageResult<()> {
        let cs_pk = row.visibility.change_set_pk;
        if cs_pk.is_head() {
            return Ok(());
        }
        let cs = self
            .change_sets
            .get(&cs_pk)
            .ok_or_else(|| StorageError::DanglingVisibility {
                row_pk: row.pk.clone(),
                change_set_pk: cs_pk,
            })?;
        check_row_visibility(row, cs)
    }

    fn rows_in(&self, cs: ChangeSetPk) -> Vec<VersionedRow> {
        let mut rows: Vec<VersionedRow> = self
            .rows
            .values()
            .filter(|r| r.visibility.change_set_pk == cs)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.pk.cmp(&b.pk)));
        rows
    }
}

/// In-memory row store backed by `HashMap`s behind one mutex.
#[derive(Debug, Default)]
pub struct MemoryRowStore {
    state: Mutex<RowState>,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RowStore for MemoryRowStore {
    async fn insert_change_set(&self, record: ChangeSetRecord) -> StorageResult<()> {
        let mut state = lock(&self.state)?;
        state.change_sets.insert(record.pk, record);
        Ok(())
    }

    async fn get_change_set(&self, pk: ChangeSetPk) -> StorageResult<ChangeSetRecord> {
        let state = lock(&self.state)?;
        state.change_set(pk).cloned()
    }

    async fn list_change_sets(&self) -> StorageResult<Vec<ChangeSetRecord>> {
        let state = lock(&self.state)?;
        let mut all: Vec<ChangeSetRecord> = state.change_sets.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    async fn insert_row(&self, row: VersionedRow) -> StorageResult<()> {
        let mut state = lock(&self.state)?;
        if state.rows.contains_key(&row.pk) {
            return Err(StorageError::DuplicateRow { row_pk: row.pk });
        }
        state.check_visibility(&row)?;
        debug!(table = %row.table, entity = %row.entity_id, "insert row");
        state.rows.insert(row.pk.clone(), row);
        Ok(())
    }

    async fn update_row(&self, row: VersionedRow) -> StorageResult<()> {
        let mut state = lock(&self.state)?;
        if !state.rows.contains_key(&row.pk) {
            return Err(StorageError::RowNotFound {
                table: row.table,
                id: row.pk,
            });
        }
        state.check_visibility(&row)?;
        state.rows.insert(row.pk.clone(), row);
        Ok(())
    }

    async fn write_rows(&self, writes: Vec<RowWrite>) -> StorageResult<()> {
        let mut state = lock(&self.state)?;
        let mut inserted: HashSet<&str> = HashSet::new();
        for write in &writes {
            let row = write.row();
            let exists = state.rows.contains_key(&row.pk) || inserted.contains(row.pk.as_str());
            match write {
                RowWrite::Insert(_) if exists => {
                    return Err(StorageError::DuplicateRow {
                        row_pk: row.pk.clone(),
                    })
                }
                RowWrite::Update(_) if !exists => {
                    return Err(StorageError::RowNotFound {
                        table: row.table,
                        id: row.pk.clone(),
                    })
                }
                RowWrite::Insert(_) => {
                    inserted.insert(&row.pk);
                }
                RowWrite::Update(_) => {}
            }
            state.check_visibility(row)?;
        }

        // Validated in full before the first write.
        debug!(rows = writes.len(), "write rows");
        for write in writes {
            let row = write.into_row();
            state.rows.insert(row.pk.clone(), row);
        }
        Ok(())
    }

    async fn rows_for_entity(
        &self,
        table: EntityTable,
        entity_id: &str,
    ) -> StorageResult<Vec<VersionedRow>> {
        let state = lock(&self.state)?;
        let mut rows: Vec<VersionedRow> = state
            .rows
            .values()
            .filter(|r| r.table == table && r.entity_id == entity_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.pk.cmp(&b.pk)));
        Ok(rows)
    }

    async fn rows_for_table(
        &self,
        table: EntityTable,
        change_set_pk: ChangeSetPk,
    ) -> StorageResult<Vec<VersionedRow>> {
        let state = lock(&self.state)?;
        Ok(state
            .rows
            .values()
            .filter(|r| {
                r.table == table
                    && (r.visibility.is_head() || r.visibility.change_set_pk == change_set_pk)
            })
            .cloned()
            .collect())
    }

    async fn rows_in_change_set(
        &self,
        change_set_pk: ChangeSetPk,
    ) -> StorageResult<Vec<VersionedRow>> {
        let state = lock(&self.state)?;
        Ok(state.rows_in(change_set_pk))
    }

    async fn merge_change_set(
        &self,
        pk: ChangeSetPk,
        applied_at: DateTime<Utc>,
    ) -> StorageResult<ChangeSetRecord> {
        let mut state = lock(&self.state)?;
        let next = state
            .change_set(pk)?
            .transition(ChangeSetStatus::Applied, applied_at)?;

        let cs_rows = state.rows_in(pk);
        let heads: HashMap<(EntityTable, String), VersionedRow> = state
            .rows
            .values()
            .filter(|r| r.visibility.is_head())
            .filter(|r| {
                cs_rows
                    .iter()
                    .any(|c| c.table == r.table && c.entity_id == r.entity_id)
            })
            .map(|r| ((r.table, r.entity_id.clone()), r.clone()))
            .collect();

        // Validated in full before the first write.
        let writes = plan_merge(pk, &cs_rows, &heads, applied_at)?;
        for row in writes {
            state.rows.insert(row.pk.clone(), row);
        }
        state.change_sets.insert(pk, next.clone());
        Ok(next)
    }

    async fn discard_change_set(
        &self,
        pk: ChangeSetPk,
        canceled_at: DateTime<Utc>,
    ) -> StorageResult<ChangeSetRecord> {
        let mut state = lock(&self.state)?;
        let next = state
            .change_set(pk)?
            .transition(ChangeSetStatus::Canceled, canceled_at)?;

        let writes = plan_discard(&state.rows_in(pk), canceled_at);
        for row in writes {
            state.rows.insert(row.pk.clone(), row);
        }
        state.change_sets.insert(pk, next.clone());
        Ok(next)
    }
}

// ---------------------------------------------------------------------------
// MemoryFixLedger
// ---------------------------------------------------------------------------

/// In-memory fix ledger backed by a `HashMap<batch_id, FixBatchRecord>`.
#[derive(Debug, Default)]
pub struct MemoryFixLedger {
    batches: Mutex<HashMap<String, FixBatchRecord>>,
}

impl MemoryFixLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FixLedger for MemoryFixLedger {
    async fn create_batch(
        &self,
        tenancy: Tenancy,
        change_set_pk: ChangeSetPk,
        members: Vec<FixExecutionRecord>,
    ) -> StorageResult<FixBatchRecord> {
        let batch = FixBatchRecord::new(tenancy, change_set_pk, members);
        let mut batches = lock(&self.batches)?;
        batches.insert(batch.batch_id.clone(), batch.clone());
        Ok(batch)
    }

    async fn record_outcome(
        &self,
        batch_id: &str,
        fix_id: &str,
        outcome: FixOutcome,
        message: Option<String>,
        attempts: u32,
    ) -> StorageResult<FixBatchRecord> {
        let mut batches = lock(&self.batches)?;
        let batch = batches
            .get_mut(batch_id)
            .ok_or_else(|| StorageError::FixBatchNotFound {
                batch_id: batch_id.to_string(),
            })?;
        batch.record(fix_id, outcome, message, attempts)?;
        Ok(batch.clone())
    }

    async fn get_batch(&self, batch_id: &str) -> StorageResult<FixBatchRecord> {
        let batches = lock(&self.batches)?;
        batches
            .get(batch_id)
            .cloned()
            .ok_or_else(|| StorageError::FixBatchNotFound {
                batch_id: batch_id.to_string(),
            })
    }
}
