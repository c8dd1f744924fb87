//! SurrealDB-backed `RowStore` and `FixLedger` implementations
//!
//! Rows are persisted flat: tenancy and visibility become explicit
//! `tenancy_*` / `visibility_*` columns, uuids and timestamps are strings.
//! Conversion to/from the `schema` types happens at the boundary.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::StorageError;
use crate::handle;
use crate::schema::{
    ChangeSetRecord, ChangeSetStatus, EntityTable, FixBatchRecord, FixExecutionRecord, FixOutcome,
    VersionedRow,
};
use crate::storage_traits::*;
use crate::tenancy::{BillingAccountPk, OrganizationPk, Tenancy, WorkspacePk};
use crate::visibility::{ChangeSetPk, Visibility};

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StorageError::Backend(format!("bad timestamp {s:?}: {e}")))
}

fn parse_uuid(s: &str) -> StorageResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| StorageError::Backend(format!("bad uuid {s:?}: {e}")))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbChangeSet {
    pk: String,
    name: String,
    status: String,
    created_at: String,
    #[serde(default)]
    applied_at: Option<String>,
    #[serde(default)]
    canceled_at: Option<String>,
}

impl DbChangeSet {
    fn from_record(r: &ChangeSetRecord) -> Self {
        Self {
            pk: r.pk.0.to_string(),
            name: r.name.clone(),
            status: r.status.as_str().to_string(),
            created_at: ts(&r.created_at),
            applied_at: r.applied_at.as_ref().map(ts),
            canceled_at: r.canceled_at.as_ref().map(ts),
        }
    }

    fn into_record(self) -> StorageResult<ChangeSetRecord> {
        let status = ChangeSetStatus::parse(&self.status).ok_or_else(|| {
            StorageError::Backend(format!("unknown change set status: {}", self.status))
        })?;
        Ok(ChangeSetRecord {
            pk: ChangeSetPk(parse_uuid(&self.pk)?),
            name: self.name,
            status,
            created_at: parse_ts(&self.created_at)?,
            applied_at: self.applied_at.as_deref().map(parse_ts).transpose()?,
            canceled_at: self.canceled_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbRow {
    pk: String,
    entity_id: String,
    table: String,
    tenancy_universal: bool,
    #[serde(default)]
    tenancy_billing_account_pk: Option<String>,
    #[serde(default)]
    tenancy_organization_pk: Option<String>,
    #[serde(default)]
    tenancy_workspace_pk: Option<String>,
    visibility_change_set_pk: String,
    #[serde(default)]
    visibility_deleted_at: Option<String>,
    #[serde(default)]
    object: serde_json::Value,
    created_at: String,
    updated_at: String,
}

impl DbRow {
    fn from_row(r: &VersionedRow) -> Self {
        Self {
            pk: r.pk.clone(),
            entity_id: r.entity_id.clone(),
            table: r.table.as_str().to_string(),
            tenancy_universal: r.tenancy.universal,
            tenancy_billing_account_pk: r.tenancy.billing_account_pk.map(|p| p.0.to_string()),
            tenancy_organization_pk: r.tenancy.organization_pk.map(|p| p.0.to_string()),
            tenancy_workspace_pk: r.tenancy.workspace_pk.map(|p| p.0.to_string()),
            visibility_change_set_pk: r.visibility.change_set_pk.0.to_string(),
            visibility_deleted_at: r.visibility.deleted_at.as_ref().map(ts),
            object: r.object.clone(),
            created_at: ts(&r.created_at),
            updated_at: ts(&r.updated_at),
        }
    }

    fn into_row(self) -> StorageResult<VersionedRow> {
        let table = EntityTable::parse(&self.table)
            .ok_or_else(|| StorageError::Backend(format!("unknown table: {}", self.table)))?;
        let tenancy = Tenancy {
            universal: self.tenancy_universal,
            billing_account_pk: self
                .tenancy_billing_account_pk
                .as_deref()
                .map(parse_uuid)
                .transpose()?
                .map(BillingAccountPk),
            organization_pk: self
                .tenancy_organization_pk
                .as_deref()
                .map(parse_uuid)
                .transpose()?
                .map(OrganizationPk),
            workspace_pk: self
                .tenancy_workspace_pk
                .as_deref()
                .map(parse_uuid)
                .transpose()?
                .map(WorkspacePk),
        };
        let visibility = Visibility::new(
            ChangeSetPk(parse_uuid(&self.visibility_change_set_pk)?),
            self.visibility_deleted_at
                .as_deref()
                .map(parse_ts)
                .transpose()?,
        );
        Ok(VersionedRow {
            pk: self.pk,
            entity_id: self.entity_id,
            table,
            tenancy,
            visibility,
            object: self.object,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

fn into_rows(rows: Vec<DbRow>) -> StorageResult<Vec<VersionedRow>> {
    let mut out = rows
        .into_iter()
        .map(DbRow::into_row)
        .collect::<StorageResult<Vec<_>>>()?;
    out.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.pk.cmp(&b.pk)));
    Ok(out)
}

// ---------------------------------------------------------------------------
// SurrealRowStore
// ---------------------------------------------------------------------------

/// SurrealDB-backed implementation of [`RowStore`].
///
/// Merge and discard run as a single `BEGIN ... COMMIT` transaction. Writes
/// from this process are serialized through `write_lock` so the change-set
/// status check and the write it guards cannot interleave with a merge.
pub struct SurrealRowStore {
    db: Surreal<Any>,
    write_lock: Mutex<()>,
}

impl SurrealRowStore {
    /// Wrap an already connected, migrated handle.
    pub fn new(db: Surreal<Any>) -> Self {
        Self {
            db,
            write_lock: Mutex::new(()),
        }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        let db = handle::connect_url("mem://", handle::DEFAULT_NAMESPACE, handle::DEFAULT_DATABASE)
            .await?;
        info!("SurrealRowStore connected (in-memory)");
        Ok(Self::new(db))
    }

    /// Connect to an explicit URL (`mem://`, `surrealkv://path`, `ws://...`).
    pub async fn connect(url: &str) -> crate::Result<Self> {
        let db =
            handle::connect_url(url, handle::DEFAULT_NAMESPACE, handle::DEFAULT_DATABASE).await?;
        Ok(Self::new(db))
    }

    /// Create from environment variables (see [`handle::connect_from_env`]).
    pub async fn from_env() -> crate::Result<Self> {
        let db = handle::connect_from_env().await?;
        Ok(Self::new(db))
    }

    /// The underlying handle, for sharing with [`SurrealFixLedger`].
    pub fn db(&self) -> Surreal<Any> {
        self.db.clone()
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_change_set(&self, pk: ChangeSetPk) -> StorageResult<Option<ChangeSetRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM change_sets WHERE pk = $pk")
            .bind(("pk", pk.0.to_string()))
            .await?;
        let rows: Vec<DbChangeSet> = res.take(0)?;
        rows.into_iter().next().map(DbChangeSet::into_record).transpose()
    }

    async fn fetch_row(&self, table: EntityTable, row_pk: &str) -> StorageResult<Option<DbRow>> {
        let sql = format!("SELECT * FROM {} WHERE pk = $pk", table.as_str());
        let mut res = self
            .db
            .query(sql)
            .bind(("pk", row_pk.to_string()))
            .await?;
        let rows: Vec<DbRow> = res.take(0)?;
        Ok(rows.into_iter().next())
    }

    async fn check_visibility(&self, row: &VersionedRow) -> StorageResult<()> {
        let cs_pk = row.visibility.change_set_pk;
        if cs_pk.is_head() {
            return Ok(());
        }
        let cs = self
            .fetch_change_set(cs_pk)
            .await?
            .ok_or_else(|| StorageError::DanglingVisibility {
                row_pk: row.pk.clone(),
                change_set_pk: cs_pk,
            })?;
        check_row_visibility(row, &cs)
    }

    async fn fetch_rows_in(&self, cs: ChangeSetPk) -> StorageResult<Vec<VersionedRow>> {
        let mut all = Vec::new();
        for table in EntityTable::ALL {
            let sql = format!(
                "SELECT * FROM {} WHERE visibility_change_set_pk = $cs",
                table.as_str()
            );
            let mut res = self
                .db
                .query(sql)
                .bind(("cs", cs.0.to_string()))
                .await?;
            let rows: Vec<DbRow> = res.take(0)?;
            all.extend(rows);
        }
        into_rows(all)
    }

    async fn fetch_head_rows_for(
        &self,
        rows: &[VersionedRow],
    ) -> StorageResult<HashMap<(EntityTable, String), VersionedRow>> {
        let mut heads = HashMap::new();
        for row in rows {
            let sql = format!(
                "SELECT * FROM {} WHERE entity_id = $eid AND visibility_change_set_pk = $head",
                row.table.as_str()
            );
            let mut res = self
                .db
                .query(sql)
                .bind(("eid", row.entity_id.clone()))
                .bind(("head", ChangeSetPk::HEAD.0.to_string()))
                .await?;
            let found: Vec<DbRow> = res.take(0)?;
            if let Some(head) = into_rows(found)?.pop() {
                heads.insert((row.table, row.entity_id.clone()), head);
            }
        }
        Ok(heads)
    }

    /// Write every row plus the new change-set record in one transaction.
    async fn commit(&self, writes: Vec<VersionedRow>, record: &ChangeSetRecord) -> StorageResult<()> {
        let mut sql = String::from("BEGIN TRANSACTION;\n");
        for (i, row) in writes.iter().enumerate() {
            sql.push_str(&format!(
                "UPDATE {} CONTENT $row_{i} WHERE pk = $pk_{i};\n",
                row.table.as_str()
            ));
        }
        sql.push_str("UPDATE change_sets CONTENT $cs WHERE pk = $cs_pk;\n");
        sql.push_str("COMMIT TRANSACTION;");

        let mut query = self.db.query(sql);
        for (i, row) in writes.iter().enumerate() {
            query = query
                .bind((format!("row_{i}"), DbRow::from_row(row)))
                .bind((format!("pk_{i}"), row.pk.clone()));
        }
        query = query
            .bind(("cs", DbChangeSet::from_record(record)))
            .bind(("cs_pk", record.pk.0.to_string()));

        query
            .await?
            .check()
            .map_err(|e| StorageError::Backend(format!("transaction failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl RowStore for SurrealRowStore {
    async fn insert_change_set(&self, record: ChangeSetRecord) -> StorageResult<()> {
        debug!(pk = %record.pk, "creating change set");
        let _created: Option<DbChangeSet> = self
            .db
            .create("change_sets")
            .content(DbChangeSet::from_record(&record))
            .await?;
        Ok(())
    }

    async fn get_change_set(&self, pk: ChangeSetPk) -> StorageResult<ChangeSetRecord> {
        self.fetch_change_set(pk)
            .await?
            .ok_or(StorageError::ChangeSetNotFound { pk })
    }

    async fn list_change_sets(&self) -> StorageResult<Vec<ChangeSetRecord>> {
        let mut res = self.db.query("SELECT * FROM change_sets").await?;
        let rows: Vec<DbChangeSet> = res.take(0)?;
        let mut out = rows
            .into_iter()
            .map(DbChangeSet::into_record)
            .collect::<StorageResult<Vec<_>>>()?;
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn insert_row(&self, row: VersionedRow) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        if self.fetch_row(row.table, &row.pk).await?.is_some() {
            return Err(StorageError::DuplicateRow { row_pk: row.pk });
        }
        self.check_visibility(&row).await?;

        let _created: Option<DbRow> = self
            .db
            .create(row.table.as_str())
            .content(DbRow::from_row(&row))
            .await?;
        Ok(())
    }

    async fn update_row(&self, row: VersionedRow) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        if self.fetch_row(row.table, &row.pk).await?.is_none() {
            return Err(StorageError::RowNotFound {
                table: row.table,
                id: row.pk,
            });
        }
        self.check_visibility(&row).await?;

        let sql = format!("UPDATE {} CONTENT $row WHERE pk = $pk", row.table.as_str());
        self.db
            .query(sql)
            .bind(("row", DbRow::from_row(&row)))
            .bind(("pk", row.pk.clone()))
            .await?
            .check()?;
        Ok(())
    }

    async fn write_rows(&self, writes: Vec<RowWrite>) -> StorageResult<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let mut inserted: HashSet<String> = HashSet::new();
        for write in &writes {
            let row = write.row();
            let exists = inserted.contains(&row.pk)
                || self.fetch_row(row.table, &row.pk).await?.is_some();
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
                    inserted.insert(row.pk.clone());
                }
                RowWrite::Update(_) => {}
            }
            self.check_visibility(row).await?;
        }

        let mut sql = String::from("BEGIN TRANSACTION;\n");
        for (i, write) in writes.iter().enumerate() {
            let table = write.row().table.as_str();
            match write {
                RowWrite::Insert(_) => sql.push_str(&format!("CREATE {table} CONTENT $row_{i};\n")),
                RowWrite::Update(_) => sql.push_str(&format!(
                    "UPDATE {table} CONTENT $row_{i} WHERE pk = $pk_{i};\n"
                )),
            }
        }
        sql.push_str("COMMIT TRANSACTION;");

        let mut query = self.db.query(sql);
        for (i, write) in writes.iter().enumerate() {
            let row = write.row();
            query = query
                .bind((format!("row_{i}"), DbRow::from_row(row)))
                .bind((format!("pk_{i}"), row.pk.clone()));
        }
        query
            .await?
            .check()
            .map_err(|e| StorageError::Backend(format!("transaction failed: {e}")))?;
        Ok(())
    }

    async fn rows_for_entity(
        &self,
        table: EntityTable,
        entity_id: &str,
    ) -> StorageResult<Vec<VersionedRow>> {
        let sql = format!("SELECT * FROM {} WHERE entity_id = $eid", table.as_str());
        let mut res = self
            .db
            .query(sql)
            .bind(("eid", entity_id.to_string()))
            .await?;
        let rows: Vec<DbRow> = res.take(0)?;
        into_rows(rows)
    }

    async fn rows_for_table(
        &self,
        table: EntityTable,
        change_set_pk: ChangeSetPk,
    ) -> StorageResult<Vec<VersionedRow>> {
        let sql = format!(
            "SELECT * FROM {} WHERE visibility_change_set_pk = $head OR visibility_change_set_pk = $cs",
            table.as_str()
        );
        let mut res = self
            .db
            .query(sql)
            .bind(("head", ChangeSetPk::HEAD.0.to_string()))
            .bind(("cs", change_set_pk.0.to_string()))
            .await?;
        let rows: Vec<DbRow> = res.take(0)?;
        into_rows(rows)
    }

    async fn rows_in_change_set(
        &self,
        change_set_pk: ChangeSetPk,
    ) -> StorageResult<Vec<VersionedRow>> {
        self.fetch_rows_in(change_set_pk).await
    }

    #[instrument(skip(self), fields(change_set = %pk))]
    async fn merge_change_set(
        &self,
        pk: ChangeSetPk,
        applied_at: DateTime<Utc>,
    ) -> StorageResult<ChangeSetRecord> {
        let _guard = self.write_lock.lock().await;
        let next = self
            .get_change_set(pk)
            .await?
            .transition(ChangeSetStatus::Applied, applied_at)?;

        let cs_rows = self.fetch_rows_in(pk).await?;
        let heads = self.fetch_head_rows_for(&cs_rows).await?;
        let writes = plan_merge(pk, &cs_rows, &heads, applied_at)?;

        debug!(rows = writes.len(), "committing merge");
        self.commit(writes, &next).await?;
        Ok(next)
    }

    #[instrument(skip(self), fields(change_set = %pk))]
    async fn discard_change_set(
        &self,
        pk: ChangeSetPk,
        canceled_at: DateTime<Utc>,
    ) -> StorageResult<ChangeSetRecord> {
        let _guard = self.write_lock.lock().await;
        let next = self
            .get_change_set(pk)
            .await?
            .transition(ChangeSetStatus::Canceled, canceled_at)?;

        let writes = plan_discard(&self.fetch_rows_in(pk).await?, canceled_at);
        self.commit(writes, &next).await?;
        Ok(next)
    }
}

// ---------------------------------------------------------------------------
// SurrealFixLedger
// ---------------------------------------------------------------------------

/// A batch document; the full record travels as JSON in `body`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbBatch {
    batch_id: String,
    completed: bool,
    body: serde_json::Value,
}

impl DbBatch {
    fn from_record(r: &FixBatchRecord) -> StorageResult<Self> {
        Ok(Self {
            batch_id: r.batch_id.clone(),
            completed: r.completed,
            body: serde_json::to_value(r)?,
        })
    }

    fn into_record(self) -> StorageResult<FixBatchRecord> {
        Ok(serde_json::from_value(self.body)?)
    }
}

/// SurrealDB-backed implementation of [`FixLedger`].
///
/// `record_outcome` runs its read-modify-write under a lock, so concurrent
/// member reports against one batch are applied one at a time.
pub struct SurrealFixLedger {
    db: Surreal<Any>,
    lock: Mutex<()>,
}

impl SurrealFixLedger {
    pub fn new(db: Surreal<Any>) -> Self {
        Self {
            db,
            lock: Mutex::new(()),
        }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        let db = handle::connect_url("mem://", handle::DEFAULT_NAMESPACE, handle::DEFAULT_DATABASE)
            .await?;
        Ok(Self::new(db))
    }

    async fn fetch(&self, batch_id: &str) -> StorageResult<FixBatchRecord> {
        let mut res = self
            .db
            .query("SELECT * FROM fix_batches WHERE batch_id = $bid")
            .bind(("bid", batch_id.to_string()))
            .await?;
        let rows: Vec<DbBatch> = res.take(0)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::FixBatchNotFound {
                batch_id: batch_id.to_string(),
            })?
            .into_record()
    }
}

#[async_trait]
impl FixLedger for SurrealFixLedger {
    async fn create_batch(
        &self,
        tenancy: Tenancy,
        change_set_pk: ChangeSetPk,
        members: Vec<FixExecutionRecord>,
    ) -> StorageResult<FixBatchRecord> {
        let batch = FixBatchRecord::new(tenancy, change_set_pk, members);
        let _created: Option<DbBatch> = self
            .db
            .create("fix_batches")
            .content(DbBatch::from_record(&batch)?)
            .await?;
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
        let _guard = self.lock.lock().await;
        let mut batch = self.fetch(batch_id).await?;
        batch.record(fix_id, outcome, message, attempts)?;

        self.db
            .query("UPDATE fix_batches CONTENT $row WHERE batch_id = $bid")
            .bind(("row", DbBatch::from_record(&batch)?))
            .bind(("bid", batch_id.to_string()))
            .await?
            .check()?;
        Ok(batch)
    }

    async fn get_batch(&self, batch_id: &str) -> StorageResult<FixBatchRecord> {
        self.fetch(batch_id).await
    }
}
