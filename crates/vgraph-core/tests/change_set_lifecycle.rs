//! Change-set lifecycle through the engine: isolation, apply, cancel, and
//! results that arrive after the change set closed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Semaphore};
use vgraph_core::domain::attribute::DOMAIN_PATH;
use vgraph_core::func::PipelineResult;
use vgraph_core::{
    CommandOutput, ComponentType, EngineConfig, EventKind, Func, FuncContext, FuncKind,
    FuncRegistry, FuncResult, GraphEngine, GraphError, InputSnapshot, SchemaVariant, Scope,
    ScriptedCommandRunner, ValueStatus,
};
use vgraph_state::{
    BillingAccountPk, ChangeSetPk, ChangeSetRecord, ChangeSetStatus, EntityTable,
    MemoryFixLedger, MemoryRowStore, RowStore, RowWrite, StorageError, StorageResult, Tenancy,
    VersionedRow,
};

struct Slow;

#[async_trait]
impl Func for Slow {
    fn name(&self) -> &str {
        "test:slow"
    }
    fn kind(&self) -> FuncKind {
        FuncKind::Attribute
    }
    async fn run(&self, _: &FuncContext, input: &InputSnapshot) -> PipelineResult<FuncResult> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let n = input.domain()?.get("n").cloned().unwrap_or(Value::Null);
        Ok(FuncResult::Attribute(n))
    }
}

fn engine() -> GraphEngine {
    GraphEngine::with_registry(
        Arc::new(MemoryRowStore::new()),
        Arc::new(MemoryFixLedger::new()),
        Arc::new(ScriptedCommandRunner::always(CommandOutput::success(""))),
        FuncRegistry::new().with_func(Arc::new(Slow)),
        EngineConfig::default(),
    )
    .with_variant(
        SchemaVariant::new("slow", ComponentType::Component).with_func(
            "/root/echo",
            "test:slow",
            &[DOMAIN_PATH],
        ),
    )
}

#[tokio::test]
async fn test_head_never_sees_open_change_set() {
    let engine = engine();
    let tenancy = Tenancy::new_universal();
    let head = Scope::head(tenancy.clone());
    let cs = engine.create_change_set(&tenancy, "add").await.unwrap();
    let branch = Scope::new(tenancy, cs.pk);

    let (c, _) = engine
        .create_component(&branch, "c", "slow", json!({"n": 1}))
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();

    assert_eq!(engine.components(&branch).await.unwrap().len(), 1);
    assert!(engine.components(&head).await.unwrap().is_empty());
    assert!(engine.attribute_values(&head, c.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_apply_merges_into_head_and_closes_branch() {
    let engine = engine();
    let tenancy = Tenancy::new_universal();
    let head = Scope::head(tenancy.clone());
    let cs = engine.create_change_set(&tenancy, "add").await.unwrap();
    let branch = Scope::new(tenancy.clone(), cs.pk);
    let (c, _) = engine
        .create_component(&branch, "c", "slow", json!({"n": 5}))
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();

    let applied = engine.apply_change_set(&tenancy, cs.pk).await.unwrap();
    assert_eq!(applied.status, ChangeSetStatus::Applied);

    let echo = engine
        .store()
        .attribute_value_at(&head, c.id, "/root/echo")
        .await
        .unwrap();
    assert_eq!(echo.value, json!(5));

    // Reads of the applied change set resolve to HEAD; writes are refused.
    assert_eq!(engine.components(&branch).await.unwrap().len(), 1);
    let err = engine
        .set_domain_property(&branch, c.id, "n", json!(6))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GraphError::Storage(StorageError::ChangeSetNotOpen { .. })
    ));

    let err = engine.apply_change_set(&tenancy, cs.pk).await.unwrap_err();
    assert!(matches!(err, GraphError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn test_cancel_discards_and_keeps_history() {
    let engine = engine();
    let tenancy = Tenancy::new_universal();
    let head = Scope::head(tenancy.clone());
    let (c, _) = engine
        .create_component(&head, "c", "slow", json!({"n": 1}))
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();

    let cs = engine.create_change_set(&tenancy, "try").await.unwrap();
    let branch = Scope::new(tenancy.clone(), cs.pk);
    engine
        .set_domain_property(&branch, c.id, "n", json!(2))
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();

    let mut canceled = engine.events().subscribe(EventKind::ChangeSetCanceled).unwrap();
    engine.cancel_change_set(&tenancy, cs.pk).await.unwrap();
    assert_eq!(canceled.recv().await.map(|e| e.change_set_pk), Some(cs.pk));

    let at_head = engine.component(&head, c.id).await.unwrap();
    assert_eq!(at_head.domain, json!({"n": 1}));

    let history = engine.history(&head, c.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history
        .iter()
        .any(|r| r.visibility.change_set_pk == cs.pk && r.visibility.is_deleted()));
}

#[tokio::test]
async fn test_result_after_cancel_is_inert() {
    let engine = engine();
    let tenancy = Tenancy::new_universal();
    let head = Scope::head(tenancy.clone());
    let cs = engine.create_change_set(&tenancy, "late").await.unwrap();
    let branch = Scope::new(tenancy.clone(), cs.pk);

    let scheduled = engine
        .create_component(&branch, "c", "slow", json!({"n": 1}))
        .await
        .unwrap();
    let component_id = scheduled.value.id;
    engine.cancel_change_set(&tenancy, cs.pk).await.unwrap();

    let report = scheduled.propagation.wait().await.unwrap();
    assert_eq!(report.change_set_pk, cs.pk);
    assert!(engine.components(&head).await.unwrap().is_empty());
    assert!(engine
        .attribute_values(&head, component_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_result_after_apply_lands_in_head() {
    let engine = engine();
    let tenancy = Tenancy::new_universal();
    let head = Scope::head(tenancy.clone());
    let cs = engine.create_change_set(&tenancy, "race").await.unwrap();
    let branch = Scope::new(tenancy.clone(), cs.pk);

    let scheduled = engine
        .create_component(&branch, "c", "slow", json!({"n": 9}))
        .await
        .unwrap();
    let component_id = scheduled.value.id;
    engine.apply_change_set(&tenancy, cs.pk).await.unwrap();
    scheduled.propagation.wait().await.unwrap();

    let echo = engine
        .store()
        .attribute_value_at(&head, component_id, "/root/echo")
        .await
        .unwrap();
    assert_eq!(echo.status, ValueStatus::Resolved);
    assert_eq!(echo.value, json!(9));
}

#[tokio::test]
async fn test_invalid_tenancy_rejected_everywhere() {
    let engine = engine();
    let empty = Tenancy::default();
    assert!(matches!(
        engine.create_change_set(&empty, "x").await,
        Err(GraphError::ScopeViolation { .. })
    ));
    assert!(matches!(
        engine.components(&Scope::head(empty)).await,
        Err(GraphError::ScopeViolation { .. })
    ));
}

/// Delegates to the in-memory store but refuses attribute-value writes while
/// armed.
#[derive(Default)]
struct RejectingValues {
    inner: MemoryRowStore,
    armed: AtomicBool,
}

impl RejectingValues {
    fn check(&self, row: &VersionedRow) -> StorageResult<()> {
        if self.armed.load(Ordering::SeqCst) && row.table == EntityTable::AttributeValues {
            return Err(StorageError::Backend("attribute value write refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RowStore for RejectingValues {
    async fn insert_change_set(&self, record: ChangeSetRecord) -> StorageResult<()> {
        self.inner.insert_change_set(record).await
    }

    async fn get_change_set(&self, pk: ChangeSetPk) -> StorageResult<ChangeSetRecord> {
        self.inner.get_change_set(pk).await
    }

    async fn list_change_sets(&self) -> StorageResult<Vec<ChangeSetRecord>> {
        self.inner.list_change_sets().await
    }

    async fn insert_row(&self, row: VersionedRow) -> StorageResult<()> {
        self.check(&row)?;
        self.inner.insert_row(row).await
    }

    async fn update_row(&self, row: VersionedRow) -> StorageResult<()> {
        self.check(&row)?;
        self.inner.update_row(row).await
    }

    async fn write_rows(&self, writes: Vec<RowWrite>) -> StorageResult<()> {
        for write in &writes {
            self.check(write.row())?;
        }
        self.inner.write_rows(writes).await
    }

    async fn rows_for_entity(
        &self,
        table: EntityTable,
        entity_id: &str,
    ) -> StorageResult<Vec<VersionedRow>> {
        self.inner.rows_for_entity(table, entity_id).await
    }

    async fn rows_for_table(
        &self,
        table: EntityTable,
        change_set_pk: ChangeSetPk,
    ) -> StorageResult<Vec<VersionedRow>> {
        self.inner.rows_for_table(table, change_set_pk).await
    }

    async fn rows_in_change_set(
        &self,
        change_set_pk: ChangeSetPk,
    ) -> StorageResult<Vec<VersionedRow>> {
        self.inner.rows_in_change_set(change_set_pk).await
    }

    async fn merge_change_set(
        &self,
        pk: ChangeSetPk,
        applied_at: DateTime<Utc>,
    ) -> StorageResult<ChangeSetRecord> {
        self.inner.merge_change_set(pk, applied_at).await
    }

    async fn discard_change_set(
        &self,
        pk: ChangeSetPk,
        canceled_at: DateTime<Utc>,
    ) -> StorageResult<ChangeSetRecord> {
        self.inner.discard_change_set(pk, canceled_at).await
    }
}

#[tokio::test]
async fn test_rejected_edit_leaves_domain_and_values_untouched() {
    let rows = Arc::new(RejectingValues::default());
    let engine = GraphEngine::with_registry(
        rows.clone(),
        Arc::new(MemoryFixLedger::new()),
        Arc::new(ScriptedCommandRunner::always(CommandOutput::success(""))),
        FuncRegistry::new().with_func(Arc::new(Slow)),
        EngineConfig::default(),
    )
    .with_variant(SchemaVariant::new("plain", ComponentType::Component));
    let head = Scope::head(Tenancy::new_universal());
    let (c, _) = engine
        .create_component(&head, "c", "plain", json!({"n": 1}))
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();
    let values_before = engine.attribute_values(&head, c.id).await.unwrap();

    rows.armed.store(true, Ordering::SeqCst);
    let err = engine
        .set_domain_property(&head, c.id, "n", json!(2))
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::Storage(StorageError::Backend(_))));
    let err = engine
        .set_domain_property(&head, c.id, "m", json!("new"))
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::Storage(StorageError::Backend(_))));
    rows.armed.store(false, Ordering::SeqCst);

    let stored = engine.component(&head, c.id).await.unwrap();
    assert_eq!(stored.domain, json!({"n": 1}));
    let mut values_after = engine.attribute_values(&head, c.id).await.unwrap();
    let mut values_before = values_before;
    values_before.sort_by_key(|av| av.id);
    values_after.sort_by_key(|av| av.id);
    assert_eq!(values_after, values_before);
}

#[tokio::test]
async fn test_failed_apply_keeps_branch_open_and_head_unchanged() {
    let engine = engine();
    let tenancy = Tenancy::new_universal();
    let head = Scope::head(tenancy.clone());
    let (c, _) = engine
        .create_component(&head, "c", "slow", json!({"n": 1}))
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();

    let cs = engine.create_change_set(&tenancy, "conflict").await.unwrap();
    let branch = Scope::new(tenancy.clone(), cs.pk);
    engine
        .set_domain_property(&branch, c.id, "n", json!(2))
        .await
        .unwrap()
        .settle()
        .await
        .unwrap();

    // A row of the branch moved to another owner: the merge must refuse.
    let rows = engine.store().rows();
    let stored = rows
        .rows_for_entity(EntityTable::Components, &c.id.to_string())
        .await
        .unwrap();
    let mut retenanted = stored
        .iter()
        .find(|r| r.visibility.change_set_pk == cs.pk)
        .unwrap()
        .clone();
    retenanted.tenancy = Tenancy::new_billing_account(BillingAccountPk::generate());
    rows.update_row(retenanted).await.unwrap();

    let mut applied = engine.events().subscribe(EventKind::ChangeSetApplied).unwrap();
    let err = engine.apply_change_set(&tenancy, cs.pk).await.unwrap_err();
    assert!(matches!(
        err,
        GraphError::Storage(StorageError::MergeConflict { .. })
    ));

    assert_eq!(
        engine.change_set(cs.pk).await.unwrap().status,
        ChangeSetStatus::Open
    );
    assert_eq!(
        engine.component(&head, c.id).await.unwrap().domain,
        json!({"n": 1})
    );
    let head_n = engine
        .store()
        .attribute_value_at(&head, c.id, "/root/domain/n")
        .await
        .unwrap();
    assert_eq!(head_n.value, json!(1));
    assert!(applied.try_recv().is_none());
}

const GATED: &str = "test:gated";

/// Reports when it starts, then waits for a permit.
struct Gated {
    started: mpsc::UnboundedSender<()>,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl Func for Gated {
    fn name(&self) -> &str {
        GATED
    }
    fn kind(&self) -> FuncKind {
        FuncKind::Attribute
    }
    async fn run(&self, _: &FuncContext, input: &InputSnapshot) -> PipelineResult<FuncResult> {
        let _ = self.started.send(());
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        let n = input.domain()?.get("n").cloned().unwrap_or(Value::Null);
        Ok(FuncResult::Attribute(n))
    }
}

#[tokio::test]
async fn test_cancel_during_propagation_settles_inert() {
    let (started_tx, mut started) = mpsc::unbounded_channel();
    let gate = Arc::new(Semaphore::new(0));
    let engine = GraphEngine::with_registry(
        Arc::new(MemoryRowStore::new()),
        Arc::new(MemoryFixLedger::new()),
        Arc::new(ScriptedCommandRunner::always(CommandOutput::success(""))),
        FuncRegistry::new().with_func(Arc::new(Gated {
            started: started_tx,
            gate: Arc::clone(&gate),
        })),
        EngineConfig::default(),
    )
    .with_variant(
        SchemaVariant::new("gated", ComponentType::Component).with_func(
            "/root/echo",
            GATED,
            &[DOMAIN_PATH],
        ),
    );
    let tenancy = Tenancy::new_universal();
    let head = Scope::head(tenancy.clone());
    let cs = engine.create_change_set(&tenancy, "doomed").await.unwrap();
    let branch = Scope::new(tenancy.clone(), cs.pk);

    let scheduled = engine
        .create_component(&branch, "c", "gated", json!({"n": 5}))
        .await
        .unwrap();
    let component_id = scheduled.value.id;

    started.recv().await.unwrap();
    engine.cancel_change_set(&tenancy, cs.pk).await.unwrap();
    gate.add_permits(1);

    let report = scheduled.propagation.wait().await.unwrap();
    assert_eq!(report.change_set_pk, cs.pk);
    assert!(report.failed.is_empty());
    assert!(engine.components(&head).await.unwrap().is_empty());
    assert!(engine.components(&branch).await.unwrap().is_empty());

    // The late result is kept in history, never visible.
    let history = engine
        .store()
        .history(&head, EntityTable::Components, &component_id.to_string())
        .await
        .unwrap();
    assert!(history.iter().all(|r| r.visibility.is_deleted()));
}
