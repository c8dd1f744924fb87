//! Trait contract tests for RowStore and FixLedger.
//!
//! Each contract is written once against `&dyn RowStore` / `&dyn FixLedger`
//! and run against the in-memory backend and SurrealDB `mem://`.

use chrono::Utc;
use serde_json::json;
use vgraph_state::*;

fn tenancy() -> Tenancy {
    Tenancy::new_billing_account(BillingAccountPk(uuid::Uuid::from_u128(42)))
}

fn head_row(entity: &str, value: i64) -> VersionedRow {
    VersionedRow::new(
        EntityTable::Components,
        entity,
        tenancy(),
        Visibility::new_head(),
        json!({ "v": value }),
    )
}

async fn open_change_set(store: &dyn RowStore) -> ChangeSetRecord {
    let cs = ChangeSetRecord::new("contract");
    store.insert_change_set(cs.clone()).await.unwrap();
    cs
}

async fn visible(store: &dyn RowStore, cs: ChangeSetPk, entity: &str) -> Option<VersionedRow> {
    let rows = store
        .rows_for_entity(EntityTable::Components, entity)
        .await
        .unwrap();
    ReadFilter::new(tenancy(), cs, false).pick(&rows).cloned()
}

// ===========================================================================
// RowStore contracts
// ===========================================================================

async fn contract_dangling_visibility_rejected(store: &dyn RowStore) {
    let row = VersionedRow::new(
        EntityTable::Components,
        "x",
        tenancy(),
        Visibility::new_change_set(ChangeSetPk::generate()),
        json!({}),
    );
    let err = store.insert_row(row).await.unwrap_err();
    assert!(matches!(err, StorageError::DanglingVisibility { .. }));
}

async fn contract_duplicate_row_rejected(store: &dyn RowStore) {
    let row = head_row("dup", 1);
    store.insert_row(row.clone()).await.unwrap();
    let err = store.insert_row(row).await.unwrap_err();
    assert!(matches!(err, StorageError::DuplicateRow { .. }));
}

async fn contract_apply_restamps_to_head(store: &dyn RowStore) {
    let head = head_row("x", 1);
    store.insert_row(head.clone()).await.unwrap();

    let cs = open_change_set(store).await;
    let edit = head.fork(Visibility::new_change_set(cs.pk), json!({ "v": 2 }));
    store.insert_row(edit).await.unwrap();

    assert_eq!(
        visible(store, ChangeSetPk::HEAD, "x").await.unwrap().object["v"],
        1
    );

    let applied = store.merge_change_set(cs.pk, Utc::now()).await.unwrap();
    assert_eq!(applied.status, ChangeSetStatus::Applied);
    assert!(applied.applied_at.is_some());

    assert_eq!(
        visible(store, ChangeSetPk::HEAD, "x").await.unwrap().object["v"],
        2
    );
    // History is retained: both rows still exist.
    let all = store
        .rows_for_entity(EntityTable::Components, "x")
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
}

async fn contract_apply_twice_is_invalid(store: &dyn RowStore) {
    let cs = open_change_set(store).await;
    store.merge_change_set(cs.pk, Utc::now()).await.unwrap();
    let err = store.merge_change_set(cs.pk, Utc::now()).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidStateTransition { .. }));
    let err = store
        .discard_change_set(cs.pk, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidStateTransition { .. }));
}

async fn contract_merge_conflict_writes_nothing(store: &dyn RowStore) {
    let a = head_row("a", 1);
    let b = head_row("b", 1);
    store.insert_row(a.clone()).await.unwrap();
    store.insert_row(b.clone()).await.unwrap();

    let cs = open_change_set(store).await;
    store
        .insert_row(a.fork(Visibility::new_change_set(cs.pk), json!({ "v": 2 })))
        .await
        .unwrap();
    let mut bad = b.fork(Visibility::new_change_set(cs.pk), json!({ "v": 2 }));
    bad.tenancy = Tenancy::new_universal();
    store.insert_row(bad).await.unwrap();

    let err = store.merge_change_set(cs.pk, Utc::now()).await.unwrap_err();
    assert!(matches!(err, StorageError::MergeConflict { .. }));

    let record = store.get_change_set(cs.pk).await.unwrap();
    assert_eq!(record.status, ChangeSetStatus::Open);
    assert_eq!(
        visible(store, ChangeSetPk::HEAD, "a").await.unwrap().object["v"],
        1
    );
}

async fn contract_cancel_leaves_head_untouched(store: &dyn RowStore) {
    let head = head_row("x", 1);
    store.insert_row(head.clone()).await.unwrap();

    let cs = open_change_set(store).await;
    store
        .insert_row(head.fork(Visibility::new_change_set(cs.pk), json!({ "v": 9 })))
        .await
        .unwrap();

    let canceled = store.discard_change_set(cs.pk, Utc::now()).await.unwrap();
    assert_eq!(canceled.status, ChangeSetStatus::Canceled);

    let at_head = visible(store, ChangeSetPk::HEAD, "x").await.unwrap();
    assert_eq!(at_head, head);

    let cs_rows = store.rows_in_change_set(cs.pk).await.unwrap();
    assert!(cs_rows.iter().all(|r| r.visibility.is_deleted()));
}

async fn contract_writes_to_closed_change_set(store: &dyn RowStore) {
    let cs = open_change_set(store).await;
    store.discard_change_set(cs.pk, Utc::now()).await.unwrap();

    let live = VersionedRow::new(
        EntityTable::Components,
        "late",
        tenancy(),
        Visibility::new_change_set(cs.pk),
        json!({}),
    );
    let err = store.insert_row(live).await.unwrap_err();
    assert!(matches!(err, StorageError::ChangeSetNotOpen { .. }));

    // Late results land inert.
    let inert = VersionedRow::new(
        EntityTable::Components,
        "late",
        tenancy(),
        Visibility::new(cs.pk, Some(Utc::now())),
        json!({}),
    );
    store.insert_row(inert).await.unwrap();
}

async fn contract_write_rows_all_or_nothing(store: &dyn RowStore) {
    let cs = open_change_set(store).await;
    let head = head_row("kept", 1);
    store.insert_row(head.clone()).await.unwrap();

    let fork = head.fork(Visibility::new_change_set(cs.pk), json!({ "v": 2 }));
    let missing = VersionedRow::new(
        EntityTable::Components,
        "never-written",
        tenancy(),
        Visibility::new_change_set(cs.pk),
        json!({}),
    );
    let err = store
        .write_rows(vec![RowWrite::Insert(fork.clone()), RowWrite::Update(missing)])
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::RowNotFound { .. }));
    assert!(store.rows_in_change_set(cs.pk).await.unwrap().is_empty());

    let added = VersionedRow::new(
        EntityTable::Components,
        "added",
        tenancy(),
        Visibility::new_change_set(cs.pk),
        json!({ "v": 3 }),
    );
    store
        .write_rows(vec![RowWrite::Insert(fork), RowWrite::Insert(added)])
        .await
        .unwrap();
    assert_eq!(
        visible(store, cs.pk, "kept").await.unwrap().object,
        json!({ "v": 2 })
    );
    assert!(visible(store, cs.pk, "added").await.is_some());
    assert!(visible(store, ChangeSetPk::HEAD, "added").await.is_none());
}

async fn contract_rows_for_table_scopes_to_change_set(store: &dyn RowStore) {
    let cs = open_change_set(store).await;
    let other = open_change_set(store).await;
    store.insert_row(head_row("h", 1)).await.unwrap();
    store
        .insert_row(VersionedRow::new(
            EntityTable::Components,
            "mine",
            tenancy(),
            Visibility::new_change_set(cs.pk),
            json!({}),
        ))
        .await
        .unwrap();
    store
        .insert_row(VersionedRow::new(
            EntityTable::Components,
            "theirs",
            tenancy(),
            Visibility::new_change_set(other.pk),
            json!({}),
        ))
        .await
        .unwrap();

    let rows = store
        .rows_for_table(EntityTable::Components, cs.pk)
        .await
        .unwrap();
    let ids: Vec<&str> = rows.iter().map(|r| r.entity_id.as_str()).collect();
    assert!(ids.contains(&"h"));
    assert!(ids.contains(&"mine"));
    assert!(!ids.contains(&"theirs"));
}

// ===========================================================================
// FixLedger contracts
// ===========================================================================

async fn contract_batch_join_barrier(ledger: &dyn FixLedger) {
    let members: Vec<FixExecutionRecord> = (0..3)
        .map(|i| FixExecutionRecord::new(format!("c{i}"), "revoke"))
        .collect();
    let ids: Vec<String> = members.iter().map(|m| m.fix_id.clone()).collect();
    let batch = ledger
        .create_batch(tenancy(), ChangeSetPk::HEAD, members)
        .await
        .unwrap();
    assert!(!batch.completed);

    let b = ledger
        .record_outcome(&batch.batch_id, &ids[0], FixOutcome::Failure, Some("boom".into()), 1)
        .await
        .unwrap();
    assert!(!b.completed, "first failure must not complete the batch");

    let b = ledger
        .record_outcome(&batch.batch_id, &ids[1], FixOutcome::Success, None, 1)
        .await
        .unwrap();
    assert!(!b.completed);

    let b = ledger
        .record_outcome(&batch.batch_id, &ids[2], FixOutcome::Success, None, 2)
        .await
        .unwrap();
    assert!(b.completed);

    let fetched = ledger.get_batch(&batch.batch_id).await.unwrap();
    assert!(fetched.completed);
    assert_eq!(fetched.pending_count(), 0);
}

async fn contract_batch_unknown(ledger: &dyn FixLedger) {
    let err = ledger.get_batch("nope").await.unwrap_err();
    assert!(matches!(err, StorageError::FixBatchNotFound { .. }));
}

// ===========================================================================
// Backends
// ===========================================================================

macro_rules! row_store_contracts {
    ($modname:ident, $make:expr) => {
        mod $modname {
            use super::*;

            #[tokio::test]
            async fn dangling_visibility_rejected() {
                contract_dangling_visibility_rejected(&$make).await;
            }

            #[tokio::test]
            async fn duplicate_row_rejected() {
                contract_duplicate_row_rejected(&$make).await;
            }

            #[tokio::test]
            async fn apply_restamps_to_head() {
                contract_apply_restamps_to_head(&$make).await;
            }

            #[tokio::test]
            async fn apply_twice_is_invalid() {
                contract_apply_twice_is_invalid(&$make).await;
            }

            #[tokio::test]
            async fn merge_conflict_writes_nothing() {
                contract_merge_conflict_writes_nothing(&$make).await;
            }

            #[tokio::test]
            async fn cancel_leaves_head_untouched() {
                contract_cancel_leaves_head_untouched(&$make).await;
            }

            #[tokio::test]
            async fn writes_to_closed_change_set() {
                contract_writes_to_closed_change_set(&$make).await;
            }

            #[tokio::test]
            async fn write_rows_all_or_nothing() {
                contract_write_rows_all_or_nothing(&$make).await;
            }

            #[tokio::test]
            async fn rows_for_table_scopes_to_change_set() {
                contract_rows_for_table_scopes_to_change_set(&$make).await;
            }
        }
    };
}

row_store_contracts!(memory_rows, MemoryRowStore::new());
row_store_contracts!(surreal_rows, SurrealRowStore::in_memory().await.unwrap());

#[tokio::test]
async fn memory_batch_join_barrier() {
    contract_batch_join_barrier(&MemoryFixLedger::new()).await;
}

#[tokio::test]
async fn memory_batch_unknown() {
    contract_batch_unknown(&MemoryFixLedger::new()).await;
}

#[tokio::test]
async fn surreal_batch_join_barrier() {
    contract_batch_join_barrier(&SurrealFixLedger::in_memory().await.unwrap()).await;
}

#[tokio::test]
async fn surreal_batch_unknown() {
    contract_batch_unknown(&SurrealFixLedger::in_memory().await.unwrap()).await;
}

#[tokio::test]
async fn concurrent_outcomes_complete_exactly_once() {
    use std::sync::Arc;

    let ledger = Arc::new(MemoryFixLedger::new());
    let members: Vec<FixExecutionRecord> = (0..16)
        .map(|i| FixExecutionRecord::new(format!("c{i}"), "revoke"))
        .collect();
    let ids: Vec<String> = members.iter().map(|m| m.fix_id.clone()).collect();
    let batch = ledger
        .create_batch(tenancy(), ChangeSetPk::HEAD, members)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for id in ids {
        let ledger = ledger.clone();
        let bid = batch.batch_id.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .record_outcome(&bid, &id, FixOutcome::Success, None, 1)
                .await
                .unwrap()
                .completed
        }));
    }

    let mut completions = 0;
    for h in handles {
        if h.await.unwrap() {
            completions += 1;
        }
    }
    assert_eq!(completions, 1);
}
