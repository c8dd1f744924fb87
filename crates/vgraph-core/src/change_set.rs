//! Change-Set Manager: lifecycle of isolated branches.
//!
//! `Open -> Applied` merges the change set's rows into HEAD; `Open ->
//! Canceled` soft-deletes them. Both are terminal. Each transition is
//! announced only after it committed; a failed transition writes nothing and
//! announces nothing.

use std::sync::Arc;

use chrono::Utc;
use tracing::instrument;
use vgraph_state::{ChangeSetPk, ChangeSetRecord, RowStore, Tenancy};

use crate::error::GraphResult;
use crate::events::{Event, EventDispatcher, EventKind, EventPayload};
use crate::metrics::METRICS;
use crate::obs;

pub struct ChangeSetManager {
    rows: Arc<dyn RowStore>,
    events: Arc<EventDispatcher>,
}

impl ChangeSetManager {
    pub fn new(rows: Arc<dyn RowStore>, events: Arc<EventDispatcher>) -> Self {
        Self { rows, events }
    }

    #[instrument(skip(self, tenancy))]
    pub async fn create(&self, tenancy: &Tenancy, name: &str) -> GraphResult<ChangeSetRecord> {
        tenancy.validate()?;
        self.events.ensure_registered(EventKind::ChangeSetCreated)?;

        let record = ChangeSetRecord::new(name);
        self.rows.insert_change_set(record.clone()).await?;

        obs::emit_change_set_created(record.pk, &record.name);
        self.events.dispatch(Event::new(
            tenancy.clone(),
            record.pk,
            EventPayload::ChangeSetCreated {
                name: record.name.clone(),
            },
        ))?;
        Ok(record)
    }

    /// Merge the change set into HEAD, all-or-nothing.
    #[instrument(skip(self, tenancy), fields(change_set_pk = %pk))]
    pub async fn apply(&self, tenancy: &Tenancy, pk: ChangeSetPk) -> GraphResult<ChangeSetRecord> {
        tenancy.validate()?;
        self.events.ensure_registered(EventKind::ChangeSetApplied)?;

        let rows = self.rows.rows_in_change_set(pk).await?.len();
        let record = self.rows.merge_change_set(pk, Utc::now()).await?;
        let applied_at = record.applied_at.unwrap_or_else(Utc::now);

        METRICS.inc_change_sets_applied();
        obs::emit_change_set_applied(pk, rows);
        self.events.dispatch(Event::new(
            tenancy.clone(),
            pk,
            EventPayload::ChangeSetApplied { applied_at },
        ))?;
        Ok(record)
    }

    /// Discard the change set. HEAD is untouched.
    #[instrument(skip(self, tenancy), fields(change_set_pk = %pk))]
    pub async fn cancel(&self, tenancy: &Tenancy, pk: ChangeSetPk) -> GraphResult<ChangeSetRecord> {
        tenancy.validate()?;
        self.events.ensure_registered(EventKind::ChangeSetCanceled)?;

        let rows = self.rows.rows_in_change_set(pk).await?.len();
        let record = self.rows.discard_change_set(pk, Utc::now()).await?;
        let canceled_at = record.canceled_at.unwrap_or_else(Utc::now);

        METRICS.inc_change_sets_canceled();
        obs::emit_change_set_canceled(pk, rows);
        self.events.dispatch(Event::new(
            tenancy.clone(),
            pk,
            EventPayload::ChangeSetCanceled { canceled_at },
        ))?;
        Ok(record)
    }

    pub async fn get(&self, pk: ChangeSetPk) -> GraphResult<ChangeSetRecord> {
        Ok(self.rows.get_change_set(pk).await?)
    }

    pub async fn list(&self) -> GraphResult<Vec<ChangeSetRecord>> {
        Ok(self.rows.list_change_sets().await?)
    }
}

impl std::fmt::Debug for ChangeSetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeSetManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventsConfig;
    use crate::error::GraphError;
    use vgraph_state::{ChangeSetStatus, MemoryRowStore};

    fn manager() -> (ChangeSetManager, Arc<EventDispatcher>) {
        let events = Arc::new(EventDispatcher::standard(&EventsConfig::default()));
        (
            ChangeSetManager::new(Arc::new(MemoryRowStore::new()), events.clone()),
            events,
        )
    }

    #[tokio::test]
    async fn test_create_then_apply_emits_events() {
        let (mgr, events) = manager();
        let mut created = events.subscribe(EventKind::ChangeSetCreated).unwrap();
        let mut applied = events.subscribe(EventKind::ChangeSetApplied).unwrap();
        let tenancy = Tenancy::new_universal();

        let cs = mgr.create(&tenancy, "add web").await.unwrap();
        assert_eq!(cs.status, ChangeSetStatus::Open);
        assert_eq!(created.try_recv().map(|e| e.change_set_pk), Some(cs.pk));

        let done = mgr.apply(&tenancy, cs.pk).await.unwrap();
        assert_eq!(done.status, ChangeSetStatus::Applied);
        assert!(done.applied_at.is_some());
        assert_eq!(applied.try_recv().map(|e| e.change_set_pk), Some(cs.pk));
    }

    #[tokio::test]
    async fn test_second_transition_fails_silently_for_observers() {
        let (mgr, events) = manager();
        let tenancy = Tenancy::new_universal();
        let cs = mgr.create(&tenancy, "x").await.unwrap();
        mgr.cancel(&tenancy, cs.pk).await.unwrap();

        let mut applied = events.subscribe(EventKind::ChangeSetApplied).unwrap();
        let mut canceled = events.subscribe(EventKind::ChangeSetCanceled).unwrap();
        let err = mgr.apply(&tenancy, cs.pk).await.unwrap_err();
        assert!(matches!(err, GraphError::InvalidStateTransition { .. }));
        let err = mgr.cancel(&tenancy, cs.pk).await.unwrap_err();
        assert!(matches!(err, GraphError::InvalidStateTransition { .. }));

        assert!(applied.try_recv().is_none());
        assert!(canceled.try_recv().is_none());
        assert_eq!(
            mgr.get(cs.pk).await.unwrap().status,
            ChangeSetStatus::Canceled
        );
    }

    #[tokio::test]
    async fn test_create_requires_tenancy() {
        let (mgr, _) = manager();
        let err = mgr.create(&Tenancy::default(), "x").await.unwrap_err();
        assert!(matches!(err, GraphError::ScopeViolation { .. }));
        assert!(mgr.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_lifecycle_kind_blocks_transition() {
        let events = Arc::new(EventDispatcher::empty(16));
        let rows: Arc<dyn RowStore> = Arc::new(MemoryRowStore::new());
        let record = ChangeSetRecord::new("x");
        let pk = record.pk;
        rows.insert_change_set(record).await.unwrap();
        let mgr = ChangeSetManager::new(rows, events);

        let err = mgr.apply(&Tenancy::new_universal(), pk).await.unwrap_err();
        assert!(matches!(err, GraphError::Dispatch(_)));
        assert_eq!(mgr.get(pk).await.unwrap().status, ChangeSetStatus::Open);
    }
}
