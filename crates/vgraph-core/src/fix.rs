//! Fix batches: run fix functions against real resources and track the batch
//! to completion.
//!
//! Members run concurrently. Each member's terminal outcome is recorded in
//! the [`FixLedger`] and announced with `FixReturn`; the member whose report
//! completes the batch announces `FixBatchReturn`, exactly once.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use vgraph_state::{FixBatchRecord, FixExecutionRecord, FixLedger, FixOutcome};

use crate::domain::ComponentId;
use crate::error::GraphResult;
use crate::events::{Event, EventDispatcher, EventKind, EventPayload};
use crate::func::{retry_faults, FuncKind, FuncPipeline, FuncResult, SandboxConfig};
use crate::obs;
use crate::scope::Scope;
use crate::store::GraphStore;

/// One fix to run: `func` against `component_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixRequest {
    pub component_id: ComponentId,
    pub func: String,
}

impl FixRequest {
    pub fn new(component_id: ComponentId, func: impl Into<String>) -> Self {
        Self {
            component_id,
            func: func.into(),
        }
    }
}

pub struct FixRunner {
    store: Arc<GraphStore>,
    pipeline: FuncPipeline,
    ledger: Arc<dyn FixLedger>,
    events: Arc<EventDispatcher>,
    sandbox: SandboxConfig,
    max_concurrency: usize,
}

impl FixRunner {
    pub fn new(
        store: Arc<GraphStore>,
        pipeline: FuncPipeline,
        ledger: Arc<dyn FixLedger>,
        events: Arc<EventDispatcher>,
        sandbox: SandboxConfig,
        max_concurrency: usize,
    ) -> Self {
        Self {
            store,
            pipeline,
            ledger,
            events,
            sandbox,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn FixLedger> {
        &self.ledger
    }

    /// Run a batch in the background.
    pub fn spawn_batch(
        self: &Arc<Self>,
        scope: Scope,
        fixes: Vec<FixRequest>,
    ) -> JoinHandle<GraphResult<FixBatchRecord>> {
        let runner = Arc::clone(self);
        tokio::spawn(async move { runner.run_batch(&scope, fixes).await })
    }

    /// Run every fix and return the completed batch.
    #[instrument(skip(self, fixes), fields(scope = %scope, fixes = fixes.len()))]
    pub async fn run_batch(
        &self,
        scope: &Scope,
        fixes: Vec<FixRequest>,
    ) -> GraphResult<FixBatchRecord> {
        scope.tenancy.validate()?;
        self.events.ensure_registered(EventKind::FixReturn)?;
        self.events.ensure_registered(EventKind::FixBatchReturn)?;
        for fix in &fixes {
            self.store.component(scope, fix.component_id).await?;
        }

        let members: Vec<FixExecutionRecord> = fixes
            .iter()
            .map(|f| FixExecutionRecord::new(f.component_id.to_string(), f.func.clone()))
            .collect();
        let batch = self
            .ledger
            .create_batch(scope.tenancy.clone(), scope.change_set_pk, members)
            .await?;
        info!(batch_id = %batch.batch_id, members = batch.members.len(), "fix batch started");

        if batch.completed {
            self.announce_batch(scope, &batch);
            return Ok(batch);
        }

        let semaphore = Semaphore::new(self.max_concurrency);
        let runs = batch
            .members
            .iter()
            .zip(&fixes)
            .map(|(member, fix)| self.run_member(scope, &batch.batch_id, member, fix, &semaphore));
        let reports = join_all(runs).await;

        let mut last = None;
        for report in reports {
            let record = report?;
            if record.completed {
                last = Some(record);
            }
        }
        match last {
            Some(record) => {
                self.announce_batch(scope, &record);
                Ok(record)
            }
            None => Ok(self.ledger.get_batch(&batch.batch_id).await?),
        }
    }

    async fn run_member(
        &self,
        scope: &Scope,
        batch_id: &str,
        member: &FixExecutionRecord,
        fix: &FixRequest,
        semaphore: &Semaphore,
    ) -> GraphResult<FixBatchRecord> {
        let _permit = semaphore.acquire().await.ok();
        // Every member reaches the ledger, including one whose component
        // dropped out of view mid-batch.
        let (outcome, message, attempts) = match self.execute_member(scope, member, fix).await {
            Ok(done) => done,
            Err(err) => {
                warn!(fix_id = %member.fix_id, error = %err, "fix could not run");
                (FixOutcome::Failure, Some(err.to_string()), 0)
            }
        };

        let record = self
            .ledger
            .record_outcome(batch_id, &member.fix_id, outcome, message.clone(), attempts)
            .await?;

        // The fix already happened; a lost announcement must not undo it.
        if let Err(err) = self.events.dispatch(Event::new(
            scope.tenancy.clone(),
            scope.change_set_pk,
            EventPayload::FixReturn {
                batch_id: batch_id.to_string(),
                fix_id: member.fix_id.clone(),
                component_id: member.component_id.clone(),
                action: member.action.clone(),
                outcome,
                message,
                attempts,
            },
        )) {
            obs::emit_dispatch_error(EventKind::FixReturn.as_str(), &err);
        }
        Ok(record)
    }

    async fn execute_member(
        &self,
        scope: &Scope,
        member: &FixExecutionRecord,
        fix: &FixRequest,
    ) -> GraphResult<(FixOutcome, Option<String>, u32)> {
        let snapshot = Arc::new(self.store.snapshot(scope, fix.component_id).await?);

        let run = retry_faults(&self.sandbox, |_| {
            self.pipeline
                .execute(&fix.func, FuncKind::Fix, Arc::clone(&snapshot), &self.sandbox)
        })
        .await;

        let (outcome, message) = match run.result {
            Ok(FuncResult::Fix(result)) if result.is_ok() => {
                self.store
                    .write_resource(scope, fix.component_id, result.value)
                    .await?;
                (FixOutcome::Success, result.message)
            }
            Ok(FuncResult::Fix(result)) => (FixOutcome::Failure, result.message),
            Ok(other) => (
                FixOutcome::Failure,
                Some(format!("unexpected {} result", other.kind())),
            ),
            Err(fault) => {
                warn!(fix_id = %member.fix_id, attempts = run.attempts, error = %fault, "fix faulted");
                (FixOutcome::Failure, Some(fault.to_string()))
            }
        };
        Ok((outcome, message, run.attempts))
    }

    fn announce_batch(&self, scope: &Scope, batch: &FixBatchRecord) {
        let succeeded = batch
            .members
            .iter()
            .filter(|m| m.outcome == Some(FixOutcome::Success))
            .count();
        let failed = batch.members.len() - succeeded;
        obs::emit_fix_batch_completed(&batch.batch_id, succeeded, failed);
        if let Err(err) = self.events.dispatch(Event::new(
            scope.tenancy.clone(),
            scope.change_set_pk,
            EventPayload::FixBatchReturn {
                batch_id: batch.batch_id.clone(),
                succeeded,
                failed,
            },
        )) {
            obs::emit_dispatch_error(EventKind::FixBatchReturn.as_str(), &err);
        }
    }
}

impl std::fmt::Debug for FixRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixRunner")
            .field("max_concurrency", &self.max_concurrency)
            .finish_non_exhaustive()
    }
}
