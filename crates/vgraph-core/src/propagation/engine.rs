//! Attribute propagation: recompute everything downstream of a write, in
//! topological order, inside the writing change set.
//!
//! 1. Build the graph of visible attribute values and take the closure of
//!    the seeds. A cycle fails the run before anything is written.
//! 2. Mark every derived node in the closure `Pending`.
//! 3. Walk the closure level by level. Plain derivations are computed
//!    inline; function derivations run concurrently through the pipeline,
//!    with retries on execution faults. A level finishes before the next
//!    starts.
//! 4. A node whose function faulted is `Failed`; nodes downstream of it stay
//!    `Pending` and are reported unresolved. Siblings carry on.
//! 5. One `DependentValuesUpdated` event announces the settle.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, instrument, warn, Instrument};
use vgraph_state::ChangeSetPk;

use super::graph::AttributeGraph;
use crate::config::PropagationConfig;
use crate::domain::attribute::derive_plain;
use crate::domain::{AttributeValue, AttributeValueId, Component, ComponentId, Derivation, ValueStatus};
use crate::error::GraphResult;
use crate::events::{Event, EventDispatcher, EventPayload};
use crate::func::{retry_faults, FuncPipeline, FuncResult, InputSnapshot, RetryOutcome, SandboxConfig};
use crate::metrics::METRICS;
use crate::obs;
use crate::scope::Scope;
use crate::store::GraphStore;

/// Outcome of one propagation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationReport {
    pub change_set_pk: ChangeSetPk,
    /// Recomputed successfully, in processing order.
    pub resolved: Vec<AttributeValueId>,
    /// Left pending because something upstream failed.
    pub unresolved: Vec<AttributeValueId>,
    /// Function faulted after retries.
    pub failed: Vec<AttributeValueId>,
}

impl PropagationReport {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty() && self.failed.is_empty()
    }
}

/// A propagation running in the background.
#[derive(Debug)]
pub struct PropagationHandle {
    change_set_pk: ChangeSetPk,
    join: JoinHandle<GraphResult<PropagationReport>>,
}

impl PropagationHandle {
    pub fn change_set_pk(&self) -> ChangeSetPk {
        self.change_set_pk
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the settle.
    pub async fn wait(self) -> GraphResult<PropagationReport> {
        self.join.await?
    }
}

pub struct PropagationEngine {
    store: Arc<GraphStore>,
    pipeline: FuncPipeline,
    events: Arc<EventDispatcher>,
    config: PropagationConfig,
    sandbox: SandboxConfig,
    // One run at a time per change set; distinct change sets run freely.
    locks: std::sync::Mutex<HashMap<ChangeSetPk, Arc<Mutex<()>>>>,
}

impl PropagationEngine {
    pub fn new(
        store: Arc<GraphStore>,
        pipeline: FuncPipeline,
        events: Arc<EventDispatcher>,
        config: PropagationConfig,
        sandbox: SandboxConfig,
    ) -> Self {
        Self {
            store,
            pipeline,
            events,
            config,
            sandbox,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, pk: ChangeSetPk) -> Arc<Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(pk).or_default().clone()
    }

    /// Drop the map entry once no other run holds or waits on it.
    fn release(&self, pk: ChangeSetPk, lock: Arc<Mutex<()>>) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // The map's reference plus ours.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&pk);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Run propagation on a background task and return immediately.
    pub fn spawn(
        self: &Arc<Self>,
        scope: Scope,
        seeds: Vec<AttributeValueId>,
    ) -> PropagationHandle {
        let engine = Arc::clone(self);
        let change_set_pk = scope.change_set_pk;
        let join = tokio::spawn(async move { engine.propagate(&scope, &seeds).await });
        PropagationHandle {
            change_set_pk,
            join,
        }
    }

    /// Recompute everything downstream of `seeds` and wait for the settle.
    #[instrument(skip(self, seeds), fields(scope = %scope, seeds = seeds.len()))]
    pub async fn propagate(
        &self,
        scope: &Scope,
        seeds: &[AttributeValueId],
    ) -> GraphResult<PropagationReport> {
        let lock = self.lock_for(scope.change_set_pk);
        let result = {
            let _running = lock.lock().await;
            self.run(scope, seeds)
                .instrument(obs::change_set_span(scope.change_set_pk))
                .await
        };
        self.release(scope.change_set_pk, lock);
        result
    }

    async fn run(
        &self,
        scope: &Scope,
        seeds: &[AttributeValueId],
    ) -> GraphResult<PropagationReport> {
        let started = Instant::now();

        // One consistent view for the whole run; later reads could resolve
        // elsewhere if the change set closes meanwhile.
        let values = self.store.attribute_values(scope).await?;
        let components: HashMap<ComponentId, Component> = self
            .store
            .components(scope)
            .await?
            .into_iter()
            .map(|c| (c.id, c))
            .collect();
        let graph = AttributeGraph::build(&values);
        let mut current: HashMap<usize, AttributeValue> = values
            .into_iter()
            .filter_map(|av| graph.index_of(av.id).map(|idx| (idx, av)))
            .collect();

        // A seed can vanish between scheduling and running, e.g. when its
        // change set is canceled. Nothing downstream of it is visible either.
        let seed_idx: Vec<usize> = seeds
            .iter()
            .filter_map(|id| {
                let idx = graph.index_of(*id);
                if idx.is_none() {
                    debug!(attribute_value_id = %id, "seed no longer visible; skipped");
                }
                idx
            })
            .collect();

        let closure = graph.reachable_from(&seed_idx);
        let levels = graph.levels(&closure)?;
        let derived: BTreeSet<usize> = closure
            .iter()
            .copied()
            .filter(|idx| current[idx].derivation != Derivation::Input)
            .collect();

        for idx in &derived {
            if let Some(av) = current.get_mut(idx) {
                if av.status != ValueStatus::Pending {
                    av.status = ValueStatus::Pending;
                    self.store.write_result_value(scope, av).await?;
                }
            }
        }

        let mut resolved = Vec::new();
        let mut failed: HashSet<usize> = HashSet::new();
        let mut blocked: HashSet<usize> = HashSet::new();

        for level in levels {
            let mut funcs = Vec::new();
            for idx in level.into_iter().filter(|i| derived.contains(i)) {
                if graph
                    .upstream(idx)
                    .iter()
                    .any(|u| failed.contains(u) || blocked.contains(u))
                {
                    blocked.insert(idx);
                    continue;
                }
                let derivation = current[&idx].derivation.clone();
                match derivation {
                    Derivation::Func { func } => funcs.push((idx, func)),
                    derivation => {
                        let value = {
                            let inputs: Vec<(&str, &serde_json::Value)> = current[&idx]
                                .depends_on
                                .iter()
                                .filter_map(|dep| graph.index_of(*dep))
                                .map(|d| (current[&d].name(), &current[&d].value))
                                .collect();
                            derive_plain(&derivation, &inputs).unwrap_or(serde_json::Value::Null)
                        };
                        if let Some(av) = current.get_mut(&idx) {
                            av.value = value;
                            av.status = ValueStatus::Resolved;
                            av.message = None;
                            self.store.write_result_value(scope, av).await?;
                            resolved.push(av.id);
                        }
                    }
                }
            }

            if funcs.is_empty() {
                continue;
            }

            let mut tasks = JoinSet::new();
            let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
            for (idx, func) in funcs {
                let Some(snapshot) = snapshot_for(scope, &graph, &current, &components, idx) else {
                    debug!(attribute_value_id = %graph.id(idx), "component no longer visible; left pending");
                    blocked.insert(idx);
                    continue;
                };
                let pipeline = self.pipeline.clone();
                let sandbox = self.sandbox.clone();
                let semaphore = Arc::clone(&semaphore);
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    let outcome = run_with_retries(&pipeline, &func, snapshot, &sandbox).await;
                    (idx, func, outcome)
                });
            }

            let mut finished = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                finished.push(joined?);
            }
            // Apply results in index order so writes and events are deterministic.
            finished.sort_by_key(|(idx, _, _)| *idx);

            for (idx, func, outcome) in finished {
                let Some(av) = current.get_mut(&idx) else {
                    continue;
                };
                match outcome.result {
                    Ok(result) => {
                        av.value = result.to_value();
                        av.status = ValueStatus::Resolved;
                        av.message = None;
                        self.store.write_result_value(scope, av).await?;
                        resolved.push(av.id);
                        self.announce_result(scope, av, &func, &result)?;
                    }
                    Err(fault) => {
                        warn!(
                            attribute_value_id = %av.id,
                            func = %func,
                            attempts = outcome.attempts,
                            error = %fault,
                            "function failed; downstream values stay pending"
                        );
                        av.status = ValueStatus::Failed;
                        av.message = Some(fault.to_string());
                        self.store.write_result_value(scope, av).await?;
                        failed.insert(idx);
                    }
                }
            }
        }

        let mut failed_ids: Vec<AttributeValueId> = failed.iter().map(|&i| graph.id(i)).collect();
        failed_ids.sort();
        let mut unresolved: Vec<AttributeValueId> = blocked.iter().map(|&i| graph.id(i)).collect();
        unresolved.sort();

        let report = PropagationReport {
            change_set_pk: scope.change_set_pk,
            resolved,
            unresolved,
            failed: failed_ids,
        };

        METRICS.inc_propagations();
        obs::emit_propagation_settled(
            scope.change_set_pk,
            report.resolved.len(),
            report.unresolved.len(),
            report.failed.len(),
            started.elapsed().as_millis() as u64,
        );
        self.events.dispatch(Event::new(
            scope.tenancy.clone(),
            scope.change_set_pk,
            EventPayload::DependentValuesUpdated {
                resolved: report.resolved.clone(),
                unresolved: report.unresolved.clone(),
                failed: report.failed.clone(),
            },
        ))?;
        Ok(report)
    }

    fn announce_result(
        &self,
        scope: &Scope,
        av: &AttributeValue,
        func: &str,
        result: &FuncResult,
    ) -> GraphResult<()> {
        let payload = match result {
            FuncResult::Qualification(q) => EventPayload::QualificationChecked {
                component_id: av.component_id,
                attribute_value_id: Some(av.id),
                func: func.to_string(),
                qualified: q.qualified,
                message: q.message.clone(),
            },
            FuncResult::CodeGeneration(c) => EventPayload::CodeGenerated {
                component_id: av.component_id,
                attribute_value_id: Some(av.id),
                func: func.to_string(),
                code: c.code.clone(),
                format: c.format,
            },
            FuncResult::Fix(_) | FuncResult::Refresh(_) | FuncResult::Attribute(_) => {
                debug!(attribute_value_id = %av.id, "no per-result event for this kind");
                return Ok(());
            }
        };
        self.events.dispatch(Event::new(
            scope.tenancy.clone(),
            scope.change_set_pk,
            payload,
        ))?;
        Ok(())
    }
}

impl std::fmt::Debug for PropagationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropagationEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Pin a function node's inputs: its component plus the current value of
/// every dependency, keyed by path. `None` when the component dropped out
/// of view.
fn snapshot_for(
    scope: &Scope,
    graph: &AttributeGraph,
    current: &HashMap<usize, AttributeValue>,
    components: &HashMap<ComponentId, Component>,
    idx: usize,
) -> Option<Arc<InputSnapshot>> {
    let av = &current[&idx];
    let component = components.get(&av.component_id)?;

    let mut snapshot =
        InputSnapshot::of_component(component, scope.tenancy.clone(), scope.change_set_pk);
    for dep in av.depends_on.iter().filter_map(|d| graph.index_of(*d)) {
        let dep = &current[&dep];
        snapshot = snapshot.with_input(dep.path.clone(), dep.value.clone());
    }
    Some(Arc::new(snapshot))
}

async fn run_with_retries(
    pipeline: &FuncPipeline,
    func: &str,
    snapshot: Arc<InputSnapshot>,
    sandbox: &SandboxConfig,
) -> RetryOutcome<FuncResult> {
    let kind = match pipeline.kind_of(func) {
        Ok(kind) => kind,
        Err(fault) => {
            return RetryOutcome {
                result: Err(fault),
                attempts: 1,
            }
        }
    };
    retry_faults(sandbox, |_| {
        pipeline.execute(func, kind, Arc::clone(&snapshot), sandbox)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventsConfig;
    use crate::domain::ComponentType;
    use crate::error::GraphError;
    use crate::func::{CommandOutput, CommandPolicy, FuncRegistry, ScriptedCommandRunner};
    use serde_json::json;
    use vgraph_state::{MemoryRowStore, RowStore, Tenancy};

    fn engine(store: Arc<GraphStore>) -> PropagationEngine {
        let events = Arc::new(EventDispatcher::standard(&EventsConfig::default()));
        let pipeline = FuncPipeline::new(
            Arc::new(FuncRegistry::new()),
            Arc::new(ScriptedCommandRunner::always(CommandOutput::success(""))),
            Arc::new(CommandPolicy::empty()),
            events.clone(),
        );
        PropagationEngine::new(
            store,
            pipeline,
            events,
            PropagationConfig::default(),
            SandboxConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_plain_derivations_follow_edit() {
        let rows: Arc<dyn RowStore> = Arc::new(MemoryRowStore::new());
        let store = Arc::new(GraphStore::new(rows));
        let scope = Scope::head(Tenancy::new_universal());
        let c = Component::new("c", "v", ComponentType::Component, json!({}));
        store.create(&scope, &c).await.unwrap();

        let mut input = AttributeValue::new(c.id, "/root/domain/n", Derivation::Input, json!(1));
        let copy = AttributeValue::new(c.id, "/root/copy", Derivation::Copy, json!(null))
            .with_dependencies(vec![input.id]);
        store.create(&scope, &input).await.unwrap();
        store.create(&scope, &copy).await.unwrap();

        input.value = json!(7);
        let mut edit = store.edit(&scope).await.unwrap();
        edit.update(&input).await.unwrap();
        edit.commit().await.unwrap();
        let report = engine(store.clone())
            .propagate(&scope, &[input.id])
            .await
            .unwrap();

        assert_eq!(report.resolved, vec![copy.id]);
        assert!(report.is_complete());
        let copied = store.attribute_value(&scope, copy.id).await.unwrap();
        assert_eq!(copied.value, json!(7));
        assert_eq!(copied.status, ValueStatus::Resolved);
    }

    #[tokio::test]
    async fn test_cycle_fails_before_any_write() {
        let rows: Arc<dyn RowStore> = Arc::new(MemoryRowStore::new());
        let store = Arc::new(GraphStore::new(rows));
        let scope = Scope::head(Tenancy::new_universal());
        let c = Component::new("c", "v", ComponentType::Component, json!({}));

        let mut a = AttributeValue::new(c.id, "/root/a", Derivation::Copy, json!(1));
        let b = AttributeValue::new(c.id, "/root/b", Derivation::Copy, json!(2))
            .with_dependencies(vec![a.id]);
        a.depends_on = vec![b.id];
        store.create(&scope, &a).await.unwrap();
        store.create(&scope, &b).await.unwrap();

        let err = engine(store.clone())
            .propagate(&scope, &[a.id])
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::DependencyCycle { .. }));
        let untouched = store.attribute_value(&scope, a.id).await.unwrap();
        assert_eq!(untouched.status, ValueStatus::Resolved);
        assert_eq!(untouched.value, json!(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawned_run_releases_its_lock() {
        let rows: Arc<dyn RowStore> = Arc::new(MemoryRowStore::new());
        let store = Arc::new(GraphStore::new(rows));
        let scope = Scope::head(Tenancy::new_universal());
        let engine = Arc::new(engine(store));

        let handles: Vec<_> = (0..4)
            .map(|_| engine.spawn(scope.clone(), vec![AttributeValueId::generate()]))
            .collect();
        for handle in handles {
            assert!(handle.wait().await.unwrap().is_complete());
        }
        assert_eq!(engine.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn test_unknown_seed_is_skipped() {
        let rows: Arc<dyn RowStore> = Arc::new(MemoryRowStore::new());
        let store = Arc::new(GraphStore::new(rows));
        let scope = Scope::head(Tenancy::new_universal());
        let report = engine(store)
            .propagate(&scope, &[AttributeValueId::generate()])
            .await
            .unwrap();
        assert!(report.resolved.is_empty());
        assert!(report.is_complete());
    }
}
