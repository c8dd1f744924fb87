//! `GraphEngine`: the assembled system.
//!
//! Wires the store, change-set manager, function pipeline, propagation engine,
//! fix runner and event dispatcher together and exposes the user-facing
//! operations. Edits return as soon as their rows are written and the
//! resulting propagation is scheduled; callers that need the settled graph
//! wait on the returned [`PropagationHandle`].

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, instrument};
use vgraph_state::{
    ChangeSetPk, ChangeSetRecord, EntityTable, FixBatchRecord, FixLedger, MemoryFixLedger,
    MemoryRowStore, RowStore, Tenancy, VersionedRow,
};

use crate::builtins::{builtin_registry, builtin_variants};
use crate::change_set::ChangeSetManager;
use crate::config::EngineConfig;
use crate::domain::attribute::{domain_prop_path, DOMAIN_PATH};
use crate::domain::{
    AttributeValue, AttributeValueId, Component, ComponentId, Derivation, InstalledPkg,
    SchemaVariant,
};
use crate::error::{GraphError, GraphResult};
use crate::events::{Event, EventDispatcher, EventKind, EventPayload};
use crate::fix::{FixRequest, FixRunner};
use crate::frame::{self, FrameConnection};
use crate::func::{
    retry_faults, CommandPolicy, CommandRunner, FuncKind, FuncPipeline, FuncRegistry, FuncResult,
    ResourceResult,
};
use crate::propagation::{PropagationEngine, PropagationHandle, PropagationReport};
use crate::scope::Scope;
use crate::store::{Edit, GraphStore};

/// An edit that was written and whose propagation is running.
#[derive(Debug)]
pub struct Scheduled<T> {
    pub value: T,
    pub propagation: PropagationHandle,
}

impl<T> Scheduled<T> {
    /// Wait for the propagation to settle.
    pub async fn settle(self) -> GraphResult<(T, PropagationReport)> {
        let report = self.propagation.wait().await?;
        Ok((self.value, report))
    }
}

pub struct GraphEngine {
    config: EngineConfig,
    store: Arc<GraphStore>,
    change_sets: ChangeSetManager,
    events: Arc<EventDispatcher>,
    pipeline: FuncPipeline,
    propagation: Arc<PropagationEngine>,
    fixes: Arc<FixRunner>,
    variants: BTreeMap<String, SchemaVariant>,
}

impl GraphEngine {
    /// An engine with the built-in functions and schema variants.
    pub fn new(
        rows: Arc<dyn RowStore>,
        ledger: Arc<dyn FixLedger>,
        runner: Arc<dyn CommandRunner>,
        config: EngineConfig,
    ) -> Self {
        let engine = Self::with_registry(rows, ledger, runner, builtin_registry(), config);
        builtin_variants()
            .into_iter()
            .fold(engine, |engine, variant| engine.with_variant(variant))
    }

    /// An engine over `registry` with no schema variants.
    pub fn with_registry(
        rows: Arc<dyn RowStore>,
        ledger: Arc<dyn FixLedger>,
        runner: Arc<dyn CommandRunner>,
        registry: FuncRegistry,
        config: EngineConfig,
    ) -> Self {
        let events = Arc::new(EventDispatcher::standard(&config.events));
        let store = Arc::new(GraphStore::new(rows.clone()));
        let pipeline = FuncPipeline::new(
            Arc::new(registry),
            runner,
            Arc::new(CommandPolicy::declared(&config.sandbox.commands)),
            events.clone(),
        );
        let propagation = Arc::new(PropagationEngine::new(
            store.clone(),
            pipeline.clone(),
            events.clone(),
            config.propagation.clone(),
            config.sandbox.clone(),
        ));
        let fixes = Arc::new(FixRunner::new(
            store.clone(),
            pipeline.clone(),
            ledger,
            events.clone(),
            config.sandbox.clone(),
            config.propagation.max_concurrency,
        ));
        Self {
            change_sets: ChangeSetManager::new(rows, events.clone()),
            config,
            store,
            events,
            pipeline,
            propagation,
            fixes,
            variants: BTreeMap::new(),
        }
    }

    /// An engine over the in-memory backends.
    pub fn in_memory(runner: Arc<dyn CommandRunner>, config: EngineConfig) -> Self {
        Self::new(
            Arc::new(MemoryRowStore::new()),
            Arc::new(MemoryFixLedger::new()),
            runner,
            config,
        )
    }

    /// Register a schema variant, replacing one of the same name.
    pub fn with_variant(mut self, variant: SchemaVariant) -> Self {
        self.variants.insert(variant.name.clone(), variant);
        self
    }

    // -- accessors -------------------------------------------------------------

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    pub fn pipeline(&self) -> &FuncPipeline {
        &self.pipeline
    }

    pub fn propagation(&self) -> &Arc<PropagationEngine> {
        &self.propagation
    }

    pub fn fix_ledger(&self) -> &Arc<dyn FixLedger> {
        self.fixes.ledger()
    }

    pub fn variant(&self, name: &str) -> GraphResult<&SchemaVariant> {
        self.variants
            .get(name)
            .ok_or_else(|| GraphError::InvalidVariant {
                variant: name.to_string(),
                reason: "not registered".into(),
            })
    }

    pub fn variants(&self) -> impl Iterator<Item = &SchemaVariant> {
        self.variants.values()
    }

    // -- change sets -------------------------------------------------------------

    pub async fn create_change_set(
        &self,
        tenancy: &Tenancy,
        name: &str,
    ) -> GraphResult<ChangeSetRecord> {
        self.change_sets.create(tenancy, name).await
    }

    pub async fn apply_change_set(
        &self,
        tenancy: &Tenancy,
        pk: ChangeSetPk,
    ) -> GraphResult<ChangeSetRecord> {
        self.change_sets.apply(tenancy, pk).await
    }

    pub async fn cancel_change_set(
        &self,
        tenancy: &Tenancy,
        pk: ChangeSetPk,
    ) -> GraphResult<ChangeSetRecord> {
        self.change_sets.cancel(tenancy, pk).await
    }

    pub async fn change_set(&self, pk: ChangeSetPk) -> GraphResult<ChangeSetRecord> {
        self.change_sets.get(pk).await
    }

    pub async fn list_change_sets(&self) -> GraphResult<Vec<ChangeSetRecord>> {
        self.change_sets.list().await
    }

    // -- components -----------------------------------------------------------------

    /// Create a component of `variant` and schedule its derived values.
    #[instrument(skip(self, domain), fields(scope = %scope))]
    pub async fn create_component(
        &self,
        scope: &Scope,
        name: &str,
        variant: &str,
        domain: serde_json::Value,
    ) -> GraphResult<Scheduled<Component>> {
        self.events.ensure_registered(EventKind::ChangeSetWritten)?;
        let variant = self.variant(variant)?;
        let component = Component::new(name, &variant.name, variant.component_type, domain);
        let values = variant.instantiate(&component)?;

        let mut edit = self.store.edit(scope).await?;
        edit.create(&component)?;
        for av in &values {
            edit.create(av)?;
        }
        edit.commit().await?;
        info!(component_id = %component.id, values = values.len(), "component created");

        self.announce_written(scope, vec![component.id])?;
        let roots = values
            .iter()
            .filter(|av| av.depends_on.is_empty())
            .map(|av| av.id)
            .collect();
        Ok(Scheduled {
            value: component,
            propagation: self.propagation.spawn(scope.clone(), roots),
        })
    }

    pub async fn component(&self, scope: &Scope, id: ComponentId) -> GraphResult<Component> {
        self.store.component(scope, id).await
    }

    pub async fn components(&self, scope: &Scope) -> GraphResult<Vec<Component>> {
        self.store.components(scope).await
    }

    pub async fn attribute_values(
        &self,
        scope: &Scope,
        component_id: ComponentId,
    ) -> GraphResult<Vec<AttributeValue>> {
        self.store.attribute_values_for(scope, component_id).await
    }

    /// Set one domain property and schedule everything downstream of it.
    #[instrument(skip(self, value), fields(scope = %scope, component_id = %component_id))]
    pub async fn set_domain_property(
        &self,
        scope: &Scope,
        component_id: ComponentId,
        prop: &str,
        value: serde_json::Value,
    ) -> GraphResult<Scheduled<Component>> {
        self.events.ensure_registered(EventKind::ChangeSetWritten)?;
        let values = self.store.attribute_values_for(scope, component_id).await?;
        let path = domain_prop_path(prop);

        // The domain tree, its attribute value and any rewiring land together.
        let mut edit = self.store.edit(scope).await?;
        let component = edit
            .modify(&component_id.to_string(), |c: &mut Component| {
                if !c.domain.is_object() {
                    c.domain = serde_json::Value::Object(serde_json::Map::new());
                }
                if let Some(domain) = c.domain.as_object_mut() {
                    domain.insert(prop.to_string(), value.clone());
                }
            })
            .await?;
        let seed = match values.iter().find(|av| av.path == path) {
            Some(existing) => {
                let mut av = existing.clone();
                av.value = value;
                edit.update(&av).await?;
                av.id
            }
            None => add_domain_prop(&mut edit, &values, component_id, path, value).await?,
        };
        edit.commit().await?;

        self.announce_written(scope, vec![component_id])?;
        Ok(Scheduled {
            value: component,
            propagation: self.propagation.spawn(scope.clone(), vec![seed]),
        })
    }

    /// Soft-delete a component and its values in `scope`.
    pub async fn delete_component(&self, scope: &Scope, component_id: ComponentId) -> GraphResult<()> {
        self.events.ensure_registered(EventKind::ChangeSetWritten)?;
        let values = self.store.attribute_values_for(scope, component_id).await?;
        let mut edit = self.store.edit(scope).await?;
        for av in values {
            edit.delete(EntityTable::AttributeValues, &av.id.to_string())
                .await?;
        }
        edit.delete(EntityTable::Components, &component_id.to_string())
            .await?;
        edit.commit().await?;
        self.announce_written(scope, vec![component_id])
    }

    /// Every stored version of a component, across change sets.
    pub async fn history(
        &self,
        scope: &Scope,
        component_id: ComponentId,
    ) -> GraphResult<Vec<VersionedRow>> {
        self.store
            .history(scope, EntityTable::Components, &component_id.to_string())
            .await
    }

    // -- frames -------------------------------------------------------------------

    pub async fn connect_component_to_frame(
        &self,
        scope: &Scope,
        child: ComponentId,
        parent: ComponentId,
    ) -> GraphResult<Scheduled<FrameConnection>> {
        self.events.ensure_registered(EventKind::ChangeSetWritten)?;
        let connection = frame::connect_component_to_frame(&self.store, scope, child, parent).await?;
        self.announce_written(scope, vec![child, parent])?;
        let seeds = connection.upstream.clone();
        Ok(Scheduled {
            value: connection,
            propagation: self.propagation.spawn(scope.clone(), seeds),
        })
    }

    // -- functions ----------------------------------------------------------------

    /// Re-run a component's qualifications and wait for the results.
    pub async fn qualify(
        &self,
        scope: &Scope,
        component_id: ComponentId,
    ) -> GraphResult<Vec<AttributeValue>> {
        self.rerun(scope, component_id, FuncKind::Qualification).await
    }

    /// Re-run a component's code generation (and everything that reads it)
    /// and wait for the results.
    pub async fn codegen(
        &self,
        scope: &Scope,
        component_id: ComponentId,
    ) -> GraphResult<Vec<AttributeValue>> {
        self.rerun(scope, component_id, FuncKind::CodeGeneration).await
    }

    async fn rerun(
        &self,
        scope: &Scope,
        component_id: ComponentId,
        kind: FuncKind,
    ) -> GraphResult<Vec<AttributeValue>> {
        let of_kind = |av: &AttributeValue| {
            av.derivation
                .func()
                .and_then(|f| self.pipeline.kind_of(f).ok())
                == Some(kind)
        };
        let seeds: Vec<AttributeValueId> = self
            .store
            .attribute_values_for(scope, component_id)
            .await?
            .into_iter()
            .filter(|av| of_kind(av))
            .map(|av| av.id)
            .collect();
        self.propagation.propagate(scope, &seeds).await?;

        Ok(self
            .store
            .attribute_values_for(scope, component_id)
            .await?
            .into_iter()
            .filter(|av| seeds.contains(&av.id))
            .collect())
    }

    /// Observe the real resource and record it on the component.
    ///
    /// An `error` result leaves `resource` untouched; only `ok` is written
    /// and announced.
    #[instrument(skip(self), fields(scope = %scope, component_id = %component_id))]
    pub async fn refresh_resource(
        &self,
        scope: &Scope,
        component_id: ComponentId,
        func: &str,
    ) -> GraphResult<ResourceResult> {
        self.events.ensure_registered(EventKind::ResourceRefreshed)?;
        let snapshot = Arc::new(self.store.snapshot(scope, component_id).await?);
        let sandbox = &self.config.sandbox;
        let run = retry_faults(sandbox, |_| {
            self.pipeline
                .execute(func, FuncKind::Refresh, Arc::clone(&snapshot), sandbox)
        })
        .await;

        let result = match run.result? {
            FuncResult::Refresh(result) => result,
            other => {
                return Err(GraphError::ExecutionFault(
                    crate::func::ExecutionFault::Crashed {
                        func: func.to_string(),
                        reason: format!("returned a {} result", other.kind()),
                    },
                ))
            }
        };
        if result.is_ok() {
            self.store
                .write_resource(scope, component_id, result.value.clone())
                .await?;
            self.events.dispatch(Event::new(
                scope.tenancy.clone(),
                scope.change_set_pk,
                EventPayload::ResourceRefreshed {
                    component_id,
                    resource: result.value.clone(),
                },
            ))?;
        }
        Ok(result)
    }

    /// Run a fix batch and wait for it to complete.
    pub async fn run_fixes(
        &self,
        scope: &Scope,
        fixes: Vec<FixRequest>,
    ) -> GraphResult<FixBatchRecord> {
        self.fixes.run_batch(scope, fixes).await
    }

    /// Run a fix batch in the background.
    pub fn spawn_fixes(
        &self,
        scope: Scope,
        fixes: Vec<FixRequest>,
    ) -> JoinHandle<GraphResult<FixBatchRecord>> {
        self.fixes.spawn_batch(scope, fixes)
    }

    // -- packages -----------------------------------------------------------------

    pub async fn install_pkg(
        &self,
        scope: &Scope,
        name: &str,
        contents: &str,
    ) -> GraphResult<InstalledPkg> {
        let pkg = InstalledPkg::new(name, contents);
        self.store.install_pkg(scope, &pkg).await?;
        Ok(pkg)
    }

    pub async fn installed_pkgs(&self, scope: &Scope) -> GraphResult<Vec<InstalledPkg>> {
        self.store.installed_pkgs(scope).await
    }

    fn announce_written(&self, scope: &Scope, component_ids: Vec<ComponentId>) -> GraphResult<()> {
        self.events.dispatch(Event::new(
            scope.tenancy.clone(),
            scope.change_set_pk,
            EventPayload::ChangeSetWritten { component_ids },
        ))?;
        Ok(())
    }
}

impl std::fmt::Debug for GraphEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphEngine")
            .field("config", &self.config)
            .field("variants", &self.variants.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// A property the variant did not know about: new input value, wired into
/// `/root/domain` ahead of the socket values.
async fn add_domain_prop(
    edit: &mut Edit<'_>,
    values: &[AttributeValue],
    component_id: ComponentId,
    path: String,
    value: serde_json::Value,
) -> GraphResult<AttributeValueId> {
    let av = AttributeValue::new(component_id, path, Derivation::Input, value);
    edit.create(&av)?;

    if let Some(domain) = values.iter().find(|v| v.path == DOMAIN_PATH) {
        let mut domain = domain.clone();
        let first_socket = domain
            .depends_on
            .iter()
            .position(|dep| values.iter().any(|v| v.id == *dep && v.is_input_socket()))
            .unwrap_or(domain.depends_on.len());
        domain.depends_on.insert(first_socket, av.id);
        edit.update(&domain).await?;
    }
    Ok(av.id)
}
