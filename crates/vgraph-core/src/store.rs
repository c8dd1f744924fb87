//! Versioned Graph Store: typed, scope-mediated access to versioned rows.
//!
//! Writes are copy-on-write at row granularity. The first edit of an entity
//! inside a change set forks the visible HEAD row into a row stamped with the
//! change set; later edits in the same change set update that row. Callers
//! never see which of the two happened.
//!
//! Reads are public. Writes go through the engine, which keeps user edits
//! on the `domain` tree and leaves `resource` to pipeline outcomes.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, instrument};
use vgraph_state::{EntityTable, RowStore, RowWrite, Tenancy, VersionedRow, Visibility};

use crate::domain::attribute::DOMAIN_PATH;
use crate::domain::{
    AttributeValue, AttributeValueId, Component, ComponentId, Edge, InstalledPkg, Versioned,
};
use crate::error::{GraphError, GraphResult};
use crate::func::InputSnapshot;
use crate::metrics::METRICS;
use crate::scope::{Scope, ScopeResolver, WriteTarget};

pub struct GraphStore {
    rows: Arc<dyn RowStore>,
    resolver: ScopeResolver,
    // Serializes read-fork-write so two writers in one change set cannot
    // both fork the same HEAD row.
    cow_lock: Mutex<()>,
}

impl GraphStore {
    pub fn new(rows: Arc<dyn RowStore>) -> Self {
        Self {
            resolver: ScopeResolver::new(rows.clone()),
            rows,
            cow_lock: Mutex::new(()),
        }
    }

    pub fn resolver(&self) -> &ScopeResolver {
        &self.resolver
    }

    pub fn rows(&self) -> &Arc<dyn RowStore> {
        &self.rows
    }

    // -- generic reads --------------------------------------------------------

    /// The entity visible under `scope`, if any.
    pub async fn get<T: Versioned>(&self, scope: &Scope, entity_id: &str) -> GraphResult<Option<T>> {
        let filter = self.resolver.read_filter(scope, false).await?;
        let rows = self.rows.rows_for_entity(T::TABLE, entity_id).await?;
        filter.pick(&rows).map(decode).transpose()
    }

    /// Every entity of `T` visible under `scope`, oldest first.
    pub async fn list<T: Versioned>(&self, scope: &Scope) -> GraphResult<Vec<T>> {
        let filter = self.resolver.read_filter(scope, false).await?;
        let rows = self
            .rows
            .rows_for_table(T::TABLE, filter.change_set_pk)
            .await?;
        filter.select(rows).iter().map(decode).collect()
    }

    /// Every stored row of an entity across all visibilities, including
    /// closed change sets and deletions, ordered by write time.
    pub async fn history(
        &self,
        scope: &Scope,
        table: EntityTable,
        entity_id: &str,
    ) -> GraphResult<Vec<VersionedRow>> {
        scope.tenancy.validate()?;
        let rows = self.rows.rows_for_entity(table, entity_id).await?;
        Ok(rows
            .into_iter()
            .filter(|r| scope.tenancy.can_read(&r.tenancy))
            .collect())
    }

    // -- generic writes -------------------------------------------------------

    /// Start an edit under `scope`. Its writes land together on
    /// [`Edit::commit`], or not at all.
    pub(crate) async fn edit(&self, scope: &Scope) -> GraphResult<Edit<'_>> {
        let target = self.resolver.write_target(scope).await?;
        Ok(self.edit_at(scope, target).await)
    }

    async fn edit_at(&self, scope: &Scope, target: WriteTarget) -> Edit<'_> {
        Edit {
            rows: &self.rows,
            tenancy: scope.tenancy.clone(),
            target,
            staged: Vec::new(),
            _guard: self.cow_lock.lock().await,
        }
    }

    /// Create a new entity under `scope`.
    #[instrument(skip(self, entity), fields(table = %T::TABLE, scope = %scope))]
    pub(crate) async fn create<T: Versioned>(&self, scope: &Scope, entity: &T) -> GraphResult<()> {
        let mut edit = self.edit(scope).await?;
        edit.create(entity)?;
        edit.commit().await
    }

    /// Record a computed value scheduled against `scope`. Only the computed
    /// fields are written; wiring edits made meanwhile are kept.
    pub(crate) async fn write_result_value(
        &self,
        scope: &Scope,
        value: &AttributeValue,
    ) -> GraphResult<()> {
        let target = self.resolver.result_target(scope).await?;
        let mut edit = self.edit_at(scope, target).await;
        edit.modify(&value.id.to_string(), |current: &mut AttributeValue| {
            current.value = value.value.clone();
            current.status = value.status;
            current.message = value.message.clone();
        })
        .await?;
        edit.commit().await
    }

    // -- typed helpers --------------------------------------------------------

    pub async fn component(&self, scope: &Scope, id: ComponentId) -> GraphResult<Component> {
        self.get(scope, &id.to_string())
            .await?
            .ok_or(GraphError::ComponentNotFound(id))
    }

    pub async fn components(&self, scope: &Scope) -> GraphResult<Vec<Component>> {
        self.list(scope).await
    }

    pub async fn attribute_value(
        &self,
        scope: &Scope,
        id: AttributeValueId,
    ) -> GraphResult<AttributeValue> {
        self.get(scope, &id.to_string())
            .await?
            .ok_or_else(|| GraphError::AttributeValueNotFound(id.to_string()))
    }

    /// All attribute values visible under `scope`, across components.
    pub async fn attribute_values(&self, scope: &Scope) -> GraphResult<Vec<AttributeValue>> {
        self.list(scope).await
    }

    pub async fn attribute_values_for(
        &self,
        scope: &Scope,
        component_id: ComponentId,
    ) -> GraphResult<Vec<AttributeValue>> {
        Ok(self
            .attribute_values(scope)
            .await?
            .into_iter()
            .filter(|av| av.component_id == component_id)
            .collect())
    }

    /// The value at `path` on a component.
    pub async fn attribute_value_at(
        &self,
        scope: &Scope,
        component_id: ComponentId,
        path: &str,
    ) -> GraphResult<AttributeValue> {
        self.attribute_values_for(scope, component_id)
            .await?
            .into_iter()
            .find(|av| av.path == path)
            .ok_or_else(|| GraphError::AttributeValueNotFound(format!("{component_id}{path}")))
    }

    /// Function input for a component-level action (fix, refresh): the
    /// component plus its resolved `/root/domain`, which already carries
    /// socket-provided values.
    pub async fn snapshot(
        &self,
        scope: &Scope,
        component_id: ComponentId,
    ) -> GraphResult<InputSnapshot> {
        let component = self.component(scope, component_id).await?;
        let mut snapshot =
            InputSnapshot::of_component(&component, scope.tenancy.clone(), scope.change_set_pk);
        if let Some(domain) = self
            .attribute_values_for(scope, component_id)
            .await?
            .into_iter()
            .find(|av| av.path == DOMAIN_PATH)
        {
            snapshot = snapshot.with_input(DOMAIN_PATH, domain.value);
        }
        Ok(snapshot)
    }

    pub async fn edges(&self, scope: &Scope) -> GraphResult<Vec<Edge>> {
        self.list(scope).await
    }

    pub async fn installed_pkgs(&self, scope: &Scope) -> GraphResult<Vec<InstalledPkg>> {
        self.list(scope).await
    }

    pub async fn find_installed_pkg(
        &self,
        scope: &Scope,
        name: &str,
    ) -> GraphResult<Option<InstalledPkg>> {
        Ok(self
            .installed_pkgs(scope)
            .await?
            .into_iter()
            .find(|p| p.name == name))
    }

    /// Record a package installation. A package name is installed at most
    /// once per visible scope.
    pub async fn install_pkg(&self, scope: &Scope, pkg: &InstalledPkg) -> GraphResult<()> {
        if self.find_installed_pkg(scope, &pkg.name).await?.is_some() {
            return Err(GraphError::PkgAlreadyInstalled {
                name: pkg.name.clone(),
            });
        }
        self.create(scope, pkg).await
    }

    /// Replace a component's `resource` tree with a pipeline outcome. Lands
    /// in HEAD if the change set was applied meanwhile, and inert if it was
    /// canceled.
    pub(crate) async fn write_resource(
        &self,
        scope: &Scope,
        component_id: ComponentId,
        resource: serde_json::Value,
    ) -> GraphResult<Component> {
        let target = self.resolver.result_target(scope).await?;
        let mut edit = self.edit_at(scope, target).await;
        let component = edit
            .modify(&component_id.to_string(), |c: &mut Component| {
                c.resource = resource;
            })
            .await?;
        edit.commit().await?;
        Ok(component)
    }
}

/// Writes staged under one scope and committed with
/// [`RowStore::write_rows`]. Holds the copy-on-write lock until dropped, so
/// never call the store's own write methods while an edit is open.
pub(crate) struct Edit<'a> {
    rows: &'a Arc<dyn RowStore>,
    tenancy: Tenancy,
    target: WriteTarget,
    staged: Vec<RowWrite>,
    _guard: MutexGuard<'a, ()>,
}

impl Edit<'_> {
    pub(crate) fn create<T: Versioned>(&mut self, entity: &T) -> GraphResult<()> {
        let row = VersionedRow::new(
            T::TABLE,
            entity.entity_id(),
            self.tenancy.clone(),
            self.target.visibility,
            serde_json::to_value(entity)?,
        );
        self.stage(RowWrite::Insert(row));
        Ok(())
    }

    pub(crate) async fn update<T: Versioned>(&mut self, entity: &T) -> GraphResult<()> {
        self.modify(&entity.entity_id(), |current: &mut T| {
            *current = entity.clone();
        })
        .await
        .map(|_| ())
    }

    /// Read the row the target bases its write on (staged writes included),
    /// apply `f`, and stage the result.
    pub(crate) async fn modify<T, F>(&mut self, entity_id: &str, f: F) -> GraphResult<T>
    where
        T: Versioned,
        F: FnOnce(&mut T),
    {
        let rows = self.rows_for(T::TABLE, entity_id).await?;
        let row = self
            .target
            .filter
            .pick(&rows)
            .ok_or_else(|| not_found(T::TABLE, entity_id))?;

        let mut entity: T = decode(row)?;
        f(&mut entity);
        let object = serde_json::to_value(&entity)?;

        let write = if row.visibility.change_set_pk == self.target.visibility.change_set_pk {
            let mut updated = row.restamp(self.target.visibility);
            updated.object = object;
            updated.updated_at = Utc::now();
            RowWrite::Update(updated)
        } else {
            debug!(table = %T::TABLE, entity = %entity_id, "forking row");
            RowWrite::Insert(row.fork(self.target.visibility, object))
        };
        self.stage(write);
        Ok(entity)
    }

    pub(crate) async fn delete(&mut self, table: EntityTable, entity_id: &str) -> GraphResult<()> {
        let rows = self.rows_for(table, entity_id).await?;
        let row = self
            .target
            .filter
            .pick(&rows)
            .ok_or_else(|| not_found(table, entity_id))?;

        let deleted = Visibility::new(self.target.visibility.change_set_pk, Some(Utc::now()));
        let write = if row.visibility.change_set_pk == self.target.visibility.change_set_pk {
            let mut updated = row.restamp(deleted);
            updated.updated_at = Utc::now();
            RowWrite::Update(updated)
        } else {
            RowWrite::Insert(row.fork(deleted, row.object.clone()))
        };
        self.stage(write);
        Ok(())
    }

    /// Write everything staged in one all-or-nothing batch.
    pub(crate) async fn commit(self) -> GraphResult<()> {
        let Edit {
            rows,
            staged,
            _guard,
            ..
        } = self;
        let count = staged.len() as u64;
        rows.write_rows(staged).await?;
        METRICS.add_rows_written(count);
        Ok(())
    }

    /// Stored rows of one entity overlaid with this edit's staged rows.
    async fn rows_for(&self, table: EntityTable, entity_id: &str) -> GraphResult<Vec<VersionedRow>> {
        let mut rows = self.rows.rows_for_entity(table, entity_id).await?;
        for row in self.staged.iter().map(RowWrite::row) {
            if row.table != table || row.entity_id != entity_id {
                continue;
            }
            match rows.iter_mut().find(|r| r.pk == row.pk) {
                Some(existing) => *existing = row.clone(),
                None => rows.push(row.clone()),
            }
        }
        Ok(rows)
    }

    /// Queue a write. A second write to a staged row replaces it and keeps
    /// the original insert-or-update.
    fn stage(&mut self, write: RowWrite) {
        let pk = write.row().pk.clone();
        match self.staged.iter_mut().find(|w| w.row().pk == pk) {
            Some(slot) => {
                *slot = if matches!(slot, RowWrite::Insert(_)) {
                    RowWrite::Insert(write.into_row())
                } else {
                    write
                };
            }
            None => self.staged.push(write),
        }
    }
}

impl std::fmt::Debug for GraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphStore").finish_non_exhaustive()
    }
}

fn decode<T: Versioned>(row: &VersionedRow) -> GraphResult<T> {
    Ok(serde_json::from_value(row.object.clone())?)
}

fn not_found(table: EntityTable, entity_id: &str) -> GraphError {
    match table {
        EntityTable::Components => match entity_id.parse() {
            Ok(id) => GraphError::ComponentNotFound(id),
            Err(_) => GraphError::AttributeValueNotFound(entity_id.to_string()),
        },
        EntityTable::AttributeValues => GraphError::AttributeValueNotFound(entity_id.to_string()),
        EntityTable::Edges | EntityTable::InstalledPkgs => {
            GraphError::Storage(vgraph_state::StorageError::RowNotFound {
                table,
                id: entity_id.to_string(),
            })
        }
    }
}
