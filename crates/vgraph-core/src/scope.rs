//! Tenancy & visibility resolution.
//!
//! Every graph operation takes an explicit [`Scope`]. The resolver turns it
//! into the [`ReadFilter`] applied to reads and the [`Visibility`] stamped on
//! writes, after checking the tenancy and the change set's lifecycle state.

use std::sync::Arc;

use chrono::Utc;
use vgraph_state::{
    ChangeSetPk, ChangeSetRecord, ChangeSetStatus, ReadFilter, RowStore, Tenancy, Visibility,
};

use crate::error::GraphResult;

/// The `(tenancy, change set)` pair every graph operation runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub tenancy: Tenancy,
    pub change_set_pk: ChangeSetPk,
}

impl Scope {
    pub fn new(tenancy: Tenancy, change_set_pk: ChangeSetPk) -> Self {
        Self {
            tenancy,
            change_set_pk,
        }
    }

    pub fn head(tenancy: Tenancy) -> Self {
        Self::new(tenancy, ChangeSetPk::HEAD)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "change_set={}", self.change_set_pk)
    }
}

/// Where a write lands: the filter that finds the row it is based on, and
/// the visibility the written row carries.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteTarget {
    pub filter: ReadFilter,
    pub visibility: Visibility,
}

impl WriteTarget {
    fn at(tenancy: &Tenancy, visibility: Visibility, include_deleted: bool) -> Self {
        Self {
            filter: ReadFilter::new(tenancy.clone(), visibility.change_set_pk, include_deleted),
            visibility,
        }
    }
}

#[derive(Clone)]
pub struct ScopeResolver {
    rows: Arc<dyn RowStore>,
}

impl ScopeResolver {
    pub fn new(rows: Arc<dyn RowStore>) -> Self {
        Self { rows }
    }

    async fn change_set(&self, pk: ChangeSetPk) -> GraphResult<Option<ChangeSetRecord>> {
        if pk.is_head() {
            return Ok(None);
        }
        Ok(Some(self.rows.get_change_set(pk).await?))
    }

    /// The read filter for `scope`.
    ///
    /// A change set that is no longer open resolves to HEAD: an applied
    /// change set's rows now live there, a canceled one's are discarded.
    pub async fn read_filter(&self, scope: &Scope, include_deleted: bool) -> GraphResult<ReadFilter> {
        scope.tenancy.validate()?;
        let target = match self.change_set(scope.change_set_pk).await? {
            Some(cs) if cs.status == ChangeSetStatus::Open => cs.pk,
            _ => ChangeSetPk::HEAD,
        };
        Ok(ReadFilter::new(scope.tenancy.clone(), target, include_deleted))
    }

    /// Target for a user edit. Fails with `ChangeSetNotOpen` unless the
    /// change set accepts writes. HEAD is writable directly.
    pub async fn write_target(&self, scope: &Scope) -> GraphResult<WriteTarget> {
        scope.tenancy.validate()?;
        match self.change_set(scope.change_set_pk).await? {
            None => Ok(WriteTarget::at(&scope.tenancy, Visibility::new_head(), false)),
            Some(cs) => {
                cs.ensure_open()?;
                Ok(WriteTarget::at(
                    &scope.tenancy,
                    Visibility::new_change_set(cs.pk),
                    false,
                ))
            }
        }
    }

    /// Target for a function result that was scheduled against `scope` and
    /// may finish after the change set closed.
    ///
    /// - open: the change set itself
    /// - applied: HEAD, where the change set's rows now live
    /// - canceled: the change set's own visibility, already deleted, so the
    ///   result is recorded but inert
    pub async fn result_target(&self, scope: &Scope) -> GraphResult<WriteTarget> {
        scope.tenancy.validate()?;
        match self.change_set(scope.change_set_pk).await? {
            None => Ok(WriteTarget::at(&scope.tenancy, Visibility::new_head(), false)),
            Some(cs) => match cs.status {
                ChangeSetStatus::Open => Ok(WriteTarget::at(
                    &scope.tenancy,
                    Visibility::new_change_set(cs.pk),
                    false,
                )),
                ChangeSetStatus::Applied => {
                    Ok(WriteTarget::at(&scope.tenancy, Visibility::new_head(), false))
                }
                ChangeSetStatus::Canceled => Ok(WriteTarget::at(
                    &scope.tenancy,
                    Visibility::new(cs.pk, Some(Utc::now())),
                    true,
                )),
            },
        }
    }
}

impl std::fmt::Debug for ScopeResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeResolver").finish_non_exhaustive()
    }
}
