//! Visibility: the `(change set | HEAD, deleted_at)` pair stamped on every row,
//! and the read filter computed from it.
//!
//! Branching is row-level copy-on-write: editing an entity inside a change set
//! writes a new row carrying that change set's pk. Reads inside the change set
//! see that row in place of the HEAD row; reads at HEAD never see it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::VersionedRow;
use crate::tenancy::Tenancy;

/// Primary key of a change set. The nil uuid is reserved for HEAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeSetPk(pub Uuid);

impl ChangeSetPk {
    /// The merge target every change set is applied into.
    pub const HEAD: ChangeSetPk = ChangeSetPk(Uuid::nil());

    pub fn generate() -> Self {
        ChangeSetPk(Uuid::new_v4())
    }

    pub fn is_head(&self) -> bool {
        self.0.is_nil()
    }
}

impl std::fmt::Display for ChangeSetPk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_head() {
            write!(f, "HEAD")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::str::FromStr for ChangeSetPk {
    type Err = uuid::Error;

    /// Accepts `HEAD` (any case) or a uuid.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("head") {
            return Ok(ChangeSetPk::HEAD);
        }
        Uuid::parse_str(s).map(ChangeSetPk)
    }
}

/// The visibility half of a row's composite scope key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visibility {
    pub change_set_pk: ChangeSetPk,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Visibility {
    pub fn new(change_set_pk: ChangeSetPk, deleted_at: Option<DateTime<Utc>>) -> Self {
        Self {
            change_set_pk,
            deleted_at,
        }
    }

    /// Live rows at HEAD.
    pub fn new_head() -> Self {
        Self::new(ChangeSetPk::HEAD, None)
    }

    /// Live rows inside a change set.
    pub fn new_change_set(change_set_pk: ChangeSetPk) -> Self {
        Self::new(change_set_pk, None)
    }

    pub fn is_head(&self) -> bool {
        self.change_set_pk.is_head()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A resolved, deterministic read predicate.
///
/// Produced by the scope resolver after the requested change set has been
/// checked against its lifecycle status; `change_set_pk` is therefore always
/// HEAD or an open change set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadFilter {
    pub tenancy: Tenancy,
    pub change_set_pk: ChangeSetPk,
    pub include_deleted: bool,
}

impl ReadFilter {
    pub fn new(tenancy: Tenancy, change_set_pk: ChangeSetPk, include_deleted: bool) -> Self {
        Self {
            tenancy,
            change_set_pk,
            include_deleted,
        }
    }

    /// Pick the visible row for one entity out of all of its stored rows.
    ///
    /// A row scoped to the filter's change set shadows the HEAD row. A
    /// shadowing row that is deleted hides the entity unless deleted rows were
    /// requested.
    pub fn pick<'a>(&self, rows: &'a [VersionedRow]) -> Option<&'a VersionedRow> {
        let in_scope = |row: &&VersionedRow| self.tenancy.can_read(&row.tenancy);

        let chosen = if self.change_set_pk.is_head() {
            None
        } else {
            rows.iter()
                .filter(in_scope)
                .filter(|r| r.visibility.change_set_pk == self.change_set_pk)
                .max_by_key(|r| r.updated_at)
        };

        let chosen = chosen.or_else(|| {
            rows.iter()
                .filter(in_scope)
                .filter(|r| r.visibility.is_head())
                .max_by_key(|r| r.updated_at)
        })?;

        if chosen.visibility.is_deleted() && !self.include_deleted {
            return None;
        }
        Some(chosen)
    }

    /// Apply [`pick`](Self::pick) per entity over a mixed set of rows.
    ///
    /// Output is ordered by entity creation time, then entity id, so repeated
    /// reads are deterministic.
    pub fn select(&self, rows: Vec<VersionedRow>) -> Vec<VersionedRow> {
        let mut by_entity: BTreeMap<String, Vec<VersionedRow>> = BTreeMap::new();
        for row in rows {
            by_entity.entry(row.entity_id.clone()).or_default().push(row);
        }

        let mut visible: Vec<VersionedRow> = by_entity
            .values()
            .filter_map(|group| self.pick(group).cloned())
            .collect();
        visible.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        visible
    }
}
