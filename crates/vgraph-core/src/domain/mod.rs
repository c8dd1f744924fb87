//! Typed graph entities and their storage mapping.
//!
//! Each entity implements [`Versioned`], which ties it to one versioned table
//! and a stable entity id. The graph store serializes entities into the
//! `object` column of a [`vgraph_state::VersionedRow`].

pub mod attribute;
pub mod component;
pub mod edge;
pub mod ids;
pub mod installed_pkg;
pub mod schema_variant;

use serde::de::DeserializeOwned;
use serde::Serialize;
use vgraph_state::EntityTable;

pub use attribute::{AttributeValue, Derivation, ValueStatus};
pub use component::{Component, ComponentType};
pub use edge::{Edge, EdgeKind};
pub use ids::{AttributeValueId, ComponentId, EdgeId, InstalledPkgId};
pub use installed_pkg::InstalledPkg;
pub use schema_variant::{FuncBinding, OutputSocket, SchemaVariant};

/// An entity stored as versioned rows.
pub trait Versioned: Serialize + DeserializeOwned + Clone + Send + Sync {
    const TABLE: EntityTable;

    fn entity_id(&self) -> String;
}

impl Versioned for Component {
    const TABLE: EntityTable = EntityTable::Components;

    fn entity_id(&self) -> String {
        self.id.to_string()
    }
}

impl Versioned for AttributeValue {
    const TABLE: EntityTable = EntityTable::AttributeValues;

    fn entity_id(&self) -> String {
        self.id.to_string()
    }
}

impl Versioned for Edge {
    const TABLE: EntityTable = EntityTable::Edges;

    fn entity_id(&self) -> String {
        self.id.to_string()
    }
}

impl Versioned for InstalledPkg {
    const TABLE: EntityTable = EntityTable::InstalledPkgs;

    fn entity_id(&self) -> String {
        self.id.to_string()
    }
}
