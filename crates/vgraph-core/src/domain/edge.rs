//! Edges between components.

use serde::{Deserialize, Serialize};

use super::ids::{ComponentId, EdgeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Containment: a child placed inside a frame.
    Symbolic,
    /// A socket wiring that carries values between components.
    Configuration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub kind: EdgeKind,
    pub from_component: ComponentId,
    pub to_component: ComponentId,
    #[serde(default)]
    pub socket: Option<String>,
}

impl Edge {
    pub fn new(
        kind: EdgeKind,
        from_component: ComponentId,
        to_component: ComponentId,
        socket: Option<String>,
    ) -> Self {
        Self {
            id: EdgeId::generate(),
            kind,
            from_component,
            to_component,
            socket,
        }
    }
}
