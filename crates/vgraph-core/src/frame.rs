//! Frames: placing a component inside a frame and wiring their sockets.
//!
//! A configuration frame pushes values down: each parent output socket feeds
//! the child's input socket of the same name. An aggregation frame pulls
//! values up: each child output socket feeds the parent's same-named input
//! socket.

use tracing::{debug, instrument};

use crate::domain::{AttributeValue, AttributeValueId, Component, ComponentId, ComponentType, Edge, EdgeKind};
use crate::error::{GraphError, GraphResult};
use crate::propagation::AttributeGraph;
use crate::scope::Scope;
use crate::store::GraphStore;

/// What a frame connection wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameConnection {
    /// The `Symbolic` containment edge, then one `Configuration` edge per
    /// wired socket.
    pub edges: Vec<Edge>,
    /// Output socket values now feeding the other side; propagation starts
    /// here.
    pub upstream: Vec<AttributeValueId>,
}

/// Place `child` in the frame `parent` and wire matching sockets.
///
/// Every wiring is checked against the attribute graph before anything is
/// written; a wiring that would close a cycle fails the whole connection.
/// The edges and socket rewiring are committed as one write.
#[instrument(skip(store), fields(scope = %scope))]
pub async fn connect_component_to_frame(
    store: &GraphStore,
    scope: &Scope,
    child_id: ComponentId,
    parent_id: ComponentId,
) -> GraphResult<FrameConnection> {
    store.resolver().write_target(scope).await?;
    let child = store.component(scope, child_id).await?;
    let parent = store.component(scope, parent_id).await?;

    let (source, dest): (&Component, &Component) = match parent.component_type {
        ComponentType::ConfigurationFrame => (&parent, &child),
        ComponentType::AggregationFrame => (&child, &parent),
        component_type => {
            return Err(GraphError::InvalidComponentTypeForFrame {
                component_id: parent.id,
                component_type,
            })
        }
    };

    let values = store.attribute_values(scope).await?;
    let mut graph = AttributeGraph::build(&values);

    let mut wirings: Vec<(&AttributeValue, AttributeValue)> = Vec::new();
    for output in values
        .iter()
        .filter(|av| av.component_id == source.id && av.is_output_socket())
    {
        let Some(socket) = output.socket_name() else {
            continue;
        };
        let input = values.iter().find(|av| {
            av.component_id == dest.id && av.is_input_socket() && av.socket_name() == Some(socket)
        });
        if let Some(input) = input {
            graph.add_dependency(output.id, input.id)?;
            wirings.push((output, input.clone()));
        }
    }
    debug!(sockets = wirings.len(), "frame sockets matched");

    let mut edit = store.edit(scope).await?;
    let containment = Edge::new(EdgeKind::Symbolic, child.id, parent.id, None);
    edit.create(&containment)?;
    let mut edges = vec![containment];
    let mut upstream = Vec::new();

    for (output, mut input) in wirings {
        if !input.depends_on.contains(&output.id) {
            input.depends_on.push(output.id);
            edit.update(&input).await?;
        }
        let edge = Edge::new(
            EdgeKind::Configuration,
            source.id,
            dest.id,
            output.socket_name().map(str::to_string),
        );
        edit.create(&edge)?;
        edges.push(edge);
        upstream.push(output.id);
    }

    edit.commit().await?;

    Ok(FrameConnection { edges, upstream })
}
