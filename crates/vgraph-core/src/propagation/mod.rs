//! Dependent-value propagation.
//!
//! - [`graph`]: `AttributeGraph`, Kahn levels and cycle detection
//! - [`engine`]: `PropagationEngine::propagate()` / `spawn()`

pub mod engine;
pub mod graph;

pub use engine::{PropagationEngine, PropagationHandle, PropagationReport};
pub use graph::AttributeGraph;
