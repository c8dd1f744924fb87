//! vgraph Core Library
//!
//! A change-set scoped component graph. Every read and write runs under a
//! [`Scope`] (tenancy + change set); edits branch at row granularity and
//! merge into HEAD when their change set is applied. Attribute edits
//! propagate through the dependency graph, running qualification,
//! code-generation and other functions through a sandboxed pipeline, and
//! every observable outcome is published on a typed event bus.

pub mod builtins;
pub mod change_set;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod events;
pub mod fix;
pub mod frame;
pub mod func;
pub mod metrics;
pub mod obs;
pub mod propagation;
pub mod scope;
pub mod store;
pub mod telemetry;

pub use builtins::{builtin_registry, builtin_variants};
pub use change_set::ChangeSetManager;
pub use config::{ConfigError, EngineConfig, EventsConfig, PropagationConfig, StorageConfig};
pub use domain::{
    AttributeValue, AttributeValueId, Component, ComponentId, ComponentType, Derivation, Edge,
    EdgeId, EdgeKind, InstalledPkg, SchemaVariant, ValueStatus,
};
pub use engine::{GraphEngine, Scheduled};
pub use error::{GraphError, GraphResult};
pub use events::{
    DispatchError, Event, EventDispatcher, EventKind, EventPayload, Retention, Subscription,
};
pub use fix::{FixRequest, FixRunner};
pub use frame::FrameConnection;
pub use func::{
    CommandOutput, CommandPolicy, CommandRunner, ExecutionFault, Func, FuncContext, FuncKind,
    FuncPipeline, FuncRegistry, FuncResult, InputSnapshot, SandboxConfig, ScriptedCommandRunner,
    TokioCommandRunner,
};
pub use propagation::{PropagationEngine, PropagationHandle, PropagationReport};
pub use scope::{Scope, ScopeResolver};
pub use store::GraphStore;

pub use metrics::METRICS;
pub use obs::{change_set_span, ChangeSetSpan};
pub use telemetry::init_tracing;

/// vgraph version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
