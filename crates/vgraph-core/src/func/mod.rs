//! Function execution pipeline: sandboxed, snapshot-pinned invocations of
//! pluggable functions.
//!
//! # Modules
//!
//! - [`kind`]: `FuncKind` and the result shapes
//! - [`snapshot`]: `InputSnapshot`, the immutable function input
//! - [`command`]: `CommandRunner` capability, real and scripted runners
//! - [`policy`]: `CommandPolicy` (first-match, default-deny)
//! - [`context`]: `FuncContext`, the sandbox boundary
//! - [`registry`]: `Func` trait and `FuncRegistry`
//! - [`controls`]: `SandboxConfig`, `retry_faults()`
//! - [`pipeline`]: `FuncPipeline::execute()`
//! - [`error`]: `ExecutionFault` / `PipelineResult`

pub mod command;
pub mod context;
pub mod controls;
pub mod error;
pub mod kind;
pub mod pipeline;
pub mod policy;
pub mod registry;
pub mod snapshot;

pub use command::{
    CommandOutput, CommandRunner, RecordedCommand, ScriptedCommandRunner, TokioCommandRunner,
};
pub use context::FuncContext;
pub use controls::{retry_faults, RetryOutcome, SandboxConfig};
pub use error::{ExecutionFault, PipelineResult};
pub use kind::{
    CodeFormat, CodeGenerationResult, FuncKind, FuncResult, QualificationResult, ResourceResult,
    ResourceStatus,
};
pub use pipeline::FuncPipeline;
pub use policy::{CommandPolicy, CommandRule, CommandVerdict};
pub use registry::{Func, FuncRegistry};
pub use snapshot::InputSnapshot;
