//! Sandbox-level faults.
//!
//! A fault means the function could not run to completion. A function that
//! ran and reported failure (non-zero exit, `qualified = false`, fix status
//! `error`) returns `Ok` with that result instead.

/// Errors produced by the function execution pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionFault {
    #[error("could not launch {command}: {reason}")]
    LaunchFailed { command: String, reason: String },

    #[error("malformed function input: {reason}")]
    MalformedInput { reason: String },

    #[error("function {func} timed out after {limit_ms}ms")]
    Timeout { func: String, limit_ms: u64 },

    #[error("command {command} is not allowed in the sandbox: {reason}")]
    CommandNotDeclared { command: String, reason: String },

    #[error("function not found: {name}")]
    FuncNotFound { name: String },

    #[error("function {func} crashed: {reason}")]
    Crashed { func: String, reason: String },

    #[error("event publication rejected: {reason}")]
    EventRejected { reason: String },
}

impl ExecutionFault {
    /// Whether a caller may retry the invocation.
    ///
    /// Launch failures, timeouts and crashes are transient. Everything else
    /// would fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutionFault::LaunchFailed { .. }
                | ExecutionFault::Timeout { .. }
                | ExecutionFault::Crashed { .. }
        )
    }
}

/// Result type for pipeline operations.
pub type PipelineResult<T> = std::result::Result<T, ExecutionFault>;
