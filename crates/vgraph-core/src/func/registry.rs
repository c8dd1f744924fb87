//! The pluggable function seam.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::context::FuncContext;
use super::error::{ExecutionFault, PipelineResult};
use super::kind::{FuncKind, FuncResult};
use super::snapshot::InputSnapshot;

/// An executable unit. Stateless between invocations.
///
/// `run` must return a result whose kind matches [`Func::kind`]. Functional
/// failure is a result value; `Err` is reserved for sandbox faults.
#[async_trait]
pub trait Func: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> FuncKind;

    async fn run(&self, ctx: &FuncContext, input: &InputSnapshot) -> PipelineResult<FuncResult>;
}

/// Functions by name.
#[derive(Clone, Default)]
pub struct FuncRegistry {
    funcs: BTreeMap<String, Arc<dyn Func>>,
}

impl FuncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function, replacing any previous one of the same name.
    pub fn with_func(mut self, func: Arc<dyn Func>) -> Self {
        self.register(func);
        self
    }

    pub fn register(&mut self, func: Arc<dyn Func>) {
        self.funcs.insert(func.name().to_string(), func);
    }

    pub fn get(&self, name: &str) -> PipelineResult<Arc<dyn Func>> {
        self.funcs
            .get(name)
            .cloned()
            .ok_or_else(|| ExecutionFault::FuncNotFound {
                name: name.to_string(),
            })
    }

    pub fn names(&self) -> Vec<&str> {
        self.funcs.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for FuncRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuncRegistry")
            .field("funcs", &self.names())
            .finish()
    }
}
