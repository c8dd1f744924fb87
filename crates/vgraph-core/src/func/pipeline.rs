//! `execute(func, kind, snapshot, sandbox) -> FuncResult`.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, instrument};

use super::command::CommandRunner;
use super::context::FuncContext;
use super::controls::SandboxConfig;
use super::error::{ExecutionFault, PipelineResult};
use super::kind::{FuncKind, FuncResult};
use super::policy::CommandPolicy;
use super::registry::FuncRegistry;
use super::snapshot::InputSnapshot;
use crate::events::EventDispatcher;
use crate::metrics::METRICS;
use crate::obs;

/// Runs registered functions against immutable snapshots.
///
/// Each invocation runs on its own task under the sandbox timeout; on
/// timeout the task is aborted. No invocation is retried here.
#[derive(Clone)]
pub struct FuncPipeline {
    registry: Arc<FuncRegistry>,
    runner: Arc<dyn CommandRunner>,
    policy: Arc<CommandPolicy>,
    events: Arc<EventDispatcher>,
}

impl FuncPipeline {
    pub fn new(
        registry: Arc<FuncRegistry>,
        runner: Arc<dyn CommandRunner>,
        policy: Arc<CommandPolicy>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            registry,
            runner,
            policy,
            events,
        }
    }

    pub fn registry(&self) -> &FuncRegistry {
        &self.registry
    }

    /// Declared kind of a registered function.
    pub fn kind_of(&self, func_name: &str) -> PipelineResult<FuncKind> {
        Ok(self.registry.get(func_name)?.kind())
    }

    #[instrument(skip(self, input, sandbox), fields(component_id = %input.component_id))]
    pub async fn execute(
        &self,
        func_name: &str,
        kind: FuncKind,
        input: Arc<InputSnapshot>,
        sandbox: &SandboxConfig,
    ) -> PipelineResult<FuncResult> {
        let func = self.registry.get(func_name)?;
        if func.kind() != kind {
            return Err(ExecutionFault::MalformedInput {
                reason: format!("{func_name} is a {} function, not {kind}", func.kind()),
            });
        }

        let ctx = FuncContext::new(
            func_name,
            input.tenancy.clone(),
            input.change_set_pk,
            self.runner.clone(),
            self.policy.clone(),
            self.events.clone(),
        );
        debug!(execution_id = %ctx.execution_id(), "executing function");

        let started = Instant::now();
        let task = tokio::spawn(async move { func.run(&ctx, &input).await });
        let abort = task.abort_handle();

        let outcome = match tokio::time::timeout(sandbox.timeout(), task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ExecutionFault::Crashed {
                func: func_name.to_string(),
                reason: join_err.to_string(),
            }),
            Err(_elapsed) => {
                abort.abort();
                Err(ExecutionFault::Timeout {
                    func: func_name.to_string(),
                    limit_ms: sandbox.timeout_ms,
                })
            }
        };

        let outcome = outcome.and_then(|result| {
            if result.kind() == kind {
                Ok(result)
            } else {
                Err(ExecutionFault::Crashed {
                    func: func_name.to_string(),
                    reason: format!("returned a {} result", result.kind()),
                })
            }
        });

        METRICS.inc_func_executions();
        obs::emit_func_executed(
            func_name,
            kind,
            started.elapsed().as_millis() as u64,
            outcome.is_ok(),
        );
        outcome
    }
}

impl std::fmt::Debug for FuncPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuncPipeline")
            .field("registry", &self.registry)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventsConfig;
    use crate::domain::{Component, ComponentType};
    use crate::func::command::{CommandOutput, ScriptedCommandRunner};
    use crate::func::kind::QualificationResult;
    use crate::func::registry::Func;
    use async_trait::async_trait;
    use std::time::Duration;
    use vgraph_state::{ChangeSetPk, Tenancy};

    struct Sleepy;

    #[async_trait]
    impl Func for Sleepy {
        fn name(&self) -> &str {
            "test:sleepy"
        }
        fn kind(&self) -> FuncKind {
            FuncKind::Qualification
        }
        async fn run(&self, _: &FuncContext, _: &InputSnapshot) -> PipelineResult<FuncResult> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(FuncResult::Qualification(QualificationResult {
                qualified: true,
                message: None,
            }))
        }
    }

    struct Liar;

    #[async_trait]
    impl Func for Liar {
        fn name(&self) -> &str {
            "test:liar"
        }
        fn kind(&self) -> FuncKind {
            FuncKind::Qualification
        }
        async fn run(&self, _: &FuncContext, _: &InputSnapshot) -> PipelineResult<FuncResult> {
            Ok(FuncResult::Attribute(serde_json::Value::Null))
        }
    }

    fn pipeline() -> FuncPipeline {
        let registry = FuncRegistry::new()
            .with_func(Arc::new(Sleepy))
            .with_func(Arc::new(Liar));
        FuncPipeline::new(
            Arc::new(registry),
            Arc::new(ScriptedCommandRunner::always(CommandOutput::success(""))),
            Arc::new(CommandPolicy::empty()),
            Arc::new(EventDispatcher::standard(&EventsConfig::default())),
        )
    }

    fn snapshot() -> Arc<InputSnapshot> {
        let c = Component::new("c", "v", ComponentType::Component, serde_json::json!({}));
        Arc::new(InputSnapshot::of_component(
            &c,
            Tenancy::new_universal(),
            ChangeSetPk::HEAD,
        ))
    }

    fn sandbox(timeout_ms: u64) -> SandboxConfig {
        SandboxConfig {
            timeout_ms,
            ..SandboxConfig::default()
        }
    }

    #[tokio::test]
    async fn test_timeout_is_a_fault() {
        let err = pipeline()
            .execute("test:sleepy", FuncKind::Qualification, snapshot(), &sandbox(20))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ExecutionFault::Timeout {
                func: "test:sleepy".into(),
                limit_ms: 20
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_func_is_a_fault() {
        let err = pipeline()
            .execute("test:nope", FuncKind::Fix, snapshot(), &sandbox(1_000))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionFault::FuncNotFound { .. }));
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_malformed_input() {
        let err = pipeline()
            .execute("test:sleepy", FuncKind::Fix, snapshot(), &sandbox(1_000))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionFault::MalformedInput { .. }));
    }

    #[tokio::test]
    async fn test_wrong_result_shape_is_a_crash() {
        let err = pipeline()
            .execute("test:liar", FuncKind::Qualification, snapshot(), &sandbox(1_000))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionFault::Crashed { .. }));
    }
}
