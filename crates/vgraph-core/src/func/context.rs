//! The sandbox boundary a function runs inside.

use std::sync::Arc;

use vgraph_state::{ChangeSetPk, Tenancy};

use super::command::{CommandOutput, CommandRunner};
use super::error::{ExecutionFault, PipelineResult};
use super::policy::{CommandPolicy, CommandVerdict};
use crate::events::{Event, EventDispatcher, EventPayload, OutputStream};

/// Handed to a function for one invocation.
///
/// Holds no graph state. The only outward capability is [`run`](Self::run),
/// which launches declared commands and streams their output as
/// `CommandOutput` / `CommandReturn` events.
pub struct FuncContext {
    execution_id: String,
    func: String,
    tenancy: Tenancy,
    change_set_pk: ChangeSetPk,
    runner: Arc<dyn CommandRunner>,
    policy: Arc<CommandPolicy>,
    events: Arc<EventDispatcher>,
}

impl FuncContext {
    pub fn new(
        func: impl Into<String>,
        tenancy: Tenancy,
        change_set_pk: ChangeSetPk,
        runner: Arc<dyn CommandRunner>,
        policy: Arc<CommandPolicy>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            func: func.into(),
            tenancy,
            change_set_pk,
            runner,
            policy,
            events,
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn func(&self) -> &str {
        &self.func
    }

    /// Launch a declared command. A non-zero exit is returned, not raised.
    pub async fn run(
        &self,
        command: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> PipelineResult<CommandOutput> {
        if let CommandVerdict::Denied { reason } = self.policy.evaluate(command) {
            return Err(ExecutionFault::CommandNotDeclared {
                command: command.to_string(),
                reason,
            });
        }

        let output = self.runner.run(command, args, stdin).await?;

        for (stream, text) in [
            (OutputStream::Stdout, &output.stdout),
            (OutputStream::Stderr, &output.stderr),
        ] {
            for line in text.lines() {
                self.publish(EventPayload::CommandOutput {
                    execution_id: self.execution_id.clone(),
                    func: self.func.clone(),
                    stream,
                    line: line.to_string(),
                })?;
            }
        }
        self.publish(EventPayload::CommandReturn {
            execution_id: self.execution_id.clone(),
            func: self.func.clone(),
            command: command.to_string(),
            exit_code: output.exit_code,
        })?;

        Ok(output)
    }

    fn publish(&self, payload: EventPayload) -> PipelineResult<()> {
        let event = Event::new(self.tenancy.clone(), self.change_set_pk, payload);
        self.events
            .dispatch(event)
            .map(|_| ())
            .map_err(|err| ExecutionFault::EventRejected {
                reason: err.to_string(),
            })
    }
}

impl std::fmt::Debug for FuncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuncContext")
            .field("execution_id", &self.execution_id)
            .field("func", &self.func)
            .field("change_set_pk", &self.change_set_pk)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventsConfig;
    use crate::events::EventKind;
    use crate::func::command::ScriptedCommandRunner;

    fn context(runner: ScriptedCommandRunner) -> (FuncContext, Arc<EventDispatcher>) {
        let events = Arc::new(EventDispatcher::standard(&EventsConfig::default()));
        let ctx = FuncContext::new(
            "test:func",
            Tenancy::new_universal(),
            ChangeSetPk::HEAD,
            Arc::new(runner),
            Arc::new(CommandPolicy::declared(&["aws"])),
            events.clone(),
        );
        (ctx, events)
    }

    #[tokio::test]
    async fn test_undeclared_command_never_launches() {
        let runner = ScriptedCommandRunner::always(CommandOutput::success(""));
        let (ctx, _) = context(runner.clone());
        let err = ctx.run("rm", &["-rf".into()], None).await.unwrap_err();
        assert!(matches!(err, ExecutionFault::CommandNotDeclared { .. }));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_output_is_streamed_as_events() {
        let runner = ScriptedCommandRunner::always(CommandOutput {
            exit_code: 3,
            stdout: "one\ntwo".into(),
            stderr: "warn".into(),
        });
        let (ctx, events) = context(runner);
        let mut returns = events.subscribe(EventKind::CommandReturn).unwrap();

        let out = ctx.run("aws", &[], None).await.unwrap();
        assert_eq!(out.exit_code, 3);

        let lines: Vec<String> = events
            .channel(EventKind::CommandOutput)
            .unwrap()
            .retained()
            .into_iter()
            .filter_map(|e| match e.payload {
                EventPayload::CommandOutput { line, .. } => Some(line),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec!["one", "two", "warn"]);

        match returns.try_recv().map(|e| e.payload) {
            Some(EventPayload::CommandReturn { exit_code, .. }) => assert_eq!(exit_code, 3),
            other => panic!("expected CommandReturn, got {other:?}"),
        }
    }
}
