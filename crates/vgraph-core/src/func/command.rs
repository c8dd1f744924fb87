//! The command-execution capability handed to functions.
//!
//! Functions never spawn processes themselves. They call
//! [`FuncContext::run`](super::FuncContext::run), which checks the command
//! policy and delegates to the injected [`CommandRunner`].

use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::error::{ExecutionFault, PipelineResult};

/// Captured result of one external process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Launches external processes.
///
/// A non-zero exit is returned as `Ok`; only a failure to launch or talk to
/// the process is an [`ExecutionFault`].
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        command: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> PipelineResult<CommandOutput>;
}

/// Runs commands as real child processes.
///
/// Children are killed when their future is dropped, so a timed-out function
/// does not leave its subprocess behind.
#[derive(Debug, Clone, Default)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(
        &self,
        command: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> PipelineResult<CommandOutput> {
        debug!(command = %command, args = ?args, "launching command");
        let launch_failed = |err: std::io::Error| ExecutionFault::LaunchFailed {
            command: command.to_string(),
            reason: err.to_string(),
        };

        let mut child = Command::new(command)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(launch_failed)?;

        // Feed stdin while draining stdout/stderr; a child that writes before
        // it has read all of its input would otherwise block on a full pipe.
        let pipe = child.stdin.take();
        let feed = async move {
            if let (Some(input), Some(mut pipe)) = (stdin, pipe) {
                match pipe.write_all(input.as_bytes()).await {
                    // The child exited without reading everything.
                    Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {}
                    other => other?,
                }
            }
            Ok::<(), std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        fed.map_err(launch_failed)?;
        let output = output.map_err(launch_failed)?;
        Ok(CommandOutput {
            // Killed by a signal: no exit code.
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// A command invocation observed by [`ScriptedCommandRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub command: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

type Script = dyn Fn(&RecordedCommand) -> PipelineResult<CommandOutput> + Send + Sync;

/// Deterministic runner for tests and dry runs: answers every invocation from
/// a script and records what was asked.
#[derive(Clone)]
pub struct ScriptedCommandRunner {
    script: Arc<Script>,
    calls: Arc<Mutex<Vec<RecordedCommand>>>,
}

impl ScriptedCommandRunner {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&RecordedCommand) -> PipelineResult<CommandOutput> + Send + Sync + 'static,
    {
        Self {
            script: Arc::new(script),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Answer every invocation with the same output.
    pub fn always(output: CommandOutput) -> Self {
        Self::new(move |_| Ok(output.clone()))
    }

    /// Every invocation seen so far, in order.
    pub fn calls(&self) -> Vec<RecordedCommand> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl std::fmt::Debug for ScriptedCommandRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedCommandRunner")
            .field("calls", &self.calls().len())
            .finish()
    }
}

#[async_trait]
impl CommandRunner for ScriptedCommandRunner {
    async fn run(
        &self,
        command: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> PipelineResult<CommandOutput> {
        let call = RecordedCommand {
            command: command.to_string(),
            args: args.to_vec(),
            stdin: stdin.map(str::to_string),
        };
        let result = (self.script)(&call);
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(call);
        result
    }
}
