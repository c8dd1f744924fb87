//! Execution controls: per-attempt timeout, and the caller-side retry loop
//! with capped exponential backoff.
//!
//! The pipeline itself never retries. Callers that need retries (propagation,
//! fix batches) wrap [`FuncPipeline::execute`](super::FuncPipeline::execute)
//! in [`retry_faults`] so the attempt count stays visible to them.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::PipelineResult;
use crate::metrics::METRICS;

/// Configuration for sandboxed function execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Maximum wall-clock time for a single attempt (milliseconds).
    pub timeout_ms: u64,
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries (milliseconds).
    pub backoff_base_ms: u64,
    /// Upper bound on a single backoff delay (milliseconds).
    pub max_backoff_ms: u64,
    /// External commands functions may launch.
    pub commands: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 2,
            backoff_base_ms: 500,
            max_backoff_ms: 10_000,
            commands: vec!["aws".to_string()],
        }
    }
}

impl SandboxConfig {
    /// Delay before retry number `attempt` (1-based attempt that just failed).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let ms = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// The final result of a retried operation and how many attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T> {
    pub result: PipelineResult<T>,
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails with a non-retryable fault, or the
/// retry budget is spent.
pub async fn retry_faults<T, F, Fut>(config: &SandboxConfig, mut op: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = PipelineResult<T>>,
{
    let max_attempts = config.max_retries + 1;
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(fault) => {
                METRICS.inc_execution_faults();
                if !fault.is_retryable() || attempt >= max_attempts {
                    return RetryOutcome {
                        result: Err(fault),
                        attempts: attempt,
                    };
                }
                let delay = config.backoff_delay(attempt);
                warn!(
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %fault,
                    "retrying after execution fault"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
