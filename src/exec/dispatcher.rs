// src/exec/dispatcher.rs

//! Executes one StepRun against its executor, bounded by a timeout and a
//! cancellation token.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::executor::{ExecutionRequest, ExecutionStatus, Executor, ExecutorRegistry};
use crate::types::{FailureReason, StepRunId};

/// A StepRun the core has moved to `Running` and wants executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub step_run_id: StepRunId,
    pub engine_id: String,
    pub execution: ExecutionRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Success,
    ExecutorError,
    Timeout,
    /// The dispatch was abandoned through its cancellation token.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub status: DispatchStatus,
    pub output: String,
    pub error_detail: Option<String>,
    /// Reason code reported by the executor, if any.
    pub reason: Option<String>,
    pub duration: Duration,
}

impl DispatchOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            status: DispatchStatus::Success,
            output: output.into(),
            error_detail: None,
            reason: None,
            duration: Duration::ZERO,
        }
    }

    pub fn executor_error(detail: impl Into<String>) -> Self {
        Self {
            status: DispatchStatus::ExecutorError,
            output: String::new(),
            error_detail: Some(detail.into()),
            reason: None,
            duration: Duration::ZERO,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            status: DispatchStatus::Timeout,
            output: String::new(),
            error_detail: Some(format!("timed out after {after:?}")),
            reason: None,
            duration: after,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: DispatchStatus::Cancelled,
            output: String::new(),
            error_detail: None,
            reason: None,
            duration: Duration::ZERO,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Reason fed to the feedback router when the dispatch did not succeed.
    pub fn failure_reason(&self) -> FailureReason {
        match (&self.reason, self.status) {
            (Some(reason), _) => FailureReason::new(reason.as_str()),
            (None, DispatchStatus::Timeout) => FailureReason::new(FailureReason::TIMEOUT),
            (None, _) => FailureReason::new(FailureReason::EXECUTOR_ERROR),
        }
    }
}

/// Resolve the engine and run the request.
///
/// Never fails: unknown engines, executor errors, timeouts and cancellation
/// all come back as a [`DispatchOutcome`].
pub async fn dispatch(
    registry: &ExecutorRegistry,
    request: DispatchRequest,
    cancel: CancellationToken,
) -> DispatchOutcome {
    let Some(executor) = registry.get(&request.engine_id) else {
        warn!(
            step_run_id = request.step_run_id,
            engine = %request.engine_id,
            "no executor registered for engine"
        );
        return DispatchOutcome::executor_error(format!(
            "unknown engine '{}'",
            request.engine_id
        ));
    };

    run_with_executor(executor, request, cancel).await
}

async fn run_with_executor(
    executor: Arc<dyn Executor>,
    request: DispatchRequest,
    cancel: CancellationToken,
) -> DispatchOutcome {
    let started = Instant::now();
    let limit = request.execution.timeout;
    let step_run_id = request.step_run_id;

    debug!(step_run_id, engine = %request.engine_id, ?limit, "dispatching");

    let mut outcome = tokio::select! {
        _ = cancel.cancelled() => {
            info!(step_run_id, "dispatch cancelled");
            DispatchOutcome::cancelled()
        }
        res = tokio::time::timeout(limit, executor.execute(request.execution)) => match res {
            Err(_elapsed) => {
                warn!(step_run_id, ?limit, "dispatch timed out");
                DispatchOutcome::timeout(limit)
            }
            Ok(Err(err)) => {
                warn!(step_run_id, error = %err, "executor failed");
                DispatchOutcome::executor_error(format!("{err:#}"))
            }
            Ok(Ok(response)) => match response.status {
                ExecutionStatus::Success => DispatchOutcome::success(response.output),
                ExecutionStatus::Error => DispatchOutcome {
                    status: DispatchStatus::ExecutorError,
                    output: response.output,
                    error_detail: response.error_detail,
                    reason: response.reason,
                    duration: Duration::ZERO,
                },
            },
        }
    };

    outcome.duration = started.elapsed();
    outcome
}
