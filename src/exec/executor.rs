// src/exec/executor.rs

//! Executor capability and the registry it is resolved from.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::WorkItemId;

/// What an executor is asked to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub work_item_id: WorkItemId,
    pub prompt: String,
    pub context_refs: Vec<String>,
    pub model: Option<String>,
    pub timeout: Duration,
    pub attempt: u32,
    /// Answer given while the step was blocked, if any.
    pub answer: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub status: ExecutionStatus,
    pub output: String,
    pub error_detail: Option<String>,
    /// Failure reason code, e.g. `clarification_required`.
    pub reason: Option<String>,
}

impl ExecutionResponse {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Success,
            output: output.into(),
            error_detail: None,
            reason: None,
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Error,
            output: String::new(),
            error_detail: Some(detail.into()),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

pub type ExecutionFuture<'a> =
    Pin<Box<dyn Future<Output = anyhow::Result<ExecutionResponse>> + Send + 'a>>;

/// Opaque capability that produces a step's output.
///
/// Dropping the returned future must abandon the work; the dispatcher drops
/// it on timeout and on cancellation.
pub trait Executor: Send + Sync {
    fn execute(&self, request: ExecutionRequest) -> ExecutionFuture<'_>;
}

/// Executors keyed by engine id, resolved at dispatch time.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: BTreeMap<String, Arc<dyn Executor>>,
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("engines", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `shell` engine.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(super::shell::ENGINE_ID, Arc::new(super::shell::ShellExecutor));
        registry
    }

    pub fn register(&mut self, engine_id: impl Into<String>, executor: Arc<dyn Executor>) {
        self.executors.insert(engine_id.into(), executor);
    }

    pub fn get(&self, engine_id: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(engine_id).cloned()
    }

    pub fn engines(&self) -> impl Iterator<Item = &str> {
        self.executors.keys().map(|k| k.as_str())
    }
}
