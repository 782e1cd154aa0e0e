use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use protorun::engine::RuntimeEvent;
use protorun::exec::{
    BackendFuture, DispatchOutcome, DispatchRequest, ExecutionFuture, ExecutionRequest,
    ExecutionResponse, Executor, ExecutorBackend,
};
use protorun::types::StepRunId;

/// Shared script: per work item, the responses to hand out in order.
/// Items without a (remaining) script succeed with output `"ok"`.
type Script<T> = Arc<Mutex<HashMap<String, VecDeque<T>>>>;

fn next_scripted<T>(script: &Script<T>, item: &str) -> Option<T> {
    script
        .lock()
        .unwrap()
        .get_mut(item)
        .and_then(|queue| queue.pop_front())
}

/// An `Executor` that:
/// - records every request it receives
/// - answers from a per-item script, optionally after a delay.
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    script: Script<(ExecutionResponse, Duration)>,
    calls: Arc<Mutex<Vec<ExecutionRequest>>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `response` for the next execution of `item`.
    pub fn respond(self, item: &str, response: ExecutionResponse) -> Self {
        self.respond_after(item, response, Duration::ZERO)
    }

    pub fn respond_after(self, item: &str, response: ExecutionResponse, delay: Duration) -> Self {
        self.script
            .lock()
            .unwrap()
            .entry(item.to_string())
            .or_default()
            .push_back((response, delay));
        self
    }

    /// Requests received so far, in order.
    pub fn calls(&self) -> Vec<ExecutionRequest> {
        self.calls.lock().unwrap().clone()
    }

    /// Work item ids executed so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.calls().into_iter().map(|r| r.work_item_id).collect()
    }
}

impl Executor for ScriptedExecutor {
    fn execute(&self, request: ExecutionRequest) -> ExecutionFuture<'_> {
        Box::pin(async move {
            let (response, delay) = next_scripted(&self.script, &request.work_item_id)
                .unwrap_or_else(|| (ExecutionResponse::success("ok"), Duration::ZERO));
            self.calls.lock().unwrap().push(request);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(response)
        })
    }
}

/// A fake `ExecutorBackend` that:
/// - records which items were dispatched and which StepRuns were cancelled
/// - immediately reports `DispatchFinished` with the scripted outcome.
pub struct FakeBackend {
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    script: Script<DispatchOutcome>,
    executed: Arc<Mutex<Vec<String>>>,
    cancelled: Arc<Mutex<Vec<StepRunId>>>,
}

impl FakeBackend {
    pub fn new(runtime_tx: mpsc::Sender<RuntimeEvent>) -> Self {
        Self {
            runtime_tx,
            script: Arc::default(),
            executed: Arc::default(),
            cancelled: Arc::default(),
        }
    }

    /// Queue `outcome` for the next dispatch of `item`.
    pub fn respond(self, item: &str, outcome: DispatchOutcome) -> Self {
        self.script
            .lock()
            .unwrap()
            .entry(item.to_string())
            .or_default()
            .push_back(outcome);
        self
    }

    pub fn executed(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.executed)
    }

    pub fn cancelled(&self) -> Arc<Mutex<Vec<StepRunId>>> {
        Arc::clone(&self.cancelled)
    }
}

impl ExecutorBackend for FakeBackend {
    fn dispatch(&mut self, requests: Vec<DispatchRequest>) -> BackendFuture<'_> {
        let tx = self.runtime_tx.clone();
        let script = Arc::clone(&self.script);
        let executed = Arc::clone(&self.executed);

        Box::pin(async move {
            for request in requests {
                let item = request.execution.work_item_id.clone();
                executed.lock().unwrap().push(item.clone());

                let outcome = next_scripted(&script, &item)
                    .unwrap_or_else(|| DispatchOutcome::success("ok"));
                tx.send(RuntimeEvent::DispatchFinished {
                    step_run_id: request.step_run_id,
                    outcome,
                })
                .await
                .map_err(anyhow::Error::from)?;
            }
            Ok(())
        })
    }

    fn cancel(&mut self, step_run_ids: Vec<StepRunId>) -> BackendFuture<'_> {
        self.cancelled.lock().unwrap().extend(step_run_ids);
        Box::pin(async { Ok(()) })
    }
}
