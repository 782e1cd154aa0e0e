// src/engine/core.rs

//! Pure core runtime state machine.
//!
//! [`CoreRuntime`] is the single writer of a run's state. It consumes
//! [`RuntimeEvent`]s and returns [`CoreStep`]s: the commands the IO shell
//! should carry out next. It has no channels, no Tokio types and performs no
//! IO, so every scenario can be driven synchronously in tests.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::dag::{
    Assessment, Graph, Policy, PolicyMap, Run, StepOrigin, StepRun, StepRunTable, WorkItem,
    next_batch,
};
use crate::engine::event_handlers::{CoreCommand, CoreStep};
use crate::engine::events::{Event, EventKind, EventLog};
use crate::engine::feedback::FeedbackRouter;
use crate::engine::{RunSettings, RuntimeEvent, RuntimeOptions};
use crate::errors::{ProtorunError, TransitionError};
use crate::exec::{DispatchRequest, ExecutionRequest};
use crate::gates::GatePipeline;
use crate::types::{
    FailureReason, PolicyId, RunId, RunStatus, StepRunId, StepStatus, WorkItemId,
};

/// Serialisable view of a run: the persisted layout.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run: Run,
    pub items: Vec<WorkItem>,
    pub groups: Vec<Vec<WorkItemId>>,
    /// Policy ids attached to each node.
    pub policies: BTreeMap<WorkItemId, Vec<PolicyId>>,
    pub step_runs: Vec<StepRun>,
    pub events: Vec<Event>,
}

#[derive(Debug)]
pub struct CoreRuntime {
    pub(super) run: Run,
    pub(super) graph: Graph,
    pub(super) policies: PolicyMap,
    pub(super) step_runs: StepRunTable,
    pub(super) events: EventLog,
    pub(super) gates: GatePipeline,
    pub(super) router: FeedbackRouter,
    pub(super) settings: RunSettings,
    pub(super) options: RuntimeOptions,
    /// Unrecoverable failure waiting to end the run at the next settle.
    pub(super) fatal: Option<FailureReason>,
}

impl CoreRuntime {
    /// Create a run in `Pending`.
    pub fn new(
        run_id: RunId,
        settings: RunSettings,
        gates: GatePipeline,
        options: RuntimeOptions,
    ) -> Self {
        let router = FeedbackRouter::new(
            settings.max_attempts,
            settings.warn_is_failure,
            &settings.human_input_reasons,
        );
        Self {
            run: Run::new(run_id),
            graph: Graph::default(),
            policies: PolicyMap::default(),
            step_runs: StepRunTable::new(run_id),
            events: EventLog::new(run_id),
            gates,
            router,
            settings,
            options,
            fatal: None,
        }
    }

    /// Build the graph and attach policies: `Pending -> Planning -> Planned`,
    /// or `-> Failed` if validation rejects the input. Nothing is applied
    /// on failure.
    pub fn plan(
        &mut self,
        items: Vec<WorkItem>,
        policies: Vec<Policy>,
    ) -> Result<(), ProtorunError> {
        self.set_run_status(RunStatus::Planning, None)?;

        let resolved = Graph::build(items)
            .and_then(|graph| PolicyMap::resolve(&graph, policies).map(|map| (graph, map)));

        match resolved {
            Ok((graph, policies)) => {
                self.graph = graph;
                self.policies = policies;
                self.set_run_status(RunStatus::Planned, None)?;
                self.events.append(
                    None,
                    EventKind::RunTransition,
                    json!({ "planned_groups": self.graph.groups() }),
                );
                Ok(())
            }
            Err(err) => {
                warn!(run_id = self.run.id, error = %err, "planning failed");
                self.set_run_status(RunStatus::Failed, Some(err.to_string()))?;
                Err(err.into())
            }
        }
    }

    /// Handle a single runtime event, returning the commands for the IO
    /// shell.
    pub fn step(&mut self, event: RuntimeEvent) -> CoreStep {
        match event {
            RuntimeEvent::Command(command) => self.handle_command(command),
            RuntimeEvent::DispatchFinished {
                step_run_id,
                outcome,
            } => self.handle_dispatch_finished(step_run_id, outcome),
            RuntimeEvent::ShutdownRequested => self.handle_shutdown(),
        }
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn status(&self) -> RunStatus {
        self.run.status
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn policies(&self) -> &PolicyMap {
        &self.policies
    }

    pub fn step_runs(&self) -> &StepRunTable {
        &self.step_runs
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run: self.run.clone(),
            items: self.graph.items().cloned().collect(),
            groups: self.graph.groups().to_vec(),
            policies: self
                .policies
                .iter()
                .map(|(node, list)| (node.clone(), list.iter().map(|p| p.id.clone()).collect()))
                .collect(),
            step_runs: self.step_runs.iter().cloned().collect(),
            events: self.events.all().to_vec(),
        }
    }

    // ---- shared state helpers -------------------------------------------

    pub(super) fn set_run_status(
        &mut self,
        to: RunStatus,
        reason: Option<String>,
    ) -> Result<(), TransitionError> {
        let from = self.run.transition(to)?;
        self.run.status_reason = reason.clone();
        info!(run_id = self.run.id, %from, %to, "run status changed");
        self.events.append(
            None,
            EventKind::RunTransition,
            json!({ "from": from, "to": to, "reason": reason }),
        );
        Ok(())
    }

    /// Checked StepRun transition. Returns false (and logs) if rejected.
    pub(super) fn set_step_status(&mut self, id: StepRunId, to: StepStatus) -> bool {
        match self.step_runs.transition(id, to) {
            Ok(from) => {
                let item = self
                    .step_runs
                    .get(id)
                    .map(|s| s.work_item_id.clone())
                    .unwrap_or_default();
                self.events.append(
                    Some(id),
                    EventKind::StepTransition,
                    json!({ "item": item, "from": from, "to": to }),
                );
                true
            }
            Err(err) => {
                warn!(step_run_id = id, error = %err, "step transition rejected");
                false
            }
        }
    }

    pub(super) fn create_step(&mut self, item: &str, origin: StepOrigin) -> Option<StepRunId> {
        let id = self.step_runs.create(item, origin.clone())?;
        let attempt = self.step_runs.get(id).map(|s| s.attempt_count).unwrap_or(1);
        self.events.append(
            Some(id),
            EventKind::StepCreated,
            json!({ "item": item, "attempt": attempt, "origin": origin }),
        );
        Some(id)
    }

    pub(super) fn keep_running(&self) -> bool {
        !self.run.status.is_terminal()
    }

    /// End the run in `status`, cancelling every non-terminal StepRun.
    pub(super) fn finish(
        &mut self,
        status: RunStatus,
        reason: Option<String>,
        commands: &mut Vec<CoreCommand>,
    ) -> Result<(), TransitionError> {
        self.set_run_status(status, reason)?;

        let mut to_cancel = Vec::new();
        let open: Vec<(StepRunId, StepStatus)> = self
            .step_runs
            .iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| (s.id, s.status))
            .collect();

        for (id, current) in open {
            if current == StepStatus::Running {
                to_cancel.push(id);
            }
            self.set_step_status(id, StepStatus::Cancelled);
        }

        if !to_cancel.is_empty() {
            commands.push(CoreCommand::CancelDispatch(to_cancel));
        }
        commands.push(CoreCommand::RunFinished(status));
        Ok(())
    }

    /// Bring the run forward after any change: materialise unreachable
    /// nodes, resolve the run status, and dispatch the next batch.
    ///
    /// Returns whether the shell should keep running.
    pub(super) fn settle(&mut self, commands: &mut Vec<CoreCommand>) -> bool {
        if self.run.status.is_terminal() {
            return false;
        }
        if !matches!(
            self.run.status,
            RunStatus::Running | RunStatus::Paused | RunStatus::Blocked
        ) {
            return true;
        }

        self.skip_unreachable();

        let blocked: Option<StepRunId> = self
            .step_runs
            .iter()
            .find(|s| s.status == StepStatus::Blocked)
            .map(|s| s.id);

        if self.run.status == RunStatus::Blocked {
            if blocked.is_some() {
                return !self.options.exit_when_blocked;
            }
            let unblocked = self.set_run_status(RunStatus::Running, Some("unblocked".to_string()));
            if let Err(err) = unblocked {
                warn!(error = %err, "could not unblock run");
                return true;
            }
        }

        if self.run.status != RunStatus::Running {
            return true;
        }

        if let Some(reason) = self.fatal.clone() {
            if let Err(err) = self.finish(RunStatus::Failed, Some(reason.to_string()), commands) {
                warn!(error = %err, "could not fail run");
            }
            return false;
        }

        if let Some(id) = blocked {
            let reason = self
                .step_runs
                .get(id)
                .and_then(|s| s.last_reason.as_ref())
                .map(|r| r.to_string());
            if let Err(err) = self.set_run_status(RunStatus::Blocked, reason) {
                warn!(error = %err, "could not block run");
            }
            return !self.options.exit_when_blocked;
        }

        let assessment = Assessment::of(&self.graph, &self.step_runs);
        if assessment.all_succeeded() {
            if let Err(err) = self.finish(RunStatus::Completed, None, commands) {
                warn!(error = %err, "could not complete run");
            }
            return false;
        }

        let batch = next_batch(
            &self.graph,
            &self.policies,
            &self.step_runs,
            self.settings.capacity,
        );
        let requests = if batch.is_empty() {
            Vec::new()
        } else {
            self.start_dispatches(batch)
        };
        if !requests.is_empty() {
            commands.push(CoreCommand::Dispatch(requests));
            return true;
        }

        // Nothing to dispatch and nothing in flight: the run is stuck
        // behind a failure.
        if self.step_runs.in_flight_count() == 0 {
            debug!(
                run_id = self.run.id,
                failed = assessment.has_failure(),
                "no dispatchable work left"
            );
            let reason = self.first_failure_reason();
            if let Err(err) = self.finish(RunStatus::Failed, reason, commands) {
                warn!(error = %err, "could not fail run");
            }
            return false;
        }

        true
    }

    /// Mark nodes that can never become ready as `Skipped`.
    fn skip_unreachable(&mut self) {
        let assessment = Assessment::of(&self.graph, &self.step_runs);
        for item in assessment.unreachable(&self.step_runs) {
            let existing = self
                .step_runs
                .latest_for(&item)
                .filter(|s| s.status == StepStatus::Pending)
                .map(|s| s.id);
            let id = match existing {
                Some(id) => Some(id),
                None => self.create_step(&item, StepOrigin::Scheduled),
            };
            if let Some(id) = id {
                debug!(item = %item, step_run_id = id, "dependency failed; skipping");
                self.set_step_status(id, StepStatus::Skipped);
            }
        }
    }

    /// Move each item's Pending StepRun (creating it if needed) to Running
    /// and build its dispatch request.
    fn start_dispatches(&mut self, batch: Vec<WorkItemId>) -> Vec<DispatchRequest> {
        let mut requests = Vec::new();

        for item_id in batch {
            let pending = self
                .step_runs
                .latest_for(&item_id)
                .filter(|s| s.status == StepStatus::Pending)
                .map(|s| s.id);
            let Some(step_run_id) =
                pending.or_else(|| self.create_step(&item_id, StepOrigin::Scheduled))
            else {
                continue;
            };
            let Some(item) = self.graph.item(&item_id).cloned() else {
                continue;
            };
            if !self.set_step_status(step_run_id, StepStatus::Running) {
                continue;
            }

            let engine_id = item
                .executor_hint
                .clone()
                .unwrap_or_else(|| self.settings.default_engine.clone());
            let timeout = item.timeout.unwrap_or(self.settings.default_timeout);

            let Some(step) = self.step_runs.get_mut(step_run_id) else {
                continue;
            };
            step.engine_id = Some(engine_id.clone());
            let attempt = step.attempt_count;
            let answer = step.runtime_state.answer.clone();

            self.events.append(
                Some(step_run_id),
                EventKind::DispatchStarted,
                json!({
                    "item": item.id,
                    "engine": engine_id,
                    "attempt": attempt,
                    "timeout_ms": timeout.as_millis() as u64,
                }),
            );

            requests.push(DispatchRequest {
                step_run_id,
                engine_id,
                execution: ExecutionRequest {
                    work_item_id: item.id,
                    prompt: item.prompt,
                    context_refs: item.context_refs,
                    model: item.model,
                    timeout,
                    attempt,
                    answer,
                },
            });
        }

        if !requests.is_empty() {
            let ids: Vec<_> = requests.iter().map(|r| r.step_run_id).collect();
            debug!(run_id = self.run.id, ?ids, "dispatching batch");
        }
        requests
    }

    fn first_failure_reason(&self) -> Option<String> {
        self.step_runs
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .find_map(|s| s.last_reason.as_ref())
            .map(|r| r.to_string())
            .or_else(|| Some("unreachable steps".to_string()))
    }
}
