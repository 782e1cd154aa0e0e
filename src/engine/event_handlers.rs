// src/engine/event_handlers.rs

//! Event handling logic for the core runtime.

use std::collections::BTreeSet;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::dag::StepOrigin;
use crate::engine::RunCommand;
use crate::engine::core::CoreRuntime;
use crate::engine::events::EventKind;
use crate::engine::feedback::{Action, Decision};
use crate::errors::{ProtorunError, TransitionError};
use crate::exec::{DispatchOutcome, DispatchRequest, DispatchStatus};
use crate::gates::GateContext;
use crate::types::{FailureReason, RunStatus, StepRunId, StepStatus, Verdict, WorkItemId};

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreCommand {
    /// Execute these StepRuns (already moved to `Running`).
    Dispatch(Vec<DispatchRequest>),
    /// Best-effort cancellation of in-flight dispatches.
    CancelDispatch(Vec<StepRunId>),
    /// The run reached a terminal status.
    RunFinished(RunStatus),
}

/// Decision returned by the core after handling a single `RuntimeEvent`.
#[derive(Debug, Clone)]
pub struct CoreStep {
    pub commands: Vec<CoreCommand>,
    /// Whether the outer runtime loop should keep running.
    pub keep_running: bool,
}

impl CoreStep {
    /// Every request dispatched by this step.
    pub fn dispatched(&self) -> Vec<&DispatchRequest> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                CoreCommand::Dispatch(requests) => Some(requests.iter()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Every StepRun whose dispatch this step cancels.
    pub fn cancelled(&self) -> Vec<StepRunId> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                CoreCommand::CancelDispatch(ids) => Some(ids.iter().copied()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

impl CoreRuntime {
    pub(super) fn handle_command(&mut self, command: RunCommand) -> CoreStep {
        let mut commands = Vec::new();
        debug!(run_id = self.run.id, ?command, "run command");

        let result: Result<(), ProtorunError> = match &command {
            RunCommand::Start => self
                .set_run_status(RunStatus::Running, None)
                .map_err(Into::into),
            RunCommand::Pause => self
                .set_run_status(RunStatus::Paused, None)
                .map_err(Into::into),
            RunCommand::Resume => self
                .set_run_status(RunStatus::Running, None)
                .map_err(Into::into),
            RunCommand::Cancel => self
                .finish(
                    RunStatus::Cancelled,
                    Some("cancelled by request".to_string()),
                    &mut commands,
                )
                .map_err(Into::into),
            RunCommand::Answer {
                step_run_id,
                answer,
            } => self.answer(*step_run_id, answer.clone()),
        };

        if let Err(err) = result {
            warn!(run_id = self.run.id, ?command, error = %err, "command rejected");
            self.events.append(
                None,
                EventKind::CommandRejected,
                json!({
                    "command": format!("{command:?}"),
                    "error": err.to_string(),
                    "status": self.run.status,
                }),
            );
        }

        let keep_running = self.settle(&mut commands);
        CoreStep {
            commands,
            keep_running,
        }
    }

    fn answer(&mut self, step_run_id: StepRunId, answer: String) -> Result<(), ProtorunError> {
        let step = self
            .step_runs
            .get(step_run_id)
            .ok_or(ProtorunError::StepRunNotFound(step_run_id))?;

        if step.status != StepStatus::Blocked {
            return Err(TransitionError {
                entity: "step_run",
                from: step.status.to_string(),
                to: StepStatus::Pending.to_string(),
            }
            .into());
        }

        self.set_step_status(step_run_id, StepStatus::Pending);
        if let Some(step) = self.step_runs.get_mut(step_run_id) {
            step.runtime_state.answer = Some(answer.clone());
        }
        info!(step_run_id, "blocking input answered");
        self.events.append(
            Some(step_run_id),
            EventKind::AnswerReceived,
            json!({ "answer": answer }),
        );
        Ok(())
    }

    pub(super) fn handle_shutdown(&mut self) -> CoreStep {
        let mut commands = Vec::new();
        if self.run.status == RunStatus::Running {
            if let Err(err) = self.finish(
                RunStatus::Cancelled,
                Some("shutdown requested".to_string()),
                &mut commands,
            ) {
                warn!(error = %err, "could not cancel run on shutdown");
            }
        } else {
            let running = self.step_runs.with_status(StepStatus::Running);
            if !running.is_empty() {
                commands.push(CoreCommand::CancelDispatch(running));
            }
        }
        CoreStep {
            commands,
            keep_running: false,
        }
    }

    pub(super) fn handle_dispatch_finished(
        &mut self,
        step_run_id: StepRunId,
        outcome: DispatchOutcome,
    ) -> CoreStep {
        let mut commands = Vec::new();

        let Some(step) = self.step_runs.get(step_run_id) else {
            warn!(step_run_id, "completion for unknown StepRun");
            return CoreStep {
                commands,
                keep_running: self.keep_running(),
            };
        };

        // Cancelled or invalidated while the executor was still working.
        if step.status != StepStatus::Running {
            debug!(step_run_id, status = %step.status, "ignoring late completion");
            let status = step.status;
            self.events.append(
                Some(step_run_id),
                EventKind::LateCompletionIgnored,
                json!({ "status": status, "dispatch": outcome.status }),
            );
            return CoreStep {
                commands,
                keep_running: self.keep_running(),
            };
        }

        let item_id = step.work_item_id.clone();
        let attempt = step.attempt_count;
        let engine = step.engine_id.clone();

        self.events.append(
            Some(step_run_id),
            EventKind::DispatchFinished,
            json!({
                "item": item_id,
                "engine": engine,
                "status": outcome.status,
                "duration_ms": outcome.duration.as_millis() as u64,
                "attempt": attempt,
            }),
        );

        let (verdict, reason) = match outcome.status {
            DispatchStatus::Success => self.review(step_run_id, &item_id, attempt, outcome.output),
            DispatchStatus::ExecutorError | DispatchStatus::Timeout | DispatchStatus::Cancelled => {
                let reason = outcome.failure_reason();
                self.events.append(
                    Some(step_run_id),
                    EventKind::DispatchFailed,
                    json!({
                        "status": outcome.status,
                        "error_detail": outcome.error_detail,
                        "reason": reason,
                    }),
                );
                if let Some(step) = self.step_runs.get_mut(step_run_id) {
                    step.result = Some(outcome.output);
                }
                (Verdict::Fail, reason)
            }
        };

        let policies = self.policies.policies_for(&item_id).to_vec();
        if let Some(step) = self.step_runs.get(step_run_id) {
            // Loop guards count per run, not per node.
            let mut view = step.clone();
            view.runtime_state.loop_counts = self.run.loop_counts.clone();
            let decision = self.router.decide(&view, verdict, &reason, &policies);
            self.run.loop_counts = decision.runtime_state.loop_counts.clone();
            self.apply_decision(step_run_id, &item_id, decision, reason, &mut commands);
        }

        let keep_running = self.settle(&mut commands);
        CoreStep {
            commands,
            keep_running,
        }
    }

    /// `Running -> NeedsReview`, then run the gate pipeline over the output.
    fn review(
        &mut self,
        step_run_id: StepRunId,
        item_id: &str,
        attempt: u32,
        output: String,
    ) -> (Verdict, FailureReason) {
        self.set_step_status(step_run_id, StepStatus::NeedsReview);

        let Some(item) = self.graph.item(item_id).cloned() else {
            return (Verdict::Fail, FailureReason::qa_failed());
        };
        let ctx = GateContext {
            run_id: self.run.id,
            work_item: &item,
            attempt,
        };
        let outcome = self.gates.evaluate(&output, &ctx, item.skip_qa);

        for result in &outcome.results {
            self.events.append(
                Some(step_run_id),
                EventKind::GateEvaluated,
                json!({
                    "gate": result.gate_id,
                    "verdict": result.verdict,
                    "findings": result.findings,
                    "duration_ms": result.duration_ms,
                }),
            );
        }
        self.events.append(
            Some(step_run_id),
            EventKind::VerdictRendered,
            json!({ "verdict": outcome.verdict, "reason": outcome.reason }),
        );

        if let Some(step) = self.step_runs.get_mut(step_run_id) {
            step.result = Some(output);
        }

        let reason = outcome.reason.unwrap_or_else(FailureReason::qa_failed);
        (outcome.verdict, reason)
    }

    fn apply_decision(
        &mut self,
        step_run_id: StepRunId,
        item_id: &str,
        decision: Decision,
        reason: FailureReason,
        commands: &mut Vec<CoreCommand>,
    ) {
        for note in &decision.notes {
            self.events
                .append(Some(step_run_id), note.kind, note.payload.clone());
        }
        if let Some(step) = self.step_runs.get_mut(step_run_id) {
            step.runtime_state = decision.runtime_state.clone();
        }

        if decision.is_continue() {
            self.set_step_status(step_run_id, StepStatus::Completed);
            return;
        }

        if let Some(step) = self.step_runs.get_mut(step_run_id) {
            step.last_reason = Some(reason.clone());
        }
        let terminal = if decision.block_reason().is_some() {
            StepStatus::Blocked
        } else {
            StepStatus::Failed
        };
        self.set_step_status(step_run_id, terminal);

        let tolerates = self
            .graph
            .item(item_id)
            .is_some_and(|i| i.continue_on_failure);

        for action in decision.actions {
            match action {
                Action::Continue | Action::Block { .. } => {}
                Action::Retry => {
                    self.create_step(item_id, StepOrigin::Retry);
                }
                Action::StepBack {
                    policy,
                    levels,
                    skip,
                } => self.step_back(item_id, &policy, levels, &skip, commands),
                Action::Trigger { policy, target } => {
                    self.enqueue_trigger(step_run_id, &policy, &target)
                }
                Action::Fail { reason } => {
                    if tolerates {
                        info!(item = item_id, %reason, "failure tolerated");
                    } else {
                        self.fatal = Some(reason);
                    }
                }
            }
        }
    }

    /// Rewind `levels` parallel-group levels from `item`.
    ///
    /// New Pending StepRuns are created for `item` and for every ancestor at
    /// or above the target level, except ids in `skip`, which keep their
    /// latest StepRun. Downstream StepRuns are marked `Skipped` and get
    /// recreated once their dependencies complete again. The walk does not
    /// pass through skipped ids.
    fn step_back(
        &mut self,
        item: &str,
        policy: &str,
        levels: u32,
        skip: &BTreeSet<WorkItemId>,
        commands: &mut Vec<CoreCommand>,
    ) {
        let level = self.graph.level_of(item).unwrap_or(0);
        let target_level = level.saturating_sub(levels.saturating_sub(1) as usize);

        let chain = self.graph.ancestors_from_level(item, target_level);
        let kept: BTreeSet<WorkItemId> = chain
            .iter()
            .filter(|id| id.as_str() != item && skip.contains(*id))
            .cloned()
            .collect();
        let reset: BTreeSet<WorkItemId> = chain.difference(&kept).cloned().collect();
        let downstream = self.graph.descendants_avoiding(&reset, &kept);

        let mut to_cancel = Vec::new();
        for id in &downstream {
            self.invalidate(id, policy, &mut to_cancel);
        }

        for id in &reset {
            let latest = self.step_runs.latest_for(id).map(|s| (s.id, s.status));
            match latest {
                Some((sid, status)) if status.is_in_flight() => {
                    if status == StepStatus::Running {
                        to_cancel.push(sid);
                    }
                    self.set_step_status(sid, StepStatus::Skipped);
                    self.create_step(id, StepOrigin::StepBack { policy: policy.to_string() });
                }
                Some((_, status)) if !status.is_terminal() => {
                    debug!(item = %id, %status, "already pending; not recreating");
                }
                _ => {
                    self.create_step(id, StepOrigin::StepBack { policy: policy.to_string() });
                }
            }
        }

        info!(
            item,
            policy,
            levels,
            target_level,
            reset = ?reset,
            "loop step-back"
        );
        self.events.append(
            None,
            EventKind::StepBackReset,
            json!({
                "from": item,
                "policy": policy,
                "levels": levels,
                "target_level": target_level,
                "reset": reset,
                "kept": kept,
                "invalidated": downstream,
            }),
        );

        if !to_cancel.is_empty() {
            commands.push(CoreCommand::CancelDispatch(to_cancel));
        }
    }

    /// Make a downstream node run again after its upstream is reset.
    fn invalidate(&mut self, item: &str, policy: &str, to_cancel: &mut Vec<StepRunId>) {
        let Some((id, status)) = self.step_runs.latest_for(item).map(|s| (s.id, s.status)) else {
            return;
        };

        match status {
            StepStatus::Skipped => {}
            StepStatus::Running => {
                to_cancel.push(id);
                self.set_step_status(id, StepStatus::Skipped);
            }
            StepStatus::Pending | StepStatus::NeedsReview | StepStatus::Blocked => {
                self.set_step_status(id, StepStatus::Skipped);
            }
            StepStatus::Completed | StepStatus::Failed | StepStatus::Cancelled => {
                if let Some(fresh) = self.create_step(
                    item,
                    StepOrigin::StepBack {
                        policy: policy.to_string(),
                    },
                ) {
                    self.set_step_status(fresh, StepStatus::Skipped);
                }
            }
        }
    }

    /// Enqueue `target` out of band, unless it already has a live StepRun.
    fn enqueue_trigger(&mut self, source: StepRunId, policy: &str, target: &str) {
        if let Some(existing) = self
            .step_runs
            .latest_for(target)
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.id)
        {
            self.events.append(
                Some(source),
                EventKind::TriggerDeduplicated,
                json!({ "policy": policy, "target": target, "existing": existing }),
            );
            return;
        }

        let depth = self
            .step_runs
            .get(source)
            .map(|s| s.runtime_state.trigger_depth)
            .unwrap_or(0);

        let origin = StepOrigin::Trigger {
            by: source,
            policy: policy.to_string(),
        };
        if let Some(id) = self.create_step(target, origin) {
            if let Some(step) = self.step_runs.get_mut(id) {
                step.runtime_state.triggered_by = Some(source);
                step.runtime_state.trigger_depth = step.runtime_state.trigger_depth.max(depth);
            }
            info!(source, target, policy, step_run_id = id, "trigger enqueued");
        }
    }
}
