// tests/scenarios.rs
//
// Drives the pure core synchronously: every test feeds `RuntimeEvent`s into
// `CoreRuntime::step` and inspects the returned commands and the core state.

mod common;
use crate::common::builders::{
    PlanBuilder, PolicyBuilder, StepBuilder, forbid_gate, planned_core,
};
use crate::common::init_tracing;

use std::time::Duration;

use protorun::dag::{StepOrigin, next_batch};
use protorun::engine::{
    CoreCommand, CoreRuntime, CoreStep, EventKind, RunCommand, RuntimeEvent, RuntimeOptions,
};
use protorun::exec::DispatchOutcome;
use protorun::types::{RunStatus, StepRunId, StepStatus};

fn send(core: &mut CoreRuntime, command: RunCommand) -> CoreStep {
    core.step(RuntimeEvent::Command(command))
}

fn finish(core: &mut CoreRuntime, step_run_id: StepRunId, outcome: DispatchOutcome) -> CoreStep {
    core.step(RuntimeEvent::DispatchFinished {
        step_run_id,
        outcome,
    })
}

/// Dispatched work item ids, sorted.
fn items(step: &CoreStep) -> Vec<String> {
    let mut ids: Vec<String> = step
        .dispatched()
        .iter()
        .map(|r| r.execution.work_item_id.clone())
        .collect();
    ids.sort();
    ids
}

/// StepRun id dispatched for `item` in `step`.
fn dispatched_id(step: &CoreStep, item: &str) -> StepRunId {
    step.dispatched()
        .iter()
        .find(|r| r.execution.work_item_id == item)
        .map(|r| r.step_run_id)
        .unwrap_or_else(|| panic!("{item} was not dispatched"))
}

fn finished_with(step: &CoreStep) -> Option<RunStatus> {
    step.commands.iter().find_map(|c| match c {
        CoreCommand::RunFinished(status) => Some(*status),
        _ => None,
    })
}

fn count(core: &CoreRuntime, kind: EventKind) -> usize {
    core.events().of_kind(kind).count()
}

fn fanout(capacity: usize) -> CoreRuntime {
    let plan = PlanBuilder::new()
        .capacity(capacity)
        .with_step(StepBuilder::new("A").build())
        .with_step(StepBuilder::new("B").after("A").build())
        .with_step(StepBuilder::new("C").after("A").build())
        .build();
    planned_core(&plan, RuntimeOptions::default())
}

#[test]
fn fanout_dispatches_both_children_together_with_capacity_two() {
    init_tracing();
    let mut core = fanout(2);

    assert_eq!(
        core.graph().groups(),
        &[vec!["A".to_string()], vec!["B".to_string(), "C".to_string()]]
    );

    let step = send(&mut core, RunCommand::Start);
    assert_eq!(items(&step), vec!["A"]);
    assert!(step.keep_running);

    let a = dispatched_id(&step, "A");
    let step = finish(&mut core, a, DispatchOutcome::success("done"));
    assert_eq!(items(&step), vec!["B", "C"]);
    assert_eq!(core.status(), RunStatus::Running);
}

#[test]
fn fanout_is_serialised_with_capacity_one() {
    init_tracing();
    let mut core = fanout(1);

    let step = send(&mut core, RunCommand::Start);
    let a = dispatched_id(&step, "A");

    let step = finish(&mut core, a, DispatchOutcome::success("a"));
    assert_eq!(items(&step), vec!["B"]);
    let b = dispatched_id(&step, "B");

    let step = finish(&mut core, b, DispatchOutcome::success("b"));
    assert_eq!(items(&step), vec!["C"]);
    let c = dispatched_id(&step, "C");

    let step = finish(&mut core, c, DispatchOutcome::success("c"));
    assert_eq!(finished_with(&step), Some(RunStatus::Completed));
    assert!(!step.keep_running);
    assert_eq!(core.status(), RunStatus::Completed);
}

#[test]
fn loop_policy_recreates_the_item_until_iterations_run_out() {
    init_tracing();
    let plan = PlanBuilder::new()
        .with_step(StepBuilder::new("X").build())
        .with_policy(PolicyBuilder::looping("loop-x", "X", 1, 2).build())
        .build();
    let mut core = planned_core(&plan, RuntimeOptions::default());

    let step = send(&mut core, RunCommand::Start);
    let first = dispatched_id(&step, "X");

    let step = finish(&mut core, first, DispatchOutcome::executor_error("boom"));
    let second = dispatched_id(&step, "X");
    assert_ne!(first, second);
    assert_eq!(
        core.step_runs().get(second).unwrap().origin,
        StepOrigin::StepBack {
            policy: "loop-x".to_string()
        }
    );
    assert_eq!(core.step_runs().get(second).unwrap().attempt_count, 2);

    let step = finish(&mut core, second, DispatchOutcome::executor_error("boom"));
    let third = dispatched_id(&step, "X");
    assert_eq!(
        core.step_runs().get(third).unwrap().runtime_state.loop_count("loop-x"),
        2
    );

    let step = finish(&mut core, third, DispatchOutcome::executor_error("boom"));
    assert_eq!(finished_with(&step), Some(RunStatus::Failed));
    assert_eq!(count(&core, EventKind::LoopDecision), 2);
    assert_eq!(count(&core, EventKind::LoopLimitReached), 1);
    assert_eq!(count(&core, EventKind::FailDecision), 1);
    assert_eq!(count(&core, EventKind::RetryDecision), 0);
    assert_eq!(core.step_runs().history_for("X").count(), 3);
}

#[test]
fn trigger_policy_enqueues_target_out_of_band() {
    init_tracing();
    let plan = PlanBuilder::new()
        .with_step(StepBuilder::new("Y").build())
        .with_step(StepBuilder::new("Z").after("Y").build())
        .with_policy(PolicyBuilder::trigger("fix-y", "Y", "Z", 1).build())
        .build();
    let mut core = planned_core(&plan, RuntimeOptions::default());

    let step = send(&mut core, RunCommand::Start);
    let y = dispatched_id(&step, "Y");

    // Z depends on Y, yet the trigger dispatches it right away.
    let step = finish(&mut core, y, DispatchOutcome::executor_error("broken"));
    assert_eq!(items(&step), vec!["Z"]);
    let z = dispatched_id(&step, "Z");

    let z_run = core.step_runs().get(z).unwrap();
    assert!(matches!(z_run.origin, StepOrigin::Trigger { by, .. } if by == y));
    assert_eq!(z_run.runtime_state.triggered_by, Some(y));
    assert_eq!(z_run.runtime_state.trigger_depth, 1);

    assert_eq!(core.step_runs().get(y).unwrap().status, StepStatus::Failed);
    assert_eq!(core.status(), RunStatus::Running);
    assert_eq!(count(&core, EventKind::TriggerDecision), 1);
    assert_eq!(count(&core, EventKind::FailDecision), 0);

    // Y itself never recovered, so the run cannot complete.
    let step = finish(&mut core, z, DispatchOutcome::success("fixed"));
    assert_eq!(finished_with(&step), Some(RunStatus::Failed));
    assert_eq!(core.step_runs().get(z).unwrap().status, StepStatus::Completed);
}

#[test]
fn cancel_stops_running_and_pending_step_runs() {
    init_tracing();
    // B's loop steps back over A, leaving {A: Running, B: Pending}.
    let plan = PlanBuilder::new()
        .with_step(StepBuilder::new("A").build())
        .with_step(StepBuilder::new("B").after("A").build())
        .with_policy(PolicyBuilder::looping("redo", "B", 2, 1).build())
        .build();
    let mut core = planned_core(&plan, RuntimeOptions::default());

    let step = send(&mut core, RunCommand::Start);
    let a1 = dispatched_id(&step, "A");
    let step = finish(&mut core, a1, DispatchOutcome::success("a"));
    let b1 = dispatched_id(&step, "B");

    let step = finish(&mut core, b1, DispatchOutcome::executor_error("b broke"));
    assert_eq!(items(&step), vec!["A"]);
    let a2 = dispatched_id(&step, "A");
    let b2 = core.step_runs().latest_for("B").unwrap().id;
    assert_eq!(core.step_runs().get(b2).unwrap().status, StepStatus::Pending);

    let step = send(&mut core, RunCommand::Cancel);
    assert_eq!(step.cancelled(), vec![a2]);
    assert_eq!(finished_with(&step), Some(RunStatus::Cancelled));
    assert!(step.dispatched().is_empty());
    assert!(!step.keep_running);

    assert_eq!(core.step_runs().get(a2).unwrap().status, StepStatus::Cancelled);
    let b = core.step_runs().get(b2).unwrap();
    assert_eq!(b.status, StepStatus::Cancelled);
    assert!(b.engine_id.is_none(), "B must never have been dispatched");

    // The executor reports A after all; the result is ignored.
    let step = finish(&mut core, a2, DispatchOutcome::success("late"));
    assert!(step.commands.is_empty());
    assert_eq!(count(&core, EventKind::LateCompletionIgnored), 1);
    assert_eq!(core.status(), RunStatus::Cancelled);
}

#[test]
fn step_back_reruns_the_intervening_chain() {
    init_tracing();
    let plan = PlanBuilder::new()
        .capacity(1)
        .with_step(StepBuilder::new("A").build())
        .with_step(StepBuilder::new("B").after("A").build())
        .with_step(StepBuilder::new("C").after("B").build())
        .with_policy(PolicyBuilder::looping("back-two", "C", 2, 1).build())
        .build();
    let mut core = planned_core(&plan, RuntimeOptions::default());

    let step = send(&mut core, RunCommand::Start);
    let a = dispatched_id(&step, "A");
    let step = finish(&mut core, a, DispatchOutcome::success("a"));
    let b = dispatched_id(&step, "B");
    let step = finish(&mut core, b, DispatchOutcome::success("b"));
    let c = dispatched_id(&step, "C");

    // C sits at level 2; stepping back 2 levels reaches B at level 1, not A.
    let step = finish(&mut core, c, DispatchOutcome::executor_error("c broke"));
    assert_eq!(items(&step), vec!["B"]);
    assert_eq!(core.step_runs().history_for("A").count(), 1);
    let reset = core.events().of_kind(EventKind::StepBackReset).next().unwrap();
    assert_eq!(reset.payload["target_level"], 1);

    let b2 = dispatched_id(&step, "B");
    let step = finish(&mut core, b2, DispatchOutcome::success("b again"));
    let c2 = dispatched_id(&step, "C");
    let step = finish(&mut core, c2, DispatchOutcome::success("c fixed"));
    assert_eq!(finished_with(&step), Some(RunStatus::Completed));
}

#[test]
fn step_back_keeps_skipped_ids_in_the_chain() {
    init_tracing();
    let plan = PlanBuilder::new()
        .with_step(StepBuilder::new("A").build())
        .with_step(StepBuilder::new("S").after("A").build())
        .with_step(StepBuilder::new("X").after("S").build())
        .with_policy(PolicyBuilder::looping("redo", "X", 3, 1).skip("S").build())
        .build();
    let mut core = planned_core(&plan, RuntimeOptions::default());

    let step = send(&mut core, RunCommand::Start);
    let a = dispatched_id(&step, "A");
    let step = finish(&mut core, a, DispatchOutcome::success("a"));
    let s = dispatched_id(&step, "S");
    let step = finish(&mut core, s, DispatchOutcome::success("s"));
    let x = dispatched_id(&step, "X");

    let step = finish(&mut core, x, DispatchOutcome::executor_error("x broke"));
    assert_eq!(items(&step), vec!["A"]);
    let reset = core.events().of_kind(EventKind::StepBackReset).next().unwrap();
    assert_eq!(reset.payload["kept"], serde_json::json!(["S"]));

    let a2 = dispatched_id(&step, "A");
    let step = finish(&mut core, a2, DispatchOutcome::success("a again"));
    assert_eq!(items(&step), vec!["X"]);

    let x2 = dispatched_id(&step, "X");
    let step = finish(&mut core, x2, DispatchOutcome::success("x fixed"));
    assert_eq!(finished_with(&step), Some(RunStatus::Completed));

    let history: Vec<StepStatus> = core
        .step_runs()
        .history_for("S")
        .map(|sr| sr.status)
        .collect();
    assert_eq!(history, vec![StepStatus::Completed]);
}

#[test]
fn loop_iterations_are_counted_per_run_across_nodes() {
    init_tracing();
    let plan = PlanBuilder::new()
        .with_step(StepBuilder::new("A").build())
        .with_step(StepBuilder::new("B").policy("once").build())
        .with_policy(PolicyBuilder::looping("once", "A", 1, 1).build())
        .build();
    let mut core = planned_core(&plan, RuntimeOptions::default());

    let step = send(&mut core, RunCommand::Start);
    let a = dispatched_id(&step, "A");
    let b = dispatched_id(&step, "B");

    let step = finish(&mut core, a, DispatchOutcome::executor_error("a broke"));
    assert_eq!(items(&step), vec!["A"]);
    assert_eq!(core.run().loop_counts.get("once"), Some(&1));

    // B shares the policy; its single iteration is already spent.
    let step = finish(&mut core, b, DispatchOutcome::executor_error("b broke"));
    assert_eq!(finished_with(&step), Some(RunStatus::Failed));
    assert_eq!(count(&core, EventKind::LoopDecision), 1);
    assert_eq!(count(&core, EventKind::LoopLimitReached), 1);
    assert_eq!(core.run().loop_counts.get("once"), Some(&1));
}

#[test]
fn untolerated_failure_stops_later_groups() {
    init_tracing();
    let plan = PlanBuilder::new()
        .with_step(StepBuilder::new("P").build())
        .with_step(StepBuilder::new("Y").build())
        .with_step(StepBuilder::new("Q").after("P").build())
        .with_step(StepBuilder::new("Z").after("Y").build())
        .with_policy(PolicyBuilder::trigger("fix-y", "Y", "Z", 1).build())
        .build();
    let mut core = planned_core(&plan, RuntimeOptions::default());

    let step = send(&mut core, RunCommand::Start);
    let p = dispatched_id(&step, "P");
    let y = dispatched_id(&step, "Y");

    let step = finish(&mut core, y, DispatchOutcome::executor_error("y broke"));
    assert_eq!(items(&step), vec!["Z"]);
    let z = dispatched_id(&step, "Z");

    // P completes, but Y's group holds an untolerated failure.
    let step = finish(&mut core, p, DispatchOutcome::success("p"));
    assert!(step.dispatched().is_empty());
    assert!(step.keep_running);

    let step = finish(&mut core, z, DispatchOutcome::success("z"));
    assert_eq!(finished_with(&step), Some(RunStatus::Failed));
    assert!(core.step_runs().latest_for("Q").is_none());
}

#[test]
fn generic_retry_is_bounded_by_max_attempts() {
    init_tracing();
    let plan = PlanBuilder::new()
        .max_attempts(2)
        .with_step(StepBuilder::new("R").build())
        .build();
    let mut core = planned_core(&plan, RuntimeOptions::default());

    let step = send(&mut core, RunCommand::Start);
    let r1 = dispatched_id(&step, "R");

    let step = finish(&mut core, r1, DispatchOutcome::timeout(Duration::from_secs(1)));
    let r2 = dispatched_id(&step, "R");
    let retried = core.step_runs().get(r2).unwrap();
    assert_eq!(retried.origin, StepOrigin::Retry);
    assert_eq!(retried.attempt_count, 2);
    assert_eq!(
        core.step_runs().get(r1).unwrap().last_reason.as_ref().unwrap().as_str(),
        "timeout"
    );

    let step = finish(&mut core, r2, DispatchOutcome::executor_error("again"));
    assert_eq!(finished_with(&step), Some(RunStatus::Failed));
    assert_eq!(count(&core, EventKind::RetryDecision), 1);
    assert_eq!(core.run().status_reason.as_deref(), Some("executor_error"));
}

#[test]
fn failure_skips_unreachable_dependents() {
    init_tracing();
    let plan = PlanBuilder::new()
        .max_attempts(1)
        .with_step(StepBuilder::new("A").build())
        .with_step(StepBuilder::new("B").after("A").build())
        .build();
    let mut core = planned_core(&plan, RuntimeOptions::default());

    let step = send(&mut core, RunCommand::Start);
    let a = dispatched_id(&step, "A");
    let step = finish(&mut core, a, DispatchOutcome::executor_error("nope"));

    assert_eq!(finished_with(&step), Some(RunStatus::Failed));
    assert_eq!(
        core.step_runs().latest_for("B").unwrap().status,
        StepStatus::Skipped
    );
}

#[test]
fn tolerated_failure_lets_the_run_complete() {
    init_tracing();
    let plan = PlanBuilder::new()
        .max_attempts(1)
        .with_step(StepBuilder::new("Lint").continue_on_failure().build())
        .with_step(StepBuilder::new("Build").build())
        .build();
    let mut core = planned_core(&plan, RuntimeOptions::default());

    let step = send(&mut core, RunCommand::Start);
    let lint = dispatched_id(&step, "Lint");
    let build = dispatched_id(&step, "Build");

    let step = finish(&mut core, lint, DispatchOutcome::executor_error("style"));
    assert!(step.keep_running);
    assert_eq!(core.status(), RunStatus::Running);

    let step = finish(&mut core, build, DispatchOutcome::success("built"));
    assert_eq!(finished_with(&step), Some(RunStatus::Completed));
}

#[test]
fn human_input_blocks_until_answered() {
    init_tracing();
    let plan = PlanBuilder::new()
        .with_step(StepBuilder::new("Spec").build())
        .build();
    let mut core = planned_core(&plan, RuntimeOptions::default());

    let step = send(&mut core, RunCommand::Start);
    let id = dispatched_id(&step, "Spec");

    let step = finish(
        &mut core,
        id,
        DispatchOutcome::executor_error("which database?").with_reason("clarification_required"),
    );
    assert!(step.keep_running);
    assert!(step.dispatched().is_empty());
    assert_eq!(core.status(), RunStatus::Blocked);
    assert_eq!(core.step_runs().get(id).unwrap().status, StepStatus::Blocked);
    assert_eq!(count(&core, EventKind::BlockDecision), 1);

    let step = send(
        &mut core,
        RunCommand::Answer {
            step_run_id: id,
            answer: "postgres".to_string(),
        },
    );
    assert_eq!(core.status(), RunStatus::Running);
    let request = step.dispatched()[0].clone();
    assert_eq!(request.step_run_id, id);
    assert_eq!(request.execution.answer.as_deref(), Some("postgres"));

    let step = finish(&mut core, id, DispatchOutcome::success("schema"));
    assert_eq!(finished_with(&step), Some(RunStatus::Completed));
}

#[test]
fn blocked_run_stops_the_shell_when_configured() {
    init_tracing();
    let plan = PlanBuilder::new()
        .with_step(StepBuilder::new("Spec").build())
        .build();
    let mut core = planned_core(
        &plan,
        RuntimeOptions {
            exit_when_blocked: true,
        },
    );

    let step = send(&mut core, RunCommand::Start);
    let id = dispatched_id(&step, "Spec");
    let step = finish(
        &mut core,
        id,
        DispatchOutcome::executor_error("?").with_reason("ambiguity"),
    );
    assert!(!step.keep_running);
    assert_eq!(core.status(), RunStatus::Blocked);
}

#[test]
fn rejected_commands_leave_state_untouched() {
    init_tracing();
    let plan = PlanBuilder::new()
        .with_step(StepBuilder::new("A").build())
        .build();
    let mut core = planned_core(&plan, RuntimeOptions::default());

    // Not started yet.
    let step = send(&mut core, RunCommand::Cancel);
    assert!(step.commands.is_empty());
    assert_eq!(core.status(), RunStatus::Planned);

    let step = send(&mut core, RunCommand::Start);
    let a = dispatched_id(&step, "A");

    // A is running, not blocked.
    send(
        &mut core,
        RunCommand::Answer {
            step_run_id: a,
            answer: "x".to_string(),
        },
    );
    send(
        &mut core,
        RunCommand::Answer {
            step_run_id: 999,
            answer: "x".to_string(),
        },
    );
    assert_eq!(core.step_runs().get(a).unwrap().status, StepStatus::Running);
    assert_eq!(count(&core, EventKind::CommandRejected), 3);
}

#[test]
fn pause_holds_new_dispatches_until_resume() {
    init_tracing();
    let mut core = fanout(2);

    let step = send(&mut core, RunCommand::Start);
    let a = dispatched_id(&step, "A");

    send(&mut core, RunCommand::Pause);
    assert_eq!(core.status(), RunStatus::Paused);

    let step = finish(&mut core, a, DispatchOutcome::success("a"));
    assert!(step.dispatched().is_empty());
    assert_eq!(core.step_runs().get(a).unwrap().status, StepStatus::Completed);

    let step = send(&mut core, RunCommand::Resume);
    assert_eq!(items(&step), vec!["B", "C"]);
}

#[test]
fn exclusive_item_runs_alone() {
    init_tracing();
    let plan = PlanBuilder::new()
        .capacity(3)
        .with_step(StepBuilder::new("A").build())
        .with_step(StepBuilder::new("B").build())
        .with_step(StepBuilder::new("M").exclusive().build())
        .build();
    let mut core = planned_core(&plan, RuntimeOptions::default());

    let step = send(&mut core, RunCommand::Start);
    assert_eq!(items(&step), vec!["M"]);
    let m = dispatched_id(&step, "M");

    let step = finish(&mut core, m, DispatchOutcome::success("m"));
    assert_eq!(items(&step), vec!["A", "B"]);
}

#[test]
fn failing_gate_routes_through_policies_by_gate_code() {
    init_tracing();
    let plan = PlanBuilder::new()
        .max_attempts(1)
        .with_gate(forbid_gate("no-todo", "TODO"))
        .with_step(StepBuilder::new("Impl").build())
        .with_policy(
            PolicyBuilder::looping("fix-todos", "Impl", 1, 1)
                .on_reasons(&["no-todo"])
                .build(),
        )
        .build();
    let mut core = planned_core(&plan, RuntimeOptions::default());

    let step = send(&mut core, RunCommand::Start);
    let first = dispatched_id(&step, "Impl");

    let step = finish(&mut core, first, DispatchOutcome::success("fn main() {} // TODO"));
    assert_eq!(count(&core, EventKind::GateEvaluated), 1);
    assert_eq!(count(&core, EventKind::LoopDecision), 1);
    assert_eq!(
        core.step_runs().get(first).unwrap().last_reason.as_ref().unwrap().as_str(),
        "no-todo"
    );

    let second = dispatched_id(&step, "Impl");
    let step = finish(&mut core, second, DispatchOutcome::success("fn main() {}"));
    assert_eq!(finished_with(&step), Some(RunStatus::Completed));
}

#[test]
fn skip_qa_bypasses_gates() {
    init_tracing();
    let plan = PlanBuilder::new()
        .with_gate(forbid_gate("no-todo", "TODO"))
        .with_step(StepBuilder::new("Draft").skip_qa().build())
        .build();
    let mut core = planned_core(&plan, RuntimeOptions::default());

    let step = send(&mut core, RunCommand::Start);
    let id = dispatched_id(&step, "Draft");
    let step = finish(&mut core, id, DispatchOutcome::success("TODO everything"));

    assert_eq!(finished_with(&step), Some(RunStatus::Completed));
    let gate = core.events().of_kind(EventKind::GateEvaluated).next().unwrap();
    assert_eq!(gate.payload["verdict"], "skip");
}

#[test]
fn shutdown_cancels_a_running_run() {
    init_tracing();
    let mut core = fanout(2);

    let step = send(&mut core, RunCommand::Start);
    let a = dispatched_id(&step, "A");

    let step = core.step(RuntimeEvent::ShutdownRequested);
    assert!(!step.keep_running);
    assert_eq!(step.cancelled(), vec![a]);
    assert_eq!(core.status(), RunStatus::Cancelled);
}

#[test]
fn empty_plan_completes_on_start() {
    init_tracing();
    let plan = PlanBuilder::new().build();
    let mut core = planned_core(&plan, RuntimeOptions::default());

    let step = send(&mut core, RunCommand::Start);
    assert_eq!(finished_with(&step), Some(RunStatus::Completed));
}

#[test]
fn scheduler_is_idempotent_on_a_snapshot() {
    init_tracing();
    let mut core = fanout(2);
    let step = send(&mut core, RunCommand::Start);
    let a = dispatched_id(&step, "A");

    let snapshot = core.step_runs().clone();
    let first = next_batch(core.graph(), core.policies(), &snapshot, 2);
    let second = next_batch(core.graph(), core.policies(), &snapshot, 2);
    assert_eq!(first, second);
    // A is in flight and its dependents are waiting on it.
    assert!(first.is_empty());

    finish(&mut core, a, DispatchOutcome::success("a"));
    let snapshot = core.step_runs().clone();
    assert_eq!(
        next_batch(core.graph(), core.policies(), &snapshot, 2),
        next_batch(core.graph(), core.policies(), &snapshot, 2)
    );
}
