use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use proptest::prelude::*;
use protorun::dag::{Graph, WorkItem, next_batch};
use protorun::engine::{CoreRuntime, CoreStep, RunCommand, RuntimeEvent, RuntimeOptions};
use protorun::errors::ValidationError;
use protorun::exec::{DispatchOutcome, DispatchRequest};
use protorun::types::{RunStatus, StepStatus};
use protorun_test_utils::builders::{PlanBuilder, PolicyBuilder, StepBuilder, planned_core};

// Acyclic by construction: step N may only depend on steps 0..N-1.
fn dag_strategy(max_steps: usize) -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1..=max_steps).prop_flat_map(|num_steps| {
        proptest::collection::vec(
            proptest::collection::vec(any::<usize>(), 0..num_steps),
            num_steps,
        )
        .prop_map(|raw| {
            raw.into_iter()
                .enumerate()
                .map(|(i, potential)| {
                    let deps: BTreeSet<usize> = if i == 0 {
                        BTreeSet::new()
                    } else {
                        potential.into_iter().map(|d| d % i).collect()
                    };
                    deps.into_iter().collect()
                })
                .collect()
        })
    })
}

fn name(i: usize) -> String {
    format!("step_{i:02}")
}

fn work_items(deps: &[Vec<usize>]) -> Vec<WorkItem> {
    deps.iter()
        .enumerate()
        .map(|(i, d)| WorkItem::new(name(i)).depends_on(d.iter().map(|&j| name(j))))
        .collect()
}

fn core_for(deps: &[Vec<usize>], capacity: usize, exclusive: &HashSet<usize>) -> CoreRuntime {
    let mut builder = PlanBuilder::new().capacity(capacity).max_attempts(2);
    for (i, d) in deps.iter().enumerate() {
        let mut step = StepBuilder::new(&name(i));
        for &j in d {
            step = step.after(&name(j));
        }
        if exclusive.contains(&i) {
            step = step.exclusive();
        }
        builder = builder.with_step(step.build());
    }
    planned_core(&builder.build(), RuntimeOptions::default())
}

fn queue_dispatches(step: &CoreStep, queue: &mut VecDeque<DispatchRequest>) {
    for request in step.dispatched() {
        queue.push_back(request.clone());
    }
}

proptest! {
    #[test]
    fn groups_respect_dependencies(deps in dag_strategy(12)) {
        let graph = Graph::build(work_items(&deps)).unwrap();

        let mut level_of = HashMap::new();
        for (level, group) in graph.groups().iter().enumerate() {
            for id in group {
                prop_assert!(level_of.insert(id.clone(), level).is_none(), "{} in two groups", id);
            }
        }
        prop_assert_eq!(level_of.len(), deps.len());

        for (i, d) in deps.iter().enumerate() {
            for &j in d {
                prop_assert!(level_of[&name(j)] < level_of[&name(i)]);
            }
        }
    }

    #[test]
    fn ring_of_dependencies_is_a_cycle(n in 1usize..8) {
        let items: Vec<WorkItem> = (0..n)
            .map(|i| WorkItem::new(name(i)).depends_on([name((i + 1) % n)]))
            .collect();

        match Graph::build(items) {
            Err(ValidationError::Cycle { cycle }) => {
                prop_assert!(cycle.len() >= 2);
                prop_assert_eq!(cycle.first(), cycle.last());
            }
            other => prop_assert!(false, "expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn run_respects_capacity_and_dependencies(
        deps in dag_strategy(10),
        capacity in 1usize..4,
        failing in proptest::collection::hash_set(0usize..10, 0..3),
        exclusive in proptest::collection::hash_set(0usize..10, 0..2),
    ) {
        let mut core = core_for(&deps, capacity, &exclusive);
        let mut queue = VecDeque::new();

        let step = core.step(RuntimeEvent::Command(RunCommand::Start));
        queue_dispatches(&step, &mut queue);
        let mut keep_running = step.keep_running;

        let mut steps = 0;
        while keep_running {
            steps += 1;
            prop_assert!(steps < 200, "run did not terminate");

            let in_flight: Vec<_> = core
                .step_runs()
                .iter()
                .filter(|s| s.status.is_in_flight())
                .collect();
            prop_assert!(in_flight.len() <= capacity);
            let exclusive_running = in_flight
                .iter()
                .any(|s| exclusive.contains(&s.work_item_id[5..].parse::<usize>().unwrap()));
            if exclusive_running {
                prop_assert_eq!(in_flight.len(), 1);
            }

            for id in core.graph().ids() {
                let live = core
                    .step_runs()
                    .history_for(id)
                    .filter(|s| !s.status.is_terminal())
                    .count();
                prop_assert!(live <= 1, "{} has {} live StepRuns", id, live);
            }

            // Same snapshot, same batch.
            let snapshot = core.step_runs().clone();
            prop_assert_eq!(
                next_batch(core.graph(), core.policies(), &snapshot, capacity),
                next_batch(core.graph(), core.policies(), &snapshot, capacity)
            );

            let Some(request) = queue.pop_front() else {
                prop_assert!(false, "run stalled with nothing in flight");
                break;
            };

            for dep in core.graph().dependencies_of(&request.execution.work_item_id) {
                let latest = core.step_runs().latest_for(dep).map(|s| s.status);
                prop_assert_eq!(latest, Some(StepStatus::Completed));
            }

            let index: usize = request.execution.work_item_id[5..].parse().unwrap();
            let outcome = if failing.contains(&index) {
                DispatchOutcome::executor_error("scripted failure")
            } else {
                DispatchOutcome::success("ok")
            };

            let step = core.step(RuntimeEvent::DispatchFinished {
                step_run_id: request.step_run_id,
                outcome,
            });
            queue_dispatches(&step, &mut queue);
            keep_running = step.keep_running;
        }

        let fails = failing.iter().any(|&i| i < deps.len());
        let expected = if fails { RunStatus::Failed } else { RunStatus::Completed };
        prop_assert_eq!(core.status(), expected);
    }

    #[test]
    fn loop_iterations_are_bounded(max_iterations in 1u32..5, step_back in 1u32..3) {
        let plan = PlanBuilder::new()
            .with_step(StepBuilder::new("X").build())
            .with_policy(PolicyBuilder::looping("again", "X", step_back, max_iterations).build())
            .build();
        let mut core = planned_core(&plan, RuntimeOptions::default());

        let mut step = core.step(RuntimeEvent::Command(RunCommand::Start));
        while step.keep_running {
            let request = step.dispatched()[0].clone();
            step = core.step(RuntimeEvent::DispatchFinished {
                step_run_id: request.step_run_id,
                outcome: DispatchOutcome::executor_error("always"),
            });
        }

        prop_assert_eq!(core.status(), RunStatus::Failed);
        prop_assert_eq!(
            core.step_runs().history_for("X").count() as u32,
            max_iterations + 1
        );
    }
}
