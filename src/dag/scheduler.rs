// src/dag/scheduler.rs

//! Stateless batch scheduler.
//!
//! Given the graph, the policy map and a snapshot of StepRuns, decide which
//! work items may be dispatched right now. Nothing here mutates state, so
//! calling [`next_batch`] twice on the same snapshot yields the same batch.

use std::collections::BTreeMap;

use tracing::trace;

use crate::dag::graph::Graph;
use crate::dag::policy::PolicyMap;
use crate::dag::state::{StepOrigin, StepRunTable};
use crate::types::{StepStatus, WorkItemId};

/// Where a work item stands, derived from its latest StepRun and its
/// dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeView {
    /// Not runnable yet: some dependency has not completed.
    Waiting,
    /// Dispatchable: every dependency completed (or it was triggered).
    Ready,
    /// Running, awaiting review, or blocked on input.
    Active,
    /// Latest StepRun completed.
    Satisfied,
    /// Latest StepRun failed but the item tolerates failure.
    Tolerated,
    /// Latest StepRun failed or was cancelled and the failure is not
    /// tolerated. Holds its group back.
    Failed,
    /// Skipped: some dependency failed, so it can never run in this run.
    Dead,
}

impl NodeView {
    /// Settled nodes let the scheduler move past their group.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            NodeView::Satisfied | NodeView::Tolerated | NodeView::Dead
        )
    }
}

/// Views for every node of a graph.
#[derive(Debug, Clone)]
pub struct Assessment {
    views: BTreeMap<WorkItemId, NodeView>,
}

impl Assessment {
    /// Classify every node, dependencies first.
    pub fn of(graph: &Graph, step_runs: &StepRunTable) -> Self {
        let mut views: BTreeMap<WorkItemId, NodeView> = BTreeMap::new();

        for group in graph.groups() {
            for id in group {
                let view = classify(graph, step_runs, &views, id);
                views.insert(id.clone(), view);
            }
        }

        Self { views }
    }

    pub fn view(&self, id: &str) -> Option<NodeView> {
        self.views.get(id).copied()
    }

    pub fn all_settled(&self) -> bool {
        self.views.values().all(|v| v.is_settled())
    }

    /// Some node failed without tolerating it.
    pub fn has_failure(&self) -> bool {
        self.views.values().any(|v| *v == NodeView::Failed)
    }

    /// Every node completed (tolerated failures count as done).
    pub fn all_succeeded(&self) -> bool {
        self.views
            .values()
            .all(|v| matches!(v, NodeView::Satisfied | NodeView::Tolerated))
    }

    /// Dead nodes whose latest StepRun still needs to be marked `Skipped`.
    pub fn unreachable(&self, step_runs: &StepRunTable) -> Vec<WorkItemId> {
        self.views
            .iter()
            .filter(|(_, v)| **v == NodeView::Dead)
            .filter(|(id, _)| match step_runs.latest_for(id) {
                None => true,
                Some(latest) => latest.status == StepStatus::Pending,
            })
            .map(|(id, _)| id.clone())
            .collect()
    }
}

fn classify(
    graph: &Graph,
    step_runs: &StepRunTable,
    views: &BTreeMap<WorkItemId, NodeView>,
    id: &str,
) -> NodeView {
    let tolerates = graph.item(id).is_some_and(|i| i.continue_on_failure);
    let latest = step_runs.latest_for(id);

    if let Some(step) = latest {
        match step.status {
            StepStatus::Completed => return NodeView::Satisfied,
            StepStatus::Failed if tolerates => return NodeView::Tolerated,
            StepStatus::Failed | StepStatus::Cancelled => return NodeView::Failed,
            StepStatus::Running | StepStatus::NeedsReview | StepStatus::Blocked => {
                return NodeView::Active;
            }
            StepStatus::Pending if matches!(step.origin, StepOrigin::Trigger { .. }) => {
                return NodeView::Ready;
            }
            StepStatus::Pending | StepStatus::Skipped => {}
        }
    }

    let mut all_satisfied = true;
    for dep in graph.dependencies_of(id) {
        match views.get(dep) {
            Some(NodeView::Satisfied) => {}
            Some(NodeView::Failed | NodeView::Dead | NodeView::Tolerated) => return NodeView::Dead,
            _ => all_satisfied = false,
        }
    }

    if all_satisfied {
        NodeView::Ready
    } else {
        NodeView::Waiting
    }
}

/// Compute the next dispatchable batch.
///
/// - Pending StepRuns enqueued by a trigger go first, regardless of their
///   position in the graph.
/// - Otherwise only the first group that is not fully settled is
///   considered; its ready ids are returned lowest id first. A group
///   holding an untolerated failure dispatches nothing.
/// - An item with `parallel_eligible = false` is returned alone, and only
///   when nothing else is in flight.
/// - At most `capacity` minus the in-flight count ids are returned.
pub fn next_batch(
    graph: &Graph,
    policies: &PolicyMap,
    step_runs: &StepRunTable,
    capacity: usize,
) -> Vec<WorkItemId> {
    let in_flight: Vec<&WorkItemId> = step_runs
        .iter()
        .filter(|s| s.status.is_in_flight())
        .map(|s| &s.work_item_id)
        .collect();

    let slots = capacity.saturating_sub(in_flight.len());
    if slots == 0 {
        return Vec::new();
    }

    let exclusive_in_flight = in_flight
        .iter()
        .any(|id| graph.item(id).is_some_and(|i| !i.parallel_eligible));
    if exclusive_in_flight {
        return Vec::new();
    }

    let assessment = Assessment::of(graph, step_runs);
    let mut candidates: Vec<WorkItemId> = Vec::new();

    for id in graph.ids() {
        let triggered = step_runs.latest_for(id).is_some_and(|s| {
            s.status == StepStatus::Pending && matches!(s.origin, StepOrigin::Trigger { .. })
        });
        if triggered && policies.is_trigger_target(id) {
            candidates.push(id.to_string());
        }
    }

    for group in graph.groups() {
        let settled = group
            .iter()
            .all(|id| assessment.view(id).is_some_and(NodeView::is_settled));
        if settled {
            continue;
        }
        if group
            .iter()
            .any(|id| assessment.view(id) == Some(NodeView::Failed))
        {
            trace!(group = ?group, "group holds a failure; not advancing");
            break;
        }

        for id in group {
            if assessment.view(id) == Some(NodeView::Ready) && !candidates.contains(id) {
                candidates.push(id.clone());
            }
        }
        break;
    }

    if let Some(exclusive) = candidates
        .iter()
        .find(|id| graph.item(id).is_some_and(|i| !i.parallel_eligible))
    {
        trace!(item = %exclusive, "exclusive item ready");
        return if in_flight.is_empty() {
            vec![exclusive.clone()]
        } else {
            Vec::new()
        };
    }

    candidates.truncate(slots);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::WorkItem;

    fn diamond() -> Graph {
        Graph::build(vec![
            WorkItem::new("A"),
            WorkItem::new("B").depends_on(["A"]),
            WorkItem::new("C").depends_on(["A"]),
            WorkItem::new("D").depends_on(["B", "C"]),
        ])
        .unwrap()
    }

    fn complete(table: &mut StepRunTable, item: &str) {
        let id = table.create(item, StepOrigin::Scheduled).unwrap();
        table.transition(id, StepStatus::Running).unwrap();
        table.transition(id, StepStatus::NeedsReview).unwrap();
        table.transition(id, StepStatus::Completed).unwrap();
    }

    #[test]
    fn roots_first_then_next_group() {
        let graph = diamond();
        let policies = PolicyMap::default();
        let mut table = StepRunTable::new(1);

        assert_eq!(next_batch(&graph, &policies, &table, 4), vec!["A"]);
        complete(&mut table, "A");
        assert_eq!(next_batch(&graph, &policies, &table, 4), vec!["B", "C"]);
    }

    #[test]
    fn capacity_counts_in_flight_steps() {
        let graph = diamond();
        let policies = PolicyMap::default();
        let mut table = StepRunTable::new(1);
        complete(&mut table, "A");

        let b = table.create("B", StepOrigin::Scheduled).unwrap();
        table.transition(b, StepStatus::Running).unwrap();

        assert_eq!(next_batch(&graph, &policies, &table, 2), vec!["C"]);
        assert!(next_batch(&graph, &policies, &table, 1).is_empty());
    }

    #[test]
    fn exclusive_item_goes_alone() {
        let graph = Graph::build(vec![
            WorkItem::new("A"),
            WorkItem::new("B").exclusive(),
            WorkItem::new("C"),
        ])
        .unwrap();
        let policies = PolicyMap::default();
        let table = StepRunTable::new(1);

        assert_eq!(next_batch(&graph, &policies, &table, 3), vec!["B"]);
    }

    #[test]
    fn failed_dependency_makes_dependents_dead() {
        let graph = diamond();
        let mut table = StepRunTable::new(1);
        let a = table.create("A", StepOrigin::Scheduled).unwrap();
        table.transition(a, StepStatus::Running).unwrap();
        table.transition(a, StepStatus::Failed).unwrap();

        let assessment = Assessment::of(&graph, &table);
        assert_eq!(assessment.view("A"), Some(NodeView::Failed));
        assert_eq!(assessment.view("D"), Some(NodeView::Dead));
        assert!(!assessment.all_settled());
        assert!(assessment.has_failure());
        assert!(!assessment.all_succeeded());
        assert_eq!(assessment.unreachable(&table), vec!["B", "C", "D"]);
    }

    #[test]
    fn untolerated_failure_holds_back_later_groups() {
        let graph = Graph::build(vec![
            WorkItem::new("P"),
            WorkItem::new("Y"),
            WorkItem::new("Q").depends_on(["P"]),
        ])
        .unwrap();
        let policies = PolicyMap::default();
        let mut table = StepRunTable::new(1);
        complete(&mut table, "P");
        let y = table.create("Y", StepOrigin::Scheduled).unwrap();
        table.transition(y, StepStatus::Running).unwrap();
        table.transition(y, StepStatus::Failed).unwrap();

        assert!(next_batch(&graph, &policies, &table, 4).is_empty());
    }

    #[test]
    fn failure_in_a_group_stops_its_siblings_too() {
        let graph = diamond();
        let policies = PolicyMap::default();
        let mut table = StepRunTable::new(1);
        complete(&mut table, "A");
        let b = table.create("B", StepOrigin::Scheduled).unwrap();
        table.transition(b, StepStatus::Running).unwrap();
        table.transition(b, StepStatus::Failed).unwrap();

        assert!(next_batch(&graph, &policies, &table, 4).is_empty());
    }

    #[test]
    fn tolerated_failure_lets_the_group_pass() {
        let mut lint = WorkItem::new("Lint");
        lint.continue_on_failure = true;
        let graph = Graph::build(vec![
            WorkItem::new("P"),
            lint,
            WorkItem::new("Q").depends_on(["P"]),
        ])
        .unwrap();
        let policies = PolicyMap::default();
        let mut table = StepRunTable::new(1);
        complete(&mut table, "P");
        let l = table.create("Lint", StepOrigin::Scheduled).unwrap();
        table.transition(l, StepStatus::Running).unwrap();
        table.transition(l, StepStatus::Failed).unwrap();

        assert_eq!(next_batch(&graph, &policies, &table, 4), vec!["Q"]);
    }
}
