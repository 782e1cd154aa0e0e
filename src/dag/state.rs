// src/dag/state.rs

//! Run and StepRun records and their checked state machines.
//!
//! Every status change goes through [`Run::transition`] or
//! [`StepRunTable::transition`]; illegal changes are rejected and leave the
//! record untouched.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::TransitionError;
use crate::types::{FailureReason, PolicyId, RunId, RunStatus, StepRunId, StepStatus, WorkItemId};

/// One execution of a graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub status: RunStatus,
    /// Why the run reached its current status, if it was not routine.
    pub status_reason: Option<String>,
    /// Times each loop policy has fired in this run, across all nodes.
    #[serde(default)]
    pub loop_counts: BTreeMap<PolicyId, u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(id: RunId) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: RunStatus::Pending,
            status_reason: None,
            loop_counts: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply `to`, returning the previous status.
    pub fn transition(&mut self, to: RunStatus) -> Result<RunStatus, TransitionError> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(TransitionError {
                entity: "run",
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        debug!(run_id = self.id, %from, %to, "run transition");
        Ok(from)
    }
}

/// Policy bookkeeping carried from one StepRun of a work item to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeState {
    /// Run-wide loop counts as of this StepRun's last decision.
    #[serde(default)]
    pub loop_counts: BTreeMap<PolicyId, u32>,
    #[serde(default)]
    pub trigger_depth: u32,
    #[serde(default)]
    pub last_action: Option<String>,
    #[serde(default)]
    pub last_policy_id: Option<PolicyId>,
    #[serde(default)]
    pub triggered_by: Option<StepRunId>,
    /// Answer supplied while the step was blocked.
    #[serde(default)]
    pub answer: Option<String>,
}

impl RuntimeState {
    pub fn loop_count(&self, policy: &str) -> u32 {
        self.loop_counts.get(policy).copied().unwrap_or(0)
    }
}

/// Why a StepRun was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOrigin {
    /// First picked up by the scheduler.
    Scheduled,
    /// Generic retry after a failure.
    Retry,
    /// Recreated by a loop step-back.
    StepBack { policy: PolicyId },
    /// Enqueued out of band by a trigger policy.
    Trigger { by: StepRunId, policy: PolicyId },
}

/// One attempt of a work item within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    pub id: StepRunId,
    pub run_id: RunId,
    pub work_item_id: WorkItemId,
    pub status: StepStatus,
    /// 1 for the first StepRun of a work item, +1 per recreation.
    pub attempt_count: u32,
    pub runtime_state: RuntimeState,
    pub engine_id: Option<String>,
    /// Output reference produced by the executor.
    pub result: Option<String>,
    pub last_reason: Option<FailureReason>,
    pub origin: StepOrigin,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// All StepRuns of one run, plus the latest StepRun per work item.
///
/// Only the latest StepRun of a work item may be non-terminal, so at most
/// one StepRun per work item is in flight.
#[derive(Debug, Clone, Serialize)]
pub struct StepRunTable {
    run_id: RunId,
    next_id: StepRunId,
    step_runs: BTreeMap<StepRunId, StepRun>,
    latest: BTreeMap<WorkItemId, StepRunId>,
}

impl StepRunTable {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            next_id: 1,
            step_runs: BTreeMap::new(),
            latest: BTreeMap::new(),
        }
    }

    /// Create a Pending StepRun for `item`.
    ///
    /// Returns `None` if the item already has a non-terminal StepRun. The new
    /// StepRun inherits the runtime state of the item's previous StepRun.
    pub fn create(&mut self, item: &str, origin: StepOrigin) -> Option<StepRunId> {
        let (attempt_count, runtime_state) = match self.latest_for(item) {
            Some(prev) if !prev.status.is_terminal() => {
                warn!(
                    item,
                    existing = prev.id,
                    status = %prev.status,
                    "refusing to create a second non-terminal StepRun"
                );
                return None;
            }
            Some(prev) => (prev.attempt_count + 1, prev.runtime_state.clone()),
            None => (1, RuntimeState::default()),
        };

        let id = self.next_id;
        self.next_id += 1;
        let now = Utc::now();

        self.step_runs.insert(
            id,
            StepRun {
                id,
                run_id: self.run_id,
                work_item_id: item.to_string(),
                status: StepStatus::Pending,
                attempt_count,
                runtime_state,
                engine_id: None,
                result: None,
                last_reason: None,
                origin,
                created_at: now,
                updated_at: now,
            },
        );
        self.latest.insert(item.to_string(), id);

        debug!(step_run_id = id, item, attempt_count, "created StepRun");
        Some(id)
    }

    /// Apply `to` to StepRun `id`, returning the previous status.
    pub fn transition(
        &mut self,
        id: StepRunId,
        to: StepStatus,
    ) -> Result<StepStatus, TransitionError> {
        let Some(step) = self.step_runs.get_mut(&id) else {
            return Err(TransitionError {
                entity: "step_run",
                from: format!("<missing #{id}>"),
                to: to.to_string(),
            });
        };
        let from = step.status;
        if !from.can_transition_to(to) {
            return Err(TransitionError {
                entity: "step_run",
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        step.status = to;
        step.updated_at = Utc::now();
        debug!(step_run_id = id, item = %step.work_item_id, %from, %to, "step transition");
        Ok(from)
    }

    pub fn get(&self, id: StepRunId) -> Option<&StepRun> {
        self.step_runs.get(&id)
    }

    pub fn get_mut(&mut self, id: StepRunId) -> Option<&mut StepRun> {
        self.step_runs.get_mut(&id)
    }

    pub fn latest_for(&self, item: &str) -> Option<&StepRun> {
        self.latest.get(item).and_then(|id| self.step_runs.get(id))
    }

    /// Every StepRun, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &StepRun> {
        self.step_runs.values()
    }

    /// Every StepRun of `item`, oldest first.
    pub fn history_for<'a>(&'a self, item: &'a str) -> impl Iterator<Item = &'a StepRun> + 'a {
        self.step_runs
            .values()
            .filter(move |s| s.work_item_id == item)
    }

    pub fn with_status(&self, status: StepStatus) -> Vec<StepRunId> {
        self.step_runs
            .values()
            .filter(|s| s.status == status)
            .map(|s| s.id)
            .collect()
    }

    pub fn in_flight_count(&self) -> usize {
        self.step_runs
            .values()
            .filter(|s| s.status.is_in_flight())
            .count()
    }

    pub fn len(&self) -> usize {
        self.step_runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.step_runs.is_empty()
    }
}
