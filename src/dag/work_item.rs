// src/dag/work_item.rs

//! Work item descriptors: the immutable input of a Run.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{PolicyId, WorkItemId};

/// One unit of work and its dependencies.
///
/// Immutable once a Run starts; StepRuns refer back to it by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub description: String,
    /// Ids this item waits for.
    pub depends_on: BTreeSet<WorkItemId>,
    /// If false, the item is always dispatched alone.
    pub parallel_eligible: bool,
    /// Name of the executor that should run this item. Falls back to the
    /// run's default engine.
    pub executor_hint: Option<String>,
    /// Policies this item explicitly references.
    pub initial_policy_refs: Vec<PolicyId>,
    /// Prompt (or command) reference handed to the executor.
    pub prompt: String,
    pub context_refs: Vec<String>,
    pub model: Option<String>,
    /// Overrides the run's default dispatch timeout.
    pub timeout: Option<Duration>,
    /// A final failure of this item does not hold up its group.
    pub continue_on_failure: bool,
    /// Gates are skipped for this item ("QA: skip").
    pub skip_qa: bool,
}

impl WorkItem {
    pub fn new(id: impl Into<WorkItemId>) -> Self {
        let id = id.into();
        Self {
            description: id.clone(),
            prompt: id.clone(),
            id,
            depends_on: BTreeSet::new(),
            parallel_eligible: true,
            executor_hint: None,
            initial_policy_refs: Vec::new(),
            context_refs: Vec::new(),
            model: None,
            timeout: None,
            continue_on_failure: false,
            skip_qa: false,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<WorkItemId>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.parallel_eligible = false;
        self
    }
}
