// src/dag/policy.rs

//! Recovery policies and their explicit attachment to graph nodes.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dag::graph::Graph;
use crate::errors::ValidationError;
use crate::types::{FailureReason, PolicyId, WorkItemId};

/// Predicate over `(reason, attempt)`.
///
/// An empty reason list matches any reason.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub min_attempt: Option<u32>,
    #[serde(default)]
    pub max_attempt: Option<u32>,
}

impl Condition {
    pub fn on_reasons<I, S>(reasons: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            reasons: reasons.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn matches(&self, reason: &FailureReason, attempt: u32) -> bool {
        let reason_ok =
            self.reasons.is_empty() || self.reasons.iter().any(|r| reason.matches(r));
        let min_ok = self.min_attempt.is_none_or(|min| attempt >= min);
        let max_ok = self.max_attempt.is_none_or(|max| attempt <= max);
        reason_ok && min_ok && max_ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "snake_case")]
pub enum PolicyBehavior {
    /// Step back `step_back` levels and re-run the chain, at most
    /// `max_iterations` times per run.
    Loop {
        step_back: u32,
        max_iterations: u32,
        skip_ids: BTreeSet<WorkItemId>,
    },
    /// Enqueue `trigger_target_id` out of band, bounded by `max_depth`.
    Trigger {
        trigger_target_id: WorkItemId,
        max_depth: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub target_id: WorkItemId,
    pub condition: Option<Condition>,
    pub behavior: PolicyBehavior,
}

impl Policy {
    pub fn looping(
        id: impl Into<PolicyId>,
        target: impl Into<WorkItemId>,
        step_back: u32,
        max_iterations: u32,
    ) -> Self {
        Self {
            id: id.into(),
            target_id: target.into(),
            condition: None,
            behavior: PolicyBehavior::Loop {
                step_back,
                max_iterations,
                skip_ids: BTreeSet::new(),
            },
        }
    }

    pub fn trigger(
        id: impl Into<PolicyId>,
        target: impl Into<WorkItemId>,
        trigger_target: impl Into<WorkItemId>,
        max_depth: u32,
    ) -> Self {
        Self {
            id: id.into(),
            target_id: target.into(),
            condition: None,
            behavior: PolicyBehavior::Trigger {
                trigger_target_id: trigger_target.into(),
                max_depth,
            },
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// A policy without a condition matches unconditionally.
    pub fn matches(&self, reason: &FailureReason, attempt: u32) -> bool {
        self.condition
            .as_ref()
            .is_none_or(|c| c.matches(reason, attempt))
    }

    pub fn behavior_name(&self) -> &'static str {
        match self.behavior {
            PolicyBehavior::Loop { .. } => "loop",
            PolicyBehavior::Trigger { .. } => "trigger",
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let malformed = |message: &str| ValidationError::MalformedPolicy {
            policy: self.id.clone(),
            message: message.to_string(),
        };

        if self.id.trim().is_empty() {
            return Err(malformed("id must not be empty"));
        }
        match &self.behavior {
            PolicyBehavior::Loop {
                step_back,
                max_iterations,
                ..
            } => {
                if *step_back < 1 {
                    return Err(malformed("step_back must be >= 1"));
                }
                if *max_iterations < 1 {
                    return Err(malformed("max_iterations must be >= 1"));
                }
            }
            PolicyBehavior::Trigger { max_depth, .. } => {
                if *max_depth < 1 {
                    return Err(malformed("max_depth must be >= 1"));
                }
            }
        }
        Ok(())
    }
}

/// Policies attached to each node, in descriptor order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PolicyMap {
    by_node: BTreeMap<WorkItemId, Vec<Policy>>,
    trigger_targets: BTreeSet<WorkItemId>,
}

impl PolicyMap {
    /// Attach each policy to node N iff N references it, it targets N, or it
    /// is a trigger whose target is N. Nothing is attached implicitly.
    pub fn resolve(graph: &Graph, policies: Vec<Policy>) -> Result<Self, ValidationError> {
        let mut seen: HashSet<&str> = HashSet::new();
        for policy in &policies {
            policy.validate()?;
            if !seen.insert(policy.id.as_str()) {
                return Err(ValidationError::DuplicateId {
                    kind: "policy",
                    id: policy.id.clone(),
                });
            }
            if !graph.contains(&policy.target_id) {
                return Err(ValidationError::UnresolvedPolicyTarget {
                    policy: policy.id.clone(),
                    target: policy.target_id.clone(),
                });
            }
            if let PolicyBehavior::Trigger {
                trigger_target_id, ..
            } = &policy.behavior
            {
                if !graph.contains(trigger_target_id) {
                    return Err(ValidationError::UnresolvedPolicyTarget {
                        policy: policy.id.clone(),
                        target: trigger_target_id.clone(),
                    });
                }
            }
        }

        for item in graph.items() {
            for policy_ref in &item.initial_policy_refs {
                if !seen.contains(policy_ref.as_str()) {
                    return Err(ValidationError::UnknownPolicyRef {
                        item: item.id.clone(),
                        policy: policy_ref.clone(),
                    });
                }
            }
        }

        let mut map = PolicyMap::default();

        for policy in &policies {
            let mut attach_to: BTreeSet<&str> = BTreeSet::new();
            attach_to.insert(policy.target_id.as_str());

            for item in graph.items() {
                if item.initial_policy_refs.iter().any(|r| r == &policy.id) {
                    attach_to.insert(item.id.as_str());
                }
            }

            if let PolicyBehavior::Trigger {
                trigger_target_id, ..
            } = &policy.behavior
            {
                attach_to.insert(trigger_target_id.as_str());
                map.trigger_targets.insert(trigger_target_id.clone());
            }

            for node in attach_to {
                debug!(policy = %policy.id, node, "attaching policy");
                map.by_node
                    .entry(node.to_string())
                    .or_default()
                    .push(policy.clone());
            }
        }

        Ok(map)
    }

    pub fn policies_for(&self, id: &str) -> &[Policy] {
        self.by_node.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn is_trigger_target(&self, id: &str) -> bool {
        self.trigger_targets.contains(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&WorkItemId, &Vec<Policy>)> {
        self.by_node.iter()
    }
}
