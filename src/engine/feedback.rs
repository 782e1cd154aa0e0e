// src/engine/feedback.rs

//! Feedback router: turns a verdict plus the node's policies into actions.
//!
//! The router is pure. It reads the failing StepRun and returns the actions
//! to apply, the updated runtime state and the notes to record as events.
//! The core applies all of it.

use std::collections::BTreeSet;

use serde_json::{Value, json};
use tracing::debug;

use crate::dag::policy::{Policy, PolicyBehavior};
use crate::dag::state::{RuntimeState, StepRun};
use crate::engine::events::EventKind;
use crate::types::{FailureReason, PolicyId, Verdict, WorkItemId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Continue,
    /// Generic retry: a new StepRun for the same item.
    Retry,
    /// Loop policy: rewind `levels` parallel-group levels.
    StepBack {
        policy: PolicyId,
        levels: u32,
        skip: BTreeSet<WorkItemId>,
    },
    /// Trigger policy: enqueue `target` out of band.
    Trigger { policy: PolicyId, target: WorkItemId },
    Block { reason: FailureReason },
    Fail { reason: FailureReason },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Continue => "continue",
            Action::Retry => "retry",
            Action::StepBack { .. } => "step_back",
            Action::Trigger { .. } => "trigger",
            Action::Block { .. } => "block",
            Action::Fail { .. } => "fail",
        }
    }
}

/// Something the core should record as an event.
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub kind: EventKind,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub actions: Vec<Action>,
    pub runtime_state: RuntimeState,
    pub notes: Vec<Note>,
}

impl Decision {
    pub fn is_continue(&self) -> bool {
        self.actions.iter().all(|a| *a == Action::Continue)
    }

    pub fn block_reason(&self) -> Option<&FailureReason> {
        self.actions.iter().find_map(|a| match a {
            Action::Block { reason } => Some(reason),
            _ => None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FeedbackRouter {
    max_attempts: u32,
    warn_is_failure: bool,
    human_input_reasons: Vec<FailureReason>,
}

impl Default for FeedbackRouter {
    fn default() -> Self {
        Self::new(3, false, ["clarification_required", "specification_gap", "ambiguity"])
    }
}

impl FeedbackRouter {
    pub fn new<I, S>(max_attempts: u32, warn_is_failure: bool, human_input_reasons: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            max_attempts,
            warn_is_failure,
            human_input_reasons: human_input_reasons
                .into_iter()
                .map(|r| FailureReason::new(r.as_ref()))
                .collect(),
        }
    }

    pub fn requires_human_input(&self, reason: &FailureReason) -> bool {
        self.human_input_reasons.contains(reason)
    }

    /// Decide what follows `verdict` on `step`.
    ///
    /// `policies` are the policies attached to the step's node, in
    /// descriptor order. All matching policies are evaluated: one loop and
    /// any number of triggers may fire from the same failure.
    pub fn decide(
        &self,
        step: &StepRun,
        verdict: Verdict,
        reason: &FailureReason,
        policies: &[Policy],
    ) -> Decision {
        let mut state = step.runtime_state.clone();
        let mut notes = Vec::new();

        let failing = match verdict {
            Verdict::Pass | Verdict::Skip => false,
            Verdict::Warn | Verdict::Error => self.warn_is_failure,
            Verdict::Fail => true,
        };

        if !failing {
            state.last_action = Some(Action::Continue.name().to_string());
            notes.push(Note {
                kind: EventKind::ContinueDecision,
                payload: json!({ "verdict": verdict }),
            });
            return Decision {
                actions: vec![Action::Continue],
                runtime_state: state,
                notes,
            };
        }

        let attempt = step.attempt_count;
        let start_depth = state.trigger_depth;
        let mut actions = Vec::new();
        let mut any_matched = false;
        let mut loop_fired = false;
        let mut trigger_fired = false;

        for policy in policies {
            let (skip_kind, base) = match &policy.behavior {
                PolicyBehavior::Loop { .. } => (EventKind::LoopConditionSkipped, "loop"),
                PolicyBehavior::Trigger {
                    trigger_target_id, ..
                } => {
                    // Attached because this node is the trigger's target.
                    if trigger_target_id == &step.work_item_id {
                        continue;
                    }
                    (EventKind::TriggerConditionSkipped, "trigger")
                }
            };

            if !policy.matches(reason, attempt) {
                notes.push(Note {
                    kind: skip_kind,
                    payload: json!({
                        "policy": policy.id,
                        "behavior": base,
                        "reason": reason,
                        "attempt": attempt,
                    }),
                });
                continue;
            }
            any_matched = true;

            match &policy.behavior {
                PolicyBehavior::Loop {
                    step_back,
                    max_iterations,
                    skip_ids,
                } => {
                    if loop_fired {
                        debug!(policy = %policy.id, "another loop already fired for this failure");
                        continue;
                    }
                    let count = state.loop_count(&policy.id);
                    if count < *max_iterations {
                        state.loop_counts.insert(policy.id.clone(), count + 1);
                        state.last_policy_id = Some(policy.id.clone());
                        loop_fired = true;
                        notes.push(Note {
                            kind: EventKind::LoopDecision,
                            payload: json!({
                                "policy": policy.id,
                                "iteration": count + 1,
                                "max_iterations": max_iterations,
                                "step_back": step_back,
                                "reason": reason,
                            }),
                        });
                        actions.push(Action::StepBack {
                            policy: policy.id.clone(),
                            levels: *step_back,
                            skip: skip_ids.clone(),
                        });
                    } else {
                        notes.push(Note {
                            kind: EventKind::LoopLimitReached,
                            payload: json!({
                                "policy": policy.id,
                                "max_iterations": max_iterations,
                            }),
                        });
                    }
                }
                PolicyBehavior::Trigger {
                    trigger_target_id,
                    max_depth,
                } => {
                    if start_depth < *max_depth {
                        trigger_fired = true;
                        state.last_policy_id = Some(policy.id.clone());
                        notes.push(Note {
                            kind: EventKind::TriggerDecision,
                            payload: json!({
                                "policy": policy.id,
                                "target": trigger_target_id,
                                "depth": start_depth + 1,
                                "max_depth": max_depth,
                                "reason": reason,
                            }),
                        });
                        actions.push(Action::Trigger {
                            policy: policy.id.clone(),
                            target: trigger_target_id.clone(),
                        });
                    } else {
                        notes.push(Note {
                            kind: EventKind::TriggerDepthExceeded,
                            payload: json!({
                                "policy": policy.id,
                                "target": trigger_target_id,
                                "depth": start_depth,
                                "max_depth": max_depth,
                            }),
                        });
                    }
                }
            }
        }

        if trigger_fired {
            state.trigger_depth = start_depth + 1;
        }

        if actions.is_empty() {
            let human = self.requires_human_input(reason);
            let action = if !any_matched && !human && attempt < self.max_attempts {
                notes.push(Note {
                    kind: EventKind::RetryDecision,
                    payload: json!({
                        "attempt": attempt,
                        "max_attempts": self.max_attempts,
                        "reason": reason,
                    }),
                });
                Action::Retry
            } else if human {
                notes.push(Note {
                    kind: EventKind::BlockDecision,
                    payload: json!({ "reason": reason }),
                });
                Action::Block {
                    reason: reason.clone(),
                }
            } else {
                notes.push(Note {
                    kind: EventKind::FailDecision,
                    payload: json!({
                        "reason": reason,
                        "attempt": attempt,
                        "policies_matched": any_matched,
                    }),
                });
                Action::Fail {
                    reason: reason.clone(),
                }
            };
            actions.push(action);
        }

        state.last_action = Some(
            actions
                .iter()
                .map(Action::name)
                .collect::<Vec<_>>()
                .join(","),
        );

        debug!(
            step_run_id = step.id,
            item = %step.work_item_id,
            ?verdict,
            %reason,
            actions = ?actions,
            "feedback decision"
        );

        Decision {
            actions,
            runtime_state: state,
            notes,
        }
    }
}
