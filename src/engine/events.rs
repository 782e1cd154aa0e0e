// src/engine/events.rs

//! Append-only audit trail of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::types::{RunId, StepRunId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunTransition,
    StepCreated,
    StepTransition,
    DispatchStarted,
    DispatchFinished,
    DispatchFailed,
    GateEvaluated,
    VerdictRendered,
    ContinueDecision,
    RetryDecision,
    LoopDecision,
    LoopLimitReached,
    LoopConditionSkipped,
    StepBackReset,
    TriggerDecision,
    TriggerDepthExceeded,
    TriggerConditionSkipped,
    TriggerDeduplicated,
    BlockDecision,
    FailDecision,
    AnswerReceived,
    CommandRejected,
    LateCompletionIgnored,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Position in the log, starting at 1.
    pub seq: u64,
    pub run_id: RunId,
    pub step_run_id: Option<StepRunId>,
    pub kind: EventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EventLog {
    run_id: RunId,
    events: Vec<Event>,
}

impl EventLog {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            events: Vec::new(),
        }
    }

    pub fn append(&mut self, step_run_id: Option<StepRunId>, kind: EventKind, payload: Value) {
        let seq = self.events.len() as u64 + 1;
        trace!(run_id = self.run_id, ?step_run_id, ?kind, seq, "event");
        self.events.push(Event {
            seq,
            run_id: self.run_id,
            step_run_id,
            kind,
            payload,
            timestamp: Utc::now(),
        });
    }

    pub fn all(&self) -> &[Event] {
        &self.events
    }

    /// Events with `seq > after`.
    pub fn since(&self, after: u64) -> &[Event] {
        let start = (after as usize).min(self.events.len());
        &self.events[start..]
    }

    pub fn of_kind(&self, kind: EventKind) -> impl Iterator<Item = &Event> {
        self.events.iter().filter(move |e| e.kind == kind)
    }

    pub fn last_seq(&self) -> u64 {
        self.events.len() as u64
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
