// src/engine/mod.rs

//! Orchestration engine.
//!
//! The pure core state machine lives in [`core`] (with per-event logic in
//! [`event_handlers`]); it owns every Run/StepRun/Event mutation. The async
//! IO shell in [`runtime`] feeds it events and carries out the commands it
//! returns. [`feedback`] decides what follows a verdict and [`events`] is
//! the audit log.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::exec::DispatchOutcome;
use crate::types::StepRunId;

/// Per-run knobs, usually from the `[run]` table of a plan file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSettings {
    /// Max simultaneous in-flight StepRuns.
    pub capacity: usize,
    /// Dispatch timeout for items without their own.
    pub default_timeout: Duration,
    /// Generic retry budget per work item.
    pub max_attempts: u32,
    pub default_engine: String,
    /// Route `Warn` verdicts through the feedback router instead of
    /// continuing.
    pub warn_is_failure: bool,
    /// Failure reasons that block the run for external input.
    pub human_input_reasons: Vec<String>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            capacity: 2,
            default_timeout: Duration::from_secs(600),
            max_attempts: 3,
            default_engine: crate::exec::shell::ENGINE_ID.to_string(),
            warn_is_failure: false,
            human_input_reasons: vec![
                "clarification_required".to_string(),
                "specification_gap".to_string(),
                "ambiguity".to_string(),
            ],
        }
    }
}

/// Options used by both the core and the async shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeOptions {
    /// Stop the runtime once the run is blocked (nobody is around to answer).
    pub exit_when_blocked: bool,
}

/// External commands against a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunCommand {
    Start,
    Pause,
    Resume,
    Cancel,
    /// Answer the input a blocked StepRun is waiting for.
    Answer {
        step_run_id: StepRunId,
        answer: String,
    },
}

/// Events flowing into the runtime.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    Command(RunCommand),
    /// A dispatch came back from the executor backend.
    DispatchFinished {
        step_run_id: StepRunId,
        outcome: DispatchOutcome,
    },
    /// Graceful shutdown requested (e.g. Ctrl-C).
    ShutdownRequested,
}

pub mod core;
pub mod event_handlers;
pub mod events;
pub mod feedback;
pub mod runtime;

pub use core::{CoreRuntime, RunSnapshot};
pub use event_handlers::{CoreCommand, CoreStep};
pub use events::{Event, EventKind, EventLog};
pub use feedback::{Action, Decision, FeedbackRouter};
pub use runtime::{RunHandle, Runtime};
