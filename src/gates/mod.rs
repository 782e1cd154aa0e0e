// src/gates/mod.rs

//! Quality gates.
//!
//! A [`Gate`] is a pure check over a StepRun's output. Gates never touch
//! StepRun state; the [`pipeline::GatePipeline`] runs them in order and the
//! engine applies the aggregated verdict.
//!
//! - [`builtin`] holds the regex-based gates available from plan files.
//! - [`pipeline`] runs gates and aggregates their verdicts.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dag::WorkItem;
use crate::types::{RunId, Verdict};

pub mod builtin;
pub mod pipeline;

pub use builtin::{GateKind, NonEmptyGate, PatternGate, build_gate};
pub use pipeline::{GatePipeline, PipelineOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    /// Verdict a gate reports when it finds something of this severity.
    pub fn verdict(self) -> Verdict {
        match self {
            Severity::Info => Verdict::Pass,
            Severity::Warning => Verdict::Warn,
            Severity::Error => Verdict::Fail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
    pub location: Option<String>,
    /// Rule code; the first failing finding's code becomes the failure reason.
    pub code: Option<String>,
}

impl Finding {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            location: None,
            code: None,
        }
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate_id: String,
    pub verdict: Verdict,
    pub findings: Vec<Finding>,
    pub duration_ms: u64,
}

impl GateResult {
    pub fn new(gate_id: impl Into<String>, verdict: Verdict, findings: Vec<Finding>) -> Self {
        Self {
            gate_id: gate_id.into(),
            verdict,
            findings,
            duration_ms: 0,
        }
    }

    pub fn pass(gate_id: impl Into<String>) -> Self {
        Self::new(gate_id, Verdict::Pass, Vec::new())
    }
}

/// What a gate may look at besides the output itself.
#[derive(Debug, Clone, Copy)]
pub struct GateContext<'a> {
    pub run_id: RunId,
    pub work_item: &'a WorkItem,
    pub attempt: u32,
}

/// Pluggable output check.
///
/// Implementations must be pure: same output and context, same result.
/// Returning an error (or panicking) is recorded as an `Error` result by the
/// pipeline.
pub trait Gate: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn evaluate(&self, output: &str, ctx: &GateContext<'_>) -> anyhow::Result<GateResult>;
}
