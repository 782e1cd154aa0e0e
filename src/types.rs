use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a work item (unique within a graph).
pub type WorkItemId = String;

/// Identifier of a recovery policy.
pub type PolicyId = String;

/// Monotonically increasing run identifier.
pub type RunId = u64;

/// Identifier of a single StepRun, unique within its run.
pub type StepRunId = u64;

/// Lifecycle of a single Run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Planning,
    Planned,
    Running,
    Paused,
    Blocked,
    Failed,
    Cancelled,
    Completed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Failed | RunStatus::Cancelled | RunStatus::Completed
        )
    }

    /// Whether `self -> to` is a legal run transition.
    pub fn can_transition_to(self, to: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, to),
            (Pending, Planning)
                | (Planning, Planned)
                | (Planning, Failed)
                | (Planned, Running)
                | (Running, Paused)
                | (Running, Cancelled)
                | (Running, Blocked)
                | (Running, Failed)
                | (Running, Completed)
                | (Paused, Running)
                | (Blocked, Running)
        )
    }
}

/// Lifecycle of one StepRun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    NeedsReview,
    Completed,
    Failed,
    Cancelled,
    Skipped,
    Blocked,
}

impl StepStatus {
    /// Terminal statuses never change again. `Blocked` is not terminal: it
    /// waits for an answer.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed
                | StepStatus::Failed
                | StepStatus::Cancelled
                | StepStatus::Skipped
        )
    }

    /// Statuses that occupy a worker slot.
    pub fn is_in_flight(self) -> bool {
        matches!(self, StepStatus::Running | StepStatus::NeedsReview)
    }

    /// Whether `self -> to` is a legal StepRun transition.
    ///
    /// Beyond the plain lifecycle, any non-terminal StepRun may be `Skipped`
    /// when an upstream node is reset by a loop step-back, and a `Blocked`
    /// StepRun returns to `Pending` once its blocking input is answered.
    pub fn can_transition_to(self, to: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Skipped)
                | (Running, NeedsReview)
                | (Running, Failed)
                | (Running, Blocked)
                | (Running, Cancelled)
                | (Running, Skipped)
                | (NeedsReview, Completed)
                | (NeedsReview, Failed)
                | (NeedsReview, Blocked)
                | (NeedsReview, Cancelled)
                | (NeedsReview, Skipped)
                | (Blocked, Pending)
                | (Blocked, Cancelled)
                | (Blocked, Skipped)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Outcome of one gate, and (for Pass/Warn/Fail) of the whole pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Warn,
    Fail,
    Skip,
    Error,
}

/// Reason code attached to a failing verdict or dispatch.
///
/// Codes are compared case-insensitively; policy conditions match on them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureReason(String);

impl FailureReason {
    pub const QA_FAILED: &'static str = "qa_failed";
    pub const QA_WARN: &'static str = "qa_warn";
    pub const EXECUTOR_ERROR: &'static str = "executor_error";
    pub const TIMEOUT: &'static str = "timeout";

    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().trim().to_lowercase())
    }

    pub fn qa_failed() -> Self {
        Self::new(Self::QA_FAILED)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, code: &str) -> bool {
        self.0 == code.trim().to_lowercase()
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse durations like `"500ms"`, `"3s"`, `"2m"` or `"1h"`.
pub fn parse_duration(s: &str) -> Result<std::time::Duration, String> {
    use std::time::Duration;

    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}
