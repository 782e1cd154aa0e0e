// src/config/model.rs

use serde::Deserialize;

use crate::dag::{Policy, WorkItem};
use crate::engine::RunSettings;
use crate::gates::GatePipeline;

/// Plan file as read from TOML, before validation.
///
/// ```toml
/// [run]
/// capacity = 2
/// timeout = "10m"
///
/// [[step]]
/// id = "A"
/// prompt = "echo A"
///
/// [[step]]
/// id = "B"
/// prompt = "echo B"
/// depends_on = ["A"]
/// ```
///
/// Every section is optional; an empty plan is valid.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawPlanFile {
    #[serde(default)]
    pub run: RunSection,

    #[serde(default)]
    pub step: Vec<StepConfig>,

    #[serde(default)]
    pub policy: Vec<PolicyConfig>,

    #[serde(default)]
    pub gate: Vec<GateConfig>,
}

/// `[run]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunSection {
    /// Max simultaneous running steps.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Default per-dispatch timeout, e.g. `"30s"`.
    #[serde(default = "default_timeout")]
    pub timeout: String,

    /// Generic retry budget per step.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_engine")]
    pub default_engine: String,

    #[serde(default)]
    pub warn_is_failure: bool,

    #[serde(default = "default_human_input_reasons")]
    pub human_input_reasons: Vec<String>,
}

fn default_capacity() -> usize {
    2
}

fn default_timeout() -> String {
    "10m".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_engine() -> String {
    crate::exec::shell::ENGINE_ID.to_string()
}

fn default_human_input_reasons() -> Vec<String> {
    RunSettings::default().human_input_reasons
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            timeout: default_timeout(),
            max_attempts: default_max_attempts(),
            default_engine: default_engine(),
            warn_is_failure: false,
            human_input_reasons: default_human_input_reasons(),
        }
    }
}

/// `[[step]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepConfig {
    pub id: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Prompt (or shell command) handed to the executor. Defaults to the id.
    #[serde(default)]
    pub prompt: Option<String>,

    #[serde(default)]
    pub context: Vec<String>,

    #[serde(default)]
    pub depends_on: Vec<String>,

    /// `false` makes the step run alone.
    #[serde(default = "default_parallel")]
    pub parallel: bool,

    #[serde(default)]
    pub engine: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub timeout: Option<String>,

    #[serde(default)]
    pub policies: Vec<String>,

    #[serde(default)]
    pub continue_on_failure: bool,

    #[serde(default)]
    pub skip_qa: bool,
}

fn default_parallel() -> bool {
    true
}

/// `[[policy]]` entry. Which fields are required depends on `behavior`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    pub id: String,

    /// `"loop"` or `"trigger"`.
    pub behavior: String,

    pub target: String,

    #[serde(default)]
    pub step_back: Option<u32>,

    #[serde(default)]
    pub max_iterations: Option<u32>,

    #[serde(default)]
    pub skip: Vec<String>,

    #[serde(default)]
    pub trigger_target: Option<String>,

    #[serde(default)]
    pub max_depth: Option<u32>,

    #[serde(default)]
    pub condition: Option<ConditionConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionConfig {
    #[serde(default)]
    pub reasons: Vec<String>,

    #[serde(default)]
    pub min_attempt: Option<u32>,

    #[serde(default)]
    pub max_attempt: Option<u32>,
}

/// `[[gate]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateConfig {
    pub id: String,

    /// `forbid_pattern`, `require_pattern` or `non_empty`.
    pub kind: String,

    #[serde(default)]
    pub pattern: Option<String>,

    /// `error` (fail) or `warning` (warn).
    #[serde(default = "default_severity")]
    pub severity: String,
}

fn default_severity() -> String {
    "error".to_string()
}

/// Validated plan, ready to hand to the core.
///
/// Only built through `TryFrom<RawPlanFile>`, so holding one means the
/// graph is acyclic and every reference resolves.
#[derive(Debug, Clone)]
pub struct PlanFile {
    pub settings: RunSettings,
    pub items: Vec<WorkItem>,
    pub policies: Vec<Policy>,
    pub gates: GatePipeline,
    /// Gate declarations, kept for display.
    pub gate_configs: Vec<GateConfig>,
}

impl PlanFile {
    pub(crate) fn new_unchecked(
        settings: RunSettings,
        items: Vec<WorkItem>,
        policies: Vec<Policy>,
        gates: GatePipeline,
        gate_configs: Vec<GateConfig>,
    ) -> Self {
        Self {
            settings,
            items,
            policies,
            gates,
            gate_configs,
        }
    }
}
