// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::model::{PlanFile, RawPlanFile};
use crate::errors::Result;

/// Load a plan file and return the raw `RawPlanFile`.
///
/// This only performs TOML deserialization; use [`load_and_validate`] for
/// semantic checks.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawPlanFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let plan: RawPlanFile = toml::from_str(&contents)?;
    debug!(
        path = %path.display(),
        steps = plan.step.len(),
        policies = plan.policy.len(),
        gates = plan.gate.len(),
        "loaded plan file"
    );

    Ok(plan)
}

/// Load a plan file and validate it completely: settings, steps, the step
/// graph (unknown dependencies, cycles), policies and gates.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<PlanFile> {
    let raw = load_from_path(&path)?;
    let plan = PlanFile::try_from(raw)?;
    Ok(plan)
}

/// `Protorun.toml` in the current working directory.
pub fn default_plan_path() -> PathBuf {
    PathBuf::from("Protorun.toml")
}
