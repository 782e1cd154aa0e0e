// src/config/mod.rs

//! Plan files: TOML model, loading and validation.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_plan_path, load_and_validate, load_from_path};
pub use model::{
    ConditionConfig, GateConfig, PlanFile, PolicyConfig, RawPlanFile, RunSection, StepConfig,
};
