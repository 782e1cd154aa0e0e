// src/errors.rs

//! Crate-wide error types.
//!
//! Only errors that stop a caller outright live here. Dispatch failures,
//! gate crashes and exhausted policies are recorded as state, events and
//! findings instead of being returned.

use thiserror::Error;

use crate::types::{PolicyId, WorkItemId};

/// Input rejected before a Run starts. Nothing is applied partially.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("cycle detected in step graph: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<WorkItemId> },

    #[error("policy '{policy}' references unknown step '{target}'")]
    UnresolvedPolicyTarget { policy: PolicyId, target: WorkItemId },

    #[error("step '{item}' references unknown policy '{policy}'")]
    UnknownPolicyRef { item: WorkItemId, policy: PolicyId },

    #[error("step '{item}' has unknown dependency '{dependency}'")]
    UnknownDependency {
        item: WorkItemId,
        dependency: WorkItemId,
    },

    #[error("duplicate {kind} id '{id}'")]
    DuplicateId { kind: &'static str, id: String },

    #[error("malformed step '{item}': {message}")]
    MalformedWorkItem { item: WorkItemId, message: String },

    #[error("malformed policy '{policy}': {message}")]
    MalformedPolicy { policy: PolicyId, message: String },
}

/// Rejected state change. Carries the current state untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {entity} transition: {from} -> {to}")]
pub struct TransitionError {
    pub entity: &'static str,
    pub from: String,
    pub to: String,
}

#[derive(Error, Debug)]
pub enum ProtorunError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("StepRun not found: {0}")]
    StepRunNotFound(u64),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, ProtorunError>;
