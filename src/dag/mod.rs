// src/dag/mod.rs

//! Graph model, policies, state machines and scheduling.
//!
//! - [`work_item`] is the input descriptor.
//! - [`graph`] validates descriptors into an acyclic graph with parallel groups.
//! - [`policy`] attaches loop/trigger policies to nodes.
//! - [`state`] holds Run/StepRun records and their checked transitions.
//! - [`scheduler`] computes the next dispatchable batch from a snapshot.

pub mod graph;
pub mod policy;
pub mod scheduler;
pub mod state;
pub mod work_item;

pub use graph::Graph;
pub use policy::{Condition, Policy, PolicyBehavior, PolicyMap};
pub use scheduler::{Assessment, NodeView, next_batch};
pub use state::{Run, RuntimeState, StepOrigin, StepRun, StepRunTable};
pub use work_item::WorkItem;
