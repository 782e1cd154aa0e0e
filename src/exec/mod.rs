// src/exec/mod.rs

//! Execution layer.
//!
//! - [`executor`] defines the opaque `Executor` capability and the registry
//!   engines are resolved from.
//! - [`dispatcher`] runs one StepRun with a timeout and a cancellation token.
//! - [`backend`] provides the `ExecutorBackend` the runtime talks to, and the
//!   production `PoolBackend`.
//! - [`shell`] is the built-in `shell` engine.

pub mod backend;
pub mod dispatcher;
pub mod executor;
pub mod shell;

pub use backend::{BackendFuture, ExecutorBackend, PoolBackend};
pub use dispatcher::{DispatchOutcome, DispatchRequest, DispatchStatus, dispatch};
pub use executor::{
    ExecutionFuture, ExecutionRequest, ExecutionResponse, ExecutionStatus, Executor,
    ExecutorRegistry,
};
pub use shell::ShellExecutor;
