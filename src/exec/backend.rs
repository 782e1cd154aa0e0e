// src/exec/backend.rs

//! Pluggable executor backend.
//!
//! The runtime hands dispatch requests and cancellations to an
//! [`ExecutorBackend`] instead of spawning work itself, so tests can swap in
//! a scripted backend that reports outcomes without running anything.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::dispatcher::{DispatchRequest, dispatch};
use super::executor::ExecutorRegistry;
use crate::engine::RuntimeEvent;
use crate::errors::Result;
use crate::types::StepRunId;

pub type BackendFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// How dispatch requests are executed.
pub trait ExecutorBackend: Send {
    /// Start executing the given requests. Each one must eventually produce a
    /// `RuntimeEvent::DispatchFinished`.
    fn dispatch(&mut self, requests: Vec<DispatchRequest>) -> BackendFuture<'_>;

    /// Best-effort cancellation of in-flight dispatches.
    fn cancel(&mut self, step_run_ids: Vec<StepRunId>) -> BackendFuture<'_>;
}

/// In-flight dispatch owned by the pool.
struct ActiveDispatch {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Production backend: one tokio task per dispatch, each with its own
/// cancellation token. The core bounds how many are in flight.
pub struct PoolBackend {
    registry: Arc<ExecutorRegistry>,
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    active: HashMap<StepRunId, ActiveDispatch>,
}

impl PoolBackend {
    pub fn new(registry: Arc<ExecutorRegistry>, runtime_tx: mpsc::Sender<RuntimeEvent>) -> Self {
        Self {
            registry,
            runtime_tx,
            active: HashMap::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.active.values().filter(|a| !a.handle.is_finished()).count()
    }

    fn prune_finished(&mut self) {
        self.active.retain(|_, a| !a.handle.is_finished());
    }
}

impl ExecutorBackend for PoolBackend {
    fn dispatch(&mut self, requests: Vec<DispatchRequest>) -> BackendFuture<'_> {
        self.prune_finished();

        for request in requests {
            let step_run_id = request.step_run_id;
            let token = CancellationToken::new();
            let registry = Arc::clone(&self.registry);
            let tx = self.runtime_tx.clone();
            let child_token = token.clone();

            let handle = tokio::spawn(async move {
                let outcome = dispatch(&registry, request, child_token).await;
                if tx
                    .send(RuntimeEvent::DispatchFinished {
                        step_run_id,
                        outcome,
                    })
                    .await
                    .is_err()
                {
                    debug!(step_run_id, "runtime gone; dropping dispatch outcome");
                }
            });

            self.active.insert(step_run_id, ActiveDispatch { token, handle });
        }

        Box::pin(async { Ok(()) })
    }

    fn cancel(&mut self, step_run_ids: Vec<StepRunId>) -> BackendFuture<'_> {
        for id in step_run_ids {
            match self.active.remove(&id) {
                Some(active) => {
                    info!(step_run_id = id, "cancelling in-flight dispatch");
                    active.token.cancel();
                }
                None => {
                    debug!(step_run_id = id, "no in-flight dispatch to cancel");
                }
            }
        }
        Box::pin(async { Ok(()) })
    }
}

impl Drop for PoolBackend {
    fn drop(&mut self) {
        for active in self.active.values() {
            active.token.cancel();
        }
    }
}
