// src/engine/runtime.rs

use std::fmt;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::{Error, Result};
use crate::exec::ExecutorBackend;
use crate::types::StepRunId;

use super::core::{CoreRuntime, RunSnapshot};
use super::events::Event;
use super::{CoreCommand, RunCommand, RuntimeEvent};

/// Drives the core in response to `RuntimeEvent`s and delegates execution to
/// an `ExecutorBackend`.
///
/// This is a pure IO shell around `CoreRuntime`, which holds all run
/// semantics. New events from the core's log are forwarded to the optional
/// sink after every step.
pub struct Runtime<E: ExecutorBackend> {
    core: CoreRuntime,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    executor: E,
    event_sink: Option<mpsc::UnboundedSender<Event>>,
    published: u64,
}

impl<E: ExecutorBackend> fmt::Debug for Runtime<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .field("published", &self.published)
            .finish_non_exhaustive()
    }
}

impl<E: ExecutorBackend> Runtime<E> {
    pub fn new(core: CoreRuntime, event_rx: mpsc::Receiver<RuntimeEvent>, executor: E) -> Self {
        Self {
            core,
            event_rx,
            executor,
            event_sink: None,
            published: 0,
        }
    }

    /// Forward every event the core records to `sink`.
    pub fn with_event_sink(mut self, sink: mpsc::UnboundedSender<Event>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Main event loop. Returns the final snapshot once the core asks to
    /// stop or the event channel closes.
    pub async fn run(mut self) -> Result<RunSnapshot> {
        info!(run_id = self.core.run().id, "protorun runtime started");
        self.publish();

        if self.core.status().is_terminal() {
            info!(status = %self.core.status(), "run already finished");
            return Ok(self.core.snapshot());
        }

        loop {
            let event = match self.event_rx.recv().await {
                Some(e) => e,
                None => {
                    info!("runtime event channel closed; exiting");
                    break;
                }
            };

            debug!(?event, "runtime received event");

            let step = self.core.step(event);

            for command in step.commands {
                self.execute_command(command).await?;
            }
            self.publish();

            if !step.keep_running {
                info!(status = %self.core.status(), "core requested exit; stopping runtime");
                break;
            }
        }

        info!("runtime exiting");
        Ok(self.core.snapshot())
    }

    async fn execute_command(&mut self, command: CoreCommand) -> Result<()> {
        match command {
            CoreCommand::Dispatch(requests) => {
                if requests.is_empty() {
                    return Ok(());
                }
                let ids: Vec<_> = requests.iter().map(|r| r.step_run_id).collect();
                debug!(?ids, "dispatching StepRuns");
                self.executor.dispatch(requests).await?;
            }
            CoreCommand::CancelDispatch(ids) => {
                debug!(?ids, "cancelling dispatches");
                self.executor.cancel(ids).await?;
            }
            CoreCommand::RunFinished(status) => {
                info!(run_id = self.core.run().id, %status, "run finished");
            }
        }
        Ok(())
    }

    fn publish(&mut self) {
        let Some(sink) = &self.event_sink else {
            self.published = self.core.events().last_seq();
            return;
        };
        for event in self.core.events().since(self.published) {
            if sink.send(event.clone()).is_err() {
                warn!("event sink closed; dropping events");
                break;
            }
        }
        self.published = self.core.events().last_seq();
    }
}

/// Cloneable handle for sending commands to a running [`Runtime`].
#[derive(Debug, Clone)]
pub struct RunHandle {
    tx: mpsc::Sender<RuntimeEvent>,
}

impl RunHandle {
    pub fn new(tx: mpsc::Sender<RuntimeEvent>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, command: RunCommand) -> Result<()> {
        self.tx
            .send(RuntimeEvent::Command(command))
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        self.send(RunCommand::Start).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.send(RunCommand::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.send(RunCommand::Resume).await
    }

    pub async fn cancel(&self) -> Result<()> {
        self.send(RunCommand::Cancel).await
    }

    pub async fn answer(&self, step_run_id: StepRunId, answer: impl Into<String>) -> Result<()> {
        self.send(RunCommand::Answer {
            step_run_id,
            answer: answer.into(),
        })
        .await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(RuntimeEvent::ShutdownRequested)
            .await
            .map_err(Error::from)?;
        Ok(())
    }
}
