// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod gates;
pub mod logging;
pub mod types;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::PlanFile;
use crate::config::loader::load_and_validate;
use crate::dag::{Graph, PolicyBehavior, PolicyMap};
use crate::engine::{
    CoreRuntime, Event, RunCommand, RunSnapshot, Runtime, RuntimeEvent, RuntimeOptions,
};
use crate::exec::{ExecutorRegistry, PoolBackend};
use crate::types::{RunStatus, StepStatus};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - plan loading and validation
/// - the core runtime and its async shell
/// - the worker-pool executor backend
/// - event / snapshot output
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let mut plan = load_and_validate(&args.plan)
        .with_context(|| format!("loading plan {}", args.plan.display()))?;

    if let Some(capacity) = args.capacity {
        if capacity == 0 {
            bail!("--capacity must be >= 1");
        }
        plan.settings.capacity = capacity;
    }

    if args.dry_run {
        print_dry_run(&plan)?;
        return Ok(());
    }

    let run_id = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let options = RuntimeOptions {
        exit_when_blocked: true,
    };

    let mut core = CoreRuntime::new(run_id, plan.settings.clone(), plan.gates.clone(), options);
    core.plan(plan.items.clone(), plan.policies.clone())?;

    // Runtime event channel.
    let (rt_tx, rt_rx) = mpsc::channel::<RuntimeEvent>(64);

    let registry = Arc::new(ExecutorRegistry::with_builtins());
    let executor = PoolBackend::new(registry, rt_tx.clone());

    // Ctrl-C → graceful shutdown.
    {
        let tx = rt_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            let _ = tx.send(RuntimeEvent::ShutdownRequested).await;
        });
    }

    rt_tx.send(RuntimeEvent::Command(RunCommand::Start)).await?;

    let mut runtime = Runtime::new(core, rt_rx, executor);
    let writer = match &args.events_out {
        Some(path) => {
            let (sink_tx, sink_rx) = mpsc::unbounded_channel::<Event>();
            runtime = runtime.with_event_sink(sink_tx);
            Some(spawn_event_writer(path, sink_rx).await?)
        }
        None => None,
    };

    let snapshot = runtime.run().await?;

    if let Some(writer) = writer {
        writer.await.context("event writer task panicked")??;
    }
    if let Some(path) = &args.state_out {
        write_snapshot(path, &snapshot).await?;
    }

    report(&snapshot)
}

/// Append events as JSON lines until the runtime drops its sender.
async fn spawn_event_writer(
    path: &Path,
    mut rx: mpsc::UnboundedReceiver<Event>,
) -> Result<JoinHandle<Result<()>>> {
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;

    Ok(tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let mut line = serde_json::to_vec(&event)?;
            line.push(b'\n');
            file.write_all(&line).await?;
        }
        file.flush().await?;
        Ok(())
    }))
}

async fn write_snapshot(path: &Path, snapshot: &RunSnapshot) -> Result<()> {
    let json = serde_json::to_vec_pretty(snapshot)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    debug!(path = %path.display(), "wrote run snapshot");
    Ok(())
}

/// Print a one-line-per-step summary and turn anything but `Completed`
/// into an error.
fn report(snapshot: &RunSnapshot) -> Result<()> {
    println!("run {}: {}", snapshot.run.id, snapshot.run.status);
    for item in &snapshot.items {
        let latest = snapshot
            .step_runs
            .iter()
            .filter(|sr| sr.work_item_id == item.id)
            .max_by_key(|sr| sr.id);
        match latest {
            Some(sr) => println!(
                "  {:<24} {:<12} attempt {}",
                item.id,
                sr.status.to_string(),
                sr.attempt_count
            ),
            None => println!("  {:<24} (never started)", item.id),
        }
    }

    match snapshot.run.status {
        RunStatus::Completed => Ok(()),
        RunStatus::Blocked => {
            let waiting: Vec<String> = snapshot
                .step_runs
                .iter()
                .filter(|sr| sr.status == StepStatus::Blocked)
                .map(|sr| format!("{} (step run {})", sr.work_item_id, sr.id))
                .collect();
            bail!("run blocked waiting for input: {}", waiting.join(", "))
        }
        status => {
            info!(%status, "run did not complete");
            bail!(
                "run finished with status {status}{}",
                snapshot
                    .run
                    .status_reason
                    .as_deref()
                    .map(|f| format!(": {f}"))
                    .unwrap_or_default()
            )
        }
    }
}

/// Dry-run output: groups, policies and gates.
fn print_dry_run(plan: &PlanFile) -> Result<()> {
    let graph = Graph::build(plan.items.clone())?;
    let policies = PolicyMap::resolve(&graph, plan.policies.clone())?;

    println!("protorun dry-run");
    println!("  run.capacity = {}", plan.settings.capacity);
    println!("  run.max_attempts = {}", plan.settings.max_attempts);
    println!("  run.default_engine = {}", plan.settings.default_engine);
    println!();

    println!("groups ({}):", graph.groups().len());
    for (level, group) in graph.groups().iter().enumerate() {
        println!("  [{level}] {}", group.join(", "));
    }
    println!();

    println!("steps ({}):", graph.len());
    for item in graph.items() {
        println!("  - {}", item.id);
        println!("      prompt: {}", item.prompt);
        let deps = graph.dependencies_of(&item.id);
        if !deps.is_empty() {
            println!("      depends_on: {deps:?}");
        }
        if !item.parallel_eligible {
            println!("      parallel: false");
        }
        if let Some(engine) = &item.executor_hint {
            println!("      engine: {engine}");
        }
        if item.continue_on_failure {
            println!("      continue_on_failure: true");
        }
        if item.skip_qa {
            println!("      skip_qa: true");
        }
        for policy in policies.policies_for(&item.id) {
            match &policy.behavior {
                PolicyBehavior::Loop {
                    step_back,
                    max_iterations,
                    ..
                } => println!(
                    "      policy {}: loop step_back={step_back} max_iterations={max_iterations}",
                    policy.id
                ),
                PolicyBehavior::Trigger {
                    trigger_target_id,
                    max_depth,
                } => println!(
                    "      policy {}: trigger -> {trigger_target_id} max_depth={max_depth}",
                    policy.id
                ),
            }
        }
    }

    if !plan.gate_configs.is_empty() {
        println!();
        println!("gates ({}):", plan.gate_configs.len());
        for gate in &plan.gate_configs {
            println!("  - {} ({}, {})", gate.id, gate.kind, gate.severity);
        }
    }

    debug!("dry-run complete (no execution)");
    Ok(())
}
