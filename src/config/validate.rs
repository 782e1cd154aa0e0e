// src/config/validate.rs

use std::collections::{BTreeSet, HashSet};

use crate::config::model::{
    GateConfig, PlanFile, PolicyConfig, RawPlanFile, RunSection, StepConfig,
};
use crate::dag::{Condition, Graph, Policy, PolicyBehavior, PolicyMap, WorkItem};
use crate::engine::RunSettings;
use crate::errors::{ProtorunError, Result, ValidationError};
use crate::gates::{GateKind, GatePipeline, Severity, build_gate};
use crate::types::parse_duration;

impl TryFrom<RawPlanFile> for PlanFile {
    type Error = ProtorunError;

    fn try_from(raw: RawPlanFile) -> std::result::Result<Self, Self::Error> {
        let settings = validate_run_section(&raw.run)?;
        let items = raw
            .step
            .iter()
            .map(work_item_from_config)
            .collect::<Result<Vec<_>>>()?;
        let policies = raw
            .policy
            .iter()
            .map(policy_from_config)
            .collect::<Result<Vec<_>>>()?;
        let gates = build_pipeline(&raw.gate)?;

        // Full graph + policy validation up front; the core repeats it when
        // planning, so a plan that loads here always plans.
        let graph = Graph::build(items.clone())?;
        PolicyMap::resolve(&graph, policies.clone())?;

        Ok(PlanFile::new_unchecked(settings, items, policies, gates, raw.gate))
    }
}

fn validate_run_section(run: &RunSection) -> Result<RunSettings> {
    if run.capacity == 0 {
        return Err(ProtorunError::Config(
            "[run].capacity must be >= 1 (got 0)".to_string(),
        ));
    }
    if run.max_attempts == 0 {
        return Err(ProtorunError::Config(
            "[run].max_attempts must be >= 1 (got 0)".to_string(),
        ));
    }
    if run.default_engine.trim().is_empty() {
        return Err(ProtorunError::Config(
            "[run].default_engine must not be empty".to_string(),
        ));
    }
    let default_timeout = parse_duration(&run.timeout)
        .map_err(|e| ProtorunError::Config(format!("[run].timeout: {e}")))?;

    Ok(RunSettings {
        capacity: run.capacity,
        default_timeout,
        max_attempts: run.max_attempts,
        default_engine: run.default_engine.clone(),
        warn_is_failure: run.warn_is_failure,
        human_input_reasons: run.human_input_reasons.clone(),
    })
}

fn work_item_from_config(step: &StepConfig) -> Result<WorkItem> {
    let timeout = step
        .timeout
        .as_deref()
        .map(parse_duration)
        .transpose()
        .map_err(|message| ValidationError::MalformedWorkItem {
            item: step.id.clone(),
            message: format!("timeout: {message}"),
        })?;

    let mut item = WorkItem::new(step.id.clone()).depends_on(step.depends_on.iter().cloned());
    if let Some(description) = &step.description {
        item.description = description.clone();
    }
    if let Some(prompt) = &step.prompt {
        item.prompt = prompt.clone();
    }
    item.context_refs = step.context.clone();
    item.parallel_eligible = step.parallel;
    item.executor_hint = step.engine.clone();
    item.model = step.model.clone();
    item.timeout = timeout;
    item.initial_policy_refs = step.policies.clone();
    item.continue_on_failure = step.continue_on_failure;
    item.skip_qa = step.skip_qa;
    Ok(item)
}

fn policy_from_config(cfg: &PolicyConfig) -> Result<Policy> {
    let malformed = |message: String| ValidationError::MalformedPolicy {
        policy: cfg.id.clone(),
        message,
    };

    let behavior = match cfg.behavior.trim().to_lowercase().as_str() {
        "loop" => {
            let max_iterations = cfg
                .max_iterations
                .ok_or_else(|| malformed("loop policy requires `max_iterations`".to_string()))?;
            PolicyBehavior::Loop {
                step_back: cfg.step_back.unwrap_or(1),
                max_iterations,
                skip_ids: cfg.skip.iter().cloned().collect::<BTreeSet<_>>(),
            }
        }
        "trigger" => {
            let trigger_target_id = cfg
                .trigger_target
                .clone()
                .ok_or_else(|| malformed("trigger policy requires `trigger_target`".to_string()))?;
            PolicyBehavior::Trigger {
                trigger_target_id,
                max_depth: cfg.max_depth.unwrap_or(1),
            }
        }
        other => {
            return Err(malformed(format!(
                "unknown behavior '{other}'; expected loop or trigger"
            ))
            .into());
        }
    };

    Ok(Policy {
        id: cfg.id.clone(),
        target_id: cfg.target.clone(),
        condition: cfg.condition.as_ref().map(|c| Condition {
            reasons: c.reasons.clone(),
            min_attempt: c.min_attempt,
            max_attempt: c.max_attempt,
        }),
        behavior,
    })
}

fn parse_severity(s: &str) -> Option<Severity> {
    match s.trim().to_lowercase().as_str() {
        "error" | "fail" => Some(Severity::Error),
        "warning" | "warn" => Some(Severity::Warning),
        "info" => Some(Severity::Info),
        _ => None,
    }
}

fn build_pipeline(configs: &[GateConfig]) -> Result<GatePipeline> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut gates = Vec::with_capacity(configs.len());

    for cfg in configs {
        if cfg.id.trim().is_empty() {
            return Err(ProtorunError::Config("gate id must not be empty".to_string()));
        }
        if !seen.insert(cfg.id.as_str()) {
            return Err(ValidationError::DuplicateId {
                kind: "gate",
                id: cfg.id.clone(),
            }
            .into());
        }
        let kind: GateKind = cfg
            .kind
            .parse()
            .map_err(|e| ProtorunError::Config(format!("gate '{}': {e}", cfg.id)))?;
        let severity = parse_severity(&cfg.severity).ok_or_else(|| {
            ProtorunError::Config(format!(
                "gate '{}': unknown severity '{}'; expected error, warning or info",
                cfg.id, cfg.severity
            ))
        })?;
        let gate = build_gate(&cfg.id, kind, cfg.pattern.as_deref(), severity)
            .map_err(ProtorunError::Config)?;
        gates.push(gate);
    }

    Ok(GatePipeline::new(gates))
}
