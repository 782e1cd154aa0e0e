#![allow(dead_code)]

use protorun::config::{
    ConditionConfig, GateConfig, PlanFile, PolicyConfig, RawPlanFile, RunSection, StepConfig,
};
use protorun::engine::{CoreRuntime, RuntimeOptions};

/// Builder for `PlanFile` to simplify test setup.
pub struct PlanBuilder {
    plan: RawPlanFile,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self {
            plan: RawPlanFile {
                run: RunSection::default(),
                step: Vec::new(),
                policy: Vec::new(),
                gate: Vec::new(),
            },
        }
    }

    pub fn with_step(mut self, step: StepConfig) -> Self {
        self.plan.step.push(step);
        self
    }

    pub fn with_policy(mut self, policy: PolicyConfig) -> Self {
        self.plan.policy.push(policy);
        self
    }

    pub fn with_gate(mut self, gate: GateConfig) -> Self {
        self.plan.gate.push(gate);
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.plan.run.capacity = capacity;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.plan.run.max_attempts = max_attempts;
        self
    }

    pub fn timeout(mut self, timeout: &str) -> Self {
        self.plan.run.timeout = timeout.to_string();
        self
    }

    pub fn default_engine(mut self, engine: &str) -> Self {
        self.plan.run.default_engine = engine.to_string();
        self
    }

    pub fn warn_is_failure(mut self, val: bool) -> Self {
        self.plan.run.warn_is_failure = val;
        self
    }

    pub fn raw(self) -> RawPlanFile {
        self.plan
    }

    pub fn build(self) -> PlanFile {
        PlanFile::try_from(self.plan).expect("Failed to build valid plan from builder")
    }
}

impl Default for PlanBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `StepConfig`.
pub struct StepBuilder {
    step: StepConfig,
}

impl StepBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            step: StepConfig {
                id: id.to_string(),
                description: None,
                prompt: None,
                context: vec![],
                depends_on: vec![],
                parallel: true,
                engine: None,
                model: None,
                timeout: None,
                policies: vec![],
                continue_on_failure: false,
                skip_qa: false,
            },
        }
    }

    pub fn prompt(mut self, prompt: &str) -> Self {
        self.step.prompt = Some(prompt.to_string());
        self
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.step.depends_on.push(dep.to_string());
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.step.parallel = false;
        self
    }

    pub fn engine(mut self, engine: &str) -> Self {
        self.step.engine = Some(engine.to_string());
        self
    }

    pub fn timeout(mut self, timeout: &str) -> Self {
        self.step.timeout = Some(timeout.to_string());
        self
    }

    pub fn policy(mut self, id: &str) -> Self {
        self.step.policies.push(id.to_string());
        self
    }

    pub fn continue_on_failure(mut self) -> Self {
        self.step.continue_on_failure = true;
        self
    }

    pub fn skip_qa(mut self) -> Self {
        self.step.skip_qa = true;
        self
    }

    pub fn build(self) -> StepConfig {
        self.step
    }
}

/// Builder for `PolicyConfig`.
pub struct PolicyBuilder {
    policy: PolicyConfig,
}

impl PolicyBuilder {
    pub fn looping(id: &str, target: &str, step_back: u32, max_iterations: u32) -> Self {
        Self {
            policy: PolicyConfig {
                id: id.to_string(),
                behavior: "loop".to_string(),
                target: target.to_string(),
                step_back: Some(step_back),
                max_iterations: Some(max_iterations),
                skip: vec![],
                trigger_target: None,
                max_depth: None,
                condition: None,
            },
        }
    }

    pub fn trigger(id: &str, target: &str, trigger_target: &str, max_depth: u32) -> Self {
        Self {
            policy: PolicyConfig {
                id: id.to_string(),
                behavior: "trigger".to_string(),
                target: target.to_string(),
                step_back: None,
                max_iterations: None,
                skip: vec![],
                trigger_target: Some(trigger_target.to_string()),
                max_depth: Some(max_depth),
                condition: None,
            },
        }
    }

    pub fn skip(mut self, id: &str) -> Self {
        self.policy.skip.push(id.to_string());
        self
    }

    pub fn on_reasons(mut self, reasons: &[&str]) -> Self {
        let condition = self.policy.condition.get_or_insert_with(ConditionConfig::default);
        condition.reasons = reasons.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn build(self) -> PolicyConfig {
        self.policy
    }
}

/// A `forbid_pattern` gate that fails on `pattern`.
pub fn forbid_gate(id: &str, pattern: &str) -> GateConfig {
    GateConfig {
        id: id.to_string(),
        kind: "forbid_pattern".to_string(),
        pattern: Some(pattern.to_string()),
        severity: "error".to_string(),
    }
}

/// Core runtime for `plan`, already planned (status `Planned`).
pub fn planned_core(plan: &PlanFile, options: RuntimeOptions) -> CoreRuntime {
    let mut core = CoreRuntime::new(1, plan.settings.clone(), plan.gates.clone(), options);
    core.plan(plan.items.clone(), plan.policies.clone())
        .expect("plan built by PlanBuilder must plan");
    core
}
