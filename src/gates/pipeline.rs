// src/gates/pipeline.rs

//! Ordered gate evaluation and verdict aggregation.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use super::{Finding, Gate, GateContext, GateResult, Severity};
use crate::types::{FailureReason, Verdict};

/// Aggregated outcome of one pipeline pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    /// Always `Pass`, `Warn` or `Fail`.
    pub verdict: Verdict,
    pub results: Vec<GateResult>,
    /// Set for `Warn` and `Fail` verdicts.
    pub reason: Option<FailureReason>,
}

#[derive(Debug, Clone, Default)]
pub struct GatePipeline {
    gates: Vec<Arc<dyn Gate>>,
}

impl GatePipeline {
    pub fn new(gates: Vec<Arc<dyn Gate>>) -> Self {
        Self { gates }
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    /// Run every gate in declared order.
    ///
    /// With `skip` set (the step opted out of QA), every gate reports `Skip`
    /// and the verdict is `Pass`. Otherwise `Skip` and `Error` results count
    /// as `Warn`.
    pub fn evaluate(&self, output: &str, ctx: &GateContext<'_>, skip: bool) -> PipelineOutcome {
        if skip {
            let results = self
                .gates
                .iter()
                .map(|gate| {
                    GateResult::new(
                        gate.id(),
                        Verdict::Skip,
                        vec![Finding::new(Severity::Info, "skipped by policy")],
                    )
                })
                .collect();
            return PipelineOutcome {
                verdict: Verdict::Pass,
                results,
                reason: None,
            };
        }

        let results: Vec<GateResult> = self
            .gates
            .iter()
            .map(|gate| run_gate(gate.as_ref(), output, ctx))
            .collect();

        let verdict = aggregate(&results);
        let reason = match verdict {
            Verdict::Fail => Some(failure_reason(&results)),
            Verdict::Warn => Some(FailureReason::new(FailureReason::QA_WARN)),
            _ => None,
        };

        debug!(
            item = %ctx.work_item.id,
            gates = results.len(),
            ?verdict,
            "gate pipeline evaluated"
        );

        PipelineOutcome {
            verdict,
            results,
            reason,
        }
    }
}

fn run_gate(gate: &dyn Gate, output: &str, ctx: &GateContext<'_>) -> GateResult {
    let started = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| gate.evaluate(output, ctx)));
    let duration_ms = started.elapsed().as_millis() as u64;

    let mut result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            warn!(gate = gate.id(), error = %err, "gate returned an error");
            errored(gate.id(), format!("gate error: {err:#}"))
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            warn!(gate = gate.id(), %message, "gate panicked");
            errored(gate.id(), format!("gate panicked: {message}"))
        }
    };
    result.duration_ms = duration_ms;
    result
}

fn errored(gate_id: &str, message: String) -> GateResult {
    GateResult::new(
        gate_id,
        Verdict::Error,
        vec![Finding::new(Severity::Warning, message).with_code("gate_error")],
    )
}

fn aggregate(results: &[GateResult]) -> Verdict {
    if results.iter().any(|r| r.verdict == Verdict::Fail) {
        Verdict::Fail
    } else if results
        .iter()
        .any(|r| matches!(r.verdict, Verdict::Warn | Verdict::Skip | Verdict::Error))
    {
        Verdict::Warn
    } else {
        Verdict::Pass
    }
}

fn failure_reason(results: &[GateResult]) -> FailureReason {
    results
        .iter()
        .filter(|r| r.verdict == Verdict::Fail)
        .flat_map(|r| r.findings.iter())
        .find_map(|f| f.code.as_deref())
        .map(FailureReason::new)
        .unwrap_or_else(FailureReason::qa_failed)
}
