// src/gates/builtin.rs

//! Gates that can be declared in a plan file.

use std::str::FromStr;
use std::sync::Arc;

use regex::Regex;

use super::{Finding, Gate, GateContext, GateResult, Severity};
use crate::types::Verdict;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    /// Any match of `pattern` is a finding.
    ForbidPattern,
    /// No match of `pattern` is a finding.
    RequirePattern,
    /// Blank output is a finding.
    NonEmpty,
}

impl FromStr for GateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "forbid_pattern" => Ok(GateKind::ForbidPattern),
            "require_pattern" => Ok(GateKind::RequirePattern),
            "non_empty" => Ok(GateKind::NonEmpty),
            other => Err(format!(
                "unknown gate kind '{other}'; expected forbid_pattern, require_pattern or non_empty"
            )),
        }
    }
}

/// Regex check over the output, line by line.
#[derive(Debug)]
pub struct PatternGate {
    id: String,
    pattern: Regex,
    forbid: bool,
    severity: Severity,
}

impl PatternGate {
    pub fn forbid(
        id: impl Into<String>,
        pattern: &str,
        severity: Severity,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            id: id.into(),
            pattern: Regex::new(pattern)?,
            forbid: true,
            severity,
        })
    }

    pub fn require(
        id: impl Into<String>,
        pattern: &str,
        severity: Severity,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            id: id.into(),
            pattern: Regex::new(pattern)?,
            forbid: false,
            severity,
        })
    }
}

impl Gate for PatternGate {
    fn id(&self) -> &str {
        &self.id
    }

    fn evaluate(&self, output: &str, _ctx: &GateContext<'_>) -> anyhow::Result<GateResult> {
        let mut findings = Vec::new();

        if self.forbid {
            for (idx, line) in output.lines().enumerate() {
                if let Some(m) = self.pattern.find(line) {
                    findings.push(
                        Finding::new(
                            self.severity,
                            format!(
                                "forbidden pattern '{}' matched '{}'",
                                self.pattern,
                                m.as_str()
                            ),
                        )
                        .at(format!("line {}", idx + 1))
                        .with_code(self.id.clone()),
                    );
                }
            }
        } else if !self.pattern.is_match(output) {
            findings.push(
                Finding::new(
                    self.severity,
                    format!("required pattern '{}' not found", self.pattern),
                )
                .with_code(self.id.clone()),
            );
        }

        let verdict = if findings.is_empty() {
            Verdict::Pass
        } else {
            self.severity.verdict()
        };
        Ok(GateResult::new(self.id.clone(), verdict, findings))
    }
}

#[derive(Debug)]
pub struct NonEmptyGate {
    id: String,
    severity: Severity,
}

impl NonEmptyGate {
    pub fn new(id: impl Into<String>, severity: Severity) -> Self {
        Self {
            id: id.into(),
            severity,
        }
    }
}

impl Gate for NonEmptyGate {
    fn id(&self) -> &str {
        &self.id
    }

    fn evaluate(&self, output: &str, _ctx: &GateContext<'_>) -> anyhow::Result<GateResult> {
        if !output.trim().is_empty() {
            return Ok(GateResult::pass(self.id.clone()));
        }
        Ok(GateResult::new(
            self.id.clone(),
            self.severity.verdict(),
            vec![Finding::new(self.severity, "output is empty").with_code(self.id.clone())],
        ))
    }
}

/// Build a gate from its plan-file description.
pub fn build_gate(
    id: &str,
    kind: GateKind,
    pattern: Option<&str>,
    severity: Severity,
) -> Result<Arc<dyn Gate>, String> {
    let need_pattern = || {
        pattern.ok_or_else(|| format!("gate '{id}' of kind {kind:?} requires a `pattern`"))
    };

    let gate: Arc<dyn Gate> = match kind {
        GateKind::ForbidPattern => Arc::new(
            PatternGate::forbid(id, need_pattern()?, severity)
                .map_err(|e| format!("gate '{id}' has an invalid pattern: {e}"))?,
        ),
        GateKind::RequirePattern => Arc::new(
            PatternGate::require(id, need_pattern()?, severity)
                .map_err(|e| format!("gate '{id}' has an invalid pattern: {e}"))?,
        ),
        GateKind::NonEmpty => Arc::new(NonEmptyGate::new(id, severity)),
    };
    Ok(gate)
}
