//! Verification gates: structural rule sets and judged (agent-backed) checks.
//!
//! A gate turns the current artifacts into a [`VerificationReport`]. The
//! report's pass flag comes from the gate's [`PassPredicate`], which defaults
//! to "every condition holds".

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use strata_types::{AgentOutput, Result, StrataError};

use crate::agent::ResolvedAgents;
use crate::artifacts::ArtifactStore;
use crate::condition::{evaluate_condition, parse_condition};
use crate::definition::AgentSpec;

// ---------------------------------------------------------------------------
// Gate specification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSpec {
    pub name: String,
    pub check: GateCheck,
    #[serde(default)]
    pub predicate: PassPredicate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateCheck {
    /// Deterministic presence/shape checks over named artifacts.
    Structural { rules: Vec<StructuralRule> },
    /// Delegated to an agent whose output is a structured report.
    Judged { agent: AgentSpec },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum StructuralRule {
    ArtifactPresent { artifact: String },
    /// Present and not null, `""`, `[]` or `{}`.
    NonEmpty { artifact: String },
    /// The artifact is a JSON object holding every listed (dotted) field.
    RequiredFields { artifact: String, fields: Vec<String> },
    /// The artifact's text matches `pattern`.
    Matches { artifact: String, pattern: String },
    /// The artifact's text is at most `max` characters long.
    MaxLength { artifact: String, max: usize },
}

impl StructuralRule {
    pub fn artifact(&self) -> &str {
        match self {
            StructuralRule::ArtifactPresent { artifact }
            | StructuralRule::NonEmpty { artifact }
            | StructuralRule::RequiredFields { artifact, .. }
            | StructuralRule::Matches { artifact, .. }
            | StructuralRule::MaxLength { artifact, .. } => artifact,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PassPredicate {
    /// Every condition holds (logical AND).
    #[default]
    AllConditions,
    /// The report score is at least `threshold`.
    MinScore { threshold: f64 },
    /// A condition expression over report fields, e.g. `score>=0.8 && payload.critical=0`.
    Expression { expr: String },
}

// ---------------------------------------------------------------------------
// VerificationReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub gate: String,
    pub passed: bool,
    pub violations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default)]
    pub payload: Value,
}

impl VerificationReport {
    /// Report for a gate that could not be evaluated; always failing.
    pub fn fail_closed(gate: &str, error: &StrataError) -> Self {
        Self {
            gate: gate.to_string(),
            passed: false,
            violations: vec![format!("gate evaluation failed: {error}")],
            score: None,
            payload: json!({ "error": error.to_string() }),
        }
    }
}

/// A report plus whatever the evaluation cost.
#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub report: VerificationReport,
    pub cost: f64,
}

// ---------------------------------------------------------------------------
// Spec checking
// ---------------------------------------------------------------------------

/// Check a gate for problems that would make evaluation impossible.
///
/// All problems are reported together in one [`StrataError::MalformedGateSpec`].
pub fn check_gate_spec(gate: &GateSpec) -> Result<()> {
    let mut problems = Vec::new();

    if gate.name.trim().is_empty() {
        problems.push("gate name is empty".to_string());
    }

    match gate.check {
        GateCheck::Structural { ref rules } => {
            if rules.is_empty() {
                problems.push("structural gate has no rules".to_string());
            }
            for rule in rules {
                if rule.artifact().trim().is_empty() {
                    problems.push("rule names an empty artifact".to_string());
                }
                match rule {
                    StructuralRule::RequiredFields { artifact, fields } if fields.is_empty() => {
                        problems.push(format!("required_fields on '{artifact}' lists no fields"));
                    }
                    StructuralRule::Matches { artifact, pattern } => {
                        if let Err(e) = Regex::new(pattern) {
                            problems.push(format!("invalid pattern for '{artifact}': {e}"));
                        }
                    }
                    _ => {}
                }
            }
        }
        GateCheck::Judged { ref agent } => {
            if agent.name.trim().is_empty() || agent.kind.trim().is_empty() {
                problems.push("judged gate agent needs a name and a kind".to_string());
            }
            if agent.outputs.len() > 1 {
                problems.push("judged gate agent must declare at most one output".to_string());
            }
        }
    }

    match gate.predicate {
        PassPredicate::AllConditions => {}
        PassPredicate::MinScore { threshold } => {
            if !threshold.is_finite() {
                problems.push("min_score threshold must be a finite number".to_string());
            }
        }
        PassPredicate::Expression { ref expr } => {
            if let Err(e) = parse_condition(expr) {
                problems.push(e.to_string());
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(StrataError::MalformedGateSpec {
            gate: gate.name.clone(),
            message: problems.join("; "),
        })
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate a structural gate against the current artifacts.
///
/// Always terminates; only a malformed spec is an error.
pub fn evaluate_structural(gate: &GateSpec, store: &ArtifactStore) -> Result<VerificationReport> {
    let rules = match gate.check {
        GateCheck::Structural { ref rules } => rules,
        GateCheck::Judged { .. } => {
            return Err(StrataError::MalformedGateSpec {
                gate: gate.name.clone(),
                message: "judged gate evaluated as structural".into(),
            })
        }
    };

    let mut violations = Vec::new();
    let mut results = Vec::with_capacity(rules.len());
    for rule in rules {
        let violation = check_rule(gate, rule, store)?;
        results.push(json!({
            "rule": serde_json::to_value(rule)?,
            "satisfied": violation.is_none(),
        }));
        violations.extend(violation);
    }

    let score = if rules.is_empty() {
        1.0
    } else {
        (rules.len() - violations.len()) as f64 / rules.len() as f64
    };
    let facts = json!({
        "passed": violations.is_empty(),
        "score": score,
        "violations": violations,
        "payload": { "rules": results },
    });
    let passed = apply_predicate(gate, violations.is_empty(), Some(score), &facts)?;

    Ok(VerificationReport {
        gate: gate.name.clone(),
        passed,
        violations,
        score: Some(score),
        payload: json!({ "rules": results }),
    })
}

fn check_rule(gate: &GateSpec, rule: &StructuralRule, store: &ArtifactStore) -> Result<Option<String>> {
    let name = rule.artifact();
    let content = match store.get(name) {
        Ok(v) => v,
        Err(_) => return Ok(Some(format!("artifact '{name}' is missing"))),
    };

    let violation = match rule {
        StructuralRule::ArtifactPresent { .. } => None,
        StructuralRule::NonEmpty { .. } => {
            is_empty_value(content).then(|| format!("artifact '{name}' is empty"))
        }
        StructuralRule::RequiredFields { fields, .. } => {
            if !content.is_object() {
                Some(format!("artifact '{name}' is not an object"))
            } else {
                let missing: Vec<&str> = fields
                    .iter()
                    .filter(|f| lookup(content, f).is_none())
                    .map(String::as_str)
                    .collect();
                (!missing.is_empty()).then(|| {
                    format!("artifact '{name}' is missing fields: {}", missing.join(", "))
                })
            }
        }
        StructuralRule::Matches { pattern, .. } => {
            let re = Regex::new(pattern).map_err(|e| StrataError::MalformedGateSpec {
                gate: gate.name.clone(),
                message: format!("invalid pattern for '{name}': {e}"),
            })?;
            (!re.is_match(&as_text(content)))
                .then(|| format!("artifact '{name}' does not match /{pattern}/"))
        }
        StructuralRule::MaxLength { max, .. } => {
            let len = as_text(content).chars().count();
            (len > *max).then(|| format!("artifact '{name}' is {len} characters, limit {max}"))
        }
    };
    Ok(violation)
}

/// Evaluate a judged gate by invoking its agent.
///
/// A judge that answers unsuccessfully or with a malformed report fails
/// closed: the outcome carries a [`VerificationReport::fail_closed`] report
/// and the judge's cost. A judge call that errors outright is a
/// [`StrataError::GateEvaluation`] with no cost attached.
pub async fn evaluate_judged(
    gate: &GateSpec,
    layer: &str,
    inputs: &HashMap<String, Value>,
    agents: &ResolvedAgents,
) -> Result<GateOutcome> {
    let agent = match gate.check {
        GateCheck::Judged { ref agent } => agent,
        GateCheck::Structural { .. } => {
            return Err(StrataError::MalformedGateSpec {
                gate: gate.name.clone(),
                message: "structural gate evaluated as judged".into(),
            })
        }
    };

    let output = agents
        .invoke_judge(layer, agent, inputs)
        .await
        .map_err(|e| StrataError::GateEvaluation {
            gate: gate.name.clone(),
            message: format!("judge '{}' failed: {e}", agent.name),
        })?;

    let report = match read_judge_report(gate, agent, &output) {
        Ok(report) => report,
        Err(e @ StrataError::GateEvaluation { .. }) => {
            tracing::warn!(layer = %layer, gate = %gate.name, cost = output.cost, error = %e, "Judge report unusable; failing closed");
            VerificationReport::fail_closed(&gate.name, &e)
        }
        Err(e) => return Err(e),
    };
    Ok(GateOutcome {
        report,
        cost: output.cost,
    })
}

fn read_judge_report(gate: &GateSpec, agent: &AgentSpec, output: &AgentOutput) -> Result<VerificationReport> {
    let eval_error = |message: String| StrataError::GateEvaluation {
        gate: gate.name.clone(),
        message,
    };

    if !output.succeeded {
        return Err(eval_error(format!(
            "judge '{}' was unsuccessful: {}",
            agent.name,
            output.message.as_deref().unwrap_or("no message")
        )));
    }

    let report_name = agent.outputs.first().map(String::as_str).unwrap_or("report");
    let raw = output
        .artifacts
        .get(report_name)
        .ok_or_else(|| eval_error(format!("judge produced no '{report_name}' output")))?;
    let object = raw
        .as_object()
        .ok_or_else(|| eval_error("judge report is not a JSON object".into()))?;

    let flag = match object.get("passed") {
        None => None,
        Some(Value::Bool(b)) => Some(*b),
        Some(_) => return Err(eval_error("'passed' must be a boolean".into())),
    };
    let score = match object.get("score") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            v.as_f64()
                .ok_or_else(|| eval_error("'score' must be a number".into()))?,
        ),
    };
    let violations = match object.get("violations") {
        None => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(_) => return Err(eval_error("'violations' must be an array".into())),
    };
    if flag.is_none() && score.is_none() {
        return Err(eval_error(
            "judge report needs a 'passed' flag or a 'score'".into(),
        ));
    }

    let all_hold = flag.unwrap_or(true) && violations.is_empty();
    let mut facts = object.clone();
    facts
        .entry("payload")
        .or_insert_with(|| raw.clone());
    let passed = apply_predicate(gate, all_hold, score, &Value::Object(facts))?;

    Ok(VerificationReport {
        gate: gate.name.clone(),
        passed,
        violations,
        score,
        payload: raw.clone(),
    })
}

fn apply_predicate(gate: &GateSpec, all_hold: bool, score: Option<f64>, facts: &Value) -> Result<bool> {
    match gate.predicate {
        PassPredicate::AllConditions => Ok(all_hold),
        PassPredicate::MinScore { threshold } => match score {
            Some(s) => Ok(s >= threshold),
            None => Err(StrataError::GateEvaluation {
                gate: gate.name.clone(),
                message: "min_score predicate but the report has no score".into(),
            }),
        },
        PassPredicate::Expression { ref expr } => {
            let parsed = parse_condition(expr).map_err(|e| StrataError::MalformedGateSpec {
                gate: gate.name.clone(),
                message: e.to_string(),
            })?;
            Ok(evaluate_condition(&parsed, &|key| resolve_fact(facts, key)))
        }
    }
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |v, seg| v.get(seg))
}

/// String form of a report field for condition evaluation. Arrays and
/// objects resolve to their length so `violations=0` works.
fn resolve_fact(facts: &Value, key: &str) -> String {
    match lookup(facts, key) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(a)) => a.len().to_string(),
        Some(Value::Object(o)) => o.len().to_string(),
        Some(other) => other.to_string(),
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
