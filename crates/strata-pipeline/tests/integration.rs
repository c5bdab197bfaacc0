//! End-to-end tests for the layered pipeline engine.
//!
//! Each test parses a JSON definition, validates it, executes it against
//! scripted invokers, and checks the run report.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use strata_pipeline::{
    load_report, render_template, save_report, validate, validate_or_raise, AgentInvoker,
    AgentRegistry, AgentSpec, BackoffPolicy, EntryKind, EventEmitter, ExecutorConfig,
    PipelineDefinition, PipelineEvent, PipelineExecutor, Provenance, RouteDecision, RunReport,
    Severity, StaticInvoker, TerminationReason, WorkflowTemplate,
};
use strata_types::{AgentOutput, BudgetKind, Result, StrataError, TerminalStatus, Verdict};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type Script = dyn Fn(&AgentSpec, usize) -> Result<AgentOutput> + Send + Sync;

/// Invoker of kind "scripted": the n-th call of each agent (0-based) is
/// answered by the script.
struct ScriptedInvoker {
    script: Arc<Script>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedInvoker {
    fn new(script: impl Fn(&AgentSpec, usize) -> Result<AgentOutput> + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
            calls: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl AgentInvoker for ScriptedInvoker {
    fn kind(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, agent: &AgentSpec, _inputs: &HashMap<String, Value>) -> Result<AgentOutput> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(agent.name.clone()).or_insert(0);
            *count += 1;
            *count - 1
        };
        (self.script)(agent, n)
    }
}

/// Invoker of kind "slow": sleeps `config.ms`, then writes `config.value`
/// to every declared output.
struct SlowInvoker;

#[async_trait]
impl AgentInvoker for SlowInvoker {
    fn kind(&self) -> &str {
        "slow"
    }

    async fn invoke(&self, agent: &AgentSpec, _inputs: &HashMap<String, Value>) -> Result<AgentOutput> {
        let ms = agent.config.get("ms").and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        let value = agent.config.get("value").cloned().unwrap_or(json!(agent.name));
        let mut out = AgentOutput::success(HashMap::new());
        for name in &agent.outputs {
            out = out.with_artifact(name.clone(), value.clone());
        }
        Ok(out)
    }
}

fn executor(script: impl Fn(&AgentSpec, usize) -> Result<AgentOutput> + Send + Sync + 'static) -> PipelineExecutor {
    let mut registry = AgentRegistry::new().with_backoff(BackoffPolicy::None);
    registry.register(StaticInvoker);
    registry.register(ScriptedInvoker::new(script));
    registry.register(SlowInvoker);
    PipelineExecutor::new(registry)
}

fn brief() -> HashMap<String, Value> {
    HashMap::from([("brief".to_string(), json!("add a login form"))])
}

/// Writer outputs `code = "v<n>"`; the reviewer fails its first `failures`
/// reviews and passes after that.
fn generate_verify(failures: usize) -> impl Fn(&AgentSpec, usize) -> Result<AgentOutput> + Send + Sync {
    move |agent, n| match agent.name.as_str() {
        "writer" | "reworker" => Ok(AgentOutput::success(HashMap::new())
            .with_artifact("code", json!(format!("v{}", n + 1)))
            .with_cost(0.1)),
        "reviewer" => {
            let passed = n >= failures;
            let violations: Vec<String> = if passed {
                vec![]
            } else {
                vec![format!("review {} rejected the code", n + 1)]
            };
            Ok(AgentOutput::success(HashMap::new())
                .with_artifact("review", json!({"passed": passed, "violations": violations})))
        }
        other => panic!("unexpected agent {other}"),
    }
}

fn gvf_definition(max_attempts: u32) -> PipelineDefinition {
    PipelineDefinition::from_json(&format!(
        r#"{{"name": "gvf", "inputs": ["brief"], "layers": [
            {{"id": "generate", "requires": ["brief"],
              "agents": [{{"name": "writer", "kind": "scripted", "outputs": ["code"]}}]}},
            {{"id": "verify", "requires": ["code"],
              "gate": {{"name": "review", "check": {{"kind": "judged",
                        "agent": {{"name": "reviewer", "kind": "scripted", "outputs": ["review"]}}}}}},
              "loop": {{"max_attempts": {max_attempts}, "fix_target": "generate"}}}}
        ]}}"#
    ))
    .expect("definition should parse")
}

fn verdicts(report: &RunReport, layer: &str) -> Vec<Option<Verdict>> {
    report.entries_of(layer).map(|t| t.verdict).collect()
}

// ---------------------------------------------------------------------------
// Fix loops
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fix_loop_escalates_after_max_attempts() {
    let def = gvf_definition(2);
    let report = executor(generate_verify(usize::MAX))
        .execute(&def, brief())
        .await
        .unwrap();

    assert_eq!(report.status, TerminalStatus::Escalated);
    assert_eq!(
        report.reason,
        TerminationReason::RetriesExhausted {
            layer: "verify".into(),
            attempts: 2
        }
    );
    // Two fixes, then the third failure escalates.
    assert_eq!(report.fix_count(), 2);
    assert_eq!(verdicts(&report, "verify"), vec![Some(Verdict::Fail); 3]);
    assert_eq!(report.entries_of("generate").count(), 3);
    assert_eq!(report.trace.len(), 6);

    let entries: Vec<EntryKind> = report.entries_of("verify").map(|t| t.entry).collect();
    assert_eq!(entries, vec![EntryKind::Forward, EntryKind::Retry, EntryKind::Retry]);

    assert!(report.reason_chain.iter().any(|r| r.contains("attempt 1 of 2")));
    assert!(report.reason_chain.iter().any(|r| r.contains("review 3 rejected")));
    assert!(report.reason_chain.last().unwrap().starts_with("escalated"));
}

#[tokio::test]
async fn fix_loop_recovers_within_budget() {
    let def = gvf_definition(3);
    let report = executor(generate_verify(2))
        .execute(&def, brief())
        .await
        .unwrap();

    assert_eq!(report.status, TerminalStatus::Success);
    assert_eq!(
        verdicts(&report, "verify"),
        vec![Some(Verdict::Fail), Some(Verdict::Fail), Some(Verdict::Pass)]
    );
    assert_eq!(report.fix_count(), 2);
    assert_eq!(report.artifacts.get("code").unwrap(), &json!("v3"));
}

#[tokio::test]
async fn artifact_history_survives_fix_loops() {
    let def = gvf_definition(3);
    let report = executor(generate_verify(2))
        .execute(&def, brief())
        .await
        .unwrap();

    let history = report.artifacts.history("code");
    let contents: Vec<&Value> = history.iter().map(|a| &a.content).collect();
    assert_eq!(contents, vec![&json!("v1"), &json!("v2"), &json!("v3")]);
    assert_eq!(
        history.iter().map(|a| a.version).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(history.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert_eq!(
        history[1].provenance,
        Provenance::Layer {
            layer: "generate".into(),
            entry: 2,
            agent: "writer".into()
        }
    );

    let reports = report.artifacts.history("verify.report");
    assert_eq!(reports.len(), 3);
    assert_eq!(reports[0].content["passed"], json!(false));
    assert_eq!(reports[2].content["passed"], json!(true));
    assert_eq!(report.artifacts.history("brief").len(), 1);
}

#[tokio::test]
async fn escalation_resets_the_attempt_counter() {
    let def = PipelineDefinition::from_json(
        r#"{"name": "esc", "inputs": ["brief"], "layers": [
            {"id": "generate", "requires": ["brief"],
             "agents": [{"name": "writer", "kind": "scripted", "outputs": ["code"]}]},
            {"id": "verify", "requires": ["code"], "on_pass": "success",
             "gate": {"name": "review", "check": {"kind": "judged",
                      "agent": {"name": "reviewer", "kind": "scripted", "outputs": ["review"]}}},
             "loop": {"max_attempts": 1, "fix_target": "generate",
                      "escape_target": {"layer": "rework"}}},
            {"id": "rework", "requires": ["code"], "on_pass": {"layer": "verify"},
             "agents": [{"name": "reworker", "kind": "scripted", "outputs": ["code"]}]}
        ]}"#,
    )
    .unwrap();

    let report = executor(generate_verify(3))
        .execute(&def, brief())
        .await
        .unwrap();
    assert_eq!(report.status, TerminalStatus::Success);

    let routes: Vec<&RouteDecision> = report.entries_of("verify").map(|t| &t.route).collect();
    assert!(matches!(routes[0], RouteDecision::Fix { attempt: 1, .. }));
    assert!(matches!(routes[1], RouteDecision::Escalate { attempts: 1, .. }));
    // Back from escalation with a fresh counter: a fix, not another escalation.
    assert!(matches!(routes[2], RouteDecision::Fix { attempt: 1, .. }));
    assert!(routes[3].is_terminal());

    let rework: Vec<EntryKind> = report.entries_of("rework").map(|t| t.entry).collect();
    assert_eq!(rework, vec![EntryKind::Escalation]);
}

// ---------------------------------------------------------------------------
// Gates and agents
// ---------------------------------------------------------------------------

#[tokio::test]
async fn gateless_layer_passes_automatically() {
    let def = PipelineDefinition::from_json(
        r#"{"name": "plain", "layers": [
            {"id": "only", "agents": [{"name": "writer", "kind": "scripted", "outputs": ["code"]}]}
        ]}"#,
    )
    .unwrap();
    let report = executor(generate_verify(0))
        .execute(&def, HashMap::new())
        .await
        .unwrap();
    assert_eq!(report.status, TerminalStatus::Success);
    assert_eq!(verdicts(&report, "only"), vec![Some(Verdict::Pass)]);
    assert!(!report.artifacts.contains("only.report"));
}

#[tokio::test]
async fn malformed_judge_report_fails_closed() {
    let def = PipelineDefinition::from_json(
        r#"{"name": "judged", "layers": [
            {"id": "verify",
             "gate": {"name": "review", "check": {"kind": "judged",
                      "agent": {"name": "judge", "kind": "scripted", "outputs": ["review"]}}}}
        ]}"#,
    )
    .unwrap();
    let report = executor(|_, _| {
        Ok(AgentOutput::success(HashMap::new()).with_artifact("review", json!("looks fine")))
    })
    .execute(&def, HashMap::new())
    .await
    .unwrap();

    assert_eq!(report.status, TerminalStatus::Failure);
    assert_eq!(
        report.reason,
        TerminationReason::GateFailed {
            layer: "verify".into()
        }
    );
    let stored = report.artifacts.get("verify.report").unwrap();
    assert_eq!(stored["passed"], json!(false));
    assert!(stored["violations"][0]
        .as_str()
        .unwrap()
        .contains("not a JSON object"));
}

#[tokio::test]
async fn agent_error_ends_the_run() {
    let def = PipelineDefinition::from_json(
        r#"{"name": "p", "layers": [
            {"id": "build", "agents": [{"name": "writer", "kind": "scripted", "outputs": ["code"]}]}
        ]}"#,
    )
    .unwrap();
    let report = executor(|agent, _| {
        Err(StrataError::AgentInvocation {
            layer: "build".into(),
            agent: agent.name.clone(),
            message: "model refused".into(),
            retryable: false,
        })
    })
    .execute(&def, HashMap::new())
    .await
    .unwrap();

    assert_eq!(report.status, TerminalStatus::Failure);
    match report.reason {
        TerminationReason::AgentError { ref layer, ref message, .. } => {
            assert_eq!(layer, "build");
            assert!(message.contains("model refused"));
        }
        ref other => panic!("Expected AgentError, got: {other:?}"),
    }
}

#[tokio::test]
async fn agent_errors_can_feed_the_fix_loop() {
    let def = PipelineDefinition::from_json(
        r#"{"name": "p", "layers": [
            {"id": "build", "retry_agent_errors": true,
             "agents": [{"name": "writer", "kind": "scripted", "outputs": ["code"]}],
             "loop": {"max_attempts": 3, "fix_target": "build"}}
        ]}"#,
    )
    .unwrap();
    let report = executor(|_, n| {
        if n < 2 {
            return Err(StrataError::Other("upstream unavailable".into()));
        }
        Ok(AgentOutput::success(HashMap::new()).with_artifact("code", json!("ok")))
    })
    .execute(&def, HashMap::new())
    .await
    .unwrap();

    assert_eq!(report.status, TerminalStatus::Success);
    assert_eq!(report.fix_count(), 2);
    assert_eq!(report.artifacts.history("code").len(), 1);
    assert_eq!(
        report
            .reason_chain
            .iter()
            .filter(|r| r.contains("upstream unavailable"))
            .count(),
        2
    );
}

#[tokio::test]
async fn parallel_agents_are_absorbed_in_declaration_order() {
    let def = PipelineDefinition::from_json(
        r#"{"name": "fan", "layers": [
            {"id": "draft", "parallel": true, "agents": [
                {"name": "slow", "kind": "slow", "outputs": ["a"], "config": {"ms": 80}},
                {"name": "fast", "kind": "slow", "outputs": ["b"], "config": {"ms": 5}}
            ]}
        ]}"#,
    )
    .unwrap();
    let started = std::time::Instant::now();
    let report = executor(generate_verify(0))
        .execute(&def, HashMap::new())
        .await
        .unwrap();

    assert_eq!(report.status, TerminalStatus::Success);
    assert!(started.elapsed() < Duration::from_millis(500));
    let a = report.artifacts.latest("a").unwrap();
    let b = report.artifacts.latest("b").unwrap();
    assert!(a.sequence < b.sequence);
}

#[tokio::test]
async fn layer_timeout_is_a_failed_entry() {
    let def = PipelineDefinition::from_json(
        r#"{"name": "slow", "layers": [
            {"id": "wait", "budget": {"timeout": "50ms"},
             "agents": [{"name": "sleeper", "kind": "slow", "outputs": ["x"], "config": {"ms": 5000}}]}
        ]}"#,
    )
    .unwrap();
    let report = executor(generate_verify(0))
        .execute(&def, HashMap::new())
        .await
        .unwrap();

    assert_eq!(report.status, TerminalStatus::Failure);
    assert_eq!(
        report.reason,
        TerminationReason::TimedOut {
            layer: "wait".into(),
            timeout_ms: 50
        }
    );
    assert_eq!(verdicts(&report, "wait"), vec![Some(Verdict::Fail)]);
    assert!(report
        .reason_chain
        .iter()
        .any(|r| r.contains("timed out after 50ms")));
    assert!(!report.artifacts.contains("x"));
}

// ---------------------------------------------------------------------------
// Budgets
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cost_overrun_preempts_a_passing_gate() {
    let def = PipelineDefinition::from_json(
        r#"{"name": "spendy", "budget": {"max_cost": 1.0}, "layers": [
            {"id": "build",
             "agents": [{"name": "writer", "kind": "static", "outputs": ["code"],
                         "config": {"outputs": {"code": "fn main() {}"}, "cost": 1.5}}],
             "gate": {"name": "present", "check": {"kind": "structural",
                      "rules": [{"rule": "artifact_present", "artifact": "code"}]}}}
        ]}"#,
    )
    .unwrap();
    let report = executor(generate_verify(0))
        .execute(&def, HashMap::new())
        .await
        .unwrap();

    assert_eq!(report.status, TerminalStatus::Failure);
    match report.reason {
        TerminationReason::BudgetExhausted { kind, spent, limit, .. } => {
            assert_eq!(kind, BudgetKind::Cost);
            assert_eq!(spent, 1.5);
            assert_eq!(limit, Some(1.0));
        }
        ref other => panic!("Expected BudgetExhausted, got: {other:?}"),
    }
    assert!(!report.artifacts.contains("build.report"));
    assert!(report.budget.cost.exceeded);
}

#[tokio::test]
async fn judge_cost_counts_against_the_budget() {
    let def = PipelineDefinition::from_json(
        r#"{"name": "p", "budget": {"max_cost": 1.0}, "layers": [
            {"id": "verify",
             "agents": [{"name": "writer", "kind": "scripted", "outputs": ["code"]}],
             "gate": {"name": "review", "check": {"kind": "judged",
                      "agent": {"name": "judge", "kind": "scripted", "outputs": ["review"]}}}}
        ]}"#,
    )
    .unwrap();
    let report = executor(|agent, _| {
        let out = AgentOutput::success(HashMap::new()).with_cost(0.6);
        Ok(match agent.name.as_str() {
            "judge" => out.with_artifact("review", json!({"passed": true})),
            _ => out.with_artifact("code", json!("x")),
        })
    })
    .execute(&def, HashMap::new())
    .await
    .unwrap();

    assert_eq!(report.status, TerminalStatus::Failure);
    assert!(matches!(
        report.reason,
        TerminationReason::BudgetExhausted { kind: BudgetKind::Cost, .. }
    ));
    assert!(report.artifacts.contains("verify.report"));
    assert!((report.trace[0].cost - 1.2).abs() < 1e-9);
}

#[tokio::test]
async fn unusable_judge_reports_are_still_charged() {
    let def = PipelineDefinition::from_json(
        r#"{"name": "p", "budget": {"max_cost": 1.0}, "layers": [
            {"id": "verify",
             "gate": {"name": "review", "check": {"kind": "judged",
                      "agent": {"name": "judge", "kind": "scripted", "outputs": ["review"]}}}}
        ]}"#,
    )
    .unwrap();
    let report = executor(|_, _| {
        Ok(AgentOutput::success(HashMap::new())
            .with_artifact("review", json!("looks fine"))
            .with_cost(5.0))
    })
    .execute(&def, HashMap::new())
    .await
    .unwrap();

    assert_eq!(report.status, TerminalStatus::Failure);
    assert!(matches!(
        report.reason,
        TerminationReason::BudgetExhausted { kind: BudgetKind::Cost, .. }
    ));
    assert_eq!(report.budget.cost.spent, 5.0);
    assert!(report.budget.cost.exceeded);
    assert_eq!(report.trace[0].cost, 5.0);
    let stored = report.artifacts.get("verify.report").unwrap();
    assert_eq!(stored["passed"], json!(false));
}

#[tokio::test]
async fn layer_cost_ceiling_is_fatal() {
    let def = PipelineDefinition::from_json(
        r#"{"name": "p", "layers": [
            {"id": "build", "budget": {"max_cost": 0.5},
             "agents": [{"name": "writer", "kind": "static", "outputs": ["code"],
                         "config": {"outputs": {"code": "x"}, "cost": 0.75}}]}
        ]}"#,
    )
    .unwrap();
    let report = executor(generate_verify(0))
        .execute(&def, HashMap::new())
        .await
        .unwrap();
    assert_eq!(report.status, TerminalStatus::Failure);
    match report.reason {
        TerminationReason::BudgetExhausted { kind, limit, ref layer, .. } => {
            assert_eq!(kind, BudgetKind::Cost);
            assert_eq!(limit, Some(0.5));
            assert_eq!(layer.as_deref(), Some("build"));
        }
        ref other => panic!("Expected BudgetExhausted, got: {other:?}"),
    }
}

#[tokio::test]
async fn invocation_ceiling_bounds_escape_cycles() {
    let def = PipelineDefinition::from_json(
        r#"{"name": "spin", "inputs": ["seed"], "budget": {"max_invocations": 5}, "layers": [
            {"id": "spin",
             "agents": [{"name": "writer", "kind": "static", "outputs": ["out"],
                         "config": {"outputs": {"out": 1}}}],
             "gate": {"name": "seeded", "check": {"kind": "structural",
                      "rules": [{"rule": "non_empty", "artifact": "seed"}]}},
             "loop": {"max_attempts": 1, "fix_target": "spin", "escape_target": {"layer": "spin"}}}
        ]}"#,
    )
    .unwrap();
    assert!(validate(&def)
        .iter()
        .any(|d| d.rule == "bounded_cycles" && d.severity == Severity::Warning));

    let report = executor(generate_verify(0))
        .execute(&def, HashMap::from([("seed".to_string(), Value::Null)]))
        .await
        .unwrap();
    assert_eq!(report.status, TerminalStatus::Failure);
    assert!(matches!(
        report.reason,
        TerminationReason::BudgetExhausted { kind: BudgetKind::Invocations, .. }
    ));
    assert_eq!(report.trace.len(), 5);
    assert_eq!(report.budget.invocations.spent, 6.0);
    let escalations = report
        .trace
        .iter()
        .filter(|t| matches!(t.route, RouteDecision::Escalate { .. }))
        .count();
    assert_eq!(escalations, 2);
}

// ---------------------------------------------------------------------------
// Validation, dry run, events, persistence
// ---------------------------------------------------------------------------

#[test]
fn validate_is_idempotent() {
    let def = gvf_definition(2);
    let first = validate(&def);
    let second = validate(&def);
    assert_eq!(first, second);
    assert!(validate_or_raise(&def).is_ok());
}

#[tokio::test]
async fn parallel_output_collision_is_rejected() {
    let def = PipelineDefinition::from_json(
        r#"{"name": "clash", "layers": [
            {"id": "draft", "parallel": true, "agents": [
                {"name": "a", "kind": "scripted", "outputs": ["doc"]},
                {"name": "b", "kind": "scripted", "outputs": ["doc"]}
            ]}
        ]}"#,
    )
    .unwrap();
    let diags = validate(&def);
    assert!(diags
        .iter()
        .any(|d| d.rule == "parallel_output_collision" && d.severity == Severity::Error));

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let err = executor(move |_, _| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(AgentOutput::success(HashMap::new()))
    })
    .execute(&def, HashMap::new())
    .await
    .unwrap_err();
    assert!(matches!(err, StrataError::InvalidDefinition(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn dry_run_binds_every_agent_to_placeholders() {
    let def = PipelineDefinition::from_json(
        r#"{"name": "dry", "inputs": ["brief"], "layers": [
            {"id": "generate", "requires": ["brief"],
             "agents": [{"name": "writer", "kind": "llm", "outputs": ["code"]}]},
            {"id": "verify", "requires": ["code"],
             "gate": {"name": "review", "predicate": {"type": "min_score", "threshold": 0.9},
                      "check": {"kind": "judged",
                      "agent": {"name": "reviewer", "kind": "llm", "outputs": ["review"]}}},
             "loop": {"max_attempts": 1, "fix_target": "generate"}}
        ]}"#,
    )
    .unwrap();

    let err = PipelineExecutor::with_default_registry()
        .execute(&def, brief())
        .await
        .unwrap_err();
    assert!(matches!(err, StrataError::UnknownAgentKind { .. }));

    let report = PipelineExecutor::with_default_registry()
        .with_config(ExecutorConfig {
            dry_run: true,
            ..ExecutorConfig::default()
        })
        .execute(&def, brief())
        .await
        .unwrap();
    assert!(report.dry_run);
    assert_eq!(report.status, TerminalStatus::Success);
    assert_eq!(report.artifacts.get("code").unwrap()["dry_run"], json!(true));
    assert_eq!(report.budget.cost.spent, 0.0);
}

#[tokio::test]
async fn events_follow_the_run() {
    let emitter = EventEmitter::new(64);
    let mut rx = emitter.subscribe();
    let def = gvf_definition(1);

    let report = executor(generate_verify(1))
        .with_events(emitter)
        .execute(&def, brief())
        .await
        .unwrap();
    assert_eq!(report.status, TerminalStatus::Success);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(events.first(), Some(PipelineEvent::RunStarted { layer_count: 2, .. })));
    match events.last() {
        Some(PipelineEvent::RunFinished { status, run_id, .. }) => {
            assert_eq!(*status, TerminalStatus::Success);
            assert_eq!(run_id, &report.run_id.to_string());
        }
        other => panic!("Expected RunFinished, got: {other:?}"),
    }
    let started = events
        .iter()
        .filter(|e| matches!(e, PipelineEvent::LayerStarted { .. }))
        .count();
    assert_eq!(started, report.trace.len());
    assert!(events.iter().any(|e| matches!(
        e,
        PipelineEvent::GateEvaluated { verdict: Verdict::Fail, violations: 1, .. }
    )));
}

#[tokio::test]
async fn report_round_trips_through_the_logs_dir() {
    let dir = tempfile::tempdir().unwrap();
    let report = executor(generate_verify(1))
        .execute(&gvf_definition(2), brief())
        .await
        .unwrap();
    save_report(&report, dir.path()).await.unwrap();

    let loaded = load_report(dir.path()).await.unwrap().unwrap();
    assert_eq!(loaded.status, TerminalStatus::Success);
    assert_eq!(loaded.reason_chain, report.reason_chain);
    assert_eq!(loaded.artifacts.history("code").len(), 2);
}

#[tokio::test]
async fn budget_failure_report_round_trips() {
    let def = PipelineDefinition::from_json(
        r#"{"name": "spendy", "budget": {"max_cost": 0.5}, "layers": [
            {"id": "build",
             "agents": [{"name": "writer", "kind": "static", "outputs": ["code"],
                         "config": {"outputs": {"code": "x"}, "cost": 0.75}}]}
        ]}"#,
    )
    .unwrap();
    let report = executor(generate_verify(0))
        .execute(&def, HashMap::new())
        .await
        .unwrap();
    assert!(matches!(
        report.reason,
        TerminationReason::BudgetExhausted { kind: BudgetKind::Cost, .. }
    ));

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["reason"]["cause"], json!("budget_exhausted"));
    assert_eq!(json["reason"]["layer"], json!("build"));

    let dir = tempfile::tempdir().unwrap();
    save_report(&report, dir.path()).await.unwrap();
    let loaded = load_report(dir.path()).await.unwrap().unwrap();
    assert_eq!(loaded.status, TerminalStatus::Failure);
    assert_eq!(loaded.reason, report.reason);
}

#[tokio::test]
async fn rendered_template_runs() {
    let template: WorkflowTemplate = serde_json::from_value(json!({
        "name": "deliver",
        "variables": [
            {"name": "feature", "type": "string"},
            {"name": "fixes", "type": "number", "default": 2}
        ],
        "pipeline": {
            "inputs": ["brief"],
            "layers": [
                {"id": "generate", "requires": ["brief"],
                 "agents": [{"name": "writer", "kind": "static", "outputs": ["code"],
                             "config": {"outputs": {"code": "// ${feature}"}}}]},
                {"id": "verify", "requires": ["code"],
                 "gate": {"name": "shape", "check": {"kind": "structural",
                          "rules": [{"rule": "matches", "artifact": "code", "pattern": "login"}]}},
                 "loop": {"max_attempts": "${fixes}", "fix_target": "generate"}}
            ]
        }
    }))
    .unwrap();
    let config = json!({"feature": "login form"}).as_object().unwrap().clone();
    let def = render_template(&template, &config).unwrap();
    assert_eq!(def.name, "deliver");
    assert_eq!(def.metadata["template"], json!("deliver"));

    let report = PipelineExecutor::with_default_registry()
        .execute(&def, brief())
        .await
        .unwrap();
    assert!(report.is_success());
    assert_eq!(report.artifacts.get("code").unwrap(), &json!("// login form"));
}
