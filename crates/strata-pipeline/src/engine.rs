//! Pipeline executor: drives one run of a validated definition from its entry
//! layer to a terminal state.
//!
//! Each layer entry walks `Pending -> Running -> Gated -> Routed` and then
//! either becomes the next `Pending` entry or the absorbing `Terminal` state.
//! A run owns its artifact store, budget tracker and loop table; nothing is
//! shared between runs.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::time::Instant;

use strata_types::{AgentOutput, BudgetKind, Result, StrataError, Verdict};

use crate::agent::{default_registry, AgentRegistry, ResolvedAgents};
use crate::artifacts::{ArtifactStore, Provenance};
use crate::budget::BudgetTracker;
use crate::definition::{AgentSpec, Layer, PipelineDefinition};
use crate::events::{EventEmitter, PipelineEvent};
use crate::gate::{evaluate_judged, evaluate_structural, GateCheck, GateOutcome, VerificationReport};
use crate::report::{LayerTrace, RunReport};
use crate::router::{route, EntryKind, LoopTable, RouteDecision, Termination, TerminationReason};
use crate::validation::validate_or_raise;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Executor settings that are not part of a pipeline definition.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Bind every agent to the dry-run invoker instead of its real kind.
    pub dry_run: bool,
    /// Invocation ceiling used when a definition sets none.
    pub default_max_invocations: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            default_max_invocations: 200,
        }
    }
}

/// Owns an agent registry and runs definitions against it.
pub struct PipelineExecutor {
    registry: AgentRegistry,
    config: ExecutorConfig,
    events: Option<EventEmitter>,
}

// ---------------------------------------------------------------------------
// Per-run state
// ---------------------------------------------------------------------------

struct Run {
    run_id: uuid::Uuid,
    agents: ResolvedAgents,
    store: ArtifactStore,
    budget: BudgetTracker,
    loops: LoopTable,
    trace: Vec<LayerTrace>,
    reasons: Vec<String>,
    entries: HashMap<String, u32>,
    started: Instant,
}

impl Run {
    fn sync_clock(&mut self) -> Result<()> {
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        self.budget.set_elapsed(elapsed_ms)
    }

    /// Latest content of each named artifact that exists.
    fn gather<'n>(&self, names: impl IntoIterator<Item = &'n str>) -> HashMap<String, Value> {
        names
            .into_iter()
            .filter_map(|name| {
                self.store
                    .latest(name)
                    .map(|a| (name.to_string(), a.content.clone()))
            })
            .collect()
    }

    /// Inputs for the `index`-th agent of `layer`: its explicit inputs, or the
    /// layer's requirements plus (sequential layers only) earlier agents' outputs.
    fn agent_inputs(&self, layer: &Layer, index: usize, agent: &AgentSpec) -> HashMap<String, Value> {
        match agent.inputs {
            Some(ref names) => self.gather(names.iter().map(String::as_str)),
            None => {
                let earlier = if layer.parallel {
                    &[][..]
                } else {
                    &layer.agents[..index]
                };
                self.gather(
                    layer
                        .requires
                        .iter()
                        .map(String::as_str)
                        .chain(earlier.iter().flat_map(|a| a.outputs.iter().map(String::as_str))),
                )
            }
        }
    }
}

/// One entry of one layer, carried through the states until it is traced.
struct Step {
    layer: String,
    entry: EntryKind,
    run_index: u32,
    cost: f64,
    started: Instant,
    /// Set when the entry was cut off by the layer's own timeout.
    timed_out: Option<u64>,
}

enum RunState {
    Pending { layer: String, via: EntryKind },
    Running(Step),
    Gated { step: Step, verdict: Verdict },
    Routed {
        step: Step,
        verdict: Option<Verdict>,
        decision: RouteDecision,
    },
    Terminal(Termination),
}

/// How a layer entry ended before routing.
enum LayerResult {
    Verdict(Verdict),
    Fatal(Termination),
}

fn lookup<'d>(def: &'d PipelineDefinition, id: &str) -> Result<&'d Layer> {
    def.layer(id)
        .ok_or_else(|| StrataError::InvalidDefinition(format!("unknown layer '{id}'")))
}

// ---------------------------------------------------------------------------
// PipelineExecutor
// ---------------------------------------------------------------------------

impl PipelineExecutor {
    pub fn new(registry: AgentRegistry) -> Self {
        Self {
            registry,
            config: ExecutorConfig::default(),
            events: None,
        }
    }

    /// Create an executor pre-loaded with the built-in invokers.
    pub fn with_default_registry() -> Self {
        Self::new(default_registry())
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish run events on `events`.
    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(ref events) = self.events {
            events.emit(event);
        }
    }

    /// Execute one run of `def` starting from `inputs`.
    ///
    /// Fails before anything runs if the definition is invalid, an external
    /// input is missing, or an agent kind is unknown. Every other outcome,
    /// including budget exhaustion and agent errors, is reported through the
    /// returned [`RunReport`].
    pub async fn execute(
        &self,
        def: &PipelineDefinition,
        inputs: HashMap<String, Value>,
    ) -> Result<RunReport> {
        validate_or_raise(def)?;

        let missing: Vec<&str> = def
            .inputs
            .iter()
            .filter(|name| !inputs.contains_key(name.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(StrataError::InvalidDefinition(format!(
                "missing input artifacts: {}",
                missing.join(", ")
            )));
        }
        let entry = def
            .entry_layer()
            .ok_or_else(|| StrataError::InvalidDefinition("pipeline has no entry layer".into()))?
            .to_string();
        let agents = self.registry.resolve(def, self.config.dry_run)?;

        let started_at = chrono::Utc::now();
        let mut run = Run {
            run_id: uuid::Uuid::new_v4(),
            agents,
            store: ArtifactStore::new(),
            budget: BudgetTracker::for_run(&def.budget, self.config.default_max_invocations),
            loops: LoopTable::new(),
            trace: Vec::new(),
            reasons: Vec::new(),
            entries: HashMap::new(),
            started: Instant::now(),
        };

        let mut initial: Vec<(String, Value)> = inputs.into_iter().collect();
        initial.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, content) in initial {
            run.store.put(name, content, Provenance::External, 0.0);
        }

        tracing::info!(
            run_id = %run.run_id,
            pipeline = %def.name,
            layers = def.layers.len(),
            dry_run = self.config.dry_run,
            "Run started"
        );
        self.emit(PipelineEvent::RunStarted {
            run_id: run.run_id.to_string(),
            pipeline: def.name.clone(),
            layer_count: def.layers.len(),
        });

        let mut state = RunState::Pending {
            layer: entry,
            via: EntryKind::Initial,
        };
        let termination = loop {
            state = match state {
                RunState::Pending { layer, via } => self.enter(&mut run, layer, via),
                RunState::Running(mut step) => {
                    let layer = lookup(def, &step.layer)?;
                    match self.run_layer(&mut run, layer, &mut step).await? {
                        LayerResult::Verdict(verdict) => RunState::Gated { step, verdict },
                        LayerResult::Fatal(termination) => RunState::Routed {
                            step,
                            verdict: None,
                            decision: RouteDecision::Terminal { termination },
                        },
                    }
                }
                RunState::Gated { step, verdict } => {
                    let layer = lookup(def, &step.layer)?;
                    let _ = run.sync_clock();
                    let decision = route(
                        layer,
                        verdict,
                        &run.budget,
                        &mut run.loops,
                        def.next_in_order(&layer.id),
                    );
                    let decision = match step.timed_out {
                        Some(timeout_ms) => decision.attribute_timeout(timeout_ms),
                        None => decision,
                    };
                    RunState::Routed {
                        step,
                        verdict: Some(verdict),
                        decision,
                    }
                }
                RunState::Routed {
                    step,
                    verdict,
                    decision,
                } => self.record(&mut run, step, verdict, decision),
                RunState::Terminal(termination) => break termination,
            };
        };

        let _ = run.sync_clock();
        run.reasons.push(termination.to_string());
        let finished_at = chrono::Utc::now();
        let duration_ms = run.started.elapsed().as_millis() as u64;

        tracing::info!(
            run_id = %run.run_id,
            status = %termination.status,
            reason = %termination.reason,
            invocations = run.budget.spent(BudgetKind::Invocations),
            cost = run.budget.spent(BudgetKind::Cost),
            duration_ms,
            "Run finished"
        );
        self.emit(PipelineEvent::RunFinished {
            run_id: run.run_id.to_string(),
            status: termination.status,
            duration_ms,
        });

        Ok(RunReport {
            run_id: run.run_id,
            pipeline: def.name.clone(),
            version: def.version.clone(),
            status: termination.status,
            reason: termination.reason,
            reason_chain: run.reasons,
            trace: run.trace,
            budget: run.budget.summary(),
            artifacts: run.store,
            started_at,
            finished_at,
            dry_run: self.config.dry_run,
        })
    }

    // -----------------------------------------------------------------------
    // Pending -> Running
    // -----------------------------------------------------------------------

    fn enter(&self, run: &mut Run, layer: String, via: EntryKind) -> RunState {
        if run.sync_clock().is_err() {
            return RunState::Terminal(self.budget_stop(&run.budget, BudgetKind::Time, &layer));
        }
        if run.budget.charge(BudgetKind::Invocations, 1.0).is_err() {
            return RunState::Terminal(self.budget_stop(&run.budget, BudgetKind::Invocations, &layer));
        }

        let entry = run.loops.enter(&layer, via);
        let run_index = {
            let count = run.entries.entry(layer.clone()).or_insert(0);
            *count += 1;
            *count
        };
        tracing::info!(
            layer = %layer,
            entry = %entry,
            run_index,
            attempts_used = run.loops.attempts(&layer),
            "Entering layer"
        );
        self.emit(PipelineEvent::LayerStarted {
            layer: layer.clone(),
            entry,
            run_index,
        });
        RunState::Running(Step {
            layer,
            entry,
            run_index,
            cost: 0.0,
            started: Instant::now(),
            timed_out: None,
        })
    }

    fn budget_stop(&self, budget: &BudgetTracker, kind: BudgetKind, layer: &str) -> Termination {
        tracing::warn!(
            layer = %layer,
            budget = %kind,
            spent = budget.spent(kind),
            limit = ?budget.limit(kind),
            "Budget exceeded; ending run"
        );
        self.emit(PipelineEvent::BudgetExceeded {
            kind,
            spent: budget.spent(kind),
        });
        Termination::budget(kind, budget, Some(layer))
    }

    // -----------------------------------------------------------------------
    // Running -> Gated
    // -----------------------------------------------------------------------

    /// Run a layer under its deadline: the earlier of the layer timeout and
    /// the run's remaining time.
    async fn run_layer(&self, run: &mut Run, layer: &Layer, step: &mut Step) -> Result<LayerResult> {
        if let Some(missing) = layer.requires.iter().find(|r| !run.store.contains(r)) {
            tracing::error!(layer = %layer.id, artifact = %missing, "Required artifact missing");
            return Ok(LayerResult::Fatal(Termination::failure(TerminationReason::MissingArtifact {
                layer: layer.id.clone(),
                artifact: missing.clone(),
            })));
        }

        let layer_deadline = layer.budget.timeout.map(|t| Instant::now() + t);
        let run_deadline = run
            .budget
            .limit(BudgetKind::Time)
            .map(|ms| run.started + Duration::from_secs_f64(ms / 1000.0));
        let deadline = match (layer_deadline, run_deadline) {
            (Some(a), Some(b)) => a.min(b),
            (Some(d), None) | (None, Some(d)) => d,
            (None, None) => return self.layer_body(run, layer, step).await,
        };

        match tokio::time::timeout_at(deadline, self.layer_body(run, layer, step)).await {
            Ok(result) => result,
            Err(_) if run_deadline.is_some_and(|d| d <= deadline) => {
                let _ = run.sync_clock();
                Ok(LayerResult::Fatal(self.budget_stop(&run.budget, BudgetKind::Time, &layer.id)))
            }
            Err(_) => {
                let timeout_ms = layer.budget.timeout.map(|t| t.as_millis() as u64).unwrap_or_default();
                tracing::warn!(layer = %layer.id, timeout_ms, "Layer timed out; counting it as a failed run");
                run.reasons
                    .push(format!("layer '{}' timed out after {timeout_ms}ms", layer.id));
                step.timed_out = Some(timeout_ms);
                Ok(LayerResult::Verdict(Verdict::Fail))
            }
        }
    }

    async fn layer_body(&self, run: &mut Run, layer: &Layer, step: &mut Step) -> Result<LayerResult> {
        let mut layer_budget = BudgetTracker::for_layer(&layer.budget);

        if layer.parallel {
            let inputs: Vec<HashMap<String, Value>> = layer
                .agents
                .iter()
                .enumerate()
                .map(|(i, agent)| run.agent_inputs(layer, i, agent))
                .collect();
            let results = join_all(
                layer
                    .agents
                    .iter()
                    .zip(&inputs)
                    .map(|(agent, inputs)| run.agents.invoke(&layer.id, agent, inputs)),
            )
            .await;

            // Absorb in declaration order so the store does not depend on
            // completion order. A fatal stop outranks a fail verdict.
            let mut stop = None;
            for (agent, result) in layer.agents.iter().zip(results) {
                let outcome = self.absorb(run, layer, agent, result, &mut layer_budget, step);
                if outcome.is_some() && !matches!(stop, Some(LayerResult::Fatal(_))) {
                    stop = outcome;
                }
            }
            if let Some(stop) = stop {
                return Ok(stop);
            }
        } else {
            for (i, agent) in layer.agents.iter().enumerate() {
                let inputs = run.agent_inputs(layer, i, agent);
                let result = run.agents.invoke(&layer.id, agent, &inputs).await;
                if let Some(stop) = self.absorb(run, layer, agent, result, &mut layer_budget, step) {
                    return Ok(stop);
                }
            }
        }

        self.evaluate_gate(run, layer, &mut layer_budget, step).await
    }

    /// Charge, check and store one agent's output. `Some` ends the layer early.
    fn absorb(
        &self,
        run: &mut Run,
        layer: &Layer,
        agent: &AgentSpec,
        result: Result<AgentOutput>,
        layer_budget: &mut BudgetTracker,
        step: &mut Step,
    ) -> Option<LayerResult> {
        let AgentOutput {
            mut artifacts,
            cost,
            succeeded,
            message,
        } = match result {
            Ok(output) => output,
            Err(e) => return Some(self.agent_failed(run, layer, agent, e.to_string())),
        };

        step.cost += cost;
        let run_charge = run.budget.charge(BudgetKind::Cost, cost);
        let layer_charge = layer_budget.charge(BudgetKind::Cost, cost);
        tracing::info!(layer = %layer.id, agent = %agent.name, succeeded, cost, "Agent completed");
        self.emit(PipelineEvent::AgentCompleted {
            layer: layer.id.clone(),
            agent: agent.name.clone(),
            succeeded,
            cost,
        });

        if run_charge.is_err() {
            return Some(LayerResult::Fatal(self.budget_stop(&run.budget, BudgetKind::Cost, &layer.id)));
        }
        if layer_charge.is_err() {
            return Some(LayerResult::Fatal(self.budget_stop(layer_budget, BudgetKind::Cost, &layer.id)));
        }
        if !succeeded {
            let message = message.unwrap_or_else(|| "agent reported failure".into());
            return Some(self.agent_failed(run, layer, agent, message));
        }
        if let Some(missing) = agent.outputs.iter().find(|o| !artifacts.contains_key(*o)) {
            let message = format!("did not produce declared output '{missing}'");
            return Some(self.agent_failed(run, layer, agent, message));
        }
        for extra in artifacts.keys().filter(|k| !agent.outputs.contains(*k)) {
            tracing::warn!(layer = %layer.id, agent = %agent.name, artifact = %extra, "Ignoring undeclared output");
        }

        for name in &agent.outputs {
            if let Some(content) = artifacts.remove(name) {
                run.store.put(
                    name.clone(),
                    content,
                    Provenance::Layer {
                        layer: layer.id.clone(),
                        entry: step.run_index,
                        agent: agent.name.clone(),
                    },
                    cost,
                );
            }
        }
        None
    }

    fn agent_failed(&self, run: &mut Run, layer: &Layer, agent: &AgentSpec, message: String) -> LayerResult {
        if layer.retry_agent_errors {
            tracing::warn!(layer = %layer.id, agent = %agent.name, error = %message, "Agent failed; counting it as a fail verdict");
            run.reasons.push(format!(
                "agent '{}' failed in layer '{}': {message}",
                agent.name, layer.id
            ));
            return LayerResult::Verdict(Verdict::Fail);
        }
        tracing::error!(layer = %layer.id, agent = %agent.name, error = %message, "Agent failed");
        LayerResult::Fatal(Termination::failure(TerminationReason::AgentError {
            layer: layer.id.clone(),
            agent: agent.name.clone(),
            message,
        }))
    }

    async fn evaluate_gate(
        &self,
        run: &mut Run,
        layer: &Layer,
        layer_budget: &mut BudgetTracker,
        step: &mut Step,
    ) -> Result<LayerResult> {
        let Some(ref gate) = layer.gate else {
            tracing::debug!(layer = %layer.id, "No gate; automatic pass");
            return Ok(LayerResult::Verdict(Verdict::Pass));
        };

        let (evaluated, author) = match gate.check {
            GateCheck::Structural { .. } => (
                evaluate_structural(gate, &run.store).map(|report| GateOutcome { report, cost: 0.0 }),
                gate.name.clone(),
            ),
            GateCheck::Judged { ref agent } => {
                let inputs = match agent.inputs {
                    Some(ref names) => run.gather(names.iter().map(String::as_str)),
                    None => run.gather(
                        layer
                            .requires
                            .iter()
                            .map(String::as_str)
                            .chain(layer.produces()),
                    ),
                };
                (
                    evaluate_judged(gate, &layer.id, &inputs, &run.agents).await,
                    agent.name.clone(),
                )
            }
        };

        let GateOutcome { report, cost } = match evaluated {
            Ok(outcome) => outcome,
            Err(StrataError::MalformedGateSpec { message, .. }) => {
                tracing::error!(layer = %layer.id, gate = %gate.name, error = %message, "Malformed gate");
                return Ok(LayerResult::Fatal(Termination::failure(TerminationReason::MalformedGate {
                    layer: layer.id.clone(),
                    message,
                })));
            }
            Err(e) => {
                tracing::warn!(layer = %layer.id, gate = %gate.name, error = %e, "Gate evaluation failed; failing closed");
                GateOutcome {
                    report: VerificationReport::fail_closed(&gate.name, &e),
                    cost: 0.0,
                }
            }
        };

        step.cost += cost;
        let run_charge = run.budget.charge(BudgetKind::Cost, cost);
        let layer_charge = layer_budget.charge(BudgetKind::Cost, cost);

        let verdict = Verdict::from_passed(report.passed);
        tracing::info!(
            layer = %layer.id,
            gate = %gate.name,
            verdict = %verdict,
            violations = report.violations.len(),
            score = ?report.score,
            "Gate evaluated"
        );
        self.emit(PipelineEvent::GateEvaluated {
            layer: layer.id.clone(),
            gate: gate.name.clone(),
            verdict,
            violations: report.violations.len(),
        });
        if !report.passed {
            let detail = if report.violations.is_empty() {
                "predicate not satisfied".to_string()
            } else {
                report.violations.join("; ")
            };
            run.reasons.push(format!(
                "gate '{}' failed in layer '{}' (entry {}): {detail}",
                gate.name, layer.id, step.run_index
            ));
        }

        run.store.put(
            layer.report_name(),
            serde_json::to_value(&report)?,
            Provenance::Layer {
                layer: layer.id.clone(),
                entry: step.run_index,
                agent: author,
            },
            cost,
        );

        if run_charge.is_err() {
            return Ok(LayerResult::Fatal(self.budget_stop(&run.budget, BudgetKind::Cost, &layer.id)));
        }
        if layer_charge.is_err() {
            return Ok(LayerResult::Fatal(self.budget_stop(layer_budget, BudgetKind::Cost, &layer.id)));
        }
        Ok(LayerResult::Verdict(verdict))
    }

    // -----------------------------------------------------------------------
    // Routed -> Pending | Terminal
    // -----------------------------------------------------------------------

    fn record(
        &self,
        run: &mut Run,
        step: Step,
        verdict: Option<Verdict>,
        decision: RouteDecision,
    ) -> RunState {
        let next = match decision {
            RouteDecision::Forward { ref target } => RunState::Pending {
                layer: target.clone(),
                via: EntryKind::Forward,
            },
            RouteDecision::FailPath { ref target } => {
                run.reasons
                    .push(format!("layer '{}' failed; routing to '{target}'", step.layer));
                RunState::Pending {
                    layer: target.clone(),
                    via: EntryKind::Forward,
                }
            }
            RouteDecision::Fix {
                ref target,
                attempt,
                max_attempts,
            } => {
                run.reasons.push(format!(
                    "layer '{}' failed (attempt {attempt} of {max_attempts}); fixing via '{target}'",
                    step.layer
                ));
                RunState::Pending {
                    layer: target.clone(),
                    via: EntryKind::Retry,
                }
            }
            RouteDecision::Escalate { ref target, attempts } => {
                run.reasons.push(format!(
                    "layer '{}' exhausted {attempts} fix attempts; escalating to '{target}'",
                    step.layer
                ));
                RunState::Pending {
                    layer: target.clone(),
                    via: EntryKind::Escalation,
                }
            }
            RouteDecision::Terminal { ref termination } => RunState::Terminal(termination.clone()),
        };

        let duration_ms = step.started.elapsed().as_millis() as u64;
        tracing::info!(
            layer = %step.layer,
            route = %decision,
            terminal = decision.is_terminal(),
            cost = step.cost,
            duration_ms,
            "Layer routed"
        );
        self.emit(PipelineEvent::Routed {
            layer: step.layer.clone(),
            decision: decision.clone(),
        });

        run.trace.push(LayerTrace {
            sequence: run.trace.len() as u32 + 1,
            attempts_used: run.loops.attempts(&step.layer),
            layer: step.layer,
            entry: step.entry,
            run_index: step.run_index,
            verdict,
            cost: step.cost,
            duration_ms,
            route: decision,
        });
        next
    }
}
