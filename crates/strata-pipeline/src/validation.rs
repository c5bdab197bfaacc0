//! Definition validation: lint rules and diagnostics.
//!
//! [`validate`] runs every built-in rule and returns all diagnostics in a
//! deterministic order. [`validate_or_raise`] turns `Error` diagnostics into
//! [`StrataError::InvalidDefinition`]; the executor calls it before a run.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

use serde::Serialize;
use strata_types::StrataError;

use crate::definition::{report_artifact_name, Layer, PipelineDefinition, RouteTarget};
use crate::gate::{check_gate_spec, GateCheck};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
}

impl Diagnostic {
    fn error(rule: &str, layer: Option<&str>, message: String) -> Self {
        Self {
            rule: rule.into(),
            severity: Severity::Error,
            message,
            layer_id: layer.map(str::to_string),
            fix: None,
        }
    }

    fn warning(rule: &str, layer: Option<&str>, message: String) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(rule, layer, message)
        }
    }

    fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.fix = Some(fix.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => f.write_str("error"),
            Severity::Warning => f.write_str("warning"),
        }
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Control-flow graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeKind {
    Pass,
    Fail,
    Fix,
    Escape,
}

impl EdgeKind {
    /// Fix and escape edges are guarded by a loop-control counter.
    fn is_guarded(self) -> bool {
        matches!(self, EdgeKind::Fix | EdgeKind::Escape)
    }
}

/// Layer-to-layer routing edges. Edges to unknown layers are left out; the
/// `route_target_exists` rule reports those.
struct ControlGraph<'a> {
    edges: BTreeMap<&'a str, Vec<(&'a str, EdgeKind)>>,
}

impl<'a> ControlGraph<'a> {
    fn build(def: &'a PipelineDefinition) -> Self {
        let known: HashSet<&str> = def.layers.iter().map(|l| l.id.as_str()).collect();
        let mut edges: BTreeMap<&'a str, Vec<(&'a str, EdgeKind)>> = BTreeMap::new();

        for (i, layer) in def.layers.iter().enumerate() {
            let out = edges.entry(layer.id.as_str()).or_default();
            let mut push = |target: &'a str, kind| {
                if known.contains(target) {
                    out.push((target, kind));
                }
            };

            match layer.on_pass {
                Some(RouteTarget::Layer(ref id)) => push(id.as_str(), EdgeKind::Pass),
                Some(_) => {}
                None => {
                    if let Some(next) = def.layers.get(i + 1) {
                        push(next.id.as_str(), EdgeKind::Pass);
                    }
                }
            }
            match layer.loop_control {
                Some(ref lc) => {
                    push(lc.fix_target.as_str(), EdgeKind::Fix);
                    if let Some(RouteTarget::Layer(ref id)) = lc.escape_target {
                        push(id.as_str(), EdgeKind::Escape);
                    }
                }
                None => {
                    if let Some(RouteTarget::Layer(ref id)) = layer.on_fail {
                        push(id.as_str(), EdgeKind::Fail);
                    }
                }
            }
        }
        Self { edges }
    }

    /// Layers reachable from `start` in one or more steps over edges
    /// accepted by `follow`. `avoid` is never expanded.
    fn reachable(
        &self,
        start: &'a str,
        avoid: Option<&str>,
        follow: impl Fn(EdgeKind) -> bool,
    ) -> HashSet<&'a str> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            if avoid == Some(current) {
                continue;
            }
            for &(next, kind) in self.edges.get(current).into_iter().flatten() {
                if follow(kind) && seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }

    /// Entry plus every layer reachable from it.
    fn reachable_from_entry(&self, entry: &'a str, avoid: Option<&str>) -> HashSet<&'a str> {
        let mut set = if avoid == Some(entry) {
            HashSet::new()
        } else {
            self.reachable(entry, avoid, |_| true)
        };
        set.insert(entry);
        set
    }
}

/// Artifact name to the layers producing it, gate reports included.
fn producers(def: &PipelineDefinition) -> HashMap<String, Vec<&str>> {
    let mut map: HashMap<String, Vec<&str>> = HashMap::new();
    for layer in &def.layers {
        for name in layer.produces() {
            map.entry(name.to_string()).or_default().push(&layer.id);
        }
        if layer.gate.is_some() {
            map.entry(layer.report_name()).or_default().push(&layer.id);
        }
    }
    map
}

/// Artifacts a layer's gate reads.
fn gate_reads(layer: &Layer) -> Vec<&str> {
    match layer.gate.as_ref().map(|g| &g.check) {
        Some(GateCheck::Structural { rules }) => rules.iter().map(|r| r.artifact()).collect(),
        Some(GateCheck::Judged { agent }) => agent
            .inputs
            .iter()
            .flatten()
            .map(String::as_str)
            .collect(),
        None => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct NonEmptyRule;
impl LintRule for NonEmptyRule {
    fn name(&self) -> &str { "non_empty" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        if def.name.trim().is_empty() {
            out.push(Diagnostic::error(self.name(), None, "Pipeline name is empty".into()));
        }
        if def.layers.is_empty() {
            out.push(
                Diagnostic::error(self.name(), None, "Pipeline declares no layers".into())
                    .with_fix("Add at least one layer"),
            );
        }
        out
    }
}

struct UniqueIdsRule;
impl LintRule for UniqueIdsRule {
    fn name(&self) -> &str { "unique_ids" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for layer in &def.layers {
            if layer.id.trim().is_empty() {
                out.push(Diagnostic::error(self.name(), None, "Layer with an empty id".into()));
            } else if !seen.insert(layer.id.as_str()) {
                out.push(Diagnostic::error(
                    self.name(),
                    Some(&layer.id),
                    format!("Layer id '{}' is declared more than once", layer.id),
                ));
            }
            let mut agents = HashSet::new();
            for agent in &layer.agents {
                if !agents.insert(agent.name.as_str()) {
                    out.push(Diagnostic::error(
                        self.name(),
                        Some(&layer.id),
                        format!("Agent '{}' appears twice in layer '{}'", agent.name, layer.id),
                    ));
                }
            }
        }
        out
    }
}

struct EntryExistsRule;
impl LintRule for EntryExistsRule {
    fn name(&self) -> &str { "entry_exists" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        match def.entry {
            Some(ref id) if def.layer(id).is_none() => vec![Diagnostic::error(
                self.name(),
                None,
                format!("Entry layer '{id}' does not exist"),
            )
            .with_fix("Point 'entry' at a declared layer or remove it")],
            _ => vec![],
        }
    }
}

struct RouteTargetExistsRule;
impl LintRule for RouteTargetExistsRule {
    fn name(&self) -> &str { "route_target_exists" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for layer in &def.layers {
            let mut targets: Vec<(&str, &str)> = Vec::new();
            if let Some(RouteTarget::Layer(ref id)) = layer.on_pass {
                targets.push(("on_pass", id));
            }
            if let Some(RouteTarget::Layer(ref id)) = layer.on_fail {
                targets.push(("on_fail", id));
            }
            if let Some(ref lc) = layer.loop_control {
                targets.push(("fix_target", &lc.fix_target));
                if let Some(RouteTarget::Layer(ref id)) = lc.escape_target {
                    targets.push(("escape_target", id));
                }
            }
            for (field, target) in targets {
                if def.layer(target).is_none() {
                    out.push(
                        Diagnostic::error(
                            self.name(),
                            Some(&layer.id),
                            format!(
                                "Layer '{}' {field} references nonexistent layer '{target}'",
                                layer.id
                            ),
                        )
                        .with_fix(format!("Declare layer '{target}' or fix the {field}")),
                    );
                }
            }
        }
        out
    }
}

struct AgentSpecRule;
impl LintRule for AgentSpecRule {
    fn name(&self) -> &str { "agent_spec" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for layer in &def.layers {
            for agent in &layer.agents {
                if agent.name.trim().is_empty() || agent.kind.trim().is_empty() {
                    out.push(Diagnostic::error(
                        self.name(),
                        Some(&layer.id),
                        format!("An agent in layer '{}' is missing a name or kind", layer.id),
                    ));
                }
                if agent.outputs.iter().any(|o| o.trim().is_empty()) {
                    out.push(Diagnostic::error(
                        self.name(),
                        Some(&layer.id),
                        format!("Agent '{}' declares an empty output name", agent.name),
                    ));
                }
                let reserved: Vec<&String> = agent
                    .outputs
                    .iter()
                    .filter(|o| o.ends_with(".report"))
                    .collect();
                for name in reserved {
                    out.push(Diagnostic::error(
                        self.name(),
                        Some(&layer.id),
                        format!(
                            "Agent '{}' output '{name}' uses the '.report' suffix reserved for gate reports",
                            agent.name
                        ),
                    ));
                }
            }
            if layer.agents.is_empty() && layer.gate.is_none() {
                out.push(Diagnostic::warning(
                    self.name(),
                    Some(&layer.id),
                    format!("Layer '{}' has no agents and no gate; it always passes", layer.id),
                ));
            }
        }
        out
    }
}

struct ArtifactProducersRule;
impl LintRule for ArtifactProducersRule {
    fn name(&self) -> &str { "artifact_producers" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        let Some(entry) = def.entry_layer().filter(|e| def.layer(e).is_some()) else {
            return vec![];
        };
        let graph = ControlGraph::build(def);
        let producers = producers(def);
        let external: HashSet<&str> = def.inputs.iter().map(String::as_str).collect();
        let mut out = Vec::new();

        for layer in &def.layers {
            let before = graph.reachable_from_entry(entry, Some(layer.id.as_str()));
            let producible = |name: &str| {
                external.contains(name)
                    || producers.get(name).is_some_and(|ps| {
                        ps.iter().any(|p| {
                            *p != layer.id
                                && before.contains(p)
                                && graph.reachable(*p, None, |_| true).contains(layer.id.as_str())
                        })
                    })
            };

            for name in &layer.requires {
                if !producible(name.as_str()) {
                    out.push(
                        Diagnostic::error(
                            self.name(),
                            Some(&layer.id),
                            format!(
                                "Layer '{}' requires artifact '{name}' but no layer that can run before it produces it",
                                layer.id
                            ),
                        )
                        .with_fix(format!(
                            "Add '{name}' to the pipeline inputs or produce it in an earlier layer"
                        )),
                    );
                }
            }

            let mut available: HashSet<&str> = layer.requires.iter().map(String::as_str).collect();
            for agent in &layer.agents {
                for name in agent.inputs.iter().flatten() {
                    if !available.contains(name.as_str()) {
                        out.push(Diagnostic::error(
                            self.name(),
                            Some(&layer.id),
                            format!(
                                "Agent '{}' reads '{name}', which layer '{}' neither requires nor produces earlier",
                                agent.name, layer.id
                            ),
                        ));
                    }
                }
                if !layer.parallel {
                    available.extend(agent.outputs.iter().map(String::as_str));
                }
            }

            let own = layer.produces();
            for name in gate_reads(layer) {
                let readable = own.contains(&name)
                    || layer.requires.iter().any(|r| r == name)
                    || producible(name);
                if !readable {
                    out.push(Diagnostic::error(
                        self.name(),
                        Some(&layer.id),
                        format!(
                            "Gate of layer '{}' reads artifact '{name}' that is never available to it",
                            layer.id
                        ),
                    ));
                }
            }
        }
        out
    }
}

struct ArtifactCyclesRule;
impl LintRule for ArtifactCyclesRule {
    fn name(&self) -> &str { "artifact_cycles" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        // Fixpoint: a layer can run once everything it requires is grounded.
        let mut grounded: HashSet<String> = def.inputs.iter().cloned().collect();
        let mut ran = vec![false; def.layers.len()];
        loop {
            let mut changed = false;
            for (i, layer) in def.layers.iter().enumerate() {
                if ran[i] || !layer.requires.iter().all(|r| grounded.contains(r)) {
                    continue;
                }
                ran[i] = true;
                changed = true;
                grounded.extend(layer.produces().into_iter().map(str::to_string));
                if layer.gate.is_some() {
                    grounded.insert(report_artifact_name(&layer.id));
                }
            }
            if !changed {
                break;
            }
        }

        // Dependency edges between ungrounded artifacts: required -> produced.
        let mut deps: HashMap<String, BTreeSet<String>> = HashMap::new();
        for layer in def.layers.iter().filter(|l| !l.requires.is_empty()) {
            let mut outputs: Vec<String> = layer.produces().into_iter().map(str::to_string).collect();
            if layer.gate.is_some() {
                outputs.push(layer.report_name());
            }
            for req in layer.requires.iter().filter(|r| !grounded.contains(*r)) {
                deps.entry(req.clone()).or_default().extend(outputs.iter().cloned());
            }
        }

        let on_cycle: BTreeSet<&str> = deps
            .keys()
            .filter(|start| {
                let mut seen = HashSet::new();
                let mut stack: Vec<&String> = deps[*start].iter().collect();
                while let Some(current) = stack.pop() {
                    if current == *start {
                        return true;
                    }
                    if seen.insert(current) {
                        stack.extend(deps.get(current).into_iter().flatten());
                    }
                }
                false
            })
            .map(String::as_str)
            .collect();

        if on_cycle.is_empty() {
            return vec![];
        }
        let names: Vec<&str> = on_cycle.into_iter().collect();
        vec![Diagnostic::error(
            self.name(),
            None,
            format!(
                "Artifacts depend on each other cyclically and can never be produced: {}",
                names.join(", ")
            ),
        )
        .with_fix("Supply one of them as a pipeline input or break the dependency")]
    }
}

struct BoundedCyclesRule;
impl LintRule for BoundedCyclesRule {
    fn name(&self) -> &str { "bounded_cycles" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        let graph = ControlGraph::build(def);
        let mut out = Vec::new();

        let unbounded: Vec<&str> = def
            .layers
            .iter()
            .map(|l| l.id.as_str())
            .filter(|id| graph.reachable(*id, None, |k| !k.is_guarded()).contains(*id))
            .collect();
        if !unbounded.is_empty() {
            out.push(
                Diagnostic::error(
                    self.name(),
                    None,
                    format!(
                        "Control cycle without a loop-control bound through layers: {}",
                        unbounded.join(", ")
                    ),
                )
                .with_fix("Route the cycle through a fix_target of a layer with loop control"),
            );
        }

        for layer in &def.layers {
            let escape = layer
                .loop_control
                .as_ref()
                .and_then(|lc| lc.escape_target.as_ref())
                .and_then(RouteTarget::layer_id);
            if let Some(target) = escape.filter(|t| def.layer(t).is_some()) {
                let loops_back = target == layer.id
                    || graph.reachable(target, None, |_| true).contains(layer.id.as_str());
                if loops_back {
                    out.push(
                        Diagnostic::warning(
                            self.name(),
                            Some(&layer.id),
                            format!(
                                "Escalation from '{}' to '{target}' can return to '{}'; only the global invocation ceiling bounds it",
                                layer.id, layer.id
                            ),
                        )
                        .with_fix("Set budget.max_invocations to a deliberate value"),
                    );
                }
            }
        }
        out
    }
}

struct ParallelOutputCollisionRule;
impl LintRule for ParallelOutputCollisionRule {
    fn name(&self) -> &str { "parallel_output_collision" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for layer in def.layers.iter().filter(|l| l.parallel) {
            let mut owners: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
            for agent in &layer.agents {
                for name in &agent.outputs {
                    owners.entry(name).or_default().push(&agent.name);
                }
            }
            for (artifact, agents) in owners.into_iter().filter(|(_, a)| a.len() > 1) {
                out.push(
                    Diagnostic::error(
                        self.name(),
                        Some(&layer.id),
                        format!(
                            "Parallel agents {} in layer '{}' all write artifact '{artifact}'",
                            agents.join(", "),
                            layer.id
                        ),
                    )
                    .with_fix("Give each parallel agent distinct output names"),
                );
            }
        }
        out
    }
}

struct GateSpecRule;
impl LintRule for GateSpecRule {
    fn name(&self) -> &str { "gate_spec" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        def.layers
            .iter()
            .filter_map(|layer| {
                let gate = layer.gate.as_ref()?;
                check_gate_spec(gate)
                    .err()
                    .map(|e| Diagnostic::error(self.name(), Some(&layer.id), e.to_string()))
            })
            .collect()
    }
}

struct LoopControlRule;
impl LintRule for LoopControlRule {
    fn name(&self) -> &str { "loop_control" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for layer in &def.layers {
            let Some(ref lc) = layer.loop_control else {
                continue;
            };
            if lc.max_attempts == 0 {
                out.push(Diagnostic::warning(
                    self.name(),
                    Some(&layer.id),
                    format!("Layer '{}' allows 0 attempts; its fix path is never taken", layer.id),
                ));
            }
            if layer.gate.is_none() && !layer.retry_agent_errors {
                out.push(Diagnostic::warning(
                    self.name(),
                    Some(&layer.id),
                    format!(
                        "Layer '{}' has loop control but no gate; only a layer timeout can fail it",
                        layer.id
                    ),
                ));
            }
            if layer.on_fail.is_some() {
                out.push(Diagnostic::warning(
                    self.name(),
                    Some(&layer.id),
                    format!("Layer '{}' on_fail is ignored because loop control handles failures", layer.id),
                ));
            }
        }
        out
    }
}

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str { "reachability" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        let Some(entry) = def.entry_layer().filter(|e| def.layer(e).is_some()) else {
            return vec![];
        };
        let reached = ControlGraph::build(def).reachable_from_entry(entry, None);
        def.layers
            .iter()
            .filter(|l| !reached.contains(l.id.as_str()))
            .map(|l| {
                Diagnostic::warning(
                    self.name(),
                    Some(&l.id),
                    format!("Layer '{}' is not reachable from entry '{entry}'", l.id),
                )
                .with_fix(format!("Route to '{}' or remove it", l.id))
            })
            .collect()
    }
}

struct BudgetSanityRule;
impl LintRule for BudgetSanityRule {
    fn name(&self) -> &str { "budget_sanity" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        let bad_cost = |c: Option<f64>| c.is_some_and(|c| !c.is_finite() || c < 0.0);

        if bad_cost(def.budget.max_cost) {
            out.push(Diagnostic::error(
                self.name(),
                None,
                "budget.max_cost must be a non-negative number".into(),
            ));
        }
        if def.budget.max_invocations == Some(0) {
            out.push(Diagnostic::error(
                self.name(),
                None,
                "budget.max_invocations of 0 lets no layer run".into(),
            ));
        }
        if def.budget.max_duration.is_some_and(|d| d.is_zero()) {
            out.push(Diagnostic::error(
                self.name(),
                None,
                "budget.max_duration must be greater than zero".into(),
            ));
        }
        for layer in &def.layers {
            if bad_cost(layer.budget.max_cost) {
                out.push(Diagnostic::error(
                    self.name(),
                    Some(&layer.id),
                    format!("Layer '{}' max_cost must be a non-negative number", layer.id),
                ));
            }
            if layer.budget.timeout.is_some_and(|d| d.is_zero()) {
                out.push(Diagnostic::error(
                    self.name(),
                    Some(&layer.id),
                    format!("Layer '{}' timeout must be greater than zero", layer.id),
                ));
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(def: &PipelineDefinition) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(NonEmptyRule),
        Box::new(UniqueIdsRule),
        Box::new(EntryExistsRule),
        Box::new(RouteTargetExistsRule),
        Box::new(AgentSpecRule),
        Box::new(ArtifactProducersRule),
        Box::new(ArtifactCyclesRule),
        Box::new(BoundedCyclesRule),
        Box::new(ParallelOutputCollisionRule),
        Box::new(GateSpecRule),
        Box::new(LoopControlRule),
        Box::new(ReachabilityRule),
        Box::new(BudgetSanityRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(def));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(def: &PipelineDefinition) -> strata_types::Result<Vec<Diagnostic>> {
    let diagnostics = validate(def);
    let messages: Vec<&str> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.message.as_str())
        .collect();
    if !messages.is_empty() {
        return Err(StrataError::InvalidDefinition(messages.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
