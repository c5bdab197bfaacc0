//! Agent invoker trait, invoker registry, and per-run agent resolution.
//!
//! The engine never runs agents itself. Each [`AgentSpec`] names an invoker
//! `kind`; [`AgentRegistry::resolve`] binds every agent in a definition to
//! its invoker once, before the run starts, so an unknown kind is reported
//! up front instead of halfway through a run.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use strata_types::{AgentOutput, Result, StrataError};

use crate::definition::{AgentSpec, PipelineDefinition};
use crate::gate::GateCheck;
use crate::invokers::{CommandInvoker, DryRunInvoker, StaticInvoker};
use crate::retry::{execute_with_retry, BackoffPolicy};

// ---------------------------------------------------------------------------
// AgentInvoker trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// The invoker kind referenced by agent specs (e.g. "static", "command").
    fn kind(&self) -> &str;

    /// Run one agent against its input artifacts.
    async fn invoke(
        &self,
        agent: &AgentSpec,
        inputs: &HashMap<String, serde_json::Value>,
    ) -> Result<AgentOutput>;
}

// ---------------------------------------------------------------------------
// AgentRegistry
// ---------------------------------------------------------------------------

pub struct AgentRegistry {
    invokers: HashMap<String, Arc<dyn AgentInvoker>>,
    backoff: BackoffPolicy,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            invokers: HashMap::new(),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn register(&mut self, invoker: impl AgentInvoker + 'static) {
        let kind = invoker.kind().to_string();
        self.invokers.insert(kind, Arc::new(invoker));
    }

    /// Backoff used between invoker-level retries.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn AgentInvoker>> {
        self.invokers.get(kind).cloned()
    }

    pub fn has(&self, kind: &str) -> bool {
        self.invokers.contains_key(kind)
    }

    /// Registered kinds in sorted order.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.invokers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Bind every layer agent and judged-gate agent in `definition` to an
    /// invoker. With `dry_run`, every agent is bound to [`DryRunInvoker`].
    pub fn resolve(&self, definition: &PipelineDefinition, dry_run: bool) -> Result<ResolvedAgents> {
        let dry: Arc<dyn AgentInvoker> = Arc::new(DryRunInvoker);
        let mut bindings = HashMap::new();

        for layer in &definition.layers {
            let judge = layer.gate.as_ref().and_then(|g| match g.check {
                GateCheck::Judged { ref agent } => Some(agent),
                GateCheck::Structural { .. } => None,
            });
            let slots = layer
                .agents
                .iter()
                .map(|a| (Slot::agent(&layer.id, &a.name), a))
                .chain(judge.map(|a| (Slot::judge(&layer.id), a)));

            for (slot, agent) in slots {
                let invoker = if dry_run {
                    dry.clone()
                } else {
                    self.get(&agent.kind)
                        .ok_or_else(|| StrataError::UnknownAgentKind {
                            agent: agent.name.clone(),
                            kind: agent.kind.clone(),
                        })?
                };
                bindings.insert(slot, invoker);
            }
        }

        tracing::debug!(agents = bindings.len(), dry_run, "Agents resolved");
        Ok(ResolvedAgents {
            bindings,
            backoff: self.backoff.clone(),
        })
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry pre-loaded with the built-in invokers.
pub fn default_registry() -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    registry.register(StaticInvoker);
    registry.register(CommandInvoker);
    registry
}

// ---------------------------------------------------------------------------
// ResolvedAgents: bindings for one run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Slot {
    layer: String,
    agent: Option<String>,
}

impl Slot {
    fn agent(layer: &str, agent: &str) -> Self {
        Self {
            layer: layer.to_string(),
            agent: Some(agent.to_string()),
        }
    }

    fn judge(layer: &str) -> Self {
        Self {
            layer: layer.to_string(),
            agent: None,
        }
    }
}

pub struct ResolvedAgents {
    bindings: HashMap<Slot, Arc<dyn AgentInvoker>>,
    backoff: BackoffPolicy,
}

impl ResolvedAgents {
    /// Invoke a layer agent, with invoker-level retries for transient errors.
    pub async fn invoke(
        &self,
        layer: &str,
        agent: &AgentSpec,
        inputs: &HashMap<String, serde_json::Value>,
    ) -> Result<AgentOutput> {
        self.call(Slot::agent(layer, &agent.name), agent, inputs).await
    }

    /// Invoke the judged-gate agent of `layer`.
    pub async fn invoke_judge(
        &self,
        layer: &str,
        agent: &AgentSpec,
        inputs: &HashMap<String, serde_json::Value>,
    ) -> Result<AgentOutput> {
        self.call(Slot::judge(layer), agent, inputs).await
    }

    async fn call(
        &self,
        slot: Slot,
        agent: &AgentSpec,
        inputs: &HashMap<String, serde_json::Value>,
    ) -> Result<AgentOutput> {
        let invoker = self.bindings.get(&slot).ok_or_else(|| {
            StrataError::Other(format!(
                "agent '{}' in layer '{}' was not resolved before the run",
                agent.name, slot.layer
            ))
        })?;
        execute_with_retry(
            || invoker.invoke(agent, inputs),
            agent.max_retries,
            &self.backoff,
            &agent.name,
        )
        .await
    }
}
