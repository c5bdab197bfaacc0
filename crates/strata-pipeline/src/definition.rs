//! Pipeline definition model.
//!
//! A [`PipelineDefinition`] is the fully-resolved JSON document the engine
//! executes: an ordered list of [`Layer`]s, the artifacts supplied from
//! outside, and run-wide budget ceilings.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_types::{Result, StrataError};

use crate::duration_serde;
use crate::gate::GateSpec;

// ---------------------------------------------------------------------------
// PipelineDefinition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Entry layer id. Defaults to the first declared layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    /// Artifact names that must be supplied when the run starts.
    #[serde(default)]
    pub inputs: Vec<String>,
    pub layers: Vec<Layer>,
    #[serde(default)]
    pub budget: BudgetLimits,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl PipelineDefinition {
    /// Parse a definition from JSON text.
    pub fn from_json(source: &str) -> Result<Self> {
        serde_json::from_str(source)
            .map_err(|e| StrataError::InvalidDefinition(format!("malformed definition: {e}")))
    }

    /// Read and parse a definition file.
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_json(&source)
    }

    pub fn layer(&self, id: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id == id)
    }

    pub fn layer_index(&self, id: &str) -> Option<usize> {
        self.layers.iter().position(|l| l.id == id)
    }

    /// The layer a run starts from: `entry` if set, otherwise the first layer.
    pub fn entry_layer(&self) -> Option<&str> {
        match self.entry {
            Some(ref id) => Some(id.as_str()),
            None => self.layers.first().map(|l| l.id.as_str()),
        }
    }

    /// Default pass target for `id`: the next layer in declaration order, or
    /// `Success` after the last one.
    pub fn next_in_order(&self, id: &str) -> RouteTarget {
        self.layer_index(id)
            .and_then(|i| self.layers.get(i + 1))
            .map(|l| RouteTarget::Layer(l.id.clone()))
            .unwrap_or(RouteTarget::Success)
    }
}

// ---------------------------------------------------------------------------
// Budgets
// ---------------------------------------------------------------------------

/// Run-wide ceilings. `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    #[serde(
        default,
        with = "duration_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_duration: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_invocations: Option<u64>,
}

/// Ceilings applied to a single entry of one layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerBudget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    #[serde(
        default,
        with = "duration_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

// ---------------------------------------------------------------------------
// Layer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// Artifacts that must exist before the layer's agents run.
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
    /// Invoke agents concurrently instead of in declared order.
    #[serde(default)]
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateSpec>,
    #[serde(default, rename = "loop", skip_serializing_if = "Option::is_none")]
    pub loop_control: Option<LoopControl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_pass: Option<RouteTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_fail: Option<RouteTarget>,
    /// Treat agent failures as a fail verdict instead of ending the run.
    #[serde(default)]
    pub retry_agent_errors: bool,
    #[serde(default)]
    pub budget: LayerBudget,
}

impl Layer {
    /// Artifacts this layer produces, in declaration order without duplicates.
    pub fn produces(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for name in self.agents.iter().flat_map(|a| a.outputs.iter()) {
            if !out.contains(&name.as_str()) {
                out.push(name);
            }
        }
        out
    }

    /// Name under which the gate's verification report is stored.
    pub fn report_name(&self) -> String {
        report_artifact_name(&self.id)
    }

    pub fn agent(&self, name: &str) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| a.name == name)
    }
}

pub fn report_artifact_name(layer_id: &str) -> String {
    format!("{layer_id}.report")
}

/// Bounded fix-loop configuration for a gated layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopControl {
    pub max_attempts: u32,
    /// Layer re-entered while attempts remain.
    pub fix_target: String,
    /// Where to go once attempts are exhausted. `None` ends the run as `Escalated`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escape_target: Option<RouteTarget>,
}

/// Destination of a routing edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTarget {
    Layer(String),
    Success,
    Failure,
    Escalated,
}

impl RouteTarget {
    pub fn layer_id(&self) -> Option<&str> {
        match self {
            RouteTarget::Layer(id) => Some(id),
            _ => None,
        }
    }
}

impl std::fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteTarget::Layer(id) => write!(f, "layer '{id}'"),
            RouteTarget::Success => f.write_str("success"),
            RouteTarget::Failure => f.write_str("failure"),
            RouteTarget::Escalated => f.write_str("escalated"),
        }
    }
}

// ---------------------------------------------------------------------------
// AgentSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    /// Invoker kind, resolved against the agent registry before the run.
    pub kind: String,
    /// Input artifact names. `None` passes every artifact the layer requires
    /// plus, in sequential layers, the outputs of earlier agents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<String>>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub config: serde_json::Value,
    /// Invoker-level retries for transient errors.
    #[serde(default)]
    pub max_retries: usize,
}
