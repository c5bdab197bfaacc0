//! Shared types and errors for the Strata layered pipeline engine.
//!
//! This crate provides the foundational types used across the other Strata crates:
//! - `StrataError`: unified error taxonomy
//! - `Verdict` / `TerminalStatus`: closed outcome variants for layers and runs
//! - `BudgetKind`: the three metered budget dimensions
//! - `AgentOutput`: what an agent invocation hands back to the engine

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unified error type for all Strata subsystems.
#[derive(Debug, thiserror::Error)]
pub enum StrataError {
    // === Definition Errors ===
    #[error("Invalid pipeline definition: {0}")]
    InvalidDefinition(String),

    #[error("Malformed gate '{gate}': {message}")]
    MalformedGateSpec { gate: String, message: String },

    #[error("Agent '{agent}' has unknown kind '{kind}'")]
    UnknownAgentKind { agent: String, kind: String },

    #[error("Template rendering failed: {0}")]
    Template(String),

    // === Runtime Errors ===
    #[error("Agent '{agent}' failed in layer '{layer}': {message}")]
    AgentInvocation {
        layer: String,
        agent: String,
        message: String,
        retryable: bool,
    },

    #[error("Gate '{gate}' evaluation failed: {message}")]
    GateEvaluation { gate: String, message: String },

    #[error("{kind} budget exceeded: spent {spent} of {limit}")]
    BudgetExceeded {
        kind: BudgetKind,
        limit: f64,
        spent: f64,
    },

    #[error("Artifact '{name}' not found")]
    ArtifactNotFound { name: String },

    #[error("Command timed out after {timeout_ms}ms")]
    CommandTimeout { timeout_ms: u64 },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl StrataError {
    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StrataError::CommandTimeout { .. }
                | StrataError::AgentInvocation {
                    retryable: true,
                    ..
                }
        )
    }
}

/// A convenience alias for `Result<T, StrataError>`.
pub type Result<T> = std::result::Result<T, StrataError>;

// ---------------------------------------------------------------------------
// Verdict: pass/fail outcome of a layer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
}

impl Verdict {
    pub fn from_passed(passed: bool) -> Self {
        if passed {
            Verdict::Pass
        } else {
            Verdict::Fail
        }
    }

    pub fn is_pass(self) -> bool {
        self == Verdict::Pass
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => f.write_str("pass"),
            Verdict::Fail => f.write_str("fail"),
        }
    }
}

// ---------------------------------------------------------------------------
// TerminalStatus: absorbing end state of a run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Success,
    Failure,
    Escalated,
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalStatus::Success => f.write_str("success"),
            TerminalStatus::Failure => f.write_str("failure"),
            TerminalStatus::Escalated => f.write_str("escalated"),
        }
    }
}

// ---------------------------------------------------------------------------
// BudgetKind
// ---------------------------------------------------------------------------

/// A metered budget dimension. Time is measured in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetKind {
    Cost,
    Time,
    Invocations,
}

impl BudgetKind {
    pub const ALL: [BudgetKind; 3] = [BudgetKind::Cost, BudgetKind::Time, BudgetKind::Invocations];
}

impl fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetKind::Cost => f.write_str("cost"),
            BudgetKind::Time => f.write_str("time"),
            BudgetKind::Invocations => f.write_str("invocations"),
        }
    }
}

// ---------------------------------------------------------------------------
// AgentOutput: result of one agent invocation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOutput {
    /// Produced artifacts keyed by artifact name.
    #[serde(default)]
    pub artifacts: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub cost: f64,
    pub succeeded: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl AgentOutput {
    /// Create a successful output carrying the given artifacts.
    pub fn success(artifacts: HashMap<String, serde_json::Value>) -> Self {
        Self {
            artifacts,
            cost: 0.0,
            succeeded: true,
            message: None,
        }
    }

    /// Create an unsuccessful output with the given reason.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            artifacts: HashMap::new(),
            cost: 0.0,
            succeeded: false,
            message: Some(message.into()),
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_artifact(mut self, name: impl Into<String>, content: serde_json::Value) -> Self {
        self.artifacts.insert(name.into(), content);
        self
    }
}
