//! Routing: turns a layer verdict into the next step of the run.
//!
//! Budget exhaustion is checked before anything else, so a run that is out of
//! invocations, time, or cost ends as a budget failure whatever the gate said.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use strata_types::{BudgetKind, TerminalStatus, Verdict};

use crate::budget::BudgetTracker;
use crate::definition::{Layer, RouteTarget};

// ---------------------------------------------------------------------------
// Loop-control table
// ---------------------------------------------------------------------------

/// How a layer was entered. Only [`EntryKind::Retry`] keeps a pending
/// attempt counter; every other entry starts the layer's loop fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Initial,
    Forward,
    Retry,
    Escalation,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::Initial => f.write_str("initial"),
            EntryKind::Forward => f.write_str("forward"),
            EntryKind::Retry => f.write_str("retry"),
            EntryKind::Escalation => f.write_str("escalation"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct LoopState {
    attempts_used: u32,
    retry_pending: bool,
}

/// Per-run attempt counters, keyed by layer id.
#[derive(Debug, Default)]
pub struct LoopTable {
    states: HashMap<String, LoopState>,
}

impl LoopTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entry into `layer` and classify it.
    ///
    /// `via` is how the router reached the layer. An escalation always
    /// resets. Otherwise a layer whose own fix path was taken and which is
    /// now being returned to is a retry and keeps its counter; anything else
    /// resets the counter.
    pub fn enter(&mut self, layer: &str, via: EntryKind) -> EntryKind {
        let state = self.states.entry(layer.to_string()).or_default();
        if via == EntryKind::Escalation {
            *state = LoopState::default();
            return EntryKind::Escalation;
        }
        if state.retry_pending {
            state.retry_pending = false;
            return EntryKind::Retry;
        }
        state.attempts_used = 0;
        via
    }

    pub fn attempts(&self, layer: &str) -> u32 {
        self.states.get(layer).map(|s| s.attempts_used).unwrap_or(0)
    }

    fn record_failure(&mut self, layer: &str) -> u32 {
        let state = self.states.entry(layer.to_string()).or_default();
        state.attempts_used += 1;
        state.attempts_used
    }

    fn mark_retry(&mut self, layer: &str) {
        self.states.entry(layer.to_string()).or_default().retry_pending = true;
    }

    fn reset(&mut self, layer: &str) {
        self.states.insert(layer.to_string(), LoopState::default());
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RouteDecision {
    /// Pass: continue to the layer's success target.
    Forward { target: String },
    /// Fail without loop control, routed to the configured failure target.
    FailPath { target: String },
    /// Fail with attempts remaining: re-enter the fix target.
    Fix {
        target: String,
        attempt: u32,
        max_attempts: u32,
    },
    /// Attempts exhausted: hand over to the escape layer.
    Escalate { target: String, attempts: u32 },
    Terminal { termination: Termination },
}

impl RouteDecision {
    pub fn terminal(status: TerminalStatus, reason: TerminationReason) -> Self {
        RouteDecision::Terminal {
            termination: Termination { status, reason },
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RouteDecision::Terminal { .. })
    }

    /// Blame a layer timeout rather than a gate for a terminal fail route.
    pub fn attribute_timeout(self, timeout_ms: u64) -> Self {
        match self {
            RouteDecision::Terminal {
                termination:
                    Termination {
                        status,
                        reason: TerminationReason::GateFailed { layer },
                    },
            } => RouteDecision::terminal(status, TerminationReason::TimedOut { layer, timeout_ms }),
            other => other,
        }
    }
}

impl fmt::Display for RouteDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteDecision::Forward { target } => write!(f, "forward to '{target}'"),
            RouteDecision::FailPath { target } => write!(f, "fail path to '{target}'"),
            RouteDecision::Fix {
                target,
                attempt,
                max_attempts,
            } => write!(f, "fix via '{target}' (attempt {attempt} of {max_attempts})"),
            RouteDecision::Escalate { target, attempts } => {
                write!(f, "escalate to '{target}' after {attempts} attempts")
            }
            RouteDecision::Terminal { termination } => write!(f, "{}", termination.status),
        }
    }
}

/// Absorbing end state of a run plus the reason it was reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Termination {
    pub status: TerminalStatus,
    pub reason: TerminationReason,
}

impl Termination {
    pub fn failure(reason: TerminationReason) -> Self {
        Self {
            status: TerminalStatus::Failure,
            reason,
        }
    }

    /// Budget failure for the first exceeded dimension of `budget`.
    pub fn budget(kind: BudgetKind, budget: &BudgetTracker, layer: Option<&str>) -> Self {
        Self::failure(TerminationReason::BudgetExhausted {
            kind,
            spent: budget.spent(kind),
            limit: budget.limit(kind),
            layer: layer.map(str::to_string),
        })
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum TerminationReason {
    Completed { layer: String },
    /// A pass verdict routed to a non-success terminal.
    Routed { layer: String, verdict: Verdict },
    GateFailed { layer: String },
    /// The layer hit its own timeout and had no fix loop to absorb it.
    TimedOut { layer: String, timeout_ms: u64 },
    RetriesExhausted { layer: String, attempts: u32 },
    AgentError {
        layer: String,
        agent: String,
        message: String,
    },
    BudgetExhausted {
        kind: BudgetKind,
        spent: f64,
        limit: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        layer: Option<String>,
    },
    MalformedGate { layer: String, message: String },
    MissingArtifact { layer: String, artifact: String },
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Completed { layer } => {
                write!(f, "pipeline completed after layer '{layer}'")
            }
            TerminationReason::Routed { layer, verdict } => {
                write!(f, "layer '{layer}' verdict {verdict} routed to a terminal state")
            }
            TerminationReason::GateFailed { layer } => {
                write!(f, "gate failed in layer '{layer}'")
            }
            TerminationReason::TimedOut { layer, timeout_ms } => {
                write!(f, "layer '{layer}' timed out after {timeout_ms}ms")
            }
            TerminationReason::RetriesExhausted { layer, attempts } => {
                write!(f, "layer '{layer}' exhausted its fix loop after {attempts} attempts")
            }
            TerminationReason::AgentError {
                layer,
                agent,
                message,
            } => write!(f, "agent '{agent}' failed in layer '{layer}': {message}"),
            TerminationReason::BudgetExhausted {
                kind,
                spent,
                limit,
                layer,
            } => {
                write!(f, "{kind} budget exhausted: spent {spent}")?;
                if let Some(limit) = limit {
                    write!(f, " of {limit}")?;
                }
                if let Some(layer) = layer {
                    write!(f, " (in layer '{layer}')")?;
                }
                Ok(())
            }
            TerminationReason::MalformedGate { layer, message } => {
                write!(f, "malformed gate in layer '{layer}': {message}")
            }
            TerminationReason::MissingArtifact { layer, artifact } => {
                write!(f, "layer '{layer}' requires missing artifact '{artifact}'")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// route
// ---------------------------------------------------------------------------

/// Decide where a run goes after `layer` produced `verdict`.
///
/// `next_in_order` is the pass target used when the layer configures none.
pub fn route(
    layer: &Layer,
    verdict: Verdict,
    budget: &BudgetTracker,
    loops: &mut LoopTable,
    next_in_order: RouteTarget,
) -> RouteDecision {
    if let Some(kind) = budget.first_exceeded() {
        tracing::warn!(layer = %layer.id, budget = %kind, "Budget exhausted; pre-empting verdict");
        return RouteDecision::Terminal {
            termination: Termination::budget(kind, budget, Some(&layer.id)),
        };
    }

    let id = layer.id.clone();
    match verdict {
        Verdict::Pass => match layer.on_pass.clone().unwrap_or(next_in_order) {
            RouteTarget::Layer(target) => RouteDecision::Forward { target },
            RouteTarget::Success => {
                RouteDecision::terminal(TerminalStatus::Success, TerminationReason::Completed { layer: id })
            }
            RouteTarget::Failure => RouteDecision::terminal(
                TerminalStatus::Failure,
                TerminationReason::Routed { layer: id, verdict },
            ),
            RouteTarget::Escalated => RouteDecision::terminal(
                TerminalStatus::Escalated,
                TerminationReason::Routed { layer: id, verdict },
            ),
        },
        Verdict::Fail => match layer.loop_control {
            None => match layer.on_fail.clone() {
                Some(RouteTarget::Layer(target)) => RouteDecision::FailPath { target },
                Some(RouteTarget::Success) => RouteDecision::terminal(
                    TerminalStatus::Success,
                    TerminationReason::GateFailed { layer: id },
                ),
                Some(RouteTarget::Escalated) => RouteDecision::terminal(
                    TerminalStatus::Escalated,
                    TerminationReason::GateFailed { layer: id },
                ),
                Some(RouteTarget::Failure) | None => RouteDecision::terminal(
                    TerminalStatus::Failure,
                    TerminationReason::GateFailed { layer: id },
                ),
            },
            Some(ref lc) => {
                let attempt = loops.record_failure(&id);
                if attempt <= lc.max_attempts {
                    loops.mark_retry(&id);
                    tracing::info!(
                        layer = %id,
                        attempt,
                        max_attempts = lc.max_attempts,
                        fix_target = %lc.fix_target,
                        "Taking fix path"
                    );
                    return RouteDecision::Fix {
                        target: lc.fix_target.clone(),
                        attempt,
                        max_attempts: lc.max_attempts,
                    };
                }

                loops.reset(&id);
                let attempts = lc.max_attempts;
                tracing::warn!(layer = %id, attempts, "Fix loop exhausted");
                let exhausted = TerminationReason::RetriesExhausted { layer: id, attempts };
                match lc.escape_target.clone() {
                    Some(RouteTarget::Layer(target)) => RouteDecision::Escalate { target, attempts },
                    Some(RouteTarget::Success) => {
                        RouteDecision::terminal(TerminalStatus::Success, exhausted)
                    }
                    Some(RouteTarget::Failure) => {
                        RouteDecision::terminal(TerminalStatus::Failure, exhausted)
                    }
                    Some(RouteTarget::Escalated) | None => {
                        RouteDecision::terminal(TerminalStatus::Escalated, exhausted)
                    }
                }
            }
        },
    }
}
