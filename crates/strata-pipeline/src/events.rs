//! Run event stream.
//!
//! The executor publishes [`PipelineEvent`]s on a [`tokio::sync::broadcast`]
//! channel. Observers subscribe without touching engine state; events sent
//! while nobody listens are dropped.

use serde::{Deserialize, Serialize};
use strata_types::{BudgetKind, TerminalStatus, Verdict};

use crate::router::{EntryKind, RouteDecision};

/// Events emitted during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStarted {
        run_id: String,
        pipeline: String,
        layer_count: usize,
    },
    LayerStarted {
        layer: String,
        entry: EntryKind,
        run_index: u32,
    },
    AgentCompleted {
        layer: String,
        agent: String,
        succeeded: bool,
        cost: f64,
    },
    GateEvaluated {
        layer: String,
        gate: String,
        verdict: Verdict,
        violations: usize,
    },
    Routed {
        layer: String,
        decision: RouteDecision,
    },
    BudgetExceeded {
        kind: BudgetKind,
        spent: f64,
    },
    RunFinished {
        run_id: String,
        status: TerminalStatus,
        duration_ms: u64,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(PipelineEvent::LayerStarted {
            layer: "generate".into(),
            entry: EntryKind::Initial,
            run_index: 1,
        });
        emitter.emit(PipelineEvent::BudgetExceeded {
            kind: BudgetKind::Cost,
            spent: 3.5,
        });

        match rx.recv().await.unwrap() {
            PipelineEvent::LayerStarted { layer, entry, .. } => {
                assert_eq!(layer, "generate");
                assert_eq!(entry, EntryKind::Initial);
            }
            other => panic!("Expected LayerStarted, got: {other:?}"),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            PipelineEvent::BudgetExceeded { kind: BudgetKind::Cost, .. }
        ));
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::default();
        emitter.emit(PipelineEvent::RunFinished {
            run_id: "r".into(),
            status: TerminalStatus::Failure,
            duration_ms: 1,
        });
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = PipelineEvent::Routed {
            layer: "verify".into(),
            decision: RouteDecision::Fix {
                target: "generate".into(),
                attempt: 1,
                max_attempts: 2,
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "routed");
        assert_eq!(value["decision"]["action"], "fix");
    }
}
