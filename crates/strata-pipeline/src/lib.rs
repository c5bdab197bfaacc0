//! Layered pipeline engine: definitions, validation, gates, routing, budgets,
//! and agent invokers.
//!
//! A run walks an ordered list of layers. Each layer invokes its agents,
//! stores their artifacts, evaluates an optional verification gate, and is
//! routed forward, into a bounded fix loop, to an escalation layer, or to a
//! terminal status. Every run ends as `success`, `failure`, or `escalated`
//! with a full reason chain.

pub mod agent;
pub mod artifacts;
pub mod budget;
pub mod condition;
pub mod definition;
pub mod duration_serde;
pub mod engine;
pub mod events;
pub mod gate;
pub mod invokers;
pub mod report;
pub mod retry;
pub mod router;
pub mod template;
pub mod validation;

pub use agent::{default_registry, AgentInvoker, AgentRegistry, ResolvedAgents};
pub use artifacts::{Artifact, ArtifactHandle, ArtifactStore, Provenance};
pub use budget::{BudgetLine, BudgetSummary, BudgetTracker};
pub use condition::{evaluate_condition, parse_condition, Clause, ConditionExpr, Operator};
pub use definition::{
    AgentSpec, BudgetLimits, Layer, LayerBudget, LoopControl, PipelineDefinition, RouteTarget,
};
pub use engine::{ExecutorConfig, PipelineExecutor};
pub use events::{EventEmitter, PipelineEvent};
pub use gate::{
    check_gate_spec, evaluate_judged, evaluate_structural, GateCheck, GateOutcome, GateSpec,
    PassPredicate, StructuralRule, VerificationReport,
};
pub use invokers::{CommandInvoker, DryRunInvoker, StaticInvoker};
pub use report::{load_report, save_report, LayerTrace, RunReport};
pub use retry::{execute_with_retry, BackoffPolicy};
pub use router::{route, EntryKind, LoopTable, RouteDecision, Termination, TerminationReason};
pub use template::{
    check_config, config_hash, expand_variables, render_template, ConfigError, TemplateVariable,
    VariableType, WorkflowTemplate,
};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
