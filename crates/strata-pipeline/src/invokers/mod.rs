pub mod command;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};

use strata_types::{AgentOutput, Result};

use crate::agent::AgentInvoker;
use crate::definition::AgentSpec;

pub use command::CommandInvoker;

// ---------------------------------------------------------------------------
// StaticInvoker: returns outputs straight from the agent config
// ---------------------------------------------------------------------------

/// Config shape:
/// `{"outputs": {"<name>": <value>}, "cost": 0.1, "succeed": true, "message": "..."}`
pub struct StaticInvoker;

#[async_trait]
impl AgentInvoker for StaticInvoker {
    fn kind(&self) -> &str {
        "static"
    }

    async fn invoke(
        &self,
        agent: &AgentSpec,
        _inputs: &HashMap<String, Value>,
    ) -> Result<AgentOutput> {
        let config = &agent.config;
        let cost = config.get("cost").and_then(Value::as_f64).unwrap_or(0.0);

        if config.get("succeed").and_then(Value::as_bool) == Some(false) {
            let message = config
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("static agent configured to fail");
            return Ok(AgentOutput::failure(message).with_cost(cost));
        }

        let mut artifacts = HashMap::new();
        for name in &agent.outputs {
            match config.get("outputs").and_then(|o| o.get(name)) {
                Some(value) => {
                    artifacts.insert(name.clone(), value.clone());
                }
                None => {
                    return Ok(AgentOutput::failure(format!(
                        "static agent has no configured value for output '{name}'"
                    ))
                    .with_cost(cost));
                }
            }
        }

        tracing::debug!(agent = %agent.name, outputs = artifacts.len(), "Static agent produced outputs");
        Ok(AgentOutput::success(artifacts).with_cost(cost))
    }
}

// ---------------------------------------------------------------------------
// DryRunInvoker: placeholder outputs, no side effects
// ---------------------------------------------------------------------------

/// Stands in for every agent when a run is started with `dry_run`.
///
/// Each declared output receives a passing report-shaped placeholder, so
/// judged gates accept it as well. An agent with no declared outputs gets a
/// single `report` artifact.
pub struct DryRunInvoker;

impl DryRunInvoker {
    fn placeholder(agent: &AgentSpec) -> Value {
        json!({
            "dry_run": true,
            "agent": agent.name,
            "kind": agent.kind,
            "passed": true,
            "violations": [],
            "score": 1.0,
        })
    }
}

#[async_trait]
impl AgentInvoker for DryRunInvoker {
    fn kind(&self) -> &str {
        "dry_run"
    }

    async fn invoke(
        &self,
        agent: &AgentSpec,
        _inputs: &HashMap<String, Value>,
    ) -> Result<AgentOutput> {
        tracing::info!(agent = %agent.name, kind = %agent.kind, "Dry run, skipping agent execution");
        let names: Vec<String> = if agent.outputs.is_empty() {
            vec!["report".to_string()]
        } else {
            agent.outputs.clone()
        };
        let artifacts = names
            .into_iter()
            .map(|name| (name, Self::placeholder(agent)))
            .collect();
        Ok(AgentOutput::success(artifacts))
    }
}
