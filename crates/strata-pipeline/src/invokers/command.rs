use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use strata_types::{AgentOutput, Result, StrataError};

use crate::agent::AgentInvoker;
use crate::definition::AgentSpec;
use crate::duration_serde::parse_duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const MESSAGE_LIMIT: usize = 4096;
/// Largest input exported through the environment. Linux rejects any single
/// variable over 128 KiB at exec time.
const ENV_VALUE_LIMIT: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// CommandInvoker: runs a shell command as an agent
// ---------------------------------------------------------------------------

/// Config shape:
/// `{"command": "...", "timeout": "30s", "workdir": "...", "cost": 0.0}`
///
/// Inputs are written to stdin as one JSON object. Inputs up to 64 KiB are
/// also exported as `STRATA_INPUT_<NAME>` variables; larger ones are only
/// available on stdin. The timeout covers feeding stdin as well as waiting
/// for exit. With a single declared output, stdout
/// becomes that artifact (parsed as JSON when it is valid JSON, raw text
/// otherwise). With several outputs, stdout must be a JSON object keyed by
/// output name. A non-zero exit status is an unsuccessful invocation.
pub struct CommandInvoker;

fn config_error(agent: &AgentSpec, message: &str) -> StrataError {
    StrataError::Other(format!("Agent '{}' is misconfigured: {message}", agent.name))
}

fn env_var_name(artifact: &str) -> String {
    let suffix: String = artifact
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("STRATA_INPUT_{suffix}")
}

fn env_value(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate(text: &str) -> String {
    if text.len() <= MESSAGE_LIMIT {
        return text.to_string();
    }
    let cut = text
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= MESSAGE_LIMIT)
        .last()
        .unwrap_or(0);
    format!("{}...(truncated)", &text[..cut])
}

fn parse_stdout(stdout: &str) -> Value {
    let trimmed = stdout.trim_end();
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

/// Map stdout onto the declared outputs, or explain why it cannot be.
fn collect_outputs(agent: &AgentSpec, stdout: &str) -> std::result::Result<HashMap<String, Value>, String> {
    let mut artifacts = HashMap::new();
    match agent.outputs.as_slice() {
        [] => {}
        [only] => {
            artifacts.insert(only.clone(), parse_stdout(stdout));
        }
        many => {
            let parsed = parse_stdout(stdout);
            let object = parsed
                .as_object()
                .ok_or("stdout must be a JSON object when several outputs are declared")?;
            for name in many {
                let value = object
                    .get(name)
                    .ok_or_else(|| format!("stdout object is missing output '{name}'"))?;
                artifacts.insert(name.clone(), value.clone());
            }
        }
    }
    Ok(artifacts)
}

#[async_trait]
impl AgentInvoker for CommandInvoker {
    fn kind(&self) -> &str {
        "command"
    }

    async fn invoke(
        &self,
        agent: &AgentSpec,
        inputs: &HashMap<String, Value>,
    ) -> Result<AgentOutput> {
        let config = &agent.config;
        let command = config
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| config_error(agent, "Missing 'command' in agent config"))?;
        let timeout = match config.get("timeout").and_then(Value::as_str) {
            Some(s) => parse_duration(s).map_err(|e| config_error(agent, &e))?,
            None => DEFAULT_TIMEOUT,
        };
        let cost = config.get("cost").and_then(Value::as_f64).unwrap_or(0.0);

        tracing::info!(agent = %agent.name, command = %command, "Executing agent command");

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        // Dropping the future (run deadline) must not leave the process behind.
        cmd.kill_on_drop(true);
        if let Some(dir) = config.get("workdir").and_then(Value::as_str) {
            cmd.current_dir(dir);
        }
        for (name, content) in inputs {
            let value = env_value(content);
            if value.len() > ENV_VALUE_LIMIT {
                tracing::debug!(agent = %agent.name, input = %name, bytes = value.len(), "Input too large for env; stdin only");
                continue;
            }
            cmd.env(env_var_name(name), value);
        }
        let payload = serde_json::to_vec(inputs)?;

        let mut child = cmd
            .spawn()
            .map_err(|e| StrataError::Other(format!("Failed to spawn command for agent '{}': {e}", agent.name)))?;

        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A command that never reads stdin closes the pipe early; that is fine.
                if let Err(e) = stdin.write_all(&payload).await {
                    tracing::debug!(agent = %agent.name, error = %e, "stdin not consumed");
                }
            }
        };
        let finished = async {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        let output = tokio::time::timeout(timeout, finished)
            .await
            .map_err(|_| StrataError::CommandTimeout {
                timeout_ms: timeout.as_millis() as u64,
            })??;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        tracing::info!(
            agent = %agent.name,
            exit_code = exit_code,
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "Agent command completed"
        );

        if !output.status.success() {
            let detail = if stderr.trim().is_empty() { &stdout } else { &stderr };
            return Ok(AgentOutput::failure(format!(
                "Command exited with code {exit_code}: {}",
                truncate(detail.trim())
            ))
            .with_cost(cost));
        }

        match collect_outputs(agent, &stdout) {
            Ok(artifacts) => Ok(AgentOutput {
                artifacts,
                cost,
                succeeded: true,
                message: (!stderr.trim().is_empty()).then(|| truncate(stderr.trim())),
            }),
            Err(reason) => Ok(AgentOutput::failure(reason).with_cost(cost)),
        }
    }
}
