//! Workflow templates: typed variables plus a pipeline body with `${var}`
//! placeholders, rendered into a [`PipelineDefinition`].
//!
//! Rendering happens before the engine sees a definition; the executor only
//! ever runs fully-resolved definitions.

use std::path::Path;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use strata_types::{Result, StrataError};

use crate::definition::PipelineDefinition;

const PLACEHOLDER: &str = r"\$\{([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\}";

// ---------------------------------------------------------------------------
// Template model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub variables: Vec<TemplateVariable>,
    /// Pipeline definition body; strings may contain `${var}` placeholders.
    pub pipeline: Value,
}

fn default_version() -> String {
    "1.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateVariable {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: VariableType,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default = "default_required")]
    pub required: bool,
    /// Allowed values, for enum-like variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<Value>>,
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    String,
    List,
    Dict,
    Boolean,
    Number,
}

impl VariableType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            VariableType::String => value.is_string(),
            VariableType::List => value.is_array(),
            VariableType::Dict => value.is_object(),
            VariableType::Boolean => value.is_boolean(),
            VariableType::Number => value.is_number(),
        }
    }
}

impl std::fmt::Display for VariableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            VariableType::String => "string",
            VariableType::List => "list",
            VariableType::Dict => "dict",
            VariableType::Boolean => "boolean",
            VariableType::Number => "number",
        };
        f.write_str(name)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

impl WorkflowTemplate {
    pub fn from_json(source: &str) -> Result<Self> {
        serde_json::from_str(source)
            .map_err(|e| StrataError::Template(format!("malformed template: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_json(&source)
    }
}

// ---------------------------------------------------------------------------
// Config checking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Required variable '{0}' not provided")]
    Missing(String),

    #[error("Variable '{name}' must be {expected}, got {actual}")]
    WrongType {
        name: String,
        expected: VariableType,
        actual: &'static str,
    },

    #[error("Variable '{name}' must be one of {options}, got {value}")]
    NotAnOption {
        name: String,
        options: String,
        value: String,
    },
}

/// Check `config` against the template's variables, collecting every problem.
pub fn check_config(template: &WorkflowTemplate, config: &Map<String, Value>) -> Vec<ConfigError> {
    let mut errors = Vec::new();
    for var in &template.variables {
        let Some(value) = config.get(&var.name) else {
            if var.required && var.default.is_none() {
                errors.push(ConfigError::Missing(var.name.clone()));
            }
            continue;
        };
        if !var.kind.accepts(value) {
            errors.push(ConfigError::WrongType {
                name: var.name.clone(),
                expected: var.kind,
                actual: json_type_name(value),
            });
        }
        if let Some(ref options) = var.options {
            if !options.is_empty() && !options.contains(value) {
                errors.push(ConfigError::NotAnOption {
                    name: var.name.clone(),
                    options: Value::Array(options.clone()).to_string(),
                    value: value.to_string(),
                });
            }
        }
    }
    errors
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Render `template` with `config` into a pipeline definition.
///
/// Defaults fill variables missing from `config`. The rendered definition's
/// metadata records the template name, template version, render time and
/// [`config_hash`] of `config`.
pub fn render_template(template: &WorkflowTemplate, config: &Map<String, Value>) -> Result<PipelineDefinition> {
    let errors = check_config(template, config);
    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
        return Err(StrataError::Template(format!(
            "configuration errors: {}",
            messages.join("; ")
        )));
    }

    let mut context = config.clone();
    for var in &template.variables {
        if let Some(ref default) = var.default {
            context.entry(var.name.clone()).or_insert_with(|| default.clone());
        }
    }

    let placeholder = Regex::new(PLACEHOLDER).map_err(|e| StrataError::Template(e.to_string()))?;
    let mut body = render_value(&template.pipeline, &context, &placeholder);
    let object = body
        .as_object_mut()
        .ok_or_else(|| StrataError::Template("template 'pipeline' must be a JSON object".into()))?;

    object
        .entry("name")
        .or_insert_with(|| Value::String(template.name.clone()));
    object
        .entry("version")
        .or_insert_with(|| Value::String(template.version.clone()));
    if !template.description.is_empty() {
        object
            .entry("description")
            .or_insert_with(|| Value::String(template.description.clone()));
    }
    let metadata = object
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(meta) = metadata.as_object_mut() {
        meta.insert("template".into(), Value::String(template.name.clone()));
        meta.insert("template_version".into(), Value::String(template.version.clone()));
        meta.insert(
            "rendered_at".into(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
        meta.insert("config_hash".into(), Value::String(config_hash(config)?));
    }

    tracing::debug!(template = %template.name, variables = context.len(), "Template rendered");
    serde_json::from_value(body)
        .map_err(|e| StrataError::Template(format!("rendered pipeline is not a valid definition: {e}")))
}

/// Short SHA-256 fingerprint of a render configuration: the first 12 hex
/// digits over its compact JSON, keys sorted.
pub fn config_hash(config: &Map<String, Value>) -> Result<String> {
    let bytes = serde_json::to_vec(config)?;
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(12);
    Ok(digest)
}

fn render_value(value: &Value, vars: &Map<String, Value>, placeholder: &Regex) -> Value {
    match value {
        Value::String(s) => expand_variables(s, vars, placeholder),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| render_value(v, vars, placeholder))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, vars, placeholder)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn lookup<'a>(vars: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = vars.get(segments.next()?)?;
    segments.try_fold(first, |v, seg| v.get(seg))
}

/// Expand `${name}` placeholders in `text`.
///
/// A string that is exactly one placeholder takes the variable's JSON value,
/// so numbers, lists and objects keep their type. Inline placeholders use the
/// value's text form. Unknown variables are left in place.
pub fn expand_variables(text: &str, vars: &Map<String, Value>, placeholder: &Regex) -> Value {
    if let Some(caps) = placeholder.captures(text) {
        if caps.get(0).is_some_and(|m| m.as_str() == text) {
            if let Some(value) = lookup(vars, &caps[1]) {
                return value.clone();
            }
        }
    }

    let expanded = placeholder.replace_all(text, |caps: &Captures| match lookup(vars, &caps[1]) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => {
            tracing::warn!(variable = &caps[1], "Unknown template variable left unexpanded");
            caps[0].to_string()
        }
    });
    Value::String(expanded.into_owned())
}
