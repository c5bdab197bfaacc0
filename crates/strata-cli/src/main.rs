//! CLI binary for running, validating, and rendering Strata pipelines.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use serde_json::Value;

use strata_pipeline::{
    check_config, duration_serde::parse_duration, render_template, save_report, validate,
    EventEmitter, ExecutorConfig, PipelineDefinition, PipelineEvent, PipelineExecutor, RunReport,
    Severity, WorkflowTemplate,
};
use strata_types::TerminalStatus;

#[derive(Parser)]
#[command(name = "strata", version, about = "Layered pipeline runner for agent workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline definition
    Run {
        /// Path to the pipeline JSON file
        pipeline: PathBuf,

        /// JSON file with an object of input artifacts
        #[arg(long)]
        inputs: Option<PathBuf>,

        /// Single input artifact as name=value (value parsed as JSON, else kept as text)
        #[arg(short, long = "input", value_name = "NAME=VALUE")]
        input: Vec<String>,

        /// Directory for report.json (default: .strata/logs/<pipeline>-<hash>)
        #[arg(short, long)]
        logs: Option<PathBuf>,

        /// Bind every agent to placeholder outputs instead of running it
        #[arg(long)]
        dry_run: bool,

        /// Override the run's cost ceiling
        #[arg(long)]
        max_cost: Option<f64>,

        /// Override the run's layer-invocation ceiling. Default when unset: 200.
        #[arg(long)]
        max_invocations: Option<u64>,

        /// Override the run's wall-clock ceiling, e.g. "90s" or "10m"
        #[arg(long)]
        timeout: Option<String>,

        /// Print run events as JSON lines while the run progresses
        #[arg(long)]
        events: bool,
    },

    /// Validate a pipeline definition
    Validate {
        /// Path to the pipeline JSON file
        pipeline: PathBuf,
    },

    /// Show information about a pipeline
    Info {
        /// Path to the pipeline JSON file
        pipeline: PathBuf,
    },

    /// Render a workflow template into a pipeline definition
    Render {
        /// Path to the template JSON file
        template: PathBuf,

        /// JSON file with the template configuration object
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            pipeline,
            inputs,
            input,
            logs,
            dry_run,
            max_cost,
            max_invocations,
            timeout,
            events,
        } => {
            let overrides = Overrides {
                max_cost,
                max_invocations,
                timeout,
            };
            let status = cmd_run(&pipeline, inputs.as_deref(), &input, logs.as_deref(), dry_run, overrides, events).await?;
            match status {
                TerminalStatus::Success => {}
                TerminalStatus::Failure => std::process::exit(1),
                TerminalStatus::Escalated => std::process::exit(2),
            }
        }
        Commands::Validate { pipeline } => {
            cmd_validate(&pipeline)?;
        }
        Commands::Info { pipeline } => {
            cmd_info(&pipeline)?;
        }
        Commands::Render {
            template,
            config,
            output,
        } => {
            cmd_render(&template, config.as_deref(), output.as_deref())?;
        }
    }

    Ok(())
}

fn load_pipeline(path: &Path) -> anyhow::Result<PipelineDefinition> {
    PipelineDefinition::load(path).with_context(|| format!("loading {}", path.display()))
}

fn load_json_object(path: &Path) -> anyhow::Result<serde_json::Map<String, Value>> {
    let source = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    match serde_json::from_str(&source)? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("{} must contain a JSON object, found {other}", path.display()),
    }
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let def = load_pipeline(path)?;
    let diagnostics = validate(&def);

    if diagnostics.is_empty() {
        println!("Pipeline is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
        };
        match diag.layer_id {
            Some(ref layer) => println!("[{severity}] {} ({layer}): {}", diag.rule, diag.message),
            None => println!("[{severity}] {}: {}", diag.rule, diag.message),
        }
        if let Some(ref fix) = diag.fix {
            println!("    fix: {fix}");
        }
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let def = load_pipeline(path)?;

    println!("Pipeline: {} v{}", def.name, def.version);
    if !def.description.is_empty() {
        println!("Description: {}", def.description);
    }
    if let Some(entry) = def.entry_layer() {
        println!("Entry: {entry}");
    }
    if !def.inputs.is_empty() {
        println!("Inputs: {}", def.inputs.join(", "));
    }
    let budget = &def.budget;
    println!(
        "Budget: cost={} duration={} invocations={}",
        budget.max_cost.map_or("unlimited".to_string(), |c| c.to_string()),
        budget
            .max_duration
            .map_or("unlimited".to_string(), |d| format!("{}ms", d.as_millis())),
        budget
            .max_invocations
            .map_or("default".to_string(), |i| i.to_string()),
    );

    println!("\nLayers:");
    for layer in &def.layers {
        let agents: Vec<String> = layer
            .agents
            .iter()
            .map(|a| format!("{}:{}", a.name, a.kind))
            .collect();
        let mode = if layer.parallel { "parallel" } else { "sequential" };
        println!("  {} [{mode}] agents=[{}]", layer.id, agents.join(", "));
        if !layer.requires.is_empty() {
            println!("    requires: {}", layer.requires.join(", "));
        }
        let produces = layer.produces();
        if !produces.is_empty() {
            println!("    produces: {}", produces.join(", "));
        }
        if let Some(ref gate) = layer.gate {
            println!("    gate: {} -> {}", gate.name, layer.report_name());
        }
        if let Some(ref lc) = layer.loop_control {
            let escape = lc
                .escape_target
                .as_ref()
                .map_or("escalated".to_string(), ToString::to_string);
            println!(
                "    loop: max_attempts={} fix={} escape={escape}",
                lc.max_attempts, lc.fix_target
            );
        }
    }

    Ok(())
}

fn cmd_render(template: &Path, config: Option<&Path>, output: Option<&Path>) -> anyhow::Result<()> {
    let template = WorkflowTemplate::load(template)?;
    let config = match config {
        Some(path) => load_json_object(path)?,
        None => serde_json::Map::new(),
    };

    let errors = check_config(&template, &config);
    if !errors.is_empty() {
        for error in &errors {
            eprintln!("[ERROR] {error}");
        }
        anyhow::bail!("{} configuration error(s) in template '{}'", errors.len(), template.name);
    }

    let def = render_template(&template, &config)?;
    let json = serde_json::to_string_pretty(&def)?;
    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, json)?;
            println!("Rendered '{}' to {}", template.name, path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

/// Generate a unique logs directory name from the pipeline filename and a short random suffix.
/// Format: `.strata/logs/<stem>-<8hex>`
fn unique_logs_dir(pipeline_path: &Path) -> PathBuf {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let stem = pipeline_path
        .file_stem()
        .unwrap_or_default()
        .to_string_lossy();

    let mut hasher = DefaultHasher::new();
    std::time::SystemTime::now().hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    let hash = hasher.finish();

    PathBuf::from(format!(".strata/logs/{}-{:08x}", stem, hash as u32))
}

fn parse_input(raw: &str) -> anyhow::Result<(String, Value)> {
    let (name, value) = raw
        .split_once('=')
        .with_context(|| format!("input '{raw}' must be NAME=VALUE"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.trim().to_string(), value))
}

struct Overrides {
    max_cost: Option<f64>,
    max_invocations: Option<u64>,
    timeout: Option<String>,
}

impl Overrides {
    fn apply(self, def: &mut PipelineDefinition) -> anyhow::Result<()> {
        if let Some(cost) = self.max_cost {
            def.budget.max_cost = Some(cost);
        }
        if let Some(invocations) = self.max_invocations {
            def.budget.max_invocations = Some(invocations);
        }
        if let Some(ref timeout) = self.timeout {
            def.budget.max_duration = Some(parse_duration(timeout).map_err(anyhow::Error::msg)?);
        }
        Ok(())
    }
}

async fn cmd_run(
    path: &Path,
    inputs_file: Option<&Path>,
    input: &[String],
    logs: Option<&Path>,
    dry_run: bool,
    overrides: Overrides,
    print_events: bool,
) -> anyhow::Result<TerminalStatus> {
    let mut def = load_pipeline(path)?;
    overrides.apply(&mut def)?;

    let mut inputs: HashMap<String, Value> = match inputs_file {
        Some(file) => load_json_object(file)?.into_iter().collect(),
        None => HashMap::new(),
    };
    for raw in input {
        let (name, value) = parse_input(raw)?;
        inputs.insert(name, value);
    }

    let logs_dir = match logs {
        Some(l) => l.to_path_buf(),
        None => unique_logs_dir(path),
    };

    println!("Running pipeline: {}", def.name);
    println!("Logs: {}", logs_dir.display());
    if dry_run {
        println!("(dry run mode -- agents are not executed)");
    }
    if let Some(cost) = def.budget.max_cost {
        println!("Cost limit: {cost}");
    }

    let mut executor = PipelineExecutor::with_default_registry().with_config(ExecutorConfig {
        dry_run,
        ..ExecutorConfig::default()
    });
    let printer = if print_events {
        let emitter = EventEmitter::default();
        let rx = emitter.subscribe();
        executor = executor.with_events(emitter);
        Some(tokio::spawn(print_events_from(rx)))
    } else {
        None
    };

    let report = executor.execute(&def, inputs).await;
    // Dropping the executor closes the channel so the printer drains and ends.
    drop(executor);
    if let Some(handle) = printer {
        let _ = handle.await;
    }
    let report = report?;

    let saved = save_report(&report, &logs_dir).await?;
    print_summary(&report);
    println!("Report: {}", saved.display());
    Ok(report.status)
}

async fn print_events_from(mut rx: tokio::sync::broadcast::Receiver<PipelineEvent>) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match rx.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(error = %e, "Could not serialize event"),
            },
            Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Event printer fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_summary(report: &RunReport) {
    println!("\nPipeline finished: {}", report.status);
    println!("Reason: {}", report.reason);
    println!("Layer entries: {}", report.trace.len());
    for entry in &report.trace {
        let verdict = entry.verdict.map_or("-".to_string(), |v| v.to_string());
        println!(
            "  #{} {} [{}] verdict={} -> {}",
            entry.sequence, entry.layer, entry.entry, verdict, entry.route
        );
    }
    if report.reason_chain.len() > 1 {
        println!("Reason chain:");
        for reason in &report.reason_chain {
            println!("  - {reason}");
        }
    }
    if report.budget.cost.spent > 0.0 {
        println!("Total cost: {:.4}", report.budget.cost.spent);
    }
}
