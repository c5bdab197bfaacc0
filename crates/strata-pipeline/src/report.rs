//! Run report: the audit surface of a finished run, plus persistence.
//!
//! [`save_report`] writes `<logs_root>/report.json`; [`load_report`] reads it
//! back for tooling that inspects past runs.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strata_types::{Result, TerminalStatus, Verdict};

use crate::artifacts::ArtifactStore;
use crate::budget::BudgetSummary;
use crate::router::{EntryKind, RouteDecision, Termination, TerminationReason};

const REPORT_FILE: &str = "report.json";

/// One entry of one layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerTrace {
    /// Position in the run, starting at 1.
    pub sequence: u32,
    pub layer: String,
    pub entry: EntryKind,
    /// How many times this layer has been entered so far, this one included.
    pub run_index: u32,
    /// `None` when the entry ended before a verdict (agent error, budget).
    pub verdict: Option<Verdict>,
    /// Loop-control attempts used after routing.
    pub attempts_used: u32,
    pub cost: f64,
    pub duration_ms: u64,
    pub route: RouteDecision,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: uuid::Uuid,
    pub pipeline: String,
    pub version: String,
    pub status: TerminalStatus,
    pub reason: TerminationReason,
    /// Human-readable account of every failed verdict, fix, escalation and
    /// the final termination.
    pub reason_chain: Vec<String>,
    pub trace: Vec<LayerTrace>,
    pub budget: BudgetSummary,
    pub artifacts: ArtifactStore,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub dry_run: bool,
}

impl RunReport {
    pub fn termination(&self) -> Termination {
        Termination {
            status: self.status,
            reason: self.reason.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TerminalStatus::Success
    }

    /// Trace entries for one layer, in run order.
    pub fn entries_of<'a>(&'a self, layer: &'a str) -> impl Iterator<Item = &'a LayerTrace> + 'a {
        self.trace.iter().filter(move |t| t.layer == layer)
    }

    /// Number of fix-path decisions taken anywhere in the run.
    pub fn fix_count(&self) -> usize {
        self.trace
            .iter()
            .filter(|t| matches!(t.route, RouteDecision::Fix { .. }))
            .count()
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// Save a report under `logs_root`, creating the directory if needed.
pub async fn save_report(report: &RunReport, logs_root: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(logs_root).await?;
    let path = logs_root.join(REPORT_FILE);
    let json = serde_json::to_string_pretty(report)?;
    tokio::fs::write(&path, json).await?;
    tracing::debug!(path = %path.display(), "Run report saved");
    Ok(path)
}

/// Load the report stored under `logs_root`, or `None` if there is none.
pub async fn load_report(logs_root: &Path) -> Result<Option<RunReport>> {
    let path = logs_root.join(REPORT_FILE);
    if !tokio::fs::try_exists(&path).await? {
        return Ok(None);
    }
    let json = tokio::fs::read_to_string(&path).await?;
    Ok(Some(serde_json::from_str(&json)?))
}
