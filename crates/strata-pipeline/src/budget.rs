//! Budget accounting for cost, wall-clock time, and layer invocations.
//!
//! Charges are always recorded, even the one that crosses a ceiling, so the
//! run report shows what was actually spent.

use serde::{Deserialize, Serialize};
use strata_types::{BudgetKind, Result, StrataError};

use crate::definition::{BudgetLimits, LayerBudget};

#[derive(Debug, Clone)]
pub struct BudgetTracker {
    limits: Meter,
    spent: Meter,
}

/// One value per [`BudgetKind`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Meter {
    cost: f64,
    time_ms: f64,
    invocations: f64,
}

impl Meter {
    fn get(&self, kind: BudgetKind) -> f64 {
        match kind {
            BudgetKind::Cost => self.cost,
            BudgetKind::Time => self.time_ms,
            BudgetKind::Invocations => self.invocations,
        }
    }

    fn get_mut(&mut self, kind: BudgetKind) -> &mut f64 {
        match kind {
            BudgetKind::Cost => &mut self.cost,
            BudgetKind::Time => &mut self.time_ms,
            BudgetKind::Invocations => &mut self.invocations,
        }
    }
}

impl BudgetTracker {
    /// A tracker with no ceilings.
    pub fn unlimited() -> Self {
        Self {
            limits: Meter {
                cost: f64::INFINITY,
                time_ms: f64::INFINITY,
                invocations: f64::INFINITY,
            },
            spent: Meter::default(),
        }
    }

    /// Run-wide tracker. `default_max_invocations` applies when the
    /// definition leaves the invocation ceiling unset.
    pub fn for_run(limits: &BudgetLimits, default_max_invocations: u64) -> Self {
        let mut tracker = Self::unlimited();
        if let Some(cost) = limits.max_cost {
            tracker.limits.cost = cost;
        }
        if let Some(duration) = limits.max_duration {
            tracker.limits.time_ms = duration.as_millis() as f64;
        }
        tracker.limits.invocations = limits.max_invocations.unwrap_or(default_max_invocations) as f64;
        tracker
    }

    /// Tracker for one entry of a layer. Only cost is metered here; the
    /// layer timeout is enforced as a deadline by the orchestrator.
    pub fn for_layer(budget: &LayerBudget) -> Self {
        let mut tracker = Self::unlimited();
        if let Some(cost) = budget.max_cost {
            tracker.limits.cost = cost;
        }
        tracker
    }

    /// Record `amount` against `kind`.
    ///
    /// Fails with [`StrataError::BudgetExceeded`] once the total crosses the
    /// ceiling; the charge is kept either way.
    pub fn charge(&mut self, kind: BudgetKind, amount: f64) -> Result<()> {
        *self.spent.get_mut(kind) += amount;
        if self.exceeded(kind) {
            return Err(StrataError::BudgetExceeded {
                kind,
                limit: self.limits.get(kind),
                spent: self.spent.get(kind),
            });
        }
        Ok(())
    }

    /// Advance the time meter to `elapsed_ms` total. Time never runs backwards.
    pub fn set_elapsed(&mut self, elapsed_ms: f64) -> Result<()> {
        let delta = (elapsed_ms - self.spent.time_ms).max(0.0);
        self.charge(BudgetKind::Time, delta)
    }

    /// Remaining headroom; `f64::INFINITY` when unlimited, never negative.
    pub fn remaining(&self, kind: BudgetKind) -> f64 {
        (self.limits.get(kind) - self.spent.get(kind)).max(0.0)
    }

    pub fn exceeded(&self, kind: BudgetKind) -> bool {
        self.spent.get(kind) > self.limits.get(kind)
    }

    pub fn spent(&self, kind: BudgetKind) -> f64 {
        self.spent.get(kind)
    }

    /// The ceiling for `kind`, or `None` when unlimited.
    pub fn limit(&self, kind: BudgetKind) -> Option<f64> {
        Some(self.limits.get(kind)).filter(|l| l.is_finite())
    }

    /// First exceeded dimension, checking invocations, then time, then cost.
    pub fn first_exceeded(&self) -> Option<BudgetKind> {
        [BudgetKind::Invocations, BudgetKind::Time, BudgetKind::Cost]
            .into_iter()
            .find(|k| self.exceeded(*k))
    }

    pub fn summary(&self) -> BudgetSummary {
        let line = |kind| BudgetLine {
            spent: self.spent(kind),
            limit: self.limit(kind),
            exceeded: self.exceeded(kind),
        };
        BudgetSummary {
            cost: line(BudgetKind::Cost),
            time_ms: line(BudgetKind::Time),
            invocations: line(BudgetKind::Invocations),
        }
    }
}

/// Serializable view of a tracker for the run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSummary {
    pub cost: BudgetLine,
    pub time_ms: BudgetLine,
    pub invocations: BudgetLine,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLine {
    pub spent: f64,
    pub limit: Option<f64>,
    pub exceeded: bool,
}
