use crate::config::BudgetConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

/// Quality zone of a context window, by fraction of its budget in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetZone {
    /// Below the warning fraction.
    Smart,
    /// Between warning and critical.
    Caution,
    /// At or above the critical fraction. The caller should compact.
    Dumb,
}

/// Rough unit estimation (4 chars ≈ 1 unit), rounded up.
pub fn estimate_units(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Tracks context consumption for one worker session.
///
/// The budget only signals; compacting the context is up to the caller,
/// which then calls [`ContextBudget::release`] or [`ContextBudget::reset`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBudget {
    max_units: u64,
    current_units: u64,
    warning: f64,
    critical: f64,
}

impl ContextBudget {
    /// A budget of `max_units` with zone boundaries as usage fractions.
    pub fn new(max_units: u64, warning: f64, critical: f64) -> Self {
        Self {
            max_units,
            current_units: 0,
            warning,
            critical,
        }
    }

    /// A budget sized from the `[budget]` section.
    pub fn from_config(config: &BudgetConfig) -> Self {
        Self::new(config.max_units, config.warning, config.critical)
    }

    /// Consume `units`, returning the zone afterwards.
    pub fn add(&mut self, units: u64) -> BudgetZone {
        let before = self.zone();
        self.current_units = self.current_units.saturating_add(units);
        let after = self.zone();
        if after > before {
            match after {
                BudgetZone::Dumb => warn!(
                    used = self.current_units,
                    max = self.max_units,
                    "Context budget critical, compaction required"
                ),
                _ => info!(
                    used = self.current_units,
                    max = self.max_units,
                    "Context budget entering caution zone"
                ),
            }
        }
        after
    }

    /// Give back `units` after the caller compacted part of its context.
    pub fn release(&mut self, units: u64) {
        self.current_units = self.current_units.saturating_sub(units);
    }

    /// Forget everything consumed, after the caller compacted its context.
    pub fn reset(&mut self) {
        self.current_units = 0;
    }

    /// Fraction of the budget in use. An empty budget counts as full.
    pub fn usage(&self) -> f64 {
        if self.max_units == 0 {
            return 1.0;
        }
        self.current_units as f64 / self.max_units as f64
    }

    /// Zone for the current usage.
    pub fn zone(&self) -> BudgetZone {
        let usage = self.usage();
        if usage >= self.critical {
            BudgetZone::Dumb
        } else if usage >= self.warning {
            BudgetZone::Caution
        } else {
            BudgetZone::Smart
        }
    }

    /// True once usage reaches the critical boundary.
    pub fn should_compact(&self) -> bool {
        self.zone() == BudgetZone::Dumb
    }

    /// Units consumed so far.
    pub fn current_units(&self) -> u64 {
        self.current_units
    }

    /// Units left before the budget is full.
    pub fn remaining(&self) -> u64 {
        self.max_units.saturating_sub(self.current_units)
    }
}

/// One [`ContextBudget`] per session id, created on first use.
pub struct SessionBudgets {
    config: BudgetConfig,
    budgets: Mutex<HashMap<String, ContextBudget>>,
}

impl SessionBudgets {
    /// No sessions yet; each one starts on first use.
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            budgets: Mutex::new(HashMap::new()),
        }
    }

    /// Consume `units` for `session` and return its zone.
    pub fn add(&self, session: &str, units: u64) -> BudgetZone {
        let mut budgets = self.budgets.lock();
        budgets
            .entry(session.to_string())
            .or_insert_with(|| ContextBudget::from_config(&self.config))
            .add(units)
    }

    /// Zone of `session`, `Smart` if it never consumed anything.
    pub fn zone(&self, session: &str) -> BudgetZone {
        self.budgets
            .lock()
            .get(session)
            .map(ContextBudget::zone)
            .unwrap_or(BudgetZone::Smart)
    }

    /// Give back `units` for `session`.
    pub fn release(&self, session: &str, units: u64) {
        if let Some(budget) = self.budgets.lock().get_mut(session) {
            budget.release(units);
        }
    }

    /// Clear the usage of `session`.
    pub fn reset(&self, session: &str) {
        if let Some(budget) = self.budgets.lock().get_mut(session) {
            budget.reset();
        }
    }

    /// Drop the budget of a finished session.
    pub fn remove(&self, session: &str) -> Option<ContextBudget> {
        self.budgets.lock().remove(session)
    }

    /// Sessions that are in the `Dumb` zone, sorted.
    pub fn needing_compaction(&self) -> Vec<String> {
        let mut sessions: Vec<String> = self
            .budgets
            .lock()
            .iter()
            .filter(|(_, b)| b.should_compact())
            .map(|(id, _)| id.clone())
            .collect();
        sessions.sort();
        sessions
    }
}
