//! Daily water/fertilizer allowance, depleted by scheduled irrigation events.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use time::Date;
use tracing::{info, warn};

use crate::critical::{BusyGuard, CriticalSection};
use crate::error::ControlResult;

/// How the share of one scheduled event is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitPolicy {
    /// `total_water / events` for every event of the day.
    #[default]
    EqualSplit,
    /// Each event asks the model again when it fires.
    FreshPrediction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyBudget {
    pub total_water: f64,
    pub remaining_water: f64,
    pub fertilizer_percent: f64,
    pub date: Date,
    /// Scheduled events the total is split across.
    pub events: usize,
}

impl DailyBudget {
    pub fn equal_share(&self) -> f64 {
        if self.events == 0 {
            self.total_water
        } else {
            self.total_water / self.events as f64
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining_water <= 0.0
    }
}

pub struct BudgetTracker {
    section: CriticalSection,
    policy: SplitPolicy,
    budget: Mutex<Option<DailyBudget>>,
}

impl BudgetTracker {
    pub fn new(section: CriticalSection, policy: SplitPolicy) -> Self {
        Self {
            section,
            policy,
            budget: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> SplitPolicy {
        self.policy
    }

    pub fn current(&self) -> Option<DailyBudget> {
        self.budget.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// True until a budget exists for `date`.
    pub fn needs_replan(&self, date: Date) -> bool {
        self.current().map_or(true, |b| b.date != date)
    }

    /// Reset the day's allowance from a model decision.
    pub fn replan(
        &self,
        total_water: f64,
        fertilizer_percent: f64,
        date: Date,
        events: usize,
        guard: &BusyGuard,
    ) -> ControlResult<DailyBudget> {
        self.section.verify(guard)?;
        let budget = DailyBudget {
            total_water: total_water.max(0.0),
            remaining_water: total_water.max(0.0),
            fertilizer_percent: fertilizer_percent.max(0.0),
            date,
            events,
        };
        info!(
            total_l = budget.total_water,
            fertilizer_pct = budget.fertilizer_percent,
            events,
            %date,
            "daily budget planned"
        );
        *self.budget.lock().unwrap_or_else(|e| e.into_inner()) = Some(budget.clone());
        Ok(budget)
    }

    /// Take `min(remaining, share)` from the budget.  Returns the allotment,
    /// which is zero once the budget is exhausted.
    pub fn allot(&self, share: f64, guard: &BusyGuard) -> ControlResult<f64> {
        self.section.verify(guard)?;
        let mut slot = self.budget.lock().unwrap_or_else(|e| e.into_inner());
        let Some(budget) = slot.as_mut() else {
            warn!("no daily budget planned; nothing allotted");
            return Ok(0.0);
        };

        let allotted = budget.remaining_water.min(share.max(0.0)).max(0.0);
        budget.remaining_water = (budget.remaining_water - allotted).max(0.0);

        if allotted <= 0.0 {
            info!(date = %budget.date, "daily budget exhausted; event is a no-op");
        } else {
            info!(
                allotted_l = allotted,
                remaining_l = budget.remaining_water,
                "water allotted"
            );
        }
        Ok(allotted)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
