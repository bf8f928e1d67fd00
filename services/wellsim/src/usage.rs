//! Usage planning for the reconciliation driver
//!
//! A policy turns the not-yet-reported part of the externally observed usage
//! into the quantities and irrigation window of one open/close cycle.

use chrono::{Duration, Months, NaiveDateTime};
use rand::Rng;

/// Quantities reported for one irrigation cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsagePlan {
    pub water: u64,
    pub electric: u64,
    pub started_at: NaiveDateTime,
    pub stopped_at: NaiveDateTime,
}

pub trait UsagePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Plan one cycle for `pending_water`/`pending_electric` not yet reported
    fn plan(&self, pending_water: u64, pending_electric: u64, now: NaiveDateTime) -> UsagePlan;

    /// Whether a started cycle should be closed after `elapsed_cycles` reconcile ticks
    fn should_close(&self, elapsed_cycles: u32) -> bool {
        elapsed_cycles >= 1
    }
}

/// Mock-data policy: bounded random water, electric derived from a random pump rate
#[derive(Debug, Clone)]
pub struct RandomizedUsagePolicy {
    min_water: u64,
    max_water: u64,
}

impl RandomizedUsagePolicy {
    pub fn new(min_water: u64, max_water: u64) -> Self {
        Self {
            min_water: min_water.min(max_water),
            max_water,
        }
    }
}

impl Default for RandomizedUsagePolicy {
    fn default() -> Self {
        Self::new(3000, 6000)
    }
}

impl UsagePolicy for RandomizedUsagePolicy {
    fn name(&self) -> &'static str {
        "randomized"
    }

    fn plan(&self, pending_water: u64, _pending_electric: u64, now: NaiveDateTime) -> UsagePlan {
        let mut rng = rand::thread_rng();
        let water = if pending_water > self.max_water {
            if self.min_water < self.max_water {
                rng.gen_range(self.min_water..self.max_water)
            } else {
                self.max_water
            }
        } else {
            pending_water
        };
        // 40..48 units of water per unit of electric
        let electric = water / rng.gen_range(40..48u64) * 10;
        // 30..40 units of electric per hour of pumping
        let minutes = electric as f64 / 10.0 / f64::from(rng.gen_range(30..40u32)) * 60.0;

        let started_at = now.checked_sub_months(Months::new(1)).unwrap_or(now);
        let stopped_at = started_at + Duration::seconds((minutes * 60.0).round() as i64);
        UsagePlan {
            water,
            electric,
            started_at,
            stopped_at,
        }
    }
}

/// Reports the pending deltas as-is over a zero-length window ending now
#[derive(Debug, Clone, Default)]
pub struct ExactUsagePolicy;

impl UsagePolicy for ExactUsagePolicy {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn plan(&self, pending_water: u64, pending_electric: u64, now: NaiveDateTime) -> UsagePlan {
        UsagePlan {
            water: pending_water,
            electric: pending_electric,
            started_at: now,
            stopped_at: now,
        }
    }
}
