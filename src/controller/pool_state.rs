//! Process-wide pool state: ratios, price history, migration timestamps.
//!
//! All maps live behind one lock with short read-modify-write critical
//! sections; nothing here is held across I/O. Entries are created lazily on
//! first observation and live for the process.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use crate::model::types::Action;

/// Smoothing factor for the drift lerp on low-risk HOLD ticks.
const DRIFT_ALPHA: f64 = 0.1;

/// Steps reported for a pool that has never migrated; normalizes to "long
/// ago" without blowing up the feature scale.
const STEPS_NEVER_MIGRATED: f64 = 100.0;

#[derive(Debug)]
struct PoolEntry {
    current_spot_ratio: f64,
    target_spot_ratio: f64,
    price_history: VecDeque<f64>,
    last_migration: Option<Instant>,
}

/// The shared store, keyed by pool id string.
#[derive(Debug, Default)]
pub struct PoolStateStore {
    pools: Mutex<HashMap<String, PoolEntry>>,
}

impl PoolStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the observed ratio for a pool, creating the entry on first
    /// sight with the target seeded from the observation.
    pub fn observe_ratio(&self, pool: &str, current: f64, min: f64, max: f64) {
        let mut pools = self.pools.lock();
        let entry = pools.entry(pool.to_string()).or_insert_with(|| PoolEntry {
            current_spot_ratio: current,
            target_spot_ratio: current.clamp(min, max),
            price_history: VecDeque::new(),
            last_migration: None,
        });
        entry.current_spot_ratio = current;
        entry.target_spot_ratio = entry.target_spot_ratio.clamp(min, max);
    }

    pub fn ratios(&self, pool: &str) -> (f64, f64) {
        let pools = self.pools.lock();
        pools
            .get(pool)
            .map(|e| (e.current_spot_ratio, e.target_spot_ratio))
            .unwrap_or((0.0, 0.0))
    }

    /// Append a price, bounding the buffer at `cap` (2x the forecast
    /// window). An empty buffer is seeded from `seed_history` first.
    pub fn push_price(&self, pool: &str, price: f64, seed_history: &[f64], cap: usize) {
        let mut pools = self.pools.lock();
        let entry = pools.entry(pool.to_string()).or_insert_with(|| PoolEntry {
            current_spot_ratio: 0.0,
            target_spot_ratio: 0.0,
            price_history: VecDeque::new(),
            last_migration: None,
        });
        if entry.price_history.is_empty() && !seed_history.is_empty() {
            entry.price_history.extend(seed_history.iter().copied());
        }
        entry.price_history.push_back(price);
        while entry.price_history.len() > cap {
            entry.price_history.pop_front();
        }
    }

    pub fn price_history(&self, pool: &str) -> Vec<f64> {
        let pools = self.pools.lock();
        pools
            .get(pool)
            .map(|e| e.price_history.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Apply an executed action to the pool's target ratio. EMERGENCY_EXIT
    /// forces the target to the floor; HOLD under low risk drifts toward
    /// `drift_target` when one is configured. Always clamped to [min, max].
    pub fn apply_action(
        &self,
        pool: &str,
        action: Action,
        min: f64,
        max: f64,
        drift_target: Option<f64>,
        low_risk: bool,
    ) -> f64 {
        let mut pools = self.pools.lock();
        let Some(entry) = pools.get_mut(pool) else {
            return 0.0;
        };
        let target = match action {
            Action::EmergencyExit => 0.0,
            Action::Hold => match drift_target {
                Some(drift) if low_risk => {
                    entry.target_spot_ratio + DRIFT_ALPHA * (drift - entry.target_spot_ratio)
                }
                _ => entry.target_spot_ratio,
            },
            other => entry.target_spot_ratio + other.ratio_delta(),
        };
        entry.target_spot_ratio = target.clamp(min, max);
        entry.target_spot_ratio
    }

    pub fn record_migration(&self, pool: &str) {
        let mut pools = self.pools.lock();
        if let Some(entry) = pools.get_mut(pool) {
            entry.last_migration = Some(Instant::now());
        }
    }

    /// Steps since the last successful migration at `step_minutes` per step.
    pub fn steps_since_migration(&self, pool: &str, step_minutes: u64) -> f64 {
        let pools = self.pools.lock();
        match pools.get(pool).and_then(|e| e.last_migration) {
            Some(at) => at.elapsed().as_secs_f64() / (step_minutes.max(1) as f64 * 60.0),
            None => STEPS_NEVER_MIGRATED,
        }
    }
}
