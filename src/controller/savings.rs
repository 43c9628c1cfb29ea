//! Shadow-mode savings reporting.
//!
//! Pure computation over the tick's node views plus metric publication.
//! Nothing here mutates the cluster; the only side effects are gauges and
//! the cumulative savings accumulator.

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::model::types::Action;
use crate::observability;

const HOURS_PER_MONTH: f64 = 730.0;

/// Per-node pricing view the reporter works from.
#[derive(Debug, Clone)]
pub struct NodeCost {
    pub node_name: String,
    pub pool: String,
    pub is_spot: bool,
    pub spot_price: f64,
    pub on_demand_price: f64,
    pub recommended_action: Action,
}

/// Aggregates for one pool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolSavings {
    /// On-demand nodes that would be cheaper on spot.
    pub optimizable_od: usize,
    pub hourly_usd: f64,
    pub monthly_usd: f64,
}

/// The tick's savings picture.
#[derive(Debug, Clone, Default)]
pub struct SavingsReport {
    pub per_pool: HashMap<String, PoolSavings>,
    pub total_hourly_usd: f64,
    pub total_current_cost_usd: f64,
}

/// Compute potential savings: for each on-demand node whose spot price is
/// below its on-demand price, the spread is money on the table.
pub fn compute(nodes: &[NodeCost]) -> SavingsReport {
    let mut report = SavingsReport::default();

    for node in nodes {
        let current_cost = if node.is_spot {
            node.spot_price
        } else {
            node.on_demand_price
        };
        report.total_current_cost_usd += current_cost;

        if !node.is_spot && node.spot_price < node.on_demand_price {
            let hourly = node.on_demand_price - node.spot_price;
            let pool = report.per_pool.entry(node.pool.clone()).or_default();
            pool.optimizable_od += 1;
            pool.hourly_usd += hourly;
            pool.monthly_usd = pool.hourly_usd * HOURS_PER_MONTH;
            report.total_hourly_usd += hourly;
        }
    }

    report
}

/// Publishes reports and keeps the cumulative total across ticks.
#[derive(Debug, Default)]
pub struct SavingsReporter {
    cumulative_usd: Mutex<f64>,
    /// Hours one tick represents, for the cumulative accumulation.
    tick_hours: f64,
}

impl SavingsReporter {
    pub fn new(tick_interval_secs: u64) -> Self {
        Self {
            cumulative_usd: Mutex::new(0.0),
            tick_hours: tick_interval_secs as f64 / 3600.0,
        }
    }

    /// Publish per-pool and per-node gauges plus the cumulative total.
    pub fn publish(&self, nodes: &[NodeCost], report: &SavingsReport) {
        for (pool, savings) in &report.per_pool {
            metrics::gauge!(
                observability::GAUGE_POTENTIAL_SAVINGS_HOURLY,
                savings.hourly_usd,
                "pool" => pool.clone()
            );
            metrics::gauge!(
                observability::GAUGE_POTENTIAL_SAVINGS_MONTHLY,
                savings.monthly_usd,
                "pool" => pool.clone()
            );
            metrics::gauge!(
                observability::GAUGE_OPTIMIZABLE_OD_NODES,
                savings.optimizable_od as f64,
                "pool" => pool.clone()
            );
        }

        for node in nodes {
            metrics::gauge!(
                observability::GAUGE_RECOMMENDED_ACTION,
                action_index(node.recommended_action),
                "node" => node.node_name.clone(),
                "pool" => node.pool.clone()
            );
        }

        let cumulative = {
            let mut total = self.cumulative_usd.lock();
            *total += report.total_hourly_usd * self.tick_hours;
            *total
        };
        // Monotonic by construction; exported as a gauge because the
        // exporter's counters are integral and these are dollars.
        metrics::gauge!(observability::COUNTER_DRY_RUN_SAVINGS_USD, cumulative);

        log::info!(
            "Savings report: {} pools, ${:.2}/h potential, ${:.2} cumulative",
            report.per_pool.len(),
            report.total_hourly_usd,
            cumulative
        );
    }

    #[cfg(test)]
    pub fn cumulative(&self) -> f64 {
        *self.cumulative_usd.lock()
    }
}

fn action_index(action: Action) -> f64 {
    (0..Action::COUNT)
        .find(|i| Action::from_index(*i) == Some(action))
        .unwrap_or(0) as f64
}
