//! Spot and on-demand price provider.
//!
//! Prices come from the same metrics store as utilization, exported per
//! instance type and zone by the price scraper. Synthetic prices are a
//! development fixture and are refused at config validation, so the only
//! provider here is the live one.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

use super::prometheus::PrometheusClient;
use super::TelemetryError;

const QUERY_SPOT_PRICE: &str = "spotvortex_spot_price_usd_per_hour";
const QUERY_ON_DEMAND_PRICE: &str = "spotvortex_on_demand_price_usd_per_hour";

/// A price observation for one (instance type, zone).
#[derive(Debug, Clone)]
pub struct PriceQuote {
    /// Current spot price, USD/hour.
    pub current: f64,
    /// Current on-demand price, USD/hour.
    pub on_demand: f64,
    /// Recent spot price history, oldest first.
    pub history: Vec<f64>,
}

/// Source of market prices for an instance pool.
#[async_trait]
pub trait PriceProvider: Send + Sync {
    async fn get_spot_price(
        &self,
        instance_type: &str,
        zone: &str,
    ) -> Result<PriceQuote, TelemetryError>;
}

/// Live provider backed by the metrics store.
pub struct LivePriceProvider {
    client: Arc<PrometheusClient>,
    /// How many steps of history to fetch.
    history_steps: usize,
    /// Seconds per history step.
    step_secs: u64,
}

impl LivePriceProvider {
    pub fn new(client: Arc<PrometheusClient>, history_steps: usize, step_secs: u64) -> Self {
        Self {
            client,
            history_steps,
            step_secs,
        }
    }

    fn selector(metric: &str, instance_type: &str, zone: &str) -> String {
        format!(
            r#"{}{{instance_type="{}",zone="{}"}}"#,
            metric, instance_type, zone
        )
    }
}

#[async_trait]
impl PriceProvider for LivePriceProvider {
    async fn get_spot_price(
        &self,
        instance_type: &str,
        zone: &str,
    ) -> Result<PriceQuote, TelemetryError> {
        let spot_query = Self::selector(QUERY_SPOT_PRICE, instance_type, zone);
        let od_query = Self::selector(QUERY_ON_DEMAND_PRICE, instance_type, zone);

        let end = Utc::now().timestamp();
        let start = end - (self.history_steps as i64) * (self.step_secs as i64);

        let history_series = self
            .client
            .query_range(&spot_query, start, end, self.step_secs)
            .await?;
        let history = history_series
            .first()
            .map(|s| s.range_values())
            .unwrap_or_default();

        let current = match history.last() {
            Some(v) => *v,
            None => {
                // No range data yet; fall back to an instant sample.
                self.client
                    .query_instant(&spot_query)
                    .await?
                    .first()
                    .and_then(|s| s.sample_value())
                    .ok_or_else(|| TelemetryError::NoData(spot_query.clone()))?
            }
        };

        let on_demand = self
            .client
            .query_instant(&od_query)
            .await?
            .first()
            .and_then(|s| s.sample_value())
            .ok_or_else(|| TelemetryError::NoData(od_query))?;

        Ok(PriceQuote {
            current,
            on_demand,
            history,
        })
    }
}
