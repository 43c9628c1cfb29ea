//! Telemetry clients for cluster metrics and market prices.
//!
//! The controller reads node CPU/memory, cluster and per-pool utilization,
//! and spot/on-demand prices from an external metrics store. A failed query
//! is an error the controller turns into "skip this tick" — never a crash.

pub mod prices;
pub mod prometheus;

pub use prices::{LivePriceProvider, PriceProvider, PriceQuote};
pub use prometheus::{NodeMetrics, PrometheusClient};

/// Error type for telemetry operations.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid metrics store URL: {0}")]
    InvalidUrl(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("No data returned for query: {0}")]
    NoData(String),

    #[error("Failed to parse response: {0}")]
    Parse(String),
}
