//! Prometheus client for node and cluster utilization.
//!
//! Queries the Prometheus HTTP API for per-node CPU/memory utilization and
//! cluster/pool aggregates. Series are keyed by whatever the exporter put in
//! the `instance`/`node` label — a bare host, `host:port`, or the kubernetes
//! node name — and are mapped back to node names here. A series whose label
//! is missing falls back to the literal `"unknown"`.

use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use super::TelemetryError;
use crate::config::TelemetryConfig;

// Utilization queries. The memory expression mirrors what node_exporter
// exposes; CPU is the non-idle fraction over a 5m rate window.
const QUERY_NODE_CPU: &str =
    r#"1 - avg by (instance) (rate(node_cpu_seconds_total{mode="idle"}[5m]))"#;
const QUERY_NODE_MEMORY: &str =
    r#"1 - node_memory_MemAvailable_bytes / node_memory_MemTotal_bytes"#;
const QUERY_POOL_UTILIZATION: &str =
    r#"avg by (pool) (spotvortex:node:utilization)"#;

/// Per-node utilization snapshot, both axes in [0, 1].
#[derive(Debug, Clone)]
pub struct NodeMetrics {
    pub node_name: String,
    pub cpu_utilization: f64,
    pub memory_utilization: f64,
}

/// Prometheus client for utilization queries.
pub struct PrometheusClient {
    base_url: String,
    http_client: Client,
    bearer_token: Option<String>,
}

impl PrometheusClient {
    pub fn new(config: &TelemetryConfig) -> Result<Self, TelemetryError> {
        let base_url = config.prometheus_url.trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(TelemetryError::InvalidUrl(
                "URL must start with http:// or https://".to_string(),
            ));
        }

        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.query_timeout_secs))
            .build()?;

        Ok(Self {
            base_url,
            http_client,
            bearer_token: config.bearer_token.clone(),
        })
    }

    fn add_auth(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.bearer_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Check if the metrics store is reachable.
    pub async fn is_available(&self) -> bool {
        let url = format!("{}/-/healthy", self.base_url);
        let req = self.http_client.get(&url).timeout(Duration::from_secs(5));
        match self.add_auth(req).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Per-node CPU and memory utilization. Nodes missing either axis get 0
    /// for it rather than being dropped.
    pub async fn get_node_metrics(&self) -> Result<Vec<NodeMetrics>, TelemetryError> {
        let cpu = self.query_by_instance(QUERY_NODE_CPU).await?;
        let memory = self.query_by_instance(QUERY_NODE_MEMORY).await?;

        let mut names: Vec<&String> = cpu.keys().chain(memory.keys()).collect();
        names.sort();
        names.dedup();

        Ok(names
            .into_iter()
            .map(|name| NodeMetrics {
                node_name: name.clone(),
                cpu_utilization: cpu.get(name).copied().unwrap_or(0.0),
                memory_utilization: memory.get(name).copied().unwrap_or(0.0),
            })
            .collect())
    }

    /// Cluster-wide utilization in [0, 1]: the mean of per-node max(cpu, mem).
    pub async fn get_cluster_utilization(&self) -> Result<f64, TelemetryError> {
        let nodes = self.get_node_metrics().await?;
        if nodes.is_empty() {
            return Err(TelemetryError::NoData("node utilization".to_string()));
        }
        let sum: f64 = nodes
            .iter()
            .map(|n| n.cpu_utilization.max(n.memory_utilization))
            .sum();
        Ok((sum / nodes.len() as f64).clamp(0.0, 1.0))
    }

    /// Per-pool utilization from the agent's recording rule.
    pub async fn get_pool_utilization(&self) -> Result<HashMap<String, f64>, TelemetryError> {
        let result = self.query_instant(QUERY_POOL_UTILIZATION).await?;
        Ok(result
            .into_iter()
            .map(|series| {
                let pool = series
                    .metric
                    .get("pool")
                    .cloned()
                    .unwrap_or_else(|| "unknown".to_string());
                (pool, series.sample_value().unwrap_or(0.0))
            })
            .collect())
    }

    /// Instant query returning a value per normalized instance label.
    async fn query_by_instance(
        &self,
        query: &str,
    ) -> Result<HashMap<String, f64>, TelemetryError> {
        let result = self.query_instant(query).await?;
        let mut values = HashMap::new();
        for series in result {
            let key = series
                .metric
                .get("instance")
                .or_else(|| series.metric.get("node"))
                .map(|label| normalize_instance_label(label))
                .unwrap_or_else(|| "unknown".to_string());
            if let Some(v) = series.sample_value() {
                values.insert(key, v);
            }
        }
        Ok(values)
    }

    /// Run an instant query against `/api/v1/query`.
    pub(crate) async fn query_instant(
        &self,
        query: &str,
    ) -> Result<Vec<PrometheusSeries>, TelemetryError> {
        let url = format!(
            "{}/api/v1/query?query={}",
            self.base_url,
            urlencoding::encode(query)
        );
        self.execute(&url).await
    }

    /// Run a range query against `/api/v1/query_range`.
    pub(crate) async fn query_range(
        &self,
        query: &str,
        start: i64,
        end: i64,
        step_secs: u64,
    ) -> Result<Vec<PrometheusSeries>, TelemetryError> {
        let url = format!(
            "{}/api/v1/query_range?query={}&start={}&end={}&step={}s",
            self.base_url,
            urlencoding::encode(query),
            start,
            end,
            step_secs
        );
        self.execute(&url).await
    }

    async fn execute(&self, url: &str) -> Result<Vec<PrometheusSeries>, TelemetryError> {
        let req = self.http_client.get(url);
        let response = self.add_auth(req).send().await?;

        if !response.status().is_success() {
            return Err(TelemetryError::QueryFailed(format!(
                "HTTP {}: {}",
                response.status(),
                response.text().await.unwrap_or_default()
            )));
        }

        let body: PrometheusResponse = response
            .json()
            .await
            .map_err(|e| TelemetryError::Parse(e.to_string()))?;

        if body.status != "success" {
            return Err(TelemetryError::QueryFailed(
                body.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        Ok(body.data.result.unwrap_or_default())
    }
}

/// Reduce an exporter instance label to a node name: strip any `:port`
/// suffix and leave bare hosts and node names untouched.
pub fn normalize_instance_label(label: &str) -> String {
    if label.is_empty() {
        return "unknown".to_string();
    }
    match label.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !host.is_empty() => {
            host.to_string()
        }
        _ => label.to_string(),
    }
}

// ============================================================================
// Prometheus API response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct PrometheusResponse {
    status: String,
    error: Option<String>,
    data: PrometheusData,
}

#[derive(Debug, Deserialize)]
struct PrometheusData {
    result: Option<Vec<PrometheusSeries>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PrometheusSeries {
    pub metric: HashMap<String, String>,
    /// Instant query result: one (timestamp, value) pair.
    pub value: Option<(f64, String)>,
    /// Range query result.
    pub values: Option<Vec<(f64, String)>>,
}

impl PrometheusSeries {
    /// Value of an instant sample, NaN and infinities filtered out.
    pub fn sample_value(&self) -> Option<f64> {
        self.value
            .as_ref()
            .and_then(|(_, v)| v.parse::<f64>().ok())
            .filter(|v| v.is_finite())
    }

    /// All finite values of a range result, in time order.
    pub fn range_values(&self) -> Vec<f64> {
        self.values
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(|(_, v)| v.parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .collect()
    }
}
