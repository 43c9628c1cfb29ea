//! Configuration types.
//!
//! Two layers: [`AgentConfig`] is read once at startup and validated fatally;
//! [`RuntimeConfig`] is a small JSON file re-read every tick so operators can
//! retune thresholds without restarting the agent.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How decisions are made: the learned policy model or the rule-based policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Q-values from the RL policy model pick the action.
    Rl,
    /// The deterministic rule ladder replaces the policy model's action.
    Deterministic,
}

/// Data-source mode for metrics and prices. Synthetic exists only as a
/// development aid and is refused outside dry-run (prices: refused always).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Live,
    Synthetic,
}

impl Default for SourceMode {
    fn default() -> Self {
        SourceMode::Live
    }
}

/// Startup configuration. Loaded from a JSON file; invalid values are fatal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Seconds between reconcile ticks. Enforced >= 10 at startup.
    pub reconcile_interval_secs: u64,
    /// Log and short-circuit every mutation.
    pub dry_run: bool,
    /// Observe and report potential savings; take no action.
    pub shadow_mode: bool,
    /// Prime-Directive capacity-score override threshold.
    pub risk_threshold: f64,
    /// Assessments below this confidence are dropped.
    pub confidence_threshold: f64,
    /// Maximum fraction of all nodes drained in one tick.
    pub max_drain_ratio: f64,
    /// Use extended pool keys (`<pool>:<type>:<zone>`) when nodes carry a
    /// workload-pool label.
    pub extended_pools: bool,
    /// Run inference once per `(workload_pool, zone)` group instead of per
    /// node.
    pub pool_level_inference: bool,
    /// Pods in this namespace make their node refuse drains unless the
    /// `ALLOW_MONITORING_DRAIN` opt-in is set.
    pub monitoring_namespace: String,
    /// `1/spot_nodes > limit` blocks mutations (guardrail 1).
    pub cluster_fraction_limit: f64,
    /// Listen address for the Prometheus metrics exporter.
    pub metrics_listen_addr: String,
    /// Path of the hot-reloaded runtime config.
    pub runtime_config_path: PathBuf,
    /// Directory holding `tft.onnx`, `rl_policy.onnx`, `MODEL_MANIFEST.json`,
    /// and optional `pysr/` equations.
    pub models_dir: PathBuf,
    /// Fail startup when the bundle has no manifest.
    pub require_model_contract: bool,

    pub telemetry: TelemetryConfig,
    pub drain: DrainConfig,
    pub karpenter: KarpenterConfig,
    pub asg: AsgConfig,
    pub forecast: ForecastConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 60,
            dry_run: false,
            shadow_mode: false,
            risk_threshold: 0.8,
            confidence_threshold: 0.5,
            max_drain_ratio: 0.1,
            extended_pools: false,
            pool_level_inference: false,
            monitoring_namespace: "monitoring".to_string(),
            cluster_fraction_limit: 0.2,
            metrics_listen_addr: "0.0.0.0:9464".to_string(),
            runtime_config_path: PathBuf::from("/etc/spotvortex/runtime.json"),
            models_dir: PathBuf::from("/models"),
            require_model_contract: false,
            telemetry: TelemetryConfig::default(),
            drain: DrainConfig::default(),
            karpenter: KarpenterConfig::default(),
            asg: AsgConfig::default(),
            forecast: ForecastConfig::default(),
        }
    }
}

/// Metrics-store and price-provider endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub prometheus_url: String,
    /// Optional bearer token for an externally exposed Prometheus.
    pub bearer_token: Option<String>,
    pub query_timeout_secs: u64,
    pub metrics_mode: SourceMode,
    pub price_mode: SourceMode,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            prometheus_url: "http://localhost:9090".to_string(),
            bearer_token: None,
            query_timeout_secs: 30,
            metrics_mode: SourceMode::Live,
            price_mode: SourceMode::Live,
        }
    }
}

/// Drainer behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    /// Grace period handed to the eviction subresource.
    pub grace_period_secs: i64,
    /// Continue past PDB violations instead of aborting the drain.
    pub force: bool,
    /// Concurrent evictions per drain.
    pub eviction_concurrency: usize,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 30,
            force: false,
            eviction_concurrency: 4,
        }
    }
}

/// Karpenter NodePool steering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KarpenterConfig {
    /// Weight written to the NodePool the swap favors.
    pub favored_weight: i32,
    /// Weight written to the sibling.
    pub disfavored_weight: i32,
    /// Minimum seconds between weight changes on one workload pool.
    pub weight_change_cooldown_secs: u64,
    /// When non-empty, only these workload pools may be steered.
    pub managed_pools: Vec<String>,
}

impl Default for KarpenterConfig {
    fn default() -> Self {
        Self {
            favored_weight: 80,
            disfavored_weight: 20,
            weight_change_cooldown_secs: 300,
            managed_pools: Vec::new(),
        }
    }
}

/// Twin-ASG discovery and readiness waiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsgConfig {
    /// Tag key whose value names the workload pool.
    pub pool_tag_key: String,
    /// Tag key whose value is `spot` or `on-demand`.
    pub capacity_type_tag_key: String,
    /// How long to wait for a Ready replacement node.
    pub node_ready_timeout_secs: u64,
    /// Poll interval while waiting.
    pub poll_interval_secs: u64,
}

impl Default for AsgConfig {
    fn default() -> Self {
        Self {
            pool_tag_key: "spotvortex.io/pool".to_string(),
            capacity_type_tag_key: "spotvortex.io/capacity-type".to_string(),
            node_ready_timeout_secs: 300,
            poll_interval_secs: 10,
        }
    }
}

/// Forecast-model input shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    /// History steps (H) fed to the forecast model.
    pub history_steps: usize,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self { history_steps: 48 }
    }
}

/// Hot-reloaded tuning knobs. Re-read every tick; a broken file keeps the
/// previous values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Applied to both forecast scores via sigmoid(logit(p) * m).
    pub risk_multiplier: f64,
    pub min_spot_ratio: f64,
    pub max_spot_ratio: f64,
    /// Drift target the ratio lerps toward on low-risk HOLD ticks.
    pub target_spot_ratio: Option<f64>,
    /// Minutes per "step" for the time-since-migration feature.
    pub step_minutes: u64,
    pub policy_mode: PolicyMode,
    /// Disable the PySR calibration stage.
    pub enable_calibration: bool,
    /// Disable the PySR fusion stage.
    pub enable_fusion: bool,
    pub deterministic: DeterministicPolicyConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            risk_multiplier: 1.0,
            min_spot_ratio: 0.0,
            max_spot_ratio: 1.0,
            target_spot_ratio: None,
            step_minutes: 5,
            policy_mode: PolicyMode::Rl,
            enable_calibration: true,
            enable_fusion: true,
            deterministic: DeterministicPolicyConfig::default(),
        }
    }
}

/// Thresholds for the rule-based policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeterministicPolicyConfig {
    /// composite_risk at or above this forces EMERGENCY_EXIT.
    pub emergency_threshold: f64,
    /// runtime_score alone at or above this forces EMERGENCY_EXIT.
    pub runtime_emergency_threshold: f64,
    pub high_threshold: f64,
    pub medium_threshold: f64,
    /// (od - spot) / od must reach this for an economic increase.
    pub min_savings_ratio: f64,
    /// migration_cost / (od - spot) must stay under this many hours.
    pub max_payback_hours: f64,
    /// Tighter economic thresholds used when a feature is out of
    /// distribution and the mode is conservative.
    pub ood_min_savings_ratio: f64,
    pub ood_max_payback_hours: f64,
    /// Handle OOD states conservatively instead of holding outright.
    pub ood_mode_conservative: bool,
    pub ood_buckets: OodBuckets,
}

impl Default for DeterministicPolicyConfig {
    fn default() -> Self {
        Self {
            emergency_threshold: 0.9,
            runtime_emergency_threshold: 0.8,
            high_threshold: 0.7,
            medium_threshold: 0.5,
            min_savings_ratio: 0.3,
            max_payback_hours: 24.0,
            ood_min_savings_ratio: 0.5,
            ood_max_payback_hours: 12.0,
            ood_mode_conservative: true,
            ood_buckets: OodBuckets::default(),
        }
    }
}

/// Training-distribution boundaries per workload feature. A value outside
/// its bucket flags the whole state as out of distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OodBuckets {
    pub startup_time_secs: (f64, f64),
    pub outage_penalty_hours: (f64, f64),
    pub priority_score: (f64, f64),
    pub cluster_utilization: (f64, f64),
}

impl Default for OodBuckets {
    fn default() -> Self {
        Self {
            startup_time_secs: (0.0, 900.0),
            outage_penalty_hours: (0.0, 96.0),
            priority_score: (0.0, 1.0),
            cluster_utilization: (0.05, 0.98),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_config_defaults() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.min_spot_ratio, 0.0);
        assert_eq!(cfg.max_spot_ratio, 1.0);
        assert_eq!(cfg.policy_mode, PolicyMode::Rl);
    }

    #[test]
    fn test_partial_runtime_json_uses_defaults() {
        let cfg: RuntimeConfig =
            serde_json::from_str(r#"{"risk_multiplier": 1.5, "policy_mode": "deterministic"}"#)
                .unwrap();
        assert_eq!(cfg.risk_multiplier, 1.5);
        assert_eq!(cfg.policy_mode, PolicyMode::Deterministic);
        assert_eq!(cfg.step_minutes, 5);
    }

    #[test]
    fn test_source_mode_lowercase() {
        let mode: SourceMode = serde_json::from_str(r#""synthetic""#).unwrap();
        assert_eq!(mode, SourceMode::Synthetic);
    }
}
