//! Configuration loading, validation, and hot reload.
//!
//! The startup config is validated once and any violation is fatal. The
//! runtime config is watched by mtime and re-read at each tick; a file that
//! fails to parse keeps the previous values in effect.

pub mod types;

pub use types::{
    AgentConfig, AsgConfig, DeterministicPolicyConfig, DrainConfig, ForecastConfig,
    KarpenterConfig, OodBuckets, PolicyMode, RuntimeConfig, SourceMode, TelemetryConfig,
};

use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// Errors from config load or validation. All fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Synthetic {0} mode is not allowed outside dry-run")]
    SyntheticRefused(&'static str),
}

/// Load and validate the startup config. A missing path yields defaults so a
/// bare agent can run against an in-cluster Prometheus.
pub fn load_agent_config(path: Option<&Path>) -> Result<AgentConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = fs::read_to_string(p).map_err(|e| ConfigError::Io {
                path: p.to_path_buf(),
                source: e,
            })?;
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                path: p.to_path_buf(),
                source: e,
            })?
        }
        None => AgentConfig::default(),
    };

    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

/// Environment variables override the file, matching the deployment contract.
fn apply_env_overrides(config: &mut AgentConfig) {
    if let Ok(mode) = std::env::var("METRICS_MODE") {
        if let Ok(parsed) = serde_json::from_value(serde_json::Value::String(mode)) {
            config.telemetry.metrics_mode = parsed;
        }
    }
    if let Ok(mode) = std::env::var("PRICE_MODE") {
        if let Ok(parsed) = serde_json::from_value(serde_json::Value::String(mode)) {
            config.telemetry.price_mode = parsed;
        }
    }
}

fn validate(config: &AgentConfig) -> Result<(), ConfigError> {
    if config.reconcile_interval_secs < 10 {
        return Err(ConfigError::Invalid(format!(
            "reconcile_interval_secs must be >= 10, got {}",
            config.reconcile_interval_secs
        )));
    }
    if !(0.0..=1.0).contains(&config.max_drain_ratio) {
        return Err(ConfigError::Invalid(format!(
            "max_drain_ratio must be in [0, 1], got {}",
            config.max_drain_ratio
        )));
    }
    if !(0.0..=1.0).contains(&config.risk_threshold) {
        return Err(ConfigError::Invalid(format!(
            "risk_threshold must be in [0, 1], got {}",
            config.risk_threshold
        )));
    }
    if config.forecast.history_steps == 0 {
        return Err(ConfigError::Invalid(
            "forecast.history_steps must be positive".to_string(),
        ));
    }
    // Synthetic prices are never acceptable; synthetic metrics only in dry-run.
    if config.telemetry.price_mode == SourceMode::Synthetic {
        return Err(ConfigError::SyntheticRefused("price"));
    }
    if config.telemetry.metrics_mode == SourceMode::Synthetic && !config.dry_run {
        return Err(ConfigError::SyntheticRefused("metrics"));
    }
    Ok(())
}

/// Validate a runtime config. Called on every reload; failures keep the old
/// values instead of aborting.
pub fn validate_runtime(config: &RuntimeConfig) -> Result<(), ConfigError> {
    if config.min_spot_ratio > config.max_spot_ratio {
        return Err(ConfigError::Invalid(format!(
            "min_spot_ratio {} > max_spot_ratio {}",
            config.min_spot_ratio, config.max_spot_ratio
        )));
    }
    if !(0.0..=1.0).contains(&config.min_spot_ratio)
        || !(0.0..=1.0).contains(&config.max_spot_ratio)
    {
        return Err(ConfigError::Invalid(
            "spot ratio bounds must be in [0, 1]".to_string(),
        ));
    }
    if config.step_minutes == 0 {
        return Err(ConfigError::Invalid("step_minutes must be positive".to_string()));
    }
    Ok(())
}

/// Shared handle over the hot-reloaded runtime config.
pub struct RuntimeConfigHandle {
    path: PathBuf,
    inner: Mutex<RuntimeState>,
}

struct RuntimeState {
    config: Arc<RuntimeConfig>,
    last_mtime: Option<SystemTime>,
}

impl RuntimeConfigHandle {
    /// Load the initial runtime config. A missing file starts from defaults;
    /// an unparseable one is fatal because there is nothing to fall back to.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let (config, mtime) = match fs::metadata(path) {
            Ok(meta) => {
                let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })?;
                let config: RuntimeConfig =
                    serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                validate_runtime(&config)?;
                (config, meta.modified().ok())
            }
            Err(_) => {
                log::info!(
                    "Runtime config {} not found, starting with defaults",
                    path.display()
                );
                (RuntimeConfig::default(), None)
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(RuntimeState {
                config: Arc::new(config),
                last_mtime: mtime,
            }),
        })
    }

    /// Current config, re-reading the file when its mtime changed. Broken
    /// content logs a warning and keeps the previous config.
    pub fn current(&self) -> Arc<RuntimeConfig> {
        let mut state = self.inner.lock();

        let mtime = fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        if mtime.is_some() && mtime != state.last_mtime {
            match fs::read_to_string(&self.path)
                .map_err(|e| e.to_string())
                .and_then(|c| serde_json::from_str::<RuntimeConfig>(&c).map_err(|e| e.to_string()))
            {
                Ok(config) => match validate_runtime(&config) {
                    Ok(()) => {
                        log::info!("Runtime config reloaded from {}", self.path.display());
                        state.config = Arc::new(config);
                        state.last_mtime = mtime;
                    }
                    Err(e) => {
                        log::warn!("Runtime config reload rejected: {}", e);
                        state.last_mtime = mtime;
                    }
                },
                Err(e) => {
                    log::warn!(
                        "Failed to reload runtime config {}: {}, keeping previous values",
                        self.path.display(),
                        e
                    );
                    state.last_mtime = mtime;
                }
            }
        }

        Arc::clone(&state.config)
    }
}
