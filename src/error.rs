//! Error types for the SpotVortex agent
//!
//! Each subsystem defines its own error enum next to its code; this module
//! provides the umbrella error the controller and the binary work with.

use thiserror::Error;

/// Top-level error for agent operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Invalid or unusable configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Model bundle or inference contract violation. Fatal at startup.
    #[error("Model contract error: {0}")]
    Model(#[from] crate::model::ModelError),

    /// Metrics or price telemetry unavailable. The tick is skipped.
    #[error("Telemetry error: {0}")]
    Telemetry(#[from] crate::telemetry::TelemetryError),

    /// Workload feature collection failed. The tick is skipped.
    #[error("Workload collection error: {0}")]
    Workload(#[from] crate::workload::CollectorError),

    /// Provisioner mutation failed.
    #[error("Capacity operation error: {0}")]
    Capacity(#[from] crate::capacity::CapacityError),

    /// Node drain failed.
    #[error("Drain error: {0}")]
    Drain(#[from] crate::drain::DrainError),

    /// Kubernetes API error outside a more specific subsystem.
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
