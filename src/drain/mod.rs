//! Node draining: cordon, evict, verify.

pub mod drainer;

pub use drainer::{DrainOutcome, Drainer};

/// Error type for drain operations.
#[derive(Debug, thiserror::Error)]
pub enum DrainError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Drain of {node} blocked by disruption budget on pod {pod}")]
    PdbViolation { node: String, pod: String },
}
