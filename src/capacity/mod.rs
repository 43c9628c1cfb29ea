//! Capacity provisioner detection, routing, and backend managers.
//!
//! Each provisioner backend satisfies the [`CapacityManager`] capability set;
//! the router owns the mapping from a node's detected provisioner to the
//! manager that can act on it. Cluster Autoscaler and Managed Nodegroup
//! intentionally fail open to each other because their ASG mechanics are
//! identical.

pub mod asg;
pub mod detector;
pub mod karpenter;
pub mod manager;

pub use asg::{AsgApi, AsgInfo, AsgManager, AwsAsgApi, KubeNodeWatcher, NodeWatcher, SwapPhase};
pub use detector::{detect_provisioner, CapacityRouter, ProvisionerType};
pub use karpenter::KarpenterManager;
pub use manager::{CapacityManager, SwapDirection, SwapResult};

/// Error type for capacity operations.
#[derive(Debug, thiserror::Error)]
pub enum CapacityError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("NodePool {0} not found")]
    NodePoolNotFound(String),

    #[error("ASG sibling missing for pool {pool}: {missing}")]
    TwinIncomplete { pool: String, missing: &'static str },

    #[error("ASG {asg} at max capacity {max}")]
    QuotaExceeded { asg: String, max: i32 },

    #[error("Timed out waiting for a ready replacement node in pool {0}")]
    NodeReadyTimeout(String),

    #[error("Cloud API error: {0}")]
    Cloud(String),

    #[error("Node {0} has no resolvable instance id")]
    NoInstanceId(String),

    #[error("Malformed NodePool object: {0}")]
    MalformedNodePool(String),
}
