//! The capability set every provisioner backend satisfies.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::detector::ProvisionerType;
use super::CapacityError;
use crate::node::NodeInfo;

/// Which way a capacity swap moves a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapDirection {
    /// Replace spot capacity with on-demand.
    ToOnDemand,
    /// Replace on-demand capacity with spot.
    ToSpot,
}

impl SwapDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapDirection::ToOnDemand => "to_on_demand",
            SwapDirection::ToSpot => "to_spot",
        }
    }
}

/// Result of preparing a swap.
#[derive(Debug, Clone, Default)]
pub struct SwapResult {
    /// The backend considers replacement capacity in place (or steering
    /// applied) and a drain may proceed.
    pub ready: bool,
    /// The replacement node, when the backend waited for one.
    pub replacement_node: Option<String>,
}

/// A provisioner backend the router can dispatch node operations to.
#[async_trait]
pub trait CapacityManager: Send + Sync {
    /// Which provisioner this manager drives.
    fn provisioner_type(&self) -> ProvisionerType;

    /// Whether the backend is usable at all right now.
    async fn is_available(&self) -> bool;

    /// Make the provisioner favor `direction` for the workload pool, and for
    /// ASG backends scale replacement capacity and wait for it to be Ready.
    async fn prepare_swap(
        &self,
        workload_pool: &str,
        direction: SwapDirection,
    ) -> Result<SwapResult, CapacityError>;

    /// After a successful drain, release the node's underlying instance.
    async fn post_drain_cleanup(&self, node: &NodeInfo) -> Result<(), CapacityError>;
}
