//! Provisioner detection from node labels, and the router that dispatches
//! per-node operations to the right backend manager.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::manager::CapacityManager;
use crate::node;

/// Which system provisioned a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvisionerType {
    Karpenter,
    ClusterAutoscaler,
    ManagedNodegroup,
    Unknown,
}

impl ProvisionerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionerType::Karpenter => "karpenter",
            ProvisionerType::ClusterAutoscaler => "cluster-autoscaler",
            ProvisionerType::ManagedNodegroup => "managed-nodegroup",
            ProvisionerType::Unknown => "unknown",
        }
    }
}

/// Classify a node by its labels. Priority: the explicit override label,
/// then Karpenter markers, then the managed-nodegroup label.
pub fn detect_provisioner(labels: &BTreeMap<String, String>) -> ProvisionerType {
    if let Some(value) = labels.get(node::LABEL_MANAGER_OVERRIDE) {
        match value.as_str() {
            "karpenter" => return ProvisionerType::Karpenter,
            "cluster-autoscaler" => return ProvisionerType::ClusterAutoscaler,
            "managed-nodegroup" => return ProvisionerType::ManagedNodegroup,
            other => {
                log::warn!("Unrecognized manager override '{}', falling through", other);
            }
        }
    }

    let has_nodegroup = labels.contains_key(node::LABEL_EKS_NODEGROUP);
    if labels.contains_key(node::LABEL_KARPENTER_NODEPOOL)
        || (labels.contains_key(node::LABEL_KARPENTER_CAPACITY_TYPE) && !has_nodegroup)
    {
        return ProvisionerType::Karpenter;
    }
    if has_nodegroup {
        return ProvisionerType::ManagedNodegroup;
    }

    ProvisionerType::Unknown
}

/// Maps detected provisioners to backend managers. CA and MNG fail open to
/// each other in either direction; Unknown maps to nothing and the
/// operation is skipped.
pub struct CapacityRouter {
    karpenter: Option<Arc<dyn CapacityManager>>,
    asg: Option<Arc<dyn CapacityManager>>,
}

impl CapacityRouter {
    pub fn new(
        karpenter: Option<Arc<dyn CapacityManager>>,
        asg: Option<Arc<dyn CapacityManager>>,
    ) -> Self {
        Self { karpenter, asg }
    }

    /// The manager responsible for a provisioner, if any.
    pub fn manager_for(&self, provisioner: ProvisionerType) -> Option<Arc<dyn CapacityManager>> {
        match provisioner {
            ProvisionerType::Karpenter => self.karpenter.clone(),
            // CA and MNG share ASG mechanics, so one manager serves both and
            // a misdetection between them still lands on working machinery.
            ProvisionerType::ClusterAutoscaler | ProvisionerType::ManagedNodegroup => {
                self.asg.clone()
            }
            ProvisionerType::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::manager::{SwapDirection, SwapResult};
    use crate::capacity::CapacityError;
    use crate::node::NodeInfo;
    use async_trait::async_trait;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_override_label_wins() {
        let l = labels(&[
            (node::LABEL_MANAGER_OVERRIDE, "cluster-autoscaler"),
            (node::LABEL_KARPENTER_NODEPOOL, "general"),
        ]);
        assert_eq!(detect_provisioner(&l), ProvisionerType::ClusterAutoscaler);
    }

    #[test]
    fn test_karpenter_by_nodepool() {
        let l = labels(&[(node::LABEL_KARPENTER_NODEPOOL, "general")]);
        assert_eq!(detect_provisioner(&l), ProvisionerType::Karpenter);
    }

    #[test]
    fn test_capacity_type_without_nodegroup_is_karpenter() {
        let l = labels(&[(node::LABEL_KARPENTER_CAPACITY_TYPE, "spot")]);
        assert_eq!(detect_provisioner(&l), ProvisionerType::Karpenter);
    }

    #[test]
    fn test_capacity_type_with_nodegroup_is_mng() {
        let l = labels(&[
            (node::LABEL_KARPENTER_CAPACITY_TYPE, "spot"),
            (node::LABEL_EKS_NODEGROUP, "ng-1"),
        ]);
        assert_eq!(detect_provisioner(&l), ProvisionerType::ManagedNodegroup);
    }

    #[test]
    fn test_unlabelled_is_unknown() {
        assert_eq!(detect_provisioner(&labels(&[])), ProvisionerType::Unknown);
    }

    #[test]
    fn test_bad_override_falls_through() {
        let l = labels(&[
            (node::LABEL_MANAGER_OVERRIDE, "something-else"),
            (node::LABEL_EKS_NODEGROUP, "ng-1"),
        ]);
        assert_eq!(detect_provisioner(&l), ProvisionerType::ManagedNodegroup);
    }

    struct StubManager(ProvisionerType);

    #[async_trait]
    impl CapacityManager for StubManager {
        fn provisioner_type(&self) -> ProvisionerType {
            self.0
        }
        async fn is_available(&self) -> bool {
            true
        }
        async fn prepare_swap(
            &self,
            _pool: &str,
            _direction: SwapDirection,
        ) -> Result<SwapResult, CapacityError> {
            Ok(SwapResult::default())
        }
        async fn post_drain_cleanup(&self, _node: &NodeInfo) -> Result<(), CapacityError> {
            Ok(())
        }
    }

    #[test]
    fn test_router_ca_mng_fail_open() {
        let asg: Arc<dyn CapacityManager> =
            Arc::new(StubManager(ProvisionerType::ClusterAutoscaler));
        let router = CapacityRouter::new(None, Some(asg));

        // Both ASG-backed provisioners land on the same manager.
        assert!(router
            .manager_for(ProvisionerType::ClusterAutoscaler)
            .is_some());
        assert!(router
            .manager_for(ProvisionerType::ManagedNodegroup)
            .is_some());
        assert!(router.manager_for(ProvisionerType::Karpenter).is_none());
        assert!(router.manager_for(ProvisionerType::Unknown).is_none());
    }
}
