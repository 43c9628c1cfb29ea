//! Node label and annotation contract.
//!
//! Everything the agent knows about a node it learns from well-known labels,
//! annotations, and taints. This module owns the label names and turns a raw
//! `Node` object into the [`NodeInfo`] the rest of the pipeline consumes.
//! Only managed, non-control-plane, non-fake nodes may ever be mutated.

use k8s_openapi::api::core::v1::Node;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// Provisioner detection labels.
pub const LABEL_KARPENTER_NODEPOOL: &str = "karpenter.sh/nodepool";
pub const LABEL_KARPENTER_CAPACITY_TYPE: &str = "karpenter.sh/capacity-type";
pub const LABEL_EKS_NODEGROUP: &str = "eks.amazonaws.com/nodegroup";
pub const LABEL_MANAGER_OVERRIDE: &str = "spotvortex.io/manager";

// Agent opt-in and grouping labels.
pub const LABEL_POOL: &str = "spotvortex.io/pool";
pub const LABEL_MANAGED: &str = "spotvortex.io/managed";

// Topology labels.
pub const LABEL_ZONE: &str = "topology.kubernetes.io/zone";
pub const LABEL_INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";

// Protected roles.
pub const LABEL_CONTROL_PLANE: &str = "node-role.kubernetes.io/control-plane";
pub const LABEL_MASTER: &str = "node-role.kubernetes.io/master";

// Taints.
pub const TAINT_FAKE: &str = "spotvortex.io/fake";
pub const TAINT_DRAINING: &str = "spotvortex.io/draining";
pub const TAINT_PREFER_SPOT: &str = "spotvortex.io/prefer-spot";

// Labels and annotations the agent writes back.
pub const LABEL_CAPACITY_SCORE: &str = "spotvortex.io/capacity-score";
pub const LABEL_MARKET_STATUS: &str = "spotvortex.io/market-status";
pub const LABEL_RISK: &str = "spotvortex.io/risk";
pub const ANNOTATION_RISK_REASON: &str = "spotvortex.io/risk-reason";

/// Pool identity used for forecasting, ratio tracking, and price history.
///
/// Three encodings exist; within a tick the same key must be used end-to-end:
/// - simple: `"<instance_type>:<zone>"`
/// - extended: `"<workload_pool>:<instance_type>:<zone>"`
/// - pool-level: `"<workload_pool>:<zone>"` (instance-type agnostic)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolId(String);

impl PoolId {
    pub fn simple(instance_type: &str, zone: &str) -> Self {
        PoolId(format!("{}:{}", instance_type, zone))
    }

    pub fn extended(workload_pool: &str, instance_type: &str, zone: &str) -> Self {
        PoolId(format!("{}:{}:{}", workload_pool, instance_type, zone))
    }

    pub fn pool_level(workload_pool: &str, zone: &str) -> Self {
        PoolId(format!("{}:{}", workload_pool, zone))
    }

    /// Extract the workload pool from an extended key (`"a:b:c"` -> `"a"`).
    pub fn parse_extended(key: &str) -> Option<&str> {
        let mut parts = key.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(pool), Some(_), Some(_)) => Some(pool),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the agent derives from a node's metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub zone: String,
    pub instance_type: String,
    /// From `karpenter.sh/capacity-type` or the cloud capacity label.
    pub is_spot: bool,
    /// Workload pool grouping key (`spotvortex.io/pool`), if labelled.
    pub workload_pool: Option<String>,
    /// Explicit mutation opt-in (`spotvortex.io/managed = "true"`).
    pub managed: bool,
    /// Carries a control-plane or master role label.
    pub control_plane: bool,
    /// Carries the simulation-fixture taint.
    pub fake: bool,
    /// Cloud provider id (e.g. `aws:///us-east-1a/i-0abc123`), if set.
    pub provider_id: Option<String>,
}

impl NodeInfo {
    /// Parse a raw node object. Missing topology labels fall back to
    /// `"unknown"` so pool keys stay well-formed.
    pub fn from_node(node: &Node) -> Self {
        let empty = BTreeMap::new();
        let labels = node.metadata.labels.as_ref().unwrap_or(&empty);
        let name = node.metadata.name.clone().unwrap_or_default();

        let is_spot = labels
            .get(LABEL_KARPENTER_CAPACITY_TYPE)
            .map(|v| v == "spot")
            .unwrap_or(false);

        let fake = node
            .spec
            .as_ref()
            .and_then(|s| s.taints.as_ref())
            .map(|taints| taints.iter().any(|t| t.key == TAINT_FAKE))
            .unwrap_or(false);

        NodeInfo {
            name,
            zone: labels
                .get(LABEL_ZONE)
                .cloned()
                .unwrap_or_else(|| "unknown".to_string()),
            instance_type: labels
                .get(LABEL_INSTANCE_TYPE)
                .cloned()
                .unwrap_or_else(|| "unknown".to_string()),
            is_spot,
            workload_pool: labels.get(LABEL_POOL).cloned(),
            managed: labels.get(LABEL_MANAGED).map(|v| v == "true").unwrap_or(false),
            control_plane: labels.contains_key(LABEL_CONTROL_PLANE)
                || labels.contains_key(LABEL_MASTER),
            fake,
            provider_id: node.spec.as_ref().and_then(|s| s.provider_id.clone()),
        }
    }

    /// Whether the agent is allowed to mutate this node at all.
    pub fn mutable(&self) -> bool {
        self.managed && !self.control_plane && !self.fake
    }

    /// Pool key for this node. Extended form when the node carries a
    /// workload-pool label and extended mode is configured.
    pub fn pool_id(&self, extended: bool) -> PoolId {
        match (&self.workload_pool, extended) {
            (Some(pool), true) => PoolId::extended(pool, &self.instance_type, &self.zone),
            _ => PoolId::simple(&self.instance_type, &self.zone),
        }
    }

    /// Workload pool name, defaulting to `"default"` for unlabelled nodes.
    pub fn workload_pool_or_default(&self) -> &str {
        self.workload_pool.as_deref().unwrap_or("default")
    }

    /// Instance id parsed from the provider id
    /// (`aws:///us-east-1a/i-0abc123` -> `i-0abc123`).
    pub fn instance_id(&self) -> Option<&str> {
        self.provider_id
            .as_deref()
            .and_then(|p| p.rsplit('/').next())
            .filter(|id| !id.is_empty())
    }

    /// Instance family, the token before the first `.`
    /// (`c6i.2xlarge` -> `c6i`).
    pub fn instance_family(&self) -> &str {
        self.instance_type
            .split('.')
            .next()
            .unwrap_or(&self.instance_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeSpec, Taint};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn node_with_labels(labels: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("node-a".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_pool_id_forms() {
        assert_eq!(PoolId::simple("c6i.2xlarge", "us-east-1a").as_str(), "c6i.2xlarge:us-east-1a");
        assert_eq!(
            PoolId::extended("api", "c6i.2xlarge", "us-east-1a").as_str(),
            "api:c6i.2xlarge:us-east-1a"
        );
        assert_eq!(PoolId::pool_level("api", "us-east-1a").as_str(), "api:us-east-1a");
    }

    #[test]
    fn test_parse_extended_round_trip() {
        assert_eq!(PoolId::parse_extended("a:b:c"), Some("a"));
        assert_eq!(PoolId::parse_extended("a:b"), None);
    }

    #[test]
    fn test_from_node_defaults_unknown() {
        let info = NodeInfo::from_node(&node_with_labels(&[]));
        assert_eq!(info.zone, "unknown");
        assert_eq!(info.instance_type, "unknown");
        assert!(!info.is_spot);
        assert!(!info.managed);
    }

    #[test]
    fn test_mutable_requires_opt_in() {
        let info = NodeInfo::from_node(&node_with_labels(&[(LABEL_MANAGED, "true")]));
        assert!(info.mutable());

        let info = NodeInfo::from_node(&node_with_labels(&[
            (LABEL_MANAGED, "true"),
            (LABEL_CONTROL_PLANE, ""),
        ]));
        assert!(!info.mutable());

        let info = NodeInfo::from_node(&node_with_labels(&[(LABEL_MANAGED, "false")]));
        assert!(!info.mutable());
    }

    #[test]
    fn test_fake_taint_blocks_mutation() {
        let mut node = node_with_labels(&[(LABEL_MANAGED, "true")]);
        node.spec = Some(NodeSpec {
            taints: Some(vec![Taint {
                key: TAINT_FAKE.to_string(),
                effect: "NoSchedule".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        let info = NodeInfo::from_node(&node);
        assert!(info.fake);
        assert!(!info.mutable());
    }

    #[test]
    fn test_instance_id_from_provider() {
        let mut node = node_with_labels(&[]);
        node.spec = Some(NodeSpec {
            provider_id: Some("aws:///us-east-1a/i-0abc123".to_string()),
            ..Default::default()
        });
        let info = NodeInfo::from_node(&node);
        assert_eq!(info.instance_id(), Some("i-0abc123"));
    }

    #[test]
    fn test_instance_family() {
        let info = NodeInfo::from_node(&node_with_labels(&[(LABEL_INSTANCE_TYPE, "c6i.2xlarge")]));
        assert_eq!(info.instance_family(), "c6i");
    }
}
