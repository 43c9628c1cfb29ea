//! Twin-ASG backend for Cluster Autoscaler and Managed Nodegroup pools.
//!
//! Each workload pool is modelled as a sibling pair of scaling groups,
//! `<pool>-spot-asg` and `<pool>-od-asg`, discovered by tag. A swap scales
//! the target sibling up by one, waits for the cluster to report a Ready
//! replacement node, and only then reports ready — callers may assume the
//! capacity exists. Per-pool state machine:
//! `Idle -> Scaling -> WaitingReady -> Ready | TimedOut | QuotaExceeded`.
//! Errors are surfaced, not retried here; the controller retries next tick.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use super::detector::ProvisionerType;
use super::manager::{CapacityManager, SwapDirection, SwapResult};
use super::CapacityError;
use crate::config::AsgConfig;
use crate::node::{self, NodeInfo};

/// Snapshot of one scaling group, copied out of the client's lock.
#[derive(Debug, Clone)]
pub struct AsgInfo {
    pub id: String,
    /// Workload pool from the pool tag.
    pub pool: String,
    /// `"spot"` or `"on-demand"`.
    pub capacity_type: String,
    pub desired: i32,
    pub current: i32,
    pub max: i32,
}

/// Per-pool swap progress, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapPhase {
    Idle,
    Scaling,
    WaitingReady,
    Ready,
    TimedOut,
    QuotaExceeded,
}

impl SwapPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapPhase::Idle => "idle",
            SwapPhase::Scaling => "scaling",
            SwapPhase::WaitingReady => "waiting_ready",
            SwapPhase::Ready => "ready",
            SwapPhase::TimedOut => "timed_out",
            SwapPhase::QuotaExceeded => "quota_exceeded",
        }
    }
}

/// Cloud-side scaling group operations.
#[async_trait]
pub trait AsgApi: Send + Sync {
    /// All groups carrying `pool_tag_key = pool`.
    async fn describe_by_pool(&self, pool: &str) -> Result<Vec<AsgInfo>, CapacityError>;
    async fn set_desired_capacity(&self, asg_id: &str, desired: i32) -> Result<(), CapacityError>;
    async fn terminate_instance(
        &self,
        instance_id: &str,
        decrement_desired: bool,
    ) -> Result<(), CapacityError>;
}

/// AWS implementation over the autoscaling SDK.
pub struct AwsAsgApi {
    client: aws_sdk_autoscaling::Client,
    pool_tag_key: String,
    capacity_type_tag_key: String,
}

impl AwsAsgApi {
    pub fn new(client: aws_sdk_autoscaling::Client, config: &AsgConfig) -> Self {
        Self {
            client,
            pool_tag_key: config.pool_tag_key.clone(),
            capacity_type_tag_key: config.capacity_type_tag_key.clone(),
        }
    }
}

#[async_trait]
impl AsgApi for AwsAsgApi {
    async fn describe_by_pool(&self, pool: &str) -> Result<Vec<AsgInfo>, CapacityError> {
        let filter = aws_sdk_autoscaling::types::Filter::builder()
            .name(format!("tag:{}", self.pool_tag_key))
            .values(pool)
            .build();

        let response = self
            .client
            .describe_auto_scaling_groups()
            .filters(filter)
            .send()
            .await
            .map_err(|e| CapacityError::Cloud(e.to_string()))?;

        let groups = response
            .auto_scaling_groups()
            .iter()
            .filter_map(|group| {
                let id = group.auto_scaling_group_name()?.to_string();
                let capacity_type = group
                    .tags()
                    .iter()
                    .find(|t| t.key() == Some(self.capacity_type_tag_key.as_str()))
                    .and_then(|t| t.value())
                    .unwrap_or("on-demand")
                    .to_string();
                Some(AsgInfo {
                    id,
                    pool: pool.to_string(),
                    capacity_type,
                    desired: group.desired_capacity().unwrap_or(0),
                    current: group.instances().len() as i32,
                    max: group.max_size().unwrap_or(0),
                })
            })
            .collect();

        Ok(groups)
    }

    async fn set_desired_capacity(&self, asg_id: &str, desired: i32) -> Result<(), CapacityError> {
        self.client
            .set_desired_capacity()
            .auto_scaling_group_name(asg_id)
            .desired_capacity(desired)
            .send()
            .await
            .map_err(|e| CapacityError::Cloud(e.to_string()))?;
        Ok(())
    }

    async fn terminate_instance(
        &self,
        instance_id: &str,
        decrement_desired: bool,
    ) -> Result<(), CapacityError> {
        self.client
            .terminate_instance_in_auto_scaling_group()
            .instance_id(instance_id)
            .should_decrement_desired_capacity(decrement_desired)
            .send()
            .await
            .map_err(|e| CapacityError::Cloud(e.to_string()))?;
        Ok(())
    }
}

/// A node as seen while waiting for replacement capacity.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub name: String,
    pub workload_pool: Option<String>,
    pub is_spot: bool,
    pub ready: bool,
    pub created_at: Option<DateTime<Utc>>,
}

/// Cluster view used by the readiness wait. Factored out so the state
/// machine tests without a cluster.
#[async_trait]
pub trait NodeWatcher: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<NodeSnapshot>, CapacityError>;
}

/// Live watcher over the Kubernetes API.
pub struct KubeNodeWatcher {
    client: kube::Client,
}

impl KubeNodeWatcher {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeWatcher for KubeNodeWatcher {
    async fn list_nodes(&self) -> Result<Vec<NodeSnapshot>, CapacityError> {
        use k8s_openapi::api::core::v1::Node;
        use kube::api::{Api, ListParams};

        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes
            .list(&ListParams::default())
            .await
            .map_err(CapacityError::Kube)?;

        Ok(list
            .items
            .iter()
            .map(|n| {
                let info = node::NodeInfo::from_node(n);
                let ready = n
                    .status
                    .as_ref()
                    .and_then(|s| s.conditions.as_ref())
                    .map(|conds| {
                        conds
                            .iter()
                            .any(|c| c.type_ == "Ready" && c.status == "True")
                    })
                    .unwrap_or(false);
                NodeSnapshot {
                    name: info.name,
                    workload_pool: info.workload_pool,
                    is_spot: info.is_spot,
                    ready,
                    created_at: n.metadata.creation_timestamp.as_ref().map(|t| t.0),
                }
            })
            .collect())
    }
}

/// Twin-ASG capacity manager.
pub struct AsgManager {
    api: Box<dyn AsgApi>,
    watcher: Box<dyn NodeWatcher>,
    config: AsgConfig,
    dry_run: bool,
    phases: Mutex<HashMap<String, SwapPhase>>,
}

impl AsgManager {
    pub fn new(
        api: Box<dyn AsgApi>,
        watcher: Box<dyn NodeWatcher>,
        config: AsgConfig,
        dry_run: bool,
    ) -> Self {
        Self {
            api,
            watcher,
            config,
            dry_run,
            phases: Mutex::new(HashMap::new()),
        }
    }

    pub fn phase(&self, pool: &str) -> SwapPhase {
        self.phases
            .lock()
            .get(pool)
            .copied()
            .unwrap_or(SwapPhase::Idle)
    }

    fn set_phase(&self, pool: &str, phase: SwapPhase) {
        self.phases.lock().insert(pool.to_string(), phase);
    }

    /// Find the spot/od sibling pair for a pool; both must exist.
    async fn discover_twins(&self, pool: &str) -> Result<(AsgInfo, AsgInfo), CapacityError> {
        let groups = self.api.describe_by_pool(pool).await?;
        let spot = groups.iter().find(|g| g.capacity_type == "spot").cloned();
        let od = groups
            .iter()
            .find(|g| g.capacity_type == "on-demand")
            .cloned();
        match (spot, od) {
            (Some(spot), Some(od)) => Ok((spot, od)),
            (None, _) => Err(CapacityError::TwinIncomplete {
                pool: pool.to_string(),
                missing: "spot",
            }),
            (_, None) => Err(CapacityError::TwinIncomplete {
                pool: pool.to_string(),
                missing: "on-demand",
            }),
        }
    }

    /// Nodes that would count as the replacement for this swap: same pool,
    /// target capacity type, and Ready.
    async fn matching_ready_nodes(
        &self,
        pool: &str,
        want_spot: bool,
    ) -> Result<HashSet<String>, CapacityError> {
        Ok(self
            .watcher
            .list_nodes()
            .await?
            .into_iter()
            .filter(|n| {
                n.ready && n.is_spot == want_spot && n.workload_pool.as_deref() == Some(pool)
            })
            .map(|n| n.name)
            .collect())
    }

    /// Poll until a Ready node appears that was not in `before`. The
    /// name-set comparison makes the match deterministic regardless of
    /// timestamp skew between the cloud and the API server.
    async fn wait_for_replacement(
        &self,
        pool: &str,
        want_spot: bool,
        before: &HashSet<String>,
    ) -> Result<String, CapacityError> {
        let timeout = Duration::from_secs(self.config.node_ready_timeout_secs);
        let interval = Duration::from_secs(self.config.poll_interval_secs.max(1));
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let now_ready = self.matching_ready_nodes(pool, want_spot).await?;
            if let Some(new_node) = now_ready.difference(before).next() {
                return Ok(new_node.clone());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CapacityError::NodeReadyTimeout(pool.to_string()));
            }
            tokio::time::sleep(interval).await;
        }
    }
}

#[async_trait]
impl CapacityManager for AsgManager {
    fn provisioner_type(&self) -> ProvisionerType {
        ProvisionerType::ClusterAutoscaler
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn prepare_swap(
        &self,
        workload_pool: &str,
        direction: SwapDirection,
    ) -> Result<SwapResult, CapacityError> {
        let (spot, od) = self.discover_twins(workload_pool).await?;
        let (source, target) = match direction {
            SwapDirection::ToOnDemand => (spot, od),
            SwapDirection::ToSpot => (od, spot),
        };
        let want_spot = target.capacity_type == "spot";

        if self.dry_run {
            log::info!(
                "[dry-run] would scale {} from {} to {} (source {} untouched)",
                target.id,
                target.desired,
                target.desired + 1,
                source.id
            );
            return Ok(SwapResult {
                ready: true,
                replacement_node: None,
            });
        }

        let new_desired = target.desired + 1;
        if new_desired > target.max {
            self.set_phase(workload_pool, SwapPhase::QuotaExceeded);
            return Err(CapacityError::QuotaExceeded {
                asg: target.id,
                max: target.max,
            });
        }

        // Snapshot the matching nodes before scaling so the replacement is
        // identified by set difference, not by timestamps.
        let before = self.matching_ready_nodes(workload_pool, want_spot).await?;

        self.set_phase(workload_pool, SwapPhase::Scaling);
        self.api.set_desired_capacity(&target.id, new_desired).await?;
        log::info!(
            "Scaled {} to desired={} for pool {} swap {}",
            target.id,
            new_desired,
            workload_pool,
            direction.as_str()
        );

        self.set_phase(workload_pool, SwapPhase::WaitingReady);
        match self
            .wait_for_replacement(workload_pool, want_spot, &before)
            .await
        {
            Ok(replacement) => {
                self.set_phase(workload_pool, SwapPhase::Ready);
                log::info!("Replacement node {} ready in pool {}", replacement, workload_pool);
                Ok(SwapResult {
                    ready: true,
                    replacement_node: Some(replacement),
                })
            }
            Err(e @ CapacityError::NodeReadyTimeout(_)) => {
                self.set_phase(workload_pool, SwapPhase::TimedOut);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Terminate the drained node's instance and shrink its group.
    async fn post_drain_cleanup(&self, node: &NodeInfo) -> Result<(), CapacityError> {
        let instance_id = node
            .instance_id()
            .ok_or_else(|| CapacityError::NoInstanceId(node.name.clone()))?;

        if self.dry_run {
            log::info!("[dry-run] would terminate instance {} with decrement", instance_id);
            return Ok(());
        }

        self.api.terminate_instance(instance_id, true).await?;
        log::info!("Terminated instance {} for node {}", instance_id, node.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct FakeAsgState {
        groups: Vec<AsgInfo>,
        terminated: Vec<(String, bool)>,
    }

    #[derive(Clone, Default)]
    struct FakeAsgApi {
        state: Arc<PlMutex<FakeAsgState>>,
    }

    impl FakeAsgApi {
        fn with_twins(pool: &str, spot_desired: i32, od_desired: i32, max: i32) -> Self {
            let api = FakeAsgApi::default();
            api.state.lock().groups = vec![
                AsgInfo {
                    id: format!("{}-spot-asg", pool),
                    pool: pool.to_string(),
                    capacity_type: "spot".to_string(),
                    desired: spot_desired,
                    current: spot_desired,
                    max,
                },
                AsgInfo {
                    id: format!("{}-od-asg", pool),
                    pool: pool.to_string(),
                    capacity_type: "on-demand".to_string(),
                    desired: od_desired,
                    current: od_desired,
                    max,
                },
            ];
            api
        }

        fn desired(&self, id: &str) -> i32 {
            self.state
                .lock()
                .groups
                .iter()
                .find(|g| g.id == id)
                .map(|g| g.desired)
                .unwrap()
        }
    }

    #[async_trait]
    impl AsgApi for FakeAsgApi {
        async fn describe_by_pool(&self, pool: &str) -> Result<Vec<AsgInfo>, CapacityError> {
            Ok(self
                .state
                .lock()
                .groups
                .iter()
                .filter(|g| g.pool == pool)
                .cloned()
                .collect())
        }

        async fn set_desired_capacity(
            &self,
            asg_id: &str,
            desired: i32,
        ) -> Result<(), CapacityError> {
            let mut state = self.state.lock();
            let group = state
                .groups
                .iter_mut()
                .find(|g| g.id == asg_id)
                .ok_or_else(|| CapacityError::Cloud(format!("no such group {}", asg_id)))?;
            group.desired = desired;
            Ok(())
        }

        async fn terminate_instance(
            &self,
            instance_id: &str,
            decrement_desired: bool,
        ) -> Result<(), CapacityError> {
            self.state
                .lock()
                .terminated
                .push((instance_id.to_string(), decrement_desired));
            Ok(())
        }
    }

    /// Watcher whose node list grows once the fake ASG has been scaled.
    struct FakeWatcher {
        api: FakeAsgApi,
        pool: String,
    }

    #[async_trait]
    impl NodeWatcher for FakeWatcher {
        async fn list_nodes(&self) -> Result<Vec<NodeSnapshot>, CapacityError> {
            let state = self.api.state.lock();
            let mut nodes = Vec::new();
            for group in &state.groups {
                for i in 0..group.desired {
                    nodes.push(NodeSnapshot {
                        name: format!("{}-node-{}", group.id, i),
                        workload_pool: Some(self.pool.clone()),
                        is_spot: group.capacity_type == "spot",
                        ready: true,
                        created_at: None,
                    });
                }
            }
            Ok(nodes)
        }
    }

    fn test_config() -> AsgConfig {
        AsgConfig {
            node_ready_timeout_secs: 2,
            poll_interval_secs: 1,
            ..Default::default()
        }
    }

    fn manager(api: FakeAsgApi, pool: &str) -> AsgManager {
        let watcher = FakeWatcher {
            api: api.clone(),
            pool: pool.to_string(),
        };
        AsgManager::new(Box::new(api), Box::new(watcher), test_config(), false)
    }

    #[tokio::test]
    async fn test_swap_to_od_scales_target_only() {
        // Twins at spot=3, od=1, max=6; swap to on-demand leaves spot
        // at 3, moves od to 2, and reports ready with a replacement.
        let api = FakeAsgApi::with_twins("api-pool", 3, 1, 6);
        let m = manager(api.clone(), "api-pool");

        let result = m
            .prepare_swap("api-pool", SwapDirection::ToOnDemand)
            .await
            .unwrap();

        assert!(result.ready);
        assert!(result.replacement_node.is_some());
        assert_eq!(api.desired("api-pool-od-asg"), 2);
        assert_eq!(api.desired("api-pool-spot-asg"), 3);
        assert_eq!(m.phase("api-pool"), SwapPhase::Ready);
    }

    #[tokio::test]
    async fn test_quota_exceeded_at_max() {
        let api = FakeAsgApi::with_twins("api-pool", 3, 6, 6);
        let m = manager(api.clone(), "api-pool");

        let err = m
            .prepare_swap("api-pool", SwapDirection::ToOnDemand)
            .await
            .unwrap_err();
        assert!(matches!(err, CapacityError::QuotaExceeded { .. }));
        assert_eq!(api.desired("api-pool-od-asg"), 6);
        assert_eq!(m.phase("api-pool"), SwapPhase::QuotaExceeded);
    }

    #[tokio::test]
    async fn test_missing_sibling_fails() {
        let api = FakeAsgApi::default();
        api.state.lock().groups = vec![AsgInfo {
            id: "lonely-spot-asg".to_string(),
            pool: "lonely".to_string(),
            capacity_type: "spot".to_string(),
            desired: 1,
            current: 1,
            max: 3,
        }];
        let m = manager(api, "lonely");

        let err = m
            .prepare_swap("lonely", SwapDirection::ToOnDemand)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CapacityError::TwinIncomplete { missing: "on-demand", .. }
        ));
    }

    #[tokio::test]
    async fn test_timeout_when_no_node_appears() {
        let api = FakeAsgApi::with_twins("api-pool", 3, 1, 6);

        // A watcher that never sees new nodes.
        struct EmptyWatcher;
        #[async_trait]
        impl NodeWatcher for EmptyWatcher {
            async fn list_nodes(&self) -> Result<Vec<NodeSnapshot>, CapacityError> {
                Ok(Vec::new())
            }
        }

        let m = AsgManager::new(
            Box::new(api.clone()),
            Box::new(EmptyWatcher),
            test_config(),
            false,
        );
        let err = m
            .prepare_swap("api-pool", SwapDirection::ToOnDemand)
            .await
            .unwrap_err();
        assert!(matches!(err, CapacityError::NodeReadyTimeout(_)));
        assert_eq!(m.phase("api-pool"), SwapPhase::TimedOut);
        // The scale-up itself happened; the controller retries next tick.
        assert_eq!(api.desired("api-pool-od-asg"), 2);
    }

    #[tokio::test]
    async fn test_post_drain_cleanup_terminates_with_decrement() {
        let api = FakeAsgApi::with_twins("api-pool", 3, 1, 6);
        let m = manager(api.clone(), "api-pool");

        let node = NodeInfo {
            name: "node-1".to_string(),
            zone: "us-east-1a".to_string(),
            instance_type: "c6i.large".to_string(),
            is_spot: true,
            workload_pool: Some("api-pool".to_string()),
            managed: true,
            control_plane: false,
            fake: false,
            provider_id: Some("aws:///us-east-1a/i-0abc123".to_string()),
        };
        m.post_drain_cleanup(&node).await.unwrap();
        assert_eq!(
            api.state.lock().terminated,
            vec![("i-0abc123".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn test_cleanup_without_provider_id_fails() {
        let api = FakeAsgApi::with_twins("api-pool", 3, 1, 6);
        let m = manager(api, "api-pool");
        let node = NodeInfo {
            name: "node-1".to_string(),
            zone: "z".to_string(),
            instance_type: "t".to_string(),
            is_spot: true,
            workload_pool: None,
            managed: true,
            control_plane: false,
            fake: false,
            provider_id: None,
        };
        assert!(matches!(
            m.post_drain_cleanup(&node).await.unwrap_err(),
            CapacityError::NoInstanceId(_)
        ));
    }

    #[tokio::test]
    async fn test_dry_run_scales_nothing() {
        let api = FakeAsgApi::with_twins("api-pool", 3, 1, 6);
        let watcher = FakeWatcher {
            api: api.clone(),
            pool: "api-pool".to_string(),
        };
        let m = AsgManager::new(Box::new(api.clone()), Box::new(watcher), test_config(), true);

        let result = m
            .prepare_swap("api-pool", SwapDirection::ToOnDemand)
            .await
            .unwrap();
        assert!(result.ready);
        assert_eq!(api.desired("api-pool-od-asg"), 1);
    }
}
