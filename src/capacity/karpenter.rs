//! Karpenter backend: declarative steering of NodePool custom resources.
//!
//! NodePool is CRD-shaped data that evolves independently of this agent, so
//! everything here goes through the dynamic client and plain JSON paths
//! (`spec.weight`, `spec.template.spec.requirements`) instead of generated
//! bindings. Weight steering is the swap mechanism: pending pods from a
//! drain land on whichever sibling pool carries the higher weight.

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DynamicObject, Patch, PatchParams};
use kube::Client;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::detector::ProvisionerType;
use super::manager::{CapacityManager, SwapDirection, SwapResult};
use super::CapacityError;
use crate::config::KarpenterConfig;
use crate::node::NodeInfo;

pub const CAPACITY_TYPE_REQUIREMENT_KEY: &str = "karpenter.sh/capacity-type";

/// One entry of `spec.disruption.budgets`.
#[derive(Debug, Clone, Deserialize)]
pub struct DisruptionBudget {
    /// `"10"` or `"20%"`.
    pub nodes: String,
    /// Cron window; treated as always-active here.
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub reasons: Option<Vec<String>>,
}

/// Access to NodePool objects. Factored out so the steering logic tests
/// against an in-memory store.
#[async_trait]
pub trait NodePoolClient: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Value>, CapacityError>;
    async fn patch(&self, name: &str, patch: Value) -> Result<(), CapacityError>;
}

/// Dynamic-client implementation against the live cluster.
pub struct KubeNodePoolClient {
    api: Api<DynamicObject>,
}

impl KubeNodePoolClient {
    pub fn new(client: Client) -> Self {
        let resource = ApiResource {
            group: "karpenter.sh".to_string(),
            version: "v1".to_string(),
            api_version: "karpenter.sh/v1".to_string(),
            kind: "NodePool".to_string(),
            plural: "nodepools".to_string(),
        };
        let api = Api::all_with(client, &resource);
        Self { api }
    }
}

#[async_trait]
impl NodePoolClient for KubeNodePoolClient {
    async fn get(&self, name: &str) -> Result<Option<Value>, CapacityError> {
        match self.api.get(name).await {
            Ok(object) => Ok(Some(serde_json::to_value(&object).map_err(|e| {
                CapacityError::MalformedNodePool(format!("{}: {}", name, e))
            })?)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(CapacityError::Kube(e)),
        }
    }

    async fn patch(&self, name: &str, patch: Value) -> Result<(), CapacityError> {
        // Merge patch keeps the agent schema-agnostic; server-side apply
        // would demand ownership of fields other controllers also write.
        let params = PatchParams::default();
        self.api
            .patch(name, &params, &Patch::Merge(patch))
            .await
            .map_err(CapacityError::Kube)?;
        Ok(())
    }
}

/// Karpenter capacity manager.
pub struct KarpenterManager {
    pools: Box<dyn NodePoolClient>,
    config: KarpenterConfig,
    dry_run: bool,
    /// Last successful weight change per workload pool, the cooldown gate.
    last_weight_change: Mutex<HashMap<String, Instant>>,
}

impl KarpenterManager {
    pub fn new(pools: Box<dyn NodePoolClient>, config: KarpenterConfig, dry_run: bool) -> Self {
        Self {
            pools,
            config,
            dry_run,
            last_weight_change: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_client(client: Client, config: KarpenterConfig, dry_run: bool) -> Self {
        Self::new(Box::new(KubeNodePoolClient::new(client)), config, dry_run)
    }

    fn spot_pool_name(workload_pool: &str) -> String {
        format!("{}-spot", workload_pool)
    }

    fn od_pool_name(workload_pool: &str) -> String {
        format!("{}-od", workload_pool)
    }

    /// Current `spec.weight`; 0 means Karpenter's default.
    pub async fn get_weight(&self, nodepool: &str) -> Result<Option<i32>, CapacityError> {
        Ok(self
            .pools
            .get(nodepool)
            .await?
            .as_ref()
            .and_then(read_weight))
    }

    pub async fn set_weight(&self, nodepool: &str, weight: i32) -> Result<(), CapacityError> {
        if self.dry_run {
            log::info!("[dry-run] would set {} spec.weight={}", nodepool, weight);
            return Ok(());
        }
        self.pools
            .patch(nodepool, json!({ "spec": { "weight": weight } }))
            .await
    }

    /// Values of the capacity-type requirement.
    pub async fn get_capacity_types(
        &self,
        nodepool: &str,
    ) -> Result<Vec<String>, CapacityError> {
        Ok(self
            .pools
            .get(nodepool)
            .await?
            .as_ref()
            .map(read_capacity_types)
            .unwrap_or_default())
    }

    pub async fn set_capacity_types(
        &self,
        nodepool: &str,
        values: &[&str],
    ) -> Result<(), CapacityError> {
        if self.dry_run {
            log::info!("[dry-run] would set {} capacity types to {:?}", nodepool, values);
            return Ok(());
        }
        let patch = json!({
            "spec": {
                "template": {
                    "spec": {
                        "requirements": [{
                            "key": CAPACITY_TYPE_REQUIREMENT_KEY,
                            "operator": "In",
                            "values": values,
                        }]
                    }
                }
            }
        });
        self.pools.patch(nodepool, patch).await
    }

    pub async fn set_limits(
        &self,
        nodepool: &str,
        cpu: &str,
        memory: &str,
    ) -> Result<(), CapacityError> {
        if self.dry_run {
            log::info!("[dry-run] would set {} limits cpu={} memory={}", nodepool, cpu, memory);
            return Ok(());
        }
        self.pools
            .patch(nodepool, json!({ "spec": { "limits": { "cpu": cpu, "memory": memory } } }))
            .await
    }

    /// Effective disruption limit for one NodePool: the minimum across its
    /// budgets resolved against `total` nodes. -1 means no limit.
    pub async fn effective_disruption_limit(
        &self,
        nodepool: &str,
        total: usize,
    ) -> Result<i64, CapacityError> {
        let budgets = match self.pools.get(nodepool).await? {
            Some(object) => read_budgets(&object),
            None => Vec::new(),
        };
        Ok(effective_limit(&budgets, total))
    }

    /// Combined limit for a workload pool's spot and OD NodePools.
    pub async fn pool_disruption_limit(
        &self,
        workload_pool: &str,
        total: usize,
    ) -> Result<i64, CapacityError> {
        let spot = self
            .effective_disruption_limit(&Self::spot_pool_name(workload_pool), total)
            .await?;
        let od = self
            .effective_disruption_limit(&Self::od_pool_name(workload_pool), total)
            .await?;
        Ok(combine_limits(spot, od))
    }
}

#[async_trait]
impl CapacityManager for KarpenterManager {
    fn provisioner_type(&self) -> ProvisionerType {
        ProvisionerType::Karpenter
    }

    async fn is_available(&self) -> bool {
        true
    }

    /// Steer sibling NodePool weights toward `direction`.
    ///
    /// Both pools missing is a no-op, not an error. A forbidden/unauthorized
    /// failure on one pool is partial success: steering is considered
    /// applied as long as at least one patch landed, so an RBAC gap on one
    /// pool does not disable steering on the other.
    async fn prepare_swap(
        &self,
        workload_pool: &str,
        direction: SwapDirection,
    ) -> Result<SwapResult, CapacityError> {
        if !self.config.managed_pools.is_empty()
            && !self.config.managed_pools.iter().any(|p| p == workload_pool)
        {
            log::debug!("Pool {} not in the managed allowlist, skipping", workload_pool);
            return Ok(SwapResult::default());
        }

        let cooldown = Duration::from_secs(self.config.weight_change_cooldown_secs);
        if let Some(last) = self.last_weight_change.lock().get(workload_pool) {
            if last.elapsed() < cooldown {
                log::info!(
                    "Weight change for pool {} inside cooldown ({}s), skipping",
                    workload_pool,
                    self.config.weight_change_cooldown_secs
                );
                // Steering from the previous change is still in effect.
                return Ok(SwapResult {
                    ready: true,
                    replacement_node: None,
                });
            }
        }

        let spot_name = Self::spot_pool_name(workload_pool);
        let od_name = Self::od_pool_name(workload_pool);
        let spot_exists = self.pools.get(&spot_name).await?.is_some();
        let od_exists = self.pools.get(&od_name).await?.is_some();
        if !spot_exists && !od_exists {
            log::debug!("No NodePools found for pool {}, nothing to steer", workload_pool);
            return Ok(SwapResult::default());
        }

        let (spot_weight, od_weight) = match direction {
            SwapDirection::ToSpot => (self.config.favored_weight, self.config.disfavored_weight),
            SwapDirection::ToOnDemand => {
                (self.config.disfavored_weight, self.config.favored_weight)
            }
        };

        let mut successes = 0;
        let mut hard_error: Option<CapacityError> = None;
        for (name, exists, weight) in [
            (&spot_name, spot_exists, spot_weight),
            (&od_name, od_exists, od_weight),
        ] {
            if !exists {
                continue;
            }
            match self.set_weight(name, weight).await {
                Ok(()) => successes += 1,
                Err(e) if is_auth_error(&e) => {
                    log::warn!("Weight patch on {} denied ({}), continuing with sibling", name, e);
                }
                Err(e) => {
                    log::warn!("Weight patch on {} failed: {}", name, e);
                    hard_error = Some(e);
                }
            }
        }

        if successes == 0 {
            return match hard_error {
                Some(e) => Err(e),
                None => Ok(SwapResult::default()),
            };
        }

        self.last_weight_change
            .lock()
            .insert(workload_pool.to_string(), Instant::now());

        log::info!(
            "Steered pool {} {} (spot={}, od={}, {}/2 patches applied)",
            workload_pool,
            direction.as_str(),
            spot_weight,
            od_weight,
            successes
        );

        Ok(SwapResult {
            ready: true,
            replacement_node: None,
        })
    }

    /// Karpenter reclaims drained nodes on its own; nothing to release.
    async fn post_drain_cleanup(&self, node: &NodeInfo) -> Result<(), CapacityError> {
        log::debug!("Karpenter handles instance cleanup for {}", node.name);
        Ok(())
    }
}

fn is_auth_error(error: &CapacityError) -> bool {
    matches!(
        error,
        CapacityError::Kube(kube::Error::Api(e)) if e.code == 403 || e.code == 401
    )
}

// ============================================================================
// JSON path helpers over the schema-less NodePool
// ============================================================================

fn read_weight(object: &Value) -> Option<i32> {
    object
        .pointer("/spec/weight")
        .and_then(Value::as_i64)
        .map(|w| w as i32)
}

fn read_capacity_types(object: &Value) -> Vec<String> {
    object
        .pointer("/spec/template/spec/requirements")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find(|req| {
            req.get("key").and_then(Value::as_str) == Some(CAPACITY_TYPE_REQUIREMENT_KEY)
        })
        .and_then(|req| req.get("values"))
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn read_budgets(object: &Value) -> Vec<DisruptionBudget> {
    object
        .pointer("/spec/disruption/budgets")
        .and_then(Value::as_array)
        .map(|budgets| {
            budgets
                .iter()
                .filter_map(|b| serde_json::from_value(b.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Resolve one budget's `nodes` field against the pool's node count.
/// `"20%"` of 10 nodes is 2 (floor); an unparseable field is ignored.
fn budget_limit(nodes: &str, total: usize) -> Option<i64> {
    let trimmed = nodes.trim();
    if let Some(percent) = trimmed.strip_suffix('%') {
        let p: f64 = percent.trim().parse().ok()?;
        Some(((p / 100.0) * total as f64).floor() as i64)
    } else {
        trimmed.parse::<i64>().ok()
    }
}

/// Minimum across budgets; -1 when nothing constrains the pool. Schedules
/// are treated as always-active.
fn effective_limit(budgets: &[DisruptionBudget], total: usize) -> i64 {
    budgets
        .iter()
        .filter_map(|b| budget_limit(&b.nodes, total))
        .min()
        .unwrap_or(-1)
}

/// Combine two per-NodePool limits, -1 meaning unconstrained.
fn combine_limits(a: i64, b: i64) -> i64 {
    match (a < 0, b < 0) {
        (true, true) => -1,
        (true, false) => b,
        (false, true) => a,
        (false, false) => a.min(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::collections::HashMap as StdHashMap;

    /// In-memory NodePool store with per-pool access denial.
    struct FakePoolClient {
        objects: PlMutex<StdHashMap<String, Value>>,
        forbidden: Vec<String>,
    }

    impl FakePoolClient {
        fn new(objects: &[(&str, Value)], forbidden: &[&str]) -> Self {
            Self {
                objects: PlMutex::new(
                    objects
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.clone()))
                        .collect(),
                ),
                forbidden: forbidden.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    #[async_trait]
    impl NodePoolClient for FakePoolClient {
        async fn get(&self, name: &str) -> Result<Option<Value>, CapacityError> {
            Ok(self.objects.lock().get(name).cloned())
        }

        async fn patch(&self, name: &str, patch: Value) -> Result<(), CapacityError> {
            if self.forbidden.iter().any(|f| f == name) {
                return Err(CapacityError::Kube(kube::Error::Api(
                    kube::core::ErrorResponse {
                        status: "Failure".to_string(),
                        message: "forbidden".to_string(),
                        reason: "Forbidden".to_string(),
                        code: 403,
                    },
                )));
            }
            let mut objects = self.objects.lock();
            let entry = objects.entry(name.to_string()).or_insert_with(|| json!({}));
            merge_json(entry, &patch);
            Ok(())
        }
    }

    fn merge_json(target: &mut Value, patch: &Value) {
        match (target, patch) {
            (Value::Object(t), Value::Object(p)) => {
                for (k, v) in p {
                    merge_json(t.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
            (t, p) => *t = p.clone(),
        }
    }

    fn nodepool(weight: i32) -> Value {
        json!({ "spec": { "weight": weight } })
    }

    fn manager(client: FakePoolClient) -> KarpenterManager {
        KarpenterManager::new(Box::new(client), KarpenterConfig::default(), false)
    }

    #[tokio::test]
    async fn test_prepare_swap_steers_both_pools() {
        let store = FakePoolClient::new(
            &[("general-spot", nodepool(50)), ("general-od", nodepool(50))],
            &[],
        );
        let m = manager(store);

        let result = m.prepare_swap("general", SwapDirection::ToSpot).await.unwrap();
        assert!(result.ready);
        assert_eq!(m.get_weight("general-spot").await.unwrap(), Some(80));
        assert_eq!(m.get_weight("general-od").await.unwrap(), Some(20));
    }

    #[tokio::test]
    async fn test_partial_rbac_is_still_ready() {
        // Patches to general-od return Forbidden; the swap is
        // considered applied because the spot pool patch landed.
        let store = FakePoolClient::new(
            &[("general-spot", nodepool(80)), ("general-od", nodepool(20))],
            &["general-od"],
        );
        let m = manager(store);

        let result = m.prepare_swap("general", SwapDirection::ToSpot).await.unwrap();
        assert!(result.ready);
        assert_eq!(m.get_weight("general-od").await.unwrap(), Some(20));
    }

    #[tokio::test]
    async fn test_both_pools_missing_is_noop() {
        let m = manager(FakePoolClient::new(&[], &[]));
        let result = m.prepare_swap("ghost", SwapDirection::ToSpot).await.unwrap();
        assert!(!result.ready);
    }

    #[tokio::test]
    async fn test_both_forbidden_is_noop_not_error() {
        let store = FakePoolClient::new(
            &[("general-spot", nodepool(50)), ("general-od", nodepool(50))],
            &["general-spot", "general-od"],
        );
        let m = manager(store);
        let result = m.prepare_swap("general", SwapDirection::ToSpot).await.unwrap();
        assert!(!result.ready);
    }

    #[tokio::test]
    async fn test_cooldown_skips_second_change() {
        let store = FakePoolClient::new(
            &[("general-spot", nodepool(50)), ("general-od", nodepool(50))],
            &[],
        );
        let m = manager(store);

        let first = m.prepare_swap("general", SwapDirection::ToSpot).await.unwrap();
        assert!(first.ready);

        // Flip direction inside the cooldown: weights must not move.
        let second = m.prepare_swap("general", SwapDirection::ToOnDemand).await.unwrap();
        assert!(second.ready);
        assert_eq!(m.get_weight("general-spot").await.unwrap(), Some(80));
    }

    #[tokio::test]
    async fn test_allowlist_skips_unlisted_pool() {
        let store = FakePoolClient::new(
            &[("general-spot", nodepool(50)), ("general-od", nodepool(50))],
            &[],
        );
        let config = KarpenterConfig {
            managed_pools: vec!["other".to_string()],
            ..Default::default()
        };
        let m = KarpenterManager::new(Box::new(store), config, false);
        let result = m.prepare_swap("general", SwapDirection::ToSpot).await.unwrap();
        assert!(!result.ready);
        assert_eq!(m.get_weight("general-spot").await.unwrap(), Some(50));
    }

    #[tokio::test]
    async fn test_dry_run_patches_nothing() {
        let store = FakePoolClient::new(&[("general-spot", nodepool(50))], &[]);
        let m = KarpenterManager::new(Box::new(store), KarpenterConfig::default(), true);
        let result = m.prepare_swap("general", SwapDirection::ToSpot).await.unwrap();
        assert!(result.ready);
        assert_eq!(m.get_weight("general-spot").await.unwrap(), Some(50));
    }

    #[tokio::test]
    async fn test_capacity_types_round_trip() {
        let store = FakePoolClient::new(&[("general-od", nodepool(20))], &[]);
        let m = manager(store);

        m.set_capacity_types("general-od", &["on-demand"]).await.unwrap();
        assert_eq!(m.get_capacity_types("general-od").await.unwrap(), vec!["on-demand"]);

        // Repeating the identical write leaves the same observable state.
        m.set_capacity_types("general-od", &["on-demand"]).await.unwrap();
        assert_eq!(m.get_capacity_types("general-od").await.unwrap(), vec!["on-demand"]);

        assert!(m.get_capacity_types("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_limits_patches_spec() {
        let store = FakePoolClient::new(&[("general-spot", nodepool(80))], &[]);
        let m = manager(store);
        m.set_limits("general-spot", "100", "400Gi").await.unwrap();

        let object = m.pools.get("general-spot").await.unwrap().unwrap();
        assert_eq!(object.pointer("/spec/limits/cpu").and_then(Value::as_str), Some("100"));
        assert_eq!(
            object.pointer("/spec/limits/memory").and_then(Value::as_str),
            Some("400Gi")
        );
    }

    #[test]
    fn test_budget_limit_forms() {
        assert_eq!(budget_limit("10", 100), Some(10));
        assert_eq!(budget_limit("20%", 10), Some(2));
        assert_eq!(budget_limit("33%", 10), Some(3));
        assert_eq!(budget_limit("garbage", 10), None);
    }

    #[test]
    fn test_effective_limit_takes_minimum() {
        let budgets = vec![
            DisruptionBudget {
                nodes: "5".to_string(),
                schedule: None,
                reasons: None,
            },
            DisruptionBudget {
                nodes: "10%".to_string(),
                schedule: Some("* * * * *".to_string()),
                reasons: None,
            },
        ];
        assert_eq!(effective_limit(&budgets, 20), 2);
        assert_eq!(effective_limit(&[], 20), -1);
    }

    #[test]
    fn test_combine_limits() {
        assert_eq!(combine_limits(-1, -1), -1);
        assert_eq!(combine_limits(-1, 3), 3);
        assert_eq!(combine_limits(5, -1), 5);
        assert_eq!(combine_limits(5, 3), 3);
    }

    #[test]
    fn test_read_capacity_types() {
        let object = json!({
            "spec": { "template": { "spec": { "requirements": [
                { "key": "kubernetes.io/arch", "operator": "In", "values": ["amd64"] },
                { "key": CAPACITY_TYPE_REQUIREMENT_KEY, "operator": "In", "values": ["spot", "on-demand"] }
            ]}}}
        });
        assert_eq!(read_capacity_types(&object), vec!["spot", "on-demand"]);
        assert!(read_capacity_types(&json!({})).is_empty());
    }

    #[test]
    fn test_read_budgets_skips_malformed_entries() {
        let object = json!({
            "spec": { "disruption": { "budgets": [
                { "nodes": "10%" },
                { "bogus": true },
                { "nodes": "3", "reasons": ["Drifted"] }
            ]}}
        });
        let budgets = read_budgets(&object);
        assert_eq!(budgets.len(), 2);
    }
}
