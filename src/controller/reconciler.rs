//! The reconciliation engine: one tick turns cluster state into assessments,
//! a drain plan, weight steering, and executed drains.
//!
//! Partial-failure semantics run through everything here: a telemetry or
//! workload failure skips the whole tick (warn, no mutations), a per-node
//! failure is logged and counted while the rest of the tick proceeds, and
//! nothing short of context cancellation stops the loop.

use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::Client;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::marks::{MarketStatus, NodeMarker};
use super::planner;
use super::pool_state::PoolStateStore;
use super::savings::{self, NodeCost, SavingsReporter};
use crate::capacity::{CapacityRouter, ProvisionerType};
use crate::config::{AgentConfig, PolicyMode, RuntimeConfig, RuntimeConfigHandle};
use crate::drain::{DrainError, Drainer};
use crate::guardrails::{self, GuardrailContext};
use crate::model::{
    engine::PredictOptions, types::DecisionSource, Action, FamilyAllowlist, InferenceEngine,
    NodeAssessment, NodeState,
};
use crate::node::{NodeInfo, PoolId};
use crate::observability;
use crate::policy;
use crate::telemetry::{NodeMetrics, PriceProvider, PriceQuote, PrometheusClient};
use crate::workload::{WorkloadCollector, WorkloadSnapshot};
use crate::Result;

/// Opt-in required before nodes hosting observability workloads may drain.
const ENV_ALLOW_MONITORING_DRAIN: &str = "ALLOW_MONITORING_DRAIN";

/// What one tick did, for logging and tests.
#[derive(Debug, Clone, Default)]
pub struct TickSummary {
    pub nodes_total: usize,
    pub assessed: usize,
    pub planned: usize,
    pub drained: usize,
    pub blocked: usize,
    pub skipped: Option<&'static str>,
}

impl TickSummary {
    fn skipped(cause: &'static str) -> Self {
        observability::record_tick_skipped(cause);
        Self {
            skipped: Some(cause),
            ..Default::default()
        }
    }
}

/// One node's fully assembled view for this tick.
struct NodeView {
    info: NodeInfo,
    pool_key: PoolId,
    state: NodeState,
}

/// The reconciliation controller.
pub struct Reconciler {
    kube: Client,
    telemetry: Arc<PrometheusClient>,
    prices: Arc<dyn PriceProvider>,
    collector: WorkloadCollector,
    engine: Mutex<InferenceEngine>,
    allowlist: FamilyAllowlist,
    router: CapacityRouter,
    /// Concrete handle kept alongside the router for the disruption-budget
    /// reads only it can serve.
    karpenter: Option<Arc<crate::capacity::KarpenterManager>>,
    drainer: Drainer,
    marker: NodeMarker,
    pool_state: PoolStateStore,
    runtime: RuntimeConfigHandle,
    config: AgentConfig,
    savings: SavingsReporter,
    running: RwLock<bool>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kube: Client,
        telemetry: Arc<PrometheusClient>,
        prices: Arc<dyn PriceProvider>,
        engine: InferenceEngine,
        allowlist: FamilyAllowlist,
        router: CapacityRouter,
        karpenter: Option<Arc<crate::capacity::KarpenterManager>>,
        runtime: RuntimeConfigHandle,
        config: AgentConfig,
    ) -> Self {
        let collector =
            WorkloadCollector::new(kube.clone(), config.monitoring_namespace.clone());
        let drainer = Drainer::new(kube.clone(), config.drain.clone(), config.dry_run);
        let marker = NodeMarker::new(kube.clone(), config.dry_run);
        let savings = SavingsReporter::new(config.reconcile_interval_secs);
        Self {
            kube,
            telemetry,
            prices,
            collector,
            engine: Mutex::new(engine),
            allowlist,
            router,
            karpenter,
            drainer,
            marker,
            pool_state: PoolStateStore::new(),
            runtime,
            config,
            savings,
            running: RwLock::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    /// Drive the ticker until shutdown flips. Overruns are waited out; a
    /// failed tick is logged and the next one proceeds.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        *self.running.write() = true;
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.reconcile_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let started = Instant::now();
                    match self.reconcile().await {
                        Ok(summary) => log::info!(
                            "Tick complete: {} nodes, {} assessed, {} planned, {} drained, {} blocked{}",
                            summary.nodes_total,
                            summary.assessed,
                            summary.planned,
                            summary.drained,
                            summary.blocked,
                            summary.skipped.map(|c| format!(" (skipped: {})", c)).unwrap_or_default()
                        ),
                        Err(e) => {
                            log::warn!("Tick failed: {}", e);
                            observability::record_tick_skipped("error");
                        }
                    }
                    observability::record_tick_duration(started.elapsed().as_secs_f64());
                }
                _ = shutdown.changed() => {
                    log::info!("Shutdown requested, stopping reconcile loop");
                    break;
                }
            }
        }
        *self.running.write() = false;
    }

    /// One tick.
    pub async fn reconcile(&self) -> Result<TickSummary> {
        let runtime = self.runtime.current();

        // 1. Cluster and telemetry state. Any failure here skips the tick:
        // deciding on stale inputs is worse than deciding late.
        let nodes_api: Api<Node> = Api::all(self.kube.clone());
        let node_list = match nodes_api.list(&ListParams::default()).await {
            Ok(list) => list,
            Err(e) => {
                log::warn!("Node list failed, skipping tick: {}", e);
                return Ok(TickSummary::skipped("node_list"));
            }
        };

        let node_metrics = match self.telemetry.get_node_metrics().await {
            Ok(metrics) => metrics,
            Err(e) => {
                log::warn!("Node metrics unavailable, skipping tick: {}", e);
                return Ok(TickSummary::skipped("telemetry"));
            }
        };
        let cluster_utilization = match self.telemetry.get_cluster_utilization().await {
            Ok(v) => v,
            Err(e) => {
                log::warn!("Cluster utilization unavailable, skipping tick: {}", e);
                return Ok(TickSummary::skipped("telemetry"));
            }
        };
        let pool_utilization = match self.telemetry.get_pool_utilization().await {
            Ok(v) => v,
            Err(e) => {
                log::warn!("Pool utilization unavailable, skipping tick: {}", e);
                return Ok(TickSummary::skipped("telemetry"));
            }
        };

        let metrics_by_node: HashMap<String, NodeMetrics> = node_metrics
            .into_iter()
            .map(|m| (m.node_name.clone(), m))
            .collect();

        let infos: Vec<(NodeInfo, BTreeMap<String, String>)> = node_list
            .items
            .iter()
            .map(|n| {
                (
                    NodeInfo::from_node(n),
                    n.metadata.labels.clone().unwrap_or_default(),
                )
            })
            .collect();
        let nodes_total = infos.len();
        let spot_node_count = infos.iter().filter(|(i, _)| i.is_spot).count();

        // 2. Pool ratio bookkeeping under the inference pool key.
        let pool_key_of = |info: &NodeInfo| -> PoolId {
            if self.config.pool_level_inference {
                PoolId::pool_level(info.workload_pool_or_default(), &info.zone)
            } else {
                info.pool_id(self.config.extended_pools)
            }
        };
        let mut pool_members: HashMap<PoolId, Vec<usize>> = HashMap::new();
        for (idx, (info, _)) in infos.iter().enumerate() {
            pool_members.entry(pool_key_of(info)).or_default().push(idx);
        }
        for (pool, members) in &pool_members {
            let spot = members.iter().filter(|&&i| infos[i].0.is_spot).count();
            let ratio = spot as f64 / members.len() as f64;
            self.pool_state.observe_ratio(
                pool.as_str(),
                ratio,
                runtime.min_spot_ratio,
                runtime.max_spot_ratio,
            );
            let (current, target) = self.pool_state.ratios(pool.as_str());
            observability::record_pool_ratios(pool.as_str(), current, target);
        }

        // 3. Workload features. Refusing to infer with stale features.
        let node_pools: HashMap<String, String> = infos
            .iter()
            .map(|(i, _)| (i.name.clone(), i.workload_pool_or_default().to_string()))
            .collect();
        let snapshot = match self.collector.collect(&node_pools).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("Workload collection failed, skipping tick: {}", e);
                return Ok(TickSummary::skipped("workload"));
            }
        };

        // 4. Assessments, per node or per pool.
        let (views, assessments) = match self
            .build_assessments(
                &infos,
                &pool_members,
                &metrics_by_node,
                &pool_utilization,
                &snapshot,
                cluster_utilization,
                &runtime,
            )
            .await
        {
            Some(result) => result,
            None => return Ok(TickSummary::skipped("prices")),
        };
        let assessed = assessments.len();

        // Shadow mode observes, reports, and stops before any mutation.
        if self.config.shadow_mode {
            let costs = savings_inputs(&views, &assessments);
            let report = savings::compute(&costs);
            self.savings.publish(&costs, &report);
            return Ok(TickSummary {
                nodes_total,
                assessed,
                ..Default::default()
            });
        }

        // 5-6. Actionability and executability filters.
        let actionable = planner::filter_actionable(
            assessments,
            self.config.confidence_threshold,
            self.config.risk_threshold,
        );
        let nodes_by_name: HashMap<String, NodeInfo> = infos
            .iter()
            .map(|(i, _)| (i.name.clone(), i.clone()))
            .collect();
        let executable = planner::filter_executable(actionable, &nodes_by_name);

        // 7. Drain budget: the global cap tightened by the Karpenter
        // disruption budgets of every touched workload pool.
        let karpenter_limit = self
            .karpenter_budget_limit(&executable, &nodes_by_name, &infos)
            .await;
        let planned = planner::plan_drain_budget(
            executable,
            nodes_total,
            self.config.max_drain_ratio,
            karpenter_limit,
        );
        let planned_count = planned.len();

        // 8. Batch weight steering, once per workload pool, strictly before
        // any drain in that pool so pending pods land on the right side.
        let labels_by_name: HashMap<String, BTreeMap<String, String>> = infos
            .iter()
            .map(|(i, l)| (i.name.clone(), l.clone()))
            .collect();
        let steer_skipped = self
            .steer_pools(&planned, &nodes_by_name, &labels_by_name)
            .await;

        // 9. Execute drains sequentially; each failure is contained.
        let summary = self
            .execute_planned(
                planned,
                &views,
                &snapshot,
                &labels_by_name,
                &steer_skipped,
                spot_node_count,
                &runtime,
            )
            .await;

        Ok(TickSummary {
            nodes_total,
            assessed,
            planned: planned_count,
            drained: summary.0,
            blocked: summary.1,
            skipped: None,
        })
    }

    /// Build per-node views and assessments. Returns `None` when a price
    /// lookup fails, which skips the tick.
    #[allow(clippy::too_many_arguments)]
    async fn build_assessments(
        &self,
        infos: &[(NodeInfo, BTreeMap<String, String>)],
        pool_members: &HashMap<PoolId, Vec<usize>>,
        metrics_by_node: &HashMap<String, NodeMetrics>,
        pool_utilization: &HashMap<String, f64>,
        snapshot: &WorkloadSnapshot,
        cluster_utilization: f64,
        runtime: &RuntimeConfig,
    ) -> Option<(HashMap<String, NodeView>, Vec<NodeAssessment>)> {
        let history_cap = self.config.forecast.history_steps * 2;
        let step_secs = runtime.step_minutes * 60;
        let mut price_cache: HashMap<(String, String), PriceQuote> = HashMap::new();
        let mut views: HashMap<String, NodeView> = HashMap::new();
        let mut assessments = Vec::new();
        let mut drift_applied: HashSet<String> = HashSet::new();

        for (pool, members) in pool_members {
            // One price per pool: the simple and extended pool keys pin the
            // instance type already, and pool-level keys use the dominant
            // type by count for pricing and feature lookup.
            let member_infos: Vec<&NodeInfo> = members.iter().map(|&i| &infos[i].0).collect();
            let dominant = dominant_instance_type(&member_infos);
            let quote = self
                .quote_cached(&mut price_cache, &dominant, &member_infos[0].zone)
                .await?;
            self.pool_state
                .push_price(pool.as_str(), quote.current, &quote.history, history_cap);

            let mut pool_prediction: Option<NodeAssessment> = None;

            for info in &member_infos {
                let state = self.build_node_state(
                    info,
                    pool,
                    &quote,
                    metrics_by_node,
                    pool_utilization,
                    snapshot,
                    cluster_utilization,
                    runtime,
                );

                // Unsupported instance families never reach inference; they
                // leave the tick as forced emergency exits.
                if !self.allowlist.is_supported(&info.instance_type) {
                    observability::record_unsupported_family(info.instance_family());
                    let assessment = NodeAssessment {
                        node_name: info.name.clone(),
                        action: Action::EmergencyExit,
                        capacity_score: 1.0,
                        runtime_score: 1.0,
                        confidence: 1.0,
                        source: DecisionSource::UnsupportedFamily,
                    };
                    observability::record_decision(assessment.source, assessment.action);
                    views.insert(
                        info.name.clone(),
                        NodeView {
                            info: (*info).clone(),
                            pool_key: pool.clone(),
                            state,
                        },
                    );
                    assessments.push(assessment);
                    continue;
                }

                // A per-node inference failure drops the node, not the tick.
                let assessment = if self.config.pool_level_inference {
                    // One prediction per pool, replicated to every member.
                    match &pool_prediction {
                        Some(shared) => NodeAssessment {
                            node_name: info.name.clone(),
                            ..shared.clone()
                        },
                        None => {
                            let mut state = state.clone();
                            match self.assess(info, pool, &mut state, runtime, step_secs) {
                                Some(assessment) => {
                                    pool_prediction = Some(assessment.clone());
                                    assessment
                                }
                                None => continue,
                            }
                        }
                    }
                } else {
                    let mut state = state.clone();
                    match self.assess(info, pool, &mut state, runtime, step_secs) {
                        Some(assessment) => assessment,
                        None => continue,
                    }
                };

                // Low-risk holds drift the pool target toward the
                // configured resting ratio, once per pool per tick.
                if assessment.action == Action::Hold
                    && !drift_applied.contains(pool.as_str())
                {
                    let low_risk = assessment.capacity_score.max(assessment.runtime_score)
                        < runtime.deterministic.medium_threshold;
                    self.pool_state.apply_action(
                        pool.as_str(),
                        Action::Hold,
                        runtime.min_spot_ratio,
                        runtime.max_spot_ratio,
                        runtime.target_spot_ratio,
                        low_risk,
                    );
                    drift_applied.insert(pool.as_str().to_string());
                }

                observability::record_decision(assessment.source, assessment.action);
                views.insert(
                    info.name.clone(),
                    NodeView {
                        info: (*info).clone(),
                        pool_key: pool.clone(),
                        state,
                    },
                );
                assessments.push(assessment);
            }
        }

        Some((views, assessments))
    }

    /// Fetch a price quote through the per-tick cache. `None` means the
    /// provider failed and the tick must be skipped.
    async fn quote_cached(
        &self,
        cache: &mut HashMap<(String, String), PriceQuote>,
        instance_type: &str,
        zone: &str,
    ) -> Option<PriceQuote> {
        let key = (instance_type.to_string(), zone.to_string());
        if let Some(quote) = cache.get(&key) {
            return Some(quote.clone());
        }
        match self.prices.get_spot_price(instance_type, zone).await {
            Ok(quote) => {
                cache.insert(key, quote.clone());
                Some(quote)
            }
            Err(e) => {
                log::warn!(
                    "Price lookup failed for {} in {}, skipping tick: {}",
                    instance_type,
                    zone,
                    e
                );
                None
            }
        }
    }

    /// Assemble the inference input for one node.
    #[allow(clippy::too_many_arguments)]
    fn build_node_state(
        &self,
        info: &NodeInfo,
        pool: &PoolId,
        quote: &PriceQuote,
        metrics_by_node: &HashMap<String, NodeMetrics>,
        pool_utilization: &HashMap<String, f64>,
        snapshot: &WorkloadSnapshot,
        cluster_utilization: f64,
        runtime: &RuntimeConfig,
    ) -> NodeState {
        let price_history = self.pool_state.price_history(pool.as_str());
        let (current_ratio, target_ratio) = self.pool_state.ratios(pool.as_str());

        let workload_pool = info.workload_pool_or_default();
        let features = snapshot.features_for(workload_pool);

        let (cpu, memory) = if self.config.pool_level_inference {
            let util = pool_utilization
                .get(workload_pool)
                .copied()
                .unwrap_or(cluster_utilization);
            (util, util)
        } else {
            metrics_by_node
                .get(&info.name)
                .map(|m| (m.cpu_utilization, m.memory_utilization))
                .unwrap_or((cluster_utilization, cluster_utilization))
        };

        NodeState {
            spot_price: quote.current,
            on_demand_price: quote.on_demand,
            price_history,
            cpu_utilization: cpu,
            memory_utilization: memory,
            cluster_utilization,
            is_spot: info.is_spot,
            startup_time_secs: features.startup_p95_secs,
            outage_penalty_hours: features.avg_outage_penalty_hours,
            migration_cost_usd: migration_cost_usd(features.startup_p95_secs, quote.on_demand),
            time_since_migration_steps: self
                .pool_state
                .steps_since_migration(pool.as_str(), runtime.step_minutes),
            current_spot_ratio: current_ratio,
            target_spot_ratio: target_ratio,
            priority_score: features.avg_priority_score,
            runtime_score: 0.0,
        }
    }

    /// Run inference (and the deterministic override when configured) for
    /// one node. `None` drops the node from this tick after logging.
    fn assess(
        &self,
        info: &NodeInfo,
        pool: &PoolId,
        state: &mut NodeState,
        runtime: &RuntimeConfig,
        step_secs: u64,
    ) -> Option<NodeAssessment> {
        let opts = PredictOptions {
            risk_multiplier: runtime.risk_multiplier,
            enable_calibration: runtime.enable_calibration,
            enable_fusion: runtime.enable_fusion,
            step_secs,
            now: chrono::Utc::now(),
        };

        let prediction = {
            let mut engine = self.engine.lock();
            match engine.predict(&info.name, state, &opts) {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("Inference failed for {}: {}", info.name, e);
                    return None;
                }
            }
        };
        observability::record_pool_scores(
            pool.as_str(),
            prediction.capacity_score,
            prediction.runtime_score,
        );

        match runtime.policy_mode {
            PolicyMode::Rl => Some(NodeAssessment {
                node_name: info.name.clone(),
                action: prediction.action,
                capacity_score: prediction.capacity_score,
                runtime_score: prediction.runtime_score,
                confidence: prediction.confidence,
                source: DecisionSource::Rl,
            }),
            PolicyMode::Deterministic => {
                let decision = policy::decide(
                    state,
                    prediction.capacity_score,
                    prediction.runtime_score,
                    &runtime.deterministic,
                    runtime.min_spot_ratio,
                    runtime.max_spot_ratio,
                );
                observability::record_deterministic_reason(decision.reason);
                observability::record_workload_cap(
                    pool.as_str(),
                    decision.effective_cap,
                    decision.ood,
                );
                Some(NodeAssessment {
                    node_name: info.name.clone(),
                    action: decision.action,
                    capacity_score: prediction.capacity_score,
                    runtime_score: prediction.runtime_score,
                    confidence: 1.0,
                    source: DecisionSource::Deterministic,
                })
            }
        }
    }

    /// Tightest Karpenter disruption limit across the workload pools the
    /// planned set touches. -1 when nothing constrains.
    async fn karpenter_budget_limit(
        &self,
        executable: &[NodeAssessment],
        nodes_by_name: &HashMap<String, NodeInfo>,
        infos: &[(NodeInfo, BTreeMap<String, String>)],
    ) -> i64 {
        let Some(karpenter) = self.karpenter.as_ref() else {
            return -1;
        };

        let mut touched: HashSet<&str> = HashSet::new();
        for assessment in executable {
            if let Some(info) = nodes_by_name.get(&assessment.node_name) {
                touched.insert(info.workload_pool_or_default());
            }
        }

        let mut limit: i64 = -1;
        for pool in touched {
            let pool_total = infos
                .iter()
                .filter(|(i, _)| i.workload_pool_or_default() == pool)
                .count();
            match karpenter.pool_disruption_limit(pool, pool_total).await {
                Ok(pool_limit) if pool_limit >= 0 => {
                    limit = if limit < 0 {
                        pool_limit
                    } else {
                        limit.min(pool_limit)
                    };
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("Disruption budget read failed for pool {}: {}", pool, e);
                }
            }
        }
        limit
    }

    /// Apply weight steering once per Karpenter-backed workload pool.
    /// Returns the pools whose steering did not land; their drains are
    /// skipped this tick.
    async fn steer_pools(
        &self,
        planned: &[NodeAssessment],
        nodes_by_name: &HashMap<String, NodeInfo>,
        labels_by_name: &HashMap<String, BTreeMap<String, String>>,
    ) -> HashSet<String> {
        let mut by_pool: HashMap<String, Vec<&NodeAssessment>> = HashMap::new();
        for assessment in planned {
            if let Some(info) = nodes_by_name.get(&assessment.node_name) {
                by_pool
                    .entry(info.workload_pool_or_default().to_string())
                    .or_default()
                    .push(assessment);
            }
        }

        let mut skipped = HashSet::new();
        for (pool, members) in by_pool {
            let first = members[0];
            let provisioner = labels_by_name
                .get(&first.node_name)
                .map(|labels| crate::capacity::detect_provisioner(labels))
                .unwrap_or(ProvisionerType::Unknown);
            if provisioner != ProvisionerType::Karpenter {
                // ASG pools swap per node during execution.
                continue;
            }
            let Some(manager) = self.router.manager_for(provisioner) else {
                skipped.insert(pool);
                continue;
            };

            let actions: Vec<Action> = members.iter().map(|a| a.action).collect();
            let direction = planner::steer_direction(&actions);
            match manager.prepare_swap(&pool, direction).await {
                Ok(result) if result.ready => {}
                Ok(_) => {
                    log::info!("Steering for pool {} not applied, deferring drains", pool);
                    skipped.insert(pool);
                }
                Err(e) => {
                    log::warn!("Steering for pool {} failed: {}", pool, e);
                    skipped.insert(pool);
                }
            }
        }
        skipped
    }

    /// Execute the planned drains sequentially. Returns (drained, blocked).
    #[allow(clippy::too_many_arguments)]
    async fn execute_planned(
        &self,
        planned: Vec<NodeAssessment>,
        views: &HashMap<String, NodeView>,
        snapshot: &WorkloadSnapshot,
        labels_by_name: &HashMap<String, BTreeMap<String, String>>,
        steer_skipped: &HashSet<String>,
        spot_node_count: usize,
        runtime: &RuntimeConfig,
    ) -> (usize, usize) {
        let allow_monitoring = allow_monitoring_drain();
        let mut drained = 0usize;
        let mut blocked = 0usize;

        for assessment in planned {
            let Some(view) = views.get(&assessment.node_name) else {
                continue;
            };
            let info = &view.info;
            let workload_pool = info.workload_pool_or_default();

            if steer_skipped.contains(workload_pool) {
                blocked += 1;
                continue;
            }

            // Guardrails, in order, on the proposed action.
            let flags = snapshot.flags_for(&info.name);
            let ctx = GuardrailContext {
                spot_node_count,
                cluster_fraction_limit: self.config.cluster_fraction_limit,
                confidence_threshold: self.config.confidence_threshold,
            };
            let outcome = guardrails::evaluate(
                assessment.action,
                assessment.confidence,
                &view.state,
                &flags,
                &ctx,
            );
            if outcome.modified() {
                observability::record_guardrail(outcome.guardrail);
                log::info!(
                    "Guardrail {} on {}: {} ({})",
                    outcome.guardrail,
                    info.name,
                    if outcome.approved { "downgraded" } else { "blocked" },
                    outcome.reason
                );
            }
            if !outcome.approved {
                blocked += 1;
                continue;
            }
            let action = outcome.modified_action;

            // Environment safety: observability hosts need an explicit
            // opt-in before they may drain.
            if flags.has_monitoring_pod && !allow_monitoring {
                log::info!(
                    "Refusing to drain {}: hosts monitoring pods and {} is unset",
                    info.name,
                    ENV_ALLOW_MONITORING_DRAIN
                );
                blocked += 1;
                continue;
            }

            // ASG-backed nodes scale-and-wait per node; Karpenter pools
            // were steered in batch above.
            let provisioner = labels_by_name
                .get(&info.name)
                .map(|labels| crate::capacity::detect_provisioner(labels))
                .unwrap_or(ProvisionerType::Unknown);
            let Some(manager) = self.router.manager_for(provisioner) else {
                log::debug!("No manager for {} ({}), skipping", info.name, provisioner.as_str());
                continue;
            };
            if provisioner != ProvisionerType::Karpenter {
                let direction = planner::direction_for_action(action);
                match manager.prepare_swap(workload_pool, direction).await {
                    Ok(result) if result.ready => {}
                    Ok(_) | Err(_) => {
                        log::warn!(
                            "Replacement capacity not ready for {}, retrying next tick",
                            info.name
                        );
                        blocked += 1;
                        continue;
                    }
                }
            }

            // Marks first, then the drain itself.
            let risk_reason = (action == Action::EmergencyExit)
                .then(|| format!("capacity_score={:.2}", assessment.capacity_score));
            if let Err(e) = self
                .marker
                .apply_assessment_marks(
                    &info.name,
                    assessment.capacity_score,
                    MarketStatus::Draining,
                    risk_reason.as_deref(),
                )
                .await
            {
                log::warn!("Failed to mark {}: {}", info.name, e);
            }
            if action.is_increase() {
                if let Err(e) = self.marker.taint_prefer_spot(&info.name).await {
                    log::warn!("Failed to taint {}: {}", info.name, e);
                }
            }
            if let Err(e) = self
                .marker
                .taint_draining(&info.name, action == Action::EmergencyExit)
                .await
            {
                log::warn!("Failed to taint {}: {}", info.name, e);
            }

            match self.drainer.drain(&info.name).await {
                Ok(outcome) if outcome.success => {
                    drained += 1;
                    self.pool_state.apply_action(
                        view.pool_key.as_str(),
                        action,
                        runtime.min_spot_ratio,
                        runtime.max_spot_ratio,
                        runtime.target_spot_ratio,
                        false,
                    );
                    self.pool_state.record_migration(view.pool_key.as_str());
                    observability::record_action_taken(action);
                    if action.is_decrease() && info.is_spot {
                        observability::record_outage_avoided();
                    }
                    let (current, target) = self.pool_state.ratios(view.pool_key.as_str());
                    observability::record_pool_ratios(view.pool_key.as_str(), current, target);

                    if let Err(e) = manager.post_drain_cleanup(info).await {
                        log::warn!("Post-drain cleanup for {} failed: {}", info.name, e);
                    }
                }
                Ok(outcome) => {
                    log::warn!(
                        "Drain of {} incomplete: {} pods failed",
                        info.name,
                        outcome.pods_failed
                    );
                    observability::record_drain_failed(&info.name);
                }
                Err(DrainError::PdbViolation { node, pod }) => {
                    log::warn!("Drain of {} aborted: PDB blocks {}", node, pod);
                    observability::record_drain_failed(&node);
                    // The node would sit cordoned until the retry; undo.
                    if let Err(e) = self.drainer.uncordon(&node).await {
                        log::warn!("Uncordon of {} failed: {}", node, e);
                    }
                }
                Err(e) => {
                    log::warn!("Drain of {} failed: {}", info.name, e);
                    observability::record_drain_failed(&info.name);
                }
            }
        }

        (drained, blocked)
    }
}

/// Whether the operator has opted into draining monitoring hosts.
fn allow_monitoring_drain() -> bool {
    std::env::var(ENV_ALLOW_MONITORING_DRAIN)
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// The instance type that appears most often in a pool.
fn dominant_instance_type(nodes: &[&NodeInfo]) -> String {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for node in nodes {
        *counts.entry(node.instance_type.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(t, _)| t.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Capacity paid for while the workload restarts elsewhere.
fn migration_cost_usd(startup_secs: f64, on_demand_price: f64) -> f64 {
    (startup_secs / 3600.0) * on_demand_price
}

/// Savings inputs from the tick's views and assessments.
fn savings_inputs(
    views: &HashMap<String, NodeView>,
    assessments: &[NodeAssessment],
) -> Vec<NodeCost> {
    assessments
        .iter()
        .filter_map(|a| {
            let view = views.get(&a.node_name)?;
            Some(NodeCost {
                node_name: a.node_name.clone(),
                pool: view.info.workload_pool_or_default().to_string(),
                is_spot: view.info.is_spot,
                spot_price: view.state.spot_price,
                on_demand_price: view.state.on_demand_price,
                recommended_action: a.action,
            })
        })
        .collect()
}
