//! Workload feature types and the pure computation over pod facts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// Pod annotations the agent honors.
pub const ANNOTATION_OUTAGE_PENALTY: &str = "spotvortex.io/outage-penalty";
pub const ANNOTATION_STARTUP_TIME: &str = "spotvortex.io/startup-time";
pub const ANNOTATION_MIGRATION_TIER: &str = "spotvortex.io/migration-tier";
pub const ANNOTATION_CRITICAL: &str = "spotvortex.io/critical";
pub const ANNOTATION_MIGRATION_STRATEGY: &str = "spotvortex.io/migration-strategy";

// Defaults for a pool that has never been observed.
pub const DEFAULT_STARTUP_SECS: f64 = 300.0;
pub const DEFAULT_OUTAGE_PENALTY_HOURS: f64 = 5.0;
pub const DEFAULT_PRIORITY_SCORE: f64 = 0.5;

/// Everything extracted from one pod that feeds pool aggregation.
#[derive(Debug, Clone)]
pub struct PodFacts {
    pub name: String,
    pub namespace: String,
    pub node_name: String,
    /// 0-1, higher = more important.
    pub priority_score: f64,
    pub outage_penalty_hours: f64,
    pub startup_time_secs: f64,
    /// CPU request in cores, floored at 1.0; the aggregation weight.
    pub cpu_weight: f64,
    pub critical_annotation: bool,
    pub graceful_only: bool,
    /// Matched by a PDB with disruptionsAllowed = 0.
    pub pdb_blocked: bool,
    pub in_monitoring_namespace: bool,
}

/// Per-pool features. Weighted averages for inference, true maxima and the
/// critical flag for guardrails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadFeatures {
    pub avg_outage_penalty_hours: f64,
    pub avg_priority_score: f64,
    /// CPU-weighted P95 of observed startup times.
    pub startup_p95_secs: f64,
    pub max_outage_penalty_hours: f64,
    pub max_priority_score: f64,
    pub max_startup_secs: f64,
    /// Any pod with priority >= 1.0.
    pub has_critical_pod: bool,
    pub pod_count: usize,
}

impl Default for WorkloadFeatures {
    fn default() -> Self {
        Self {
            avg_outage_penalty_hours: DEFAULT_OUTAGE_PENALTY_HOURS,
            avg_priority_score: DEFAULT_PRIORITY_SCORE,
            startup_p95_secs: DEFAULT_STARTUP_SECS,
            max_outage_penalty_hours: DEFAULT_OUTAGE_PENALTY_HOURS,
            max_priority_score: DEFAULT_PRIORITY_SCORE,
            max_startup_secs: DEFAULT_STARTUP_SECS,
            has_critical_pod: false,
            pod_count: 0,
        }
    }
}

/// Per-node flags the guardrails and the environment-safety check read.
#[derive(Debug, Clone, Default)]
pub struct NodeWorkloadFlags {
    /// A pod on this node is matched by a PDB with disruptionsAllowed = 0.
    pub has_pdb_blocked_pod: bool,
    /// A pod on this node carries the critical annotation.
    pub has_critical_pod: bool,
    /// A pod on this node requires graceful-only migration.
    pub has_graceful_only_pod: bool,
    /// A pod on this node lives in the monitoring namespace.
    pub has_monitoring_pod: bool,
}

/// One tick's workload view.
#[derive(Debug, Clone, Default)]
pub struct WorkloadSnapshot {
    /// Features keyed by workload pool name.
    pub pools: HashMap<String, WorkloadFeatures>,
    /// Safety flags keyed by node name.
    pub node_flags: HashMap<String, NodeWorkloadFlags>,
}

impl WorkloadSnapshot {
    /// Features for a pool, conservative defaults when never observed.
    pub fn features_for(&self, pool: &str) -> WorkloadFeatures {
        self.pools.get(pool).cloned().unwrap_or_default()
    }

    pub fn flags_for(&self, node: &str) -> NodeWorkloadFlags {
        self.node_flags.get(node).cloned().unwrap_or_default()
    }
}

/// Parse an hours string: `"10h"` -> 10.0, `"0.5h"` -> 0.5, `"24"` -> 24.0.
/// Anything unparseable, including the empty string, is 0.
pub fn parse_hours(value: &str) -> f64 {
    let trimmed = value.trim();
    let numeric = trimmed.strip_suffix('h').unwrap_or(trimmed);
    numeric.parse::<f64>().unwrap_or(0.0).max(0.0)
}

/// Priority score from the migration-tier annotation (wins) or the priority
/// class name.
pub fn priority_score(migration_tier: Option<&str>, priority_class: Option<&str>) -> f64 {
    if let Some(tier) = migration_tier {
        match tier.trim() {
            "0" => return 1.0,
            "1" => return 0.5,
            "2" => return 0.25,
            _ => {}
        }
    }
    match priority_class {
        Some(class) if class.contains("system") => 1.0,
        Some(class) if class.contains("high") => 0.75,
        Some(class) if class.contains("low") => 0.25,
        _ => 0.5,
    }
}

/// Base outage penalty in hours for a priority class, before the ownership
/// and PDB adjustments.
pub fn base_outage_penalty(priority_class: Option<&str>) -> f64 {
    match priority_class {
        Some(class) if class.contains("system") => 48.0,
        Some(class) if class.contains("high") => 12.0,
        Some(class) if class.contains("low") => 1.0,
        _ => 4.0,
    }
}

/// Apply the ownership/PDB adjustments to a base penalty: doubled under a
/// restricted PDB, halved for a ReplicaSet with >= 2 replicas that is not
/// restricted, doubled for a StatefulSet.
pub fn adjust_outage_penalty(
    base: f64,
    restricted_pdb: bool,
    replicaset_replicas: Option<i32>,
    stateful_set: bool,
) -> f64 {
    let mut penalty = base;
    if restricted_pdb {
        penalty *= 2.0;
    } else if replicaset_replicas.map(|r| r >= 2).unwrap_or(false) {
        penalty /= 2.0;
    }
    if stateful_set {
        penalty *= 2.0;
    }
    penalty
}

/// Aggregate pod facts into per-pool features and per-node flags.
/// `node_pools` maps node name -> workload pool name.
pub fn aggregate(
    facts: &[PodFacts],
    node_pools: &HashMap<String, String>,
) -> WorkloadSnapshot {
    let mut by_pool: HashMap<String, Vec<&PodFacts>> = HashMap::new();
    let mut node_flags: HashMap<String, NodeWorkloadFlags> = HashMap::new();

    for fact in facts {
        let flags = node_flags.entry(fact.node_name.clone()).or_default();
        flags.has_pdb_blocked_pod |= fact.pdb_blocked;
        flags.has_critical_pod |= fact.critical_annotation || fact.priority_score >= 1.0;
        flags.has_graceful_only_pod |= fact.graceful_only;
        flags.has_monitoring_pod |= fact.in_monitoring_namespace;

        if let Some(pool) = node_pools.get(&fact.node_name) {
            by_pool.entry(pool.clone()).or_default().push(fact);
        }
    }

    let pools = by_pool
        .into_iter()
        .map(|(pool, pods)| (pool, aggregate_pool(&pods)))
        .collect();

    WorkloadSnapshot { pools, node_flags }
}

fn aggregate_pool(pods: &[&PodFacts]) -> WorkloadFeatures {
    if pods.is_empty() {
        return WorkloadFeatures::default();
    }

    let total_weight: f64 = pods.iter().map(|p| p.cpu_weight).sum();
    let weighted = |f: fn(&PodFacts) -> f64| -> f64 {
        pods.iter().map(|p| f(p) * p.cpu_weight).sum::<f64>() / total_weight
    };

    WorkloadFeatures {
        avg_outage_penalty_hours: weighted(|p| p.outage_penalty_hours),
        avg_priority_score: weighted(|p| p.priority_score),
        startup_p95_secs: weighted_percentile(pods, 0.95, |p| p.startup_time_secs),
        max_outage_penalty_hours: pods
            .iter()
            .map(|p| p.outage_penalty_hours)
            .fold(0.0, f64::max),
        max_priority_score: pods.iter().map(|p| p.priority_score).fold(0.0, f64::max),
        max_startup_secs: pods.iter().map(|p| p.startup_time_secs).fold(0.0, f64::max),
        has_critical_pod: pods.iter().any(|p| p.priority_score >= 1.0),
        pod_count: pods.len(),
    }
}

/// Weighted percentile: sort by value, walk cumulative weight until the
/// requested fraction of total weight is covered.
fn weighted_percentile(pods: &[&PodFacts], p: f64, value: fn(&PodFacts) -> f64) -> f64 {
    if pods.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<(f64, f64)> = pods.iter().map(|f| (value(f), f.cpu_weight)).collect();
    sorted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let total: f64 = sorted.iter().map(|(_, w)| w).sum();
    let threshold = total * p;
    let mut cumulative = 0.0;
    for (v, w) in &sorted {
        cumulative += w;
        if cumulative >= threshold {
            return *v;
        }
    }
    sorted.last().map(|(v, _)| *v).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(node: &str, priority: f64, outage: f64, startup: f64, weight: f64) -> PodFacts {
        PodFacts {
            name: "pod".to_string(),
            namespace: "default".to_string(),
            node_name: node.to_string(),
            priority_score: priority,
            outage_penalty_hours: outage,
            startup_time_secs: startup,
            cpu_weight: weight,
            critical_annotation: false,
            graceful_only: false,
            pdb_blocked: false,
            in_monitoring_namespace: false,
        }
    }

    #[test]
    fn test_parse_hours() {
        assert_eq!(parse_hours("10h"), 10.0);
        assert_eq!(parse_hours("0.5h"), 0.5);
        assert_eq!(parse_hours("24"), 24.0);
        assert_eq!(parse_hours(""), 0.0);
        assert_eq!(parse_hours("abc"), 0.0);
        assert_eq!(parse_hours("-3h"), 0.0);
    }

    #[test]
    fn test_priority_score_tier_wins() {
        assert_eq!(priority_score(Some("0"), Some("low-priority")), 1.0);
        assert_eq!(priority_score(Some("1"), None), 0.5);
        assert_eq!(priority_score(Some("2"), Some("system-critical")), 0.25);
        // Garbage tier falls through to the class mapping.
        assert_eq!(priority_score(Some("9"), Some("system-critical")), 1.0);
    }

    #[test]
    fn test_priority_score_class_substrings() {
        assert_eq!(priority_score(None, Some("system-cluster-critical")), 1.0);
        assert_eq!(priority_score(None, Some("high-priority")), 0.75);
        assert_eq!(priority_score(None, Some("low-batch")), 0.25);
        assert_eq!(priority_score(None, Some("whatever")), 0.5);
        assert_eq!(priority_score(None, None), 0.5);
    }

    #[test]
    fn test_outage_penalty_adjustments() {
        // Restricted PDB doubles and suppresses the replica halving.
        assert_eq!(adjust_outage_penalty(4.0, true, Some(3), false), 8.0);
        // ReplicaSet with >= 2 replicas halves.
        assert_eq!(adjust_outage_penalty(4.0, false, Some(2), false), 2.0);
        // Single replica does not halve.
        assert_eq!(adjust_outage_penalty(4.0, false, Some(1), false), 4.0);
        // StatefulSet doubles on top.
        assert_eq!(adjust_outage_penalty(4.0, false, Some(2), true), 4.0);
        assert_eq!(adjust_outage_penalty(48.0, true, None, true), 192.0);
    }

    #[test]
    fn test_aggregate_weighted_vs_max() {
        let node_pools: HashMap<String, String> =
            [("n1".to_string(), "api".to_string())].into();
        // One heavy ordinary pod and one tiny critical pod: the average must
        // stay near the heavy pod while the max reflects the critical one.
        let facts = vec![
            fact("n1", 0.5, 4.0, 60.0, 9.0),
            fact("n1", 1.0, 48.0, 600.0, 1.0),
        ];
        let snapshot = aggregate(&facts, &node_pools);
        let features = snapshot.features_for("api");

        assert!((features.avg_priority_score - 0.55).abs() < 1e-9);
        assert!((features.avg_outage_penalty_hours - 8.4).abs() < 1e-9);
        assert_eq!(features.max_outage_penalty_hours, 48.0);
        assert_eq!(features.max_priority_score, 1.0);
        assert!(features.has_critical_pod);
    }

    #[test]
    fn test_aggregate_node_flags() {
        let node_pools = HashMap::new();
        let mut f = fact("n1", 0.5, 4.0, 60.0, 1.0);
        f.pdb_blocked = true;
        f.in_monitoring_namespace = true;
        let snapshot = aggregate(&[f], &node_pools);
        let flags = snapshot.flags_for("n1");
        assert!(flags.has_pdb_blocked_pod);
        assert!(flags.has_monitoring_pod);
        assert!(!flags.has_graceful_only_pod);
    }

    #[test]
    fn test_unobserved_pool_defaults() {
        let snapshot = WorkloadSnapshot::default();
        let features = snapshot.features_for("never-seen");
        assert_eq!(features.startup_p95_secs, DEFAULT_STARTUP_SECS);
        assert_eq!(features.avg_outage_penalty_hours, DEFAULT_OUTAGE_PENALTY_HOURS);
        assert_eq!(features.avg_priority_score, DEFAULT_PRIORITY_SCORE);
        assert!(!features.has_critical_pod);
    }

    #[test]
    fn test_weighted_percentile_dominant_weight() {
        let pods = vec![
            fact("n", 0.5, 0.0, 10.0, 1.0),
            fact("n", 0.5, 0.0, 20.0, 1.0),
            fact("n", 0.5, 0.0, 30.0, 98.0),
        ];
        let refs: Vec<&PodFacts> = pods.iter().collect();
        assert_eq!(weighted_percentile(&refs, 0.95, |p| p.startup_time_secs), 30.0);
    }
}
