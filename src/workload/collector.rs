//! Kubernetes-side workload collection.
//!
//! Lists pods, PodDisruptionBudgets, and ReplicaSets once per tick and
//! reduces them to [`PodFacts`]. Only pods bound to known nodes contribute;
//! everything else (pending, completed, unknown-node) is skipped.

use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{
    api::{Api, ListParams},
    Client,
};
use std::collections::{BTreeMap, HashMap};

use super::features::{
    self, adjust_outage_penalty, aggregate, base_outage_penalty, parse_hours, priority_score,
    PodFacts, WorkloadSnapshot,
};

/// Error type for workload collection.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("Failed to list {kind}: {source}")]
    List {
        kind: &'static str,
        #[source]
        source: kube::Error,
    },
}

/// Collects workload features from the cluster.
pub struct WorkloadCollector {
    client: Client,
    monitoring_namespace: String,
}

impl WorkloadCollector {
    pub fn new(client: Client, monitoring_namespace: String) -> Self {
        Self {
            client,
            monitoring_namespace,
        }
    }

    /// Produce this tick's workload snapshot. `node_pools` maps node name to
    /// workload pool and doubles as the known-node filter.
    pub async fn collect(
        &self,
        node_pools: &HashMap<String, String>,
    ) -> Result<WorkloadSnapshot, CollectorError> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let pdbs: Api<PodDisruptionBudget> = Api::all(self.client.clone());
        let replica_sets: Api<ReplicaSet> = Api::all(self.client.clone());

        let pod_list = pods
            .list(&ListParams::default())
            .await
            .map_err(|e| CollectorError::List {
                kind: "pods",
                source: e,
            })?;
        let pdb_list = pdbs
            .list(&ListParams::default())
            .await
            .map_err(|e| CollectorError::List {
                kind: "poddisruptionbudgets",
                source: e,
            })?;
        let rs_list = replica_sets
            .list(&ListParams::default())
            .await
            .map_err(|e| CollectorError::List {
                kind: "replicasets",
                source: e,
            })?;

        // Index replica counts by (namespace, name) for owner lookups.
        let rs_replicas: HashMap<(String, String), i32> = rs_list
            .items
            .iter()
            .filter_map(|rs| {
                let ns = rs.metadata.namespace.clone()?;
                let name = rs.metadata.name.clone()?;
                let replicas = rs.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                Some(((ns, name), replicas))
            })
            .collect();

        // Index PDBs by namespace; a namespace is "restricted" when any of
        // its budgets currently allows zero disruptions.
        let mut pdbs_by_ns: HashMap<String, Vec<&PodDisruptionBudget>> = HashMap::new();
        for pdb in &pdb_list.items {
            if let Some(ns) = &pdb.metadata.namespace {
                pdbs_by_ns.entry(ns.clone()).or_default().push(pdb);
            }
        }

        let mut facts = Vec::new();
        for pod in &pod_list.items {
            let Some(fact) = self.pod_facts(pod, node_pools, &rs_replicas, &pdbs_by_ns) else {
                continue;
            };
            facts.push(fact);
        }

        log::debug!(
            "Collected workload facts for {} pods across {} nodes",
            facts.len(),
            node_pools.len()
        );

        Ok(aggregate(&facts, node_pools))
    }

    fn pod_facts(
        &self,
        pod: &Pod,
        node_pools: &HashMap<String, String>,
        rs_replicas: &HashMap<(String, String), i32>,
        pdbs_by_ns: &HashMap<String, Vec<&PodDisruptionBudget>>,
    ) -> Option<PodFacts> {
        let spec = pod.spec.as_ref()?;
        let node_name = spec.node_name.clone()?;
        if !node_pools.contains_key(&node_name) {
            return None;
        }

        let name = pod.metadata.name.clone().unwrap_or_default();
        let namespace = pod
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let empty = BTreeMap::new();
        let annotations = pod.metadata.annotations.as_ref().unwrap_or(&empty);
        let labels = pod.metadata.labels.as_ref().unwrap_or(&empty);
        let priority_class = spec.priority_class_name.as_deref();

        let priority = priority_score(
            annotations.get(features::ANNOTATION_MIGRATION_TIER).map(String::as_str),
            priority_class,
        );

        // Ownership shapes the outage penalty.
        let (rs_count, stateful) = match pod.metadata.owner_references.as_deref() {
            Some(owners) => {
                let rs_count = owners
                    .iter()
                    .find(|o| o.kind == "ReplicaSet")
                    .and_then(|o| rs_replicas.get(&(namespace.clone(), o.name.clone())))
                    .copied();
                let stateful = owners.iter().any(|o| o.kind == "StatefulSet");
                (rs_count, stateful)
            }
            None => (None, false),
        };

        let ns_pdbs = pdbs_by_ns.get(&namespace).map(Vec::as_slice).unwrap_or(&[]);
        let restricted = ns_pdbs.iter().any(|p| disruptions_allowed(p) == Some(0));
        let pdb_blocked = ns_pdbs.iter().any(|p| {
            disruptions_allowed(p) == Some(0)
                && p.spec
                    .as_ref()
                    .and_then(|s| s.selector.as_ref())
                    .map(|sel| selector_matches(sel, labels))
                    .unwrap_or(false)
        });

        // Annotation override wins over the class-derived penalty.
        let outage_penalty = match annotations.get(features::ANNOTATION_OUTAGE_PENALTY) {
            Some(v) => parse_hours(v),
            None => adjust_outage_penalty(
                base_outage_penalty(priority_class),
                restricted,
                rs_count,
                stateful,
            ),
        };

        let startup_time = annotations
            .get(features::ANNOTATION_STARTUP_TIME)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .unwrap_or_else(|| observed_startup_secs(pod));

        Some(PodFacts {
            name,
            namespace: namespace.clone(),
            node_name,
            priority_score: priority,
            outage_penalty_hours: outage_penalty,
            startup_time_secs: startup_time,
            cpu_weight: pod_cpu_weight(spec),
            critical_annotation: annotations
                .get(features::ANNOTATION_CRITICAL)
                .map(|v| v == "true")
                .unwrap_or(false),
            graceful_only: annotations
                .get(features::ANNOTATION_MIGRATION_STRATEGY)
                .map(|v| v == "graceful-only")
                .unwrap_or(false),
            pdb_blocked,
            in_monitoring_namespace: namespace == self.monitoring_namespace,
        })
    }
}

fn disruptions_allowed(pdb: &PodDisruptionBudget) -> Option<i32> {
    pdb.status.as_ref().map(|s| s.disruptions_allowed)
}

/// Observed startup: PodReady transition minus pod start time. Pods without
/// both timestamps report the conservative default.
fn observed_startup_secs(pod: &Pod) -> f64 {
    let status = match pod.status.as_ref() {
        Some(s) => s,
        None => return features::DEFAULT_STARTUP_SECS,
    };
    let started = match status.start_time.as_ref() {
        Some(t) => t.0,
        None => return features::DEFAULT_STARTUP_SECS,
    };
    let ready = status
        .conditions
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|c| c.type_ == "Ready" && c.status == "True")
        .and_then(|c| c.last_transition_time.as_ref())
        .map(|t| t.0);

    match ready {
        Some(ready) if ready >= started => (ready - started).num_seconds() as f64,
        _ => features::DEFAULT_STARTUP_SECS,
    }
}

/// Aggregation weight: total CPU request in cores, floored at 1.0.
fn pod_cpu_weight(spec: &k8s_openapi::api::core::v1::PodSpec) -> f64 {
    let millicores: u64 = spec
        .containers
        .iter()
        .filter_map(|c| c.resources.as_ref())
        .filter_map(|r| r.requests.as_ref())
        .filter_map(|req| req.get("cpu"))
        .map(|q| parse_cpu_millicores(&q.0))
        .sum();
    (millicores as f64 / 1000.0).max(1.0)
}

/// Parse a CPU quantity string (e.g. "100m", "1", "500n") to millicores.
fn parse_cpu_millicores(quantity: &str) -> u64 {
    let quantity = quantity.trim();

    if let Some(val) = quantity.strip_suffix('n') {
        val.parse::<u64>().map(|n| n / 1_000_000).unwrap_or(0)
    } else if let Some(val) = quantity.strip_suffix('u') {
        val.parse::<u64>().map(|u| u / 1_000).unwrap_or(0)
    } else if let Some(val) = quantity.strip_suffix('m') {
        val.parse::<u64>().unwrap_or(0)
    } else {
        quantity
            .parse::<f64>()
            .map(|c| (c * 1000.0) as u64)
            .unwrap_or(0)
    }
}

/// Evaluate a label selector against pod labels: matchLabels plus the
/// In/NotIn/Exists/DoesNotExist expression operators.
fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (k, v) in match_labels {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
    }
    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let value = labels.get(&expr.key);
            let wanted = expr.values.as_deref().unwrap_or_default();
            let ok = match expr.operator.as_str() {
                "In" => value.map(|v| wanted.iter().any(|w| w == v)).unwrap_or(false),
                "NotIn" => value.map(|v| !wanted.iter().any(|w| w == v)).unwrap_or(true),
                "Exists" => value.is_some(),
                "DoesNotExist" => value.is_none(),
                _ => false,
            };
            if !ok {
                return false;
            }
        }
    }
    true
}
