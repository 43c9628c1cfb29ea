//! The drain sequence: cordon the node, evict its pods through the policy
//! eviction subresource, and report exactly what happened.
//!
//! Evictions respect PodDisruptionBudgets by construction: the API server
//! answers 429 when a budget would be violated, and unless `force` is set
//! the drain aborts right there. DaemonSet-owned and mirror pods are never
//! touched, and nothing is ever force-deleted.

use futures_util::stream::{self, StreamExt};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use std::time::{Duration, Instant};

use super::DrainError;
use crate::config::DrainConfig;

/// Mirror (static) pods carry this annotation and cannot be evicted.
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// What happened to one pod during eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvictOutcome {
    Evicted,
    /// 404: already gone, which is what a drain wants anyway.
    AlreadyGone,
    /// 429: a disruption budget blocked the eviction.
    PdbBlocked,
    Failed,
}

/// Result of draining one node.
#[derive(Debug, Clone)]
pub struct DrainOutcome {
    pub node: String,
    pub success: bool,
    pub pods_evicted: usize,
    pub pods_skipped: usize,
    pub pods_failed: usize,
    pub failed_pod_names: Vec<String>,
    pub duration: Duration,
}

/// Cordons and evicts. One instance serves the whole process.
pub struct Drainer {
    client: Client,
    config: DrainConfig,
    dry_run: bool,
}

impl Drainer {
    pub fn new(client: Client, config: DrainConfig, dry_run: bool) -> Self {
        Self {
            client,
            config,
            dry_run,
        }
    }

    /// Mark a node unschedulable. Idempotent: cordoning a cordoned node is
    /// a no-op on the server side.
    pub async fn cordon(&self, node_name: &str) -> Result<(), DrainError> {
        if self.dry_run {
            log::info!("[dry-run] would cordon {}", node_name);
            return Ok(());
        }
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes
            .patch(
                node_name,
                &PatchParams::default(),
                &Patch::Merge(json!({ "spec": { "unschedulable": true } })),
            )
            .await?;
        log::info!("Cordoned {}", node_name);
        Ok(())
    }

    /// Reverse a cordon after a failed or abandoned drain.
    pub async fn uncordon(&self, node_name: &str) -> Result<(), DrainError> {
        if self.dry_run {
            log::info!("[dry-run] would uncordon {}", node_name);
            return Ok(());
        }
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes
            .patch(
                node_name,
                &PatchParams::default(),
                &Patch::Merge(json!({ "spec": { "unschedulable": false } })),
            )
            .await?;
        log::info!("Uncordoned {}", node_name);
        Ok(())
    }

    /// Cordon, evict every evictable pod, and summarize. `force` decides
    /// whether a PDB violation aborts the drain or is recorded and skipped.
    pub async fn drain(&self, node_name: &str) -> Result<DrainOutcome, DrainError> {
        let started = Instant::now();
        self.cordon(node_name).await?;

        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={}", node_name));
        let pod_list = pods.list(&params).await?;

        let mut evictable = Vec::new();
        let mut skipped = 0usize;
        for pod in pod_list.items {
            if should_skip_pod(&pod) {
                skipped += 1;
                continue;
            }
            let name = pod.metadata.name.clone().unwrap_or_default();
            let namespace = pod
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string());
            evictable.push((namespace, name));
        }

        if self.dry_run {
            log::info!(
                "[dry-run] would evict {} pods from {} ({} skipped)",
                evictable.len(),
                node_name,
                skipped
            );
            return Ok(DrainOutcome {
                node: node_name.to_string(),
                success: true,
                pods_evicted: evictable.len(),
                pods_skipped: skipped,
                pods_failed: 0,
                failed_pod_names: Vec::new(),
                duration: started.elapsed(),
            });
        }

        let mut evicted = 0usize;
        let mut failed_pods = Vec::new();

        let mut evictions = stream::iter(evictable.into_iter().map(|(namespace, name)| {
            let client = self.client.clone();
            let grace = self.config.grace_period_secs;
            async move {
                let outcome = evict_pod(client, &namespace, &name, grace).await;
                (namespace, name, outcome)
            }
        }))
        .buffer_unordered(self.config.eviction_concurrency.max(1));

        while let Some((namespace, name, outcome)) = evictions.next().await {
            match outcome {
                EvictOutcome::Evicted | EvictOutcome::AlreadyGone => evicted += 1,
                EvictOutcome::PdbBlocked => {
                    if !self.config.force {
                        // Dropping the stream abandons evictions not yet
                        // started; the node stays cordoned for the retry.
                        drop(evictions);
                        return Err(DrainError::PdbViolation {
                            node: node_name.to_string(),
                            pod: format!("{}/{}", namespace, name),
                        });
                    }
                    log::warn!(
                        "PDB blocked eviction of {}/{}, continuing (force)",
                        namespace,
                        name
                    );
                    failed_pods.push(format!("{}/{}", namespace, name));
                }
                EvictOutcome::Failed => {
                    failed_pods.push(format!("{}/{}", namespace, name));
                }
            }
        }

        let outcome = DrainOutcome {
            node: node_name.to_string(),
            success: failed_pods.is_empty(),
            pods_evicted: evicted,
            pods_skipped: skipped,
            pods_failed: failed_pods.len(),
            failed_pod_names: failed_pods,
            duration: started.elapsed(),
        };
        log::info!(
            "Drained {}: evicted={} skipped={} failed={} in {:?}",
            node_name,
            outcome.pods_evicted,
            outcome.pods_skipped,
            outcome.pods_failed,
            outcome.duration
        );
        Ok(outcome)
    }
}

async fn evict_pod(client: Client, namespace: &str, name: &str, grace_secs: i64) -> EvictOutcome {
    let pods: Api<Pod> = Api::namespaced(client, namespace);
    let params = EvictParams {
        delete_options: Some(DeleteParams {
            grace_period_seconds: Some(grace_secs.max(0) as u32),
            ..Default::default()
        }),
        ..Default::default()
    };

    match pods.evict(name, &params).await {
        Ok(_) => EvictOutcome::Evicted,
        Err(e) => {
            let outcome = classify_eviction_error(&e);
            if outcome == EvictOutcome::Failed {
                log::warn!("Eviction of {}/{} failed: {}", namespace, name, e);
            }
            outcome
        }
    }
}

fn classify_eviction_error(error: &kube::Error) -> EvictOutcome {
    match error {
        kube::Error::Api(e) if e.code == 404 => EvictOutcome::AlreadyGone,
        kube::Error::Api(e) if e.code == 429 => EvictOutcome::PdbBlocked,
        _ => EvictOutcome::Failed,
    }
}

/// DaemonSet pods reschedule onto the same node and mirror pods belong to
/// the kubelet; evicting either is pointless or impossible.
fn should_skip_pod(pod: &Pod) -> bool {
    let daemonset_owned = pod
        .metadata
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|owner| owner.kind == "DaemonSet");

    let mirror = pod
        .metadata
        .annotations
        .as_ref()
        .map(|a| a.contains_key(MIRROR_POD_ANNOTATION))
        .unwrap_or(false);

    daemonset_owned || mirror
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    fn pod_with_owner(kind: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("p".to_string()),
                owner_references: Some(vec![OwnerReference {
                    kind: kind.to_string(),
                    name: "owner".to_string(),
                    api_version: "apps/v1".to_string(),
                    uid: "uid".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_skip_daemonset_pods() {
        assert!(should_skip_pod(&pod_with_owner("DaemonSet")));
        assert!(!should_skip_pod(&pod_with_owner("ReplicaSet")));
    }

    #[test]
    fn test_skip_mirror_pods() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("kube-apiserver".to_string()),
                annotations: Some(
                    [(MIRROR_POD_ANNOTATION.to_string(), "hash".to_string())].into(),
                ),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(should_skip_pod(&pod));
    }

    #[test]
    fn test_plain_pod_is_evictable() {
        assert!(!should_skip_pod(&Pod::default()));
    }

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: String::new(),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn test_eviction_error_classification() {
        // 404 counts as success: the pod is gone either way.
        assert_eq!(
            classify_eviction_error(&api_error(404)),
            EvictOutcome::AlreadyGone
        );
        assert_eq!(
            classify_eviction_error(&api_error(429)),
            EvictOutcome::PdbBlocked
        );
        assert_eq!(classify_eviction_error(&api_error(500)), EvictOutcome::Failed);
    }
}
