//! Node labels, annotations, and taints the agent writes back.
//!
//! These marks are advisory breadcrumbs for operators and the scheduler:
//! the capacity score, a coarse market status, a risk label with its
//! reason, and the draining / prefer-spot taints. Everything is guarded by
//! the same mutability rules as drains and short-circuits in dry-run.

use k8s_openapi::api::core::v1::{Node, Taint};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;

use crate::drain::DrainError;
use crate::node;

/// Market status written to the node label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketStatus {
    Stable,
    Volatile,
    Draining,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Stable => "stable",
            MarketStatus::Volatile => "volatile",
            MarketStatus::Draining => "draining",
        }
    }

    /// Coarse status from the capacity score for nodes not being drained.
    pub fn from_score(capacity_score: f64) -> Self {
        if capacity_score >= 0.5 {
            MarketStatus::Volatile
        } else {
            MarketStatus::Stable
        }
    }
}

/// Writes node marks.
pub struct NodeMarker {
    client: Client,
    dry_run: bool,
}

impl NodeMarker {
    pub fn new(client: Client, dry_run: bool) -> Self {
        Self { client, dry_run }
    }

    /// Label the node with its score and status, and when `risk_reason` is
    /// set, the high-risk label plus its reason annotation.
    pub async fn apply_assessment_marks(
        &self,
        node_name: &str,
        capacity_score: f64,
        status: MarketStatus,
        risk_reason: Option<&str>,
    ) -> Result<(), DrainError> {
        let score_label = format!("{:.2}", capacity_score);
        if self.dry_run {
            log::info!(
                "[dry-run] would label {} capacity-score={} market-status={}",
                node_name,
                score_label,
                status.as_str()
            );
            return Ok(());
        }

        let (risk, reason) = match risk_reason {
            Some(reason) => ("high", Some(reason.to_string())),
            None => ("low", None),
        };

        let patch = json!({
            "metadata": {
                "labels": {
                    node::LABEL_CAPACITY_SCORE: score_label,
                    node::LABEL_MARKET_STATUS: status.as_str(),
                    node::LABEL_RISK: risk,
                },
                "annotations": {
                    node::ANNOTATION_RISK_REASON: reason,
                }
            }
        });

        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes
            .patch(node_name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    /// Add the draining taint ahead of eviction so nothing new schedules
    /// while pods move.
    pub async fn taint_draining(&self, node_name: &str, no_execute: bool) -> Result<(), DrainError> {
        let effect = if no_execute { "NoExecute" } else { "NoSchedule" };
        self.add_taint(node_name, node::TAINT_DRAINING, effect).await
    }

    /// Hint the scheduler away from an on-demand node whose pool is being
    /// steered toward spot.
    pub async fn taint_prefer_spot(&self, node_name: &str) -> Result<(), DrainError> {
        self.add_taint(node_name, node::TAINT_PREFER_SPOT, "PreferNoSchedule")
            .await
    }

    /// Taints are a whole-array field, so this is a read-modify-write:
    /// fetch, append if absent, patch the full list back.
    async fn add_taint(
        &self,
        node_name: &str,
        key: &str,
        effect: &str,
    ) -> Result<(), DrainError> {
        if self.dry_run {
            log::info!("[dry-run] would taint {} {}:{}", node_name, key, effect);
            return Ok(());
        }

        let nodes: Api<Node> = Api::all(self.client.clone());
        let current = nodes.get(node_name).await?;
        let mut taints = current
            .spec
            .as_ref()
            .and_then(|s| s.taints.clone())
            .unwrap_or_default();

        if taints.iter().any(|t| t.key == key && t.effect == effect) {
            return Ok(());
        }
        taints.push(Taint {
            key: key.to_string(),
            effect: effect.to_string(),
            value: Some("true".to_string()),
            time_added: None,
        });

        nodes
            .patch(
                node_name,
                &PatchParams::default(),
                &Patch::Merge(json!({ "spec": { "taints": taints } })),
            )
            .await?;
        log::debug!("Tainted {} with {}:{}", node_name, key, effect);
        Ok(())
    }
}
