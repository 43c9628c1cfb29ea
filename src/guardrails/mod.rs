//! Multi-layer guardrails applied to every proposed action.
//!
//! The chain runs in a fixed order and accumulates: once a guardrail
//! downgrades an action, every later guardrail sees the downgraded action.
//! Outcomes never raise; each carries enough for logging and metrics to
//! reconstruct what would have happened without the rail.

use crate::model::types::{Action, NodeState};
use crate::workload::NodeWorkloadFlags;

pub const GUARDRAIL_CLUSTER_FRACTION: &str = "cluster_fraction";
pub const GUARDRAIL_LOW_CONFIDENCE: &str = "low_confidence";
pub const GUARDRAIL_PDB: &str = "pdb";
pub const GUARDRAIL_CRITICAL_WORKLOAD: &str = "critical_workload";
pub const GUARDRAIL_HIGH_UTILIZATION: &str = "high_utilization";

/// Cluster-level facts the rails evaluate against.
#[derive(Debug, Clone)]
pub struct GuardrailContext {
    /// Spot nodes currently in the cluster.
    pub spot_node_count: usize,
    /// `1/spot_nodes` above this blocks (default 0.20, i.e. fewer than 5
    /// spot nodes means one drain moves too much of the fleet).
    pub cluster_fraction_limit: f64,
    pub confidence_threshold: f64,
}

/// Verdict for one `(node, action)` proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardrailOutcome {
    pub approved: bool,
    /// The action after any downgrades; meaningless when not approved.
    pub modified_action: Action,
    pub reason: String,
    /// Which rail decided, empty for a clean approval.
    pub guardrail: &'static str,
}

impl GuardrailOutcome {
    fn approve(action: Action) -> Self {
        Self {
            approved: true,
            modified_action: action,
            reason: String::new(),
            guardrail: "",
        }
    }

    fn block(action: Action, guardrail: &'static str, reason: String) -> Self {
        Self {
            approved: false,
            modified_action: action,
            reason,
            guardrail,
        }
    }

    fn downgrade(action: Action, guardrail: &'static str, reason: String) -> Self {
        Self {
            approved: true,
            modified_action: action,
            reason,
            guardrail,
        }
    }

    /// Whether any rail touched the proposal.
    pub fn modified(&self) -> bool {
        !self.guardrail.is_empty()
    }
}

/// Run the full chain over a proposed action.
pub fn evaluate(
    action: Action,
    confidence: f64,
    state: &NodeState,
    flags: &NodeWorkloadFlags,
    ctx: &GuardrailContext,
) -> GuardrailOutcome {
    // HOLD is free: nothing to protect against.
    if action == Action::Hold {
        return GuardrailOutcome::approve(action);
    }

    // 1. Cluster fraction: a single node must not be too large a share of
    // the spot fleet.
    if ctx.spot_node_count == 0
        || 1.0 / ctx.spot_node_count as f64 > ctx.cluster_fraction_limit
    {
        return GuardrailOutcome::block(
            action,
            GUARDRAIL_CLUSTER_FRACTION,
            format!(
                "one node is >{:.0}% of a {}-node spot fleet",
                ctx.cluster_fraction_limit * 100.0,
                ctx.spot_node_count
            ),
        );
    }

    // 2. Confidence floor.
    if confidence < ctx.confidence_threshold {
        return GuardrailOutcome::block(
            action,
            GUARDRAIL_LOW_CONFIDENCE,
            format!(
                "confidence {:.2} below threshold {:.2}",
                confidence, ctx.confidence_threshold
            ),
        );
    }

    let mut current = action;
    let mut verdict: Option<GuardrailOutcome> = None;

    // 3. PDB: an emergency exit would breach a zero-disruption budget, so
    // soften it and let the ordinary drain path negotiate with the budget.
    if current == Action::EmergencyExit && flags.has_pdb_blocked_pod {
        current = Action::Decrease30;
        verdict = Some(GuardrailOutcome::downgrade(
            current,
            GUARDRAIL_PDB,
            "node hosts a pod with disruptionsAllowed=0".to_string(),
        ));
    }

    // 4. Critical workload: same downgrade for annotated-critical or
    // graceful-only pods. Sees the action as rail 3 left it.
    if current == Action::EmergencyExit
        && (flags.has_critical_pod || flags.has_graceful_only_pod)
    {
        current = Action::Decrease30;
        verdict = Some(GuardrailOutcome::downgrade(
            current,
            GUARDRAIL_CRITICAL_WORKLOAD,
            "node hosts critical or graceful-only pods".to_string(),
        ));
    }

    // 5. High utilization: above 0.85 emergencies soften; above 0.95 any
    // capacity-removing action is blocked outright.
    let utilization = state.cluster_utilization;
    if utilization > 0.85 {
        if current == Action::EmergencyExit {
            current = Action::Decrease30;
            verdict = Some(GuardrailOutcome::downgrade(
                current,
                GUARDRAIL_HIGH_UTILIZATION,
                format!("cluster at {:.0}% utilization, emergency softened", utilization * 100.0),
            ));
        }
        if utilization > 0.95 && current.is_decrease() {
            return GuardrailOutcome::block(
                current,
                GUARDRAIL_HIGH_UTILIZATION,
                format!(
                    "cluster at {:.0}% utilization, refusing to remove capacity",
                    utilization * 100.0
                ),
            );
        }
    }

    verdict.unwrap_or_else(|| GuardrailOutcome::approve(current))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> GuardrailContext {
        GuardrailContext {
            spot_node_count: 10,
            cluster_fraction_limit: 0.2,
            confidence_threshold: 0.5,
        }
    }

    fn state() -> NodeState {
        NodeState::default()
    }

    fn flags() -> NodeWorkloadFlags {
        NodeWorkloadFlags::default()
    }

    #[test]
    fn test_hold_skips_all_rails() {
        let mut c = ctx();
        c.spot_node_count = 0; // would block anything else
        let outcome = evaluate(Action::Hold, 0.0, &state(), &flags(), &c);
        assert!(outcome.approved);
        assert!(!outcome.modified());
    }

    #[test]
    fn test_cluster_fraction_blocks_small_fleets() {
        let mut c = ctx();
        c.spot_node_count = 4; // 1/4 = 0.25 > 0.20
        let outcome = evaluate(Action::Decrease10, 0.9, &state(), &flags(), &c);
        assert!(!outcome.approved);
        assert_eq!(outcome.guardrail, GUARDRAIL_CLUSTER_FRACTION);

        c.spot_node_count = 5; // 1/5 = 0.20, not above the limit
        let outcome = evaluate(Action::Decrease10, 0.9, &state(), &flags(), &c);
        assert!(outcome.approved);
    }

    #[test]
    fn test_low_confidence_blocks() {
        let outcome = evaluate(Action::Decrease30, 0.4, &state(), &flags(), &ctx());
        assert!(!outcome.approved);
        assert_eq!(outcome.guardrail, GUARDRAIL_LOW_CONFIDENCE);
    }

    #[test]
    fn test_pdb_downgrades_emergency() {
        // EMERGENCY_EXIT against a disruptionsAllowed=0 PDB
        // becomes DECREASE_30 with the pdb rail named.
        let mut f = flags();
        f.has_pdb_blocked_pod = true;
        let outcome = evaluate(Action::EmergencyExit, 0.9, &state(), &f, &ctx());
        assert!(outcome.approved);
        assert_eq!(outcome.modified_action, Action::Decrease30);
        assert_eq!(outcome.guardrail, GUARDRAIL_PDB);
    }

    #[test]
    fn test_pdb_leaves_plain_decrease_alone() {
        let mut f = flags();
        f.has_pdb_blocked_pod = true;
        let outcome = evaluate(Action::Decrease30, 0.9, &state(), &f, &ctx());
        assert!(outcome.approved);
        assert!(!outcome.modified());
    }

    #[test]
    fn test_critical_workload_downgrades_emergency() {
        let mut f = flags();
        f.has_graceful_only_pod = true;
        let outcome = evaluate(Action::EmergencyExit, 0.9, &state(), &f, &ctx());
        assert!(outcome.approved);
        assert_eq!(outcome.modified_action, Action::Decrease30);
        assert_eq!(outcome.guardrail, GUARDRAIL_CRITICAL_WORKLOAD);
    }

    #[test]
    fn test_high_utilization_softens_emergency() {
        let mut s = state();
        s.cluster_utilization = 0.9;
        let outcome = evaluate(Action::EmergencyExit, 0.9, &s, &flags(), &ctx());
        assert!(outcome.approved);
        assert_eq!(outcome.modified_action, Action::Decrease30);
        assert_eq!(outcome.guardrail, GUARDRAIL_HIGH_UTILIZATION);
    }

    #[test]
    fn test_extreme_utilization_blocks_decreases() {
        let mut s = state();
        s.cluster_utilization = 0.96;
        for action in [Action::Decrease10, Action::Decrease30, Action::EmergencyExit] {
            let outcome = evaluate(action, 0.9, &s, &flags(), &ctx());
            assert!(!outcome.approved, "{:?} should be blocked", action);
            assert_eq!(outcome.guardrail, GUARDRAIL_HIGH_UTILIZATION);
        }
        // Increases add capacity and pass.
        let outcome = evaluate(Action::Increase10, 0.9, &s, &flags(), &ctx());
        assert!(outcome.approved);
    }

    #[test]
    fn test_later_rails_see_downgraded_action() {
        // PDB downgrades to DECREASE_30 first; at >0.95 utilization the
        // downgraded action is then blocked by the utilization rail.
        let mut f = flags();
        f.has_pdb_blocked_pod = true;
        let mut s = state();
        s.cluster_utilization = 0.96;
        let outcome = evaluate(Action::EmergencyExit, 0.9, &s, &f, &ctx());
        assert!(!outcome.approved);
        assert_eq!(outcome.guardrail, GUARDRAIL_HIGH_UTILIZATION);
        assert_eq!(outcome.modified_action, Action::Decrease30);
    }
}
