//! Deterministic policy: risk bands, workload capping, out-of-distribution
//! handling, and the economic test.
//!
//! When runtime config selects this policy it replaces the policy model's
//! action outright, with confidence forced to 1.0. Every decision carries a
//! reason code so operators can audit the ladder from metrics alone.

use crate::config::{DeterministicPolicyConfig, OodBuckets};
use crate::model::types::{Action, NodeState};

/// Outcome of the rule ladder for one node.
#[derive(Debug, Clone, PartialEq)]
pub struct DeterministicDecision {
    pub action: Action,
    /// Stable reason code for the decision_reason metric.
    pub reason: &'static str,
    /// The cap that applied after clamping to the configured ratio bounds.
    pub effective_cap: f64,
    /// Any workload feature fell outside its configured bucket.
    pub ood: bool,
}

/// Run the decision ladder. `min_ratio`/`max_ratio` are the configured spot
/// ratio bounds the workload cap is clamped into.
pub fn decide(
    state: &NodeState,
    capacity_score: f64,
    runtime_score: f64,
    config: &DeterministicPolicyConfig,
    min_ratio: f64,
    max_ratio: f64,
) -> DeterministicDecision {
    let composite_risk = capacity_score.max(runtime_score);
    let cap = workload_spot_cap(state);
    let effective_cap = cap.clamp(min_ratio, max_ratio);
    let ood = is_out_of_distribution(state, &config.ood_buckets);

    let decision = |action, reason| DeterministicDecision {
        action,
        reason,
        effective_cap,
        ood,
    };

    // 1. Emergency bands trump everything.
    if composite_risk >= config.emergency_threshold {
        return decision(Action::EmergencyExit, "emergency_risk");
    }
    if runtime_score >= config.runtime_emergency_threshold {
        return decision(Action::EmergencyExit, "runtime_emergency");
    }

    // 2-3. Graded de-risking.
    if composite_risk >= config.high_threshold {
        return decision(Action::Decrease30, "high_risk_decrease30");
    }
    if composite_risk >= config.medium_threshold {
        return decision(Action::Decrease10, "medium_risk_decrease10");
    }

    // 4. The workload cap is a ceiling, not a target.
    if state.current_spot_ratio >= effective_cap {
        return decision(Action::Hold, "cap_reached");
    }

    // 5. Out of distribution: only the conservative economic step.
    if ood && config.ood_mode_conservative {
        if passes_economic_test(
            state,
            config.ood_min_savings_ratio,
            config.ood_max_payback_hours,
        ) {
            return decision(Action::Increase10, "ood_conservative_increase10");
        }
        return decision(Action::Hold, "ood_conservative_hold");
    }

    // 6. In-distribution economics.
    if passes_economic_test(state, config.min_savings_ratio, config.max_payback_hours) {
        if effective_cap - state.current_spot_ratio >= 0.25 {
            return decision(Action::Increase30, "economic_increase30");
        }
        return decision(Action::Increase10, "economic_increase10");
    }

    // 7. Nothing compelling either way.
    decision(Action::Hold, "default_hold")
}

/// Maximum spot ratio appropriate for this workload: the minimum over
/// independently applied rules. 1.0 when nothing objects.
pub fn workload_spot_cap(state: &NodeState) -> f64 {
    let mut cap: f64 = 1.0;

    let priority = state.priority_score;
    if priority >= 0.90 {
        cap = cap.min(0.20);
    } else if priority >= 0.70 {
        cap = cap.min(0.50);
    } else if priority >= 0.45 {
        cap = cap.min(0.80);
    }

    let outage = state.outage_penalty_hours;
    if outage >= 96.0 {
        cap = cap.min(0.10);
    } else if outage >= 48.0 {
        cap = cap.min(0.20);
    } else if outage >= 24.0 {
        cap = cap.min(0.30);
    } else if outage >= 10.0 {
        cap = cap.min(0.50);
    }

    let startup = state.startup_time_secs;
    if startup >= 600.0 {
        cap = cap.min(0.20);
    } else if startup >= 300.0 {
        cap = cap.min(0.30);
    } else if startup >= 120.0 {
        cap = cap.min(0.50);
    }

    let cost = state.migration_cost_usd;
    if cost >= 8.0 {
        cap = cap.min(0.20);
    } else if cost >= 5.0 {
        cap = cap.min(0.30);
    } else if cost >= 2.0 {
        cap = cap.min(0.60);
    }

    if state.cluster_utilization >= 0.95 {
        cap = cap.min(0.70);
    }

    cap
}

/// Any workload feature outside its configured bucket flags the state.
pub fn is_out_of_distribution(state: &NodeState, buckets: &OodBuckets) -> bool {
    let outside = |value: f64, (lo, hi): (f64, f64)| value < lo || value > hi;
    outside(state.startup_time_secs, buckets.startup_time_secs)
        || outside(state.outage_penalty_hours, buckets.outage_penalty_hours)
        || outside(state.priority_score, buckets.priority_score)
        || outside(state.cluster_utilization, buckets.cluster_utilization)
}

/// Economic test: savings worth having and a migration that pays for itself
/// quickly enough.
fn passes_economic_test(state: &NodeState, min_savings_ratio: f64, max_payback_hours: f64) -> bool {
    let od = state.on_demand_price;
    let spread = od - state.spot_price;
    if od <= 0.0 || spread <= 0.0 {
        return false;
    }
    let savings_ratio = spread / od;
    let payback_hours = state.migration_cost_usd / spread;
    savings_ratio >= min_savings_ratio && payback_hours <= max_payback_hours
}
