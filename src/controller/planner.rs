//! Pure planning stages of the tick: actionability filtering, executability
//! filtering, the drain budget, and swap direction tallies. Kept free of
//! I/O so every invariant here is testable with plain values.

use std::collections::HashMap;

use crate::capacity::SwapDirection;
use crate::model::types::{Action, DecisionSource, NodeAssessment};
use crate::node::NodeInfo;

/// Step 5: drop low-confidence assessments, apply the Prime-Directive
/// override, then drop the remaining HOLDs.
///
/// The override comes before the HOLD drop on purpose: a HOLD with a
/// capacity score past the risk threshold must leave the tick as an
/// emergency exit, not be filtered away.
pub fn filter_actionable(
    assessments: Vec<NodeAssessment>,
    confidence_threshold: f64,
    risk_threshold: f64,
) -> Vec<NodeAssessment> {
    assessments
        .into_iter()
        .filter(|a| a.confidence >= confidence_threshold)
        .map(|mut a| {
            if a.capacity_score > risk_threshold && a.action != Action::EmergencyExit {
                log::warn!(
                    "Prime Directive: {} capacity {:.2} > {:.2}, forcing emergency exit over {}",
                    a.node_name,
                    a.capacity_score,
                    risk_threshold,
                    a.action.as_str()
                );
                a.action = Action::EmergencyExit;
                a.source = DecisionSource::PrimeDirective;
            }
            a
        })
        .filter(|a| a.action != Action::Hold)
        .collect()
}

/// Step 6: keep only nodes the agent may mutate, moving in a direction that
/// makes sense for their capacity type. Increases drain on-demand nodes to
/// make room for spot; decreases and emergencies drain spot nodes.
pub fn filter_executable(
    assessments: Vec<NodeAssessment>,
    nodes: &HashMap<String, NodeInfo>,
) -> Vec<NodeAssessment> {
    assessments
        .into_iter()
        .filter(|a| {
            let Some(node) = nodes.get(&a.node_name) else {
                return false;
            };
            if !node.mutable() {
                return false;
            }
            if a.action.is_increase() && node.is_spot {
                return false;
            }
            if a.action.is_decrease() && !node.is_spot {
                return false;
            }
            true
        })
        .collect()
}

/// Step 7: order by urgency and truncate to the drain budget.
///
/// The global cap is `ceil(total * max_drain_ratio)`, at least 1; the
/// provisioner limit applies when non-negative (-1 means unconstrained).
pub fn plan_drain_budget(
    mut candidates: Vec<NodeAssessment>,
    total_nodes: usize,
    max_drain_ratio: f64,
    provisioner_limit: i64,
) -> Vec<NodeAssessment> {
    candidates.sort_by(|a, b| {
        let a_emergency = a.action == Action::EmergencyExit;
        let b_emergency = b.action == Action::EmergencyExit;
        b_emergency
            .cmp(&a_emergency)
            .then(
                b.capacity_score
                    .partial_cmp(&a.capacity_score)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    });

    let mut cap = ((total_nodes as f64 * max_drain_ratio).ceil() as usize).max(1);
    if provisioner_limit >= 0 {
        cap = cap.min(provisioner_limit as usize);
    }
    candidates.truncate(cap);
    candidates
}

/// Step 8 tally: which way a pool's weight steering should go given the
/// planned actions inside it. Ties go to on-demand, the safe side.
pub fn steer_direction(actions: &[Action]) -> SwapDirection {
    let favor_spot = actions.iter().filter(|a| a.is_increase()).count();
    let favor_od = actions.iter().filter(|a| a.is_decrease()).count();
    if favor_spot > favor_od {
        SwapDirection::ToSpot
    } else {
        SwapDirection::ToOnDemand
    }
}

/// Swap direction implied by a single node's action.
pub fn direction_for_action(action: Action) -> SwapDirection {
    if action.is_increase() {
        SwapDirection::ToSpot
    } else {
        SwapDirection::ToOnDemand
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assessment(name: &str, action: Action, capacity: f64, confidence: f64) -> NodeAssessment {
        NodeAssessment {
            node_name: name.to_string(),
            action,
            capacity_score: capacity,
            runtime_score: 0.0,
            confidence,
            source: DecisionSource::Rl,
        }
    }

    fn node(name: &str, is_spot: bool, managed: bool) -> NodeInfo {
        NodeInfo {
            name: name.to_string(),
            zone: "us-east-1a".to_string(),
            instance_type: "c6i.large".to_string(),
            is_spot,
            workload_pool: Some("api".to_string()),
            managed,
            control_plane: false,
            fake: false,
            provider_id: None,
        }
    }

    #[test]
    fn test_prime_directive_overrides_hold() {
        // Capacity 0.9 with HOLD at confidence 0.9 against a
        // 0.8 risk threshold must come out as an emergency exit.
        let result = filter_actionable(
            vec![assessment("n1", Action::Hold, 0.9, 0.9)],
            0.5,
            0.8,
        );
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].action, Action::EmergencyExit);
        assert_eq!(result[0].source, DecisionSource::PrimeDirective);
    }

    #[test]
    fn test_low_confidence_dropped_even_at_high_risk() {
        let result = filter_actionable(
            vec![assessment("n1", Action::EmergencyExit, 0.95, 0.1)],
            0.5,
            0.8,
        );
        assert!(result.is_empty());
    }

    #[test]
    fn test_plain_holds_dropped() {
        let result = filter_actionable(
            vec![assessment("n1", Action::Hold, 0.2, 0.9)],
            0.5,
            0.8,
        );
        assert!(result.is_empty());
    }

    #[test]
    fn test_executability_by_capacity_type() {
        let nodes: HashMap<String, NodeInfo> = [
            ("spot-1".to_string(), node("spot-1", true, true)),
            ("od-1".to_string(), node("od-1", false, true)),
        ]
        .into();

        // Increases only execute on on-demand nodes.
        let result = filter_executable(
            vec![
                assessment("spot-1", Action::Increase10, 0.1, 0.9),
                assessment("od-1", Action::Increase10, 0.1, 0.9),
            ],
            &nodes,
        );
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].node_name, "od-1");

        // Decreases only execute on spot nodes.
        let result = filter_executable(
            vec![
                assessment("spot-1", Action::EmergencyExit, 0.9, 0.9),
                assessment("od-1", Action::Decrease30, 0.9, 0.9),
            ],
            &nodes,
        );
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].node_name, "spot-1");
    }

    #[test]
    fn test_unmanaged_and_unknown_nodes_dropped() {
        let nodes: HashMap<String, NodeInfo> =
            [("unmanaged".to_string(), node("unmanaged", true, false))].into();
        let result = filter_executable(
            vec![
                assessment("unmanaged", Action::Decrease10, 0.5, 0.9),
                assessment("ghost", Action::Decrease10, 0.5, 0.9),
            ],
            &nodes,
        );
        assert!(result.is_empty());
    }

    #[test]
    fn test_control_plane_never_executable() {
        let mut cp = node("cp-1", true, true);
        cp.control_plane = true;
        let nodes: HashMap<String, NodeInfo> = [("cp-1".to_string(), cp)].into();
        let result = filter_executable(
            vec![assessment("cp-1", Action::EmergencyExit, 0.99, 1.0)],
            &nodes,
        );
        assert!(result.is_empty());
    }

    #[test]
    fn test_drain_budget_seed_scenario() {
        // 100 nodes, 20 at risk, one emergency at capacity 0.9,
        // max_drain_ratio 0.1: exactly 10 planned, the emergency first.
        let mut candidates = Vec::new();
        candidates.push(assessment("urgent", Action::EmergencyExit, 0.9, 1.0));
        for i in 0..19 {
            candidates.push(assessment(
                &format!("risky-{}", i),
                Action::Decrease30,
                0.5 + (i as f64) * 0.01,
                1.0,
            ));
        }

        let planned = plan_drain_budget(candidates, 100, 0.1, -1);
        assert_eq!(planned.len(), 10);
        assert_eq!(planned[0].node_name, "urgent");
        // The rest are the highest capacity scores, descending.
        assert_eq!(planned[1].node_name, "risky-18");
    }

    #[test]
    fn test_drain_budget_floor_of_one() {
        let candidates = vec![assessment("n1", Action::Decrease10, 0.5, 1.0)];
        let planned = plan_drain_budget(candidates, 3, 0.1, -1);
        assert_eq!(planned.len(), 1);
    }

    #[test]
    fn test_provisioner_limit_tightens_budget() {
        let candidates: Vec<NodeAssessment> = (0..10)
            .map(|i| assessment(&format!("n{}", i), Action::Decrease10, 0.5, 1.0))
            .collect();
        assert_eq!(plan_drain_budget(candidates.clone(), 100, 0.1, 3).len(), 3);
        // -1 means unconstrained.
        assert_eq!(plan_drain_budget(candidates.clone(), 100, 0.1, -1).len(), 10);
        // A zero limit silences the tick entirely.
        assert_eq!(plan_drain_budget(candidates, 100, 0.1, 0).len(), 0);
    }

    #[test]
    fn test_steer_direction_ties_go_od() {
        assert_eq!(
            steer_direction(&[Action::Increase10, Action::Decrease10]),
            SwapDirection::ToOnDemand
        );
        assert_eq!(
            steer_direction(&[Action::Increase10, Action::Increase30, Action::Decrease10]),
            SwapDirection::ToSpot
        );
        assert_eq!(
            steer_direction(&[Action::EmergencyExit]),
            SwapDirection::ToOnDemand
        );
    }

    #[test]
    fn test_direction_for_action() {
        assert_eq!(direction_for_action(Action::Increase30), SwapDirection::ToSpot);
        assert_eq!(direction_for_action(Action::EmergencyExit), SwapDirection::ToOnDemand);
    }
}
