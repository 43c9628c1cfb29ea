//! Core decision types shared by inference, the deterministic policy, and
//! the reconciler.

use serde::{Deserialize, Serialize};

/// Ratio adjustment chosen for a node. The Q-vector index order is fixed by
/// the exported policy model and must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Hold,
    Decrease10,
    Decrease30,
    Increase10,
    Increase30,
    EmergencyExit,
}

impl Action {
    /// Number of actions; the policy model's Q-vector length.
    pub const COUNT: usize = 6;

    /// Action for a Q-vector index.
    pub fn from_index(index: usize) -> Option<Action> {
        match index {
            0 => Some(Action::Hold),
            1 => Some(Action::Decrease10),
            2 => Some(Action::Decrease30),
            3 => Some(Action::Increase10),
            4 => Some(Action::Increase30),
            5 => Some(Action::EmergencyExit),
            _ => None,
        }
    }

    /// Target-ratio delta. EMERGENCY_EXIT has no delta; it forces the
    /// target down to the configured floor.
    pub fn ratio_delta(&self) -> f64 {
        match self {
            Action::Hold | Action::EmergencyExit => 0.0,
            Action::Decrease10 => -0.10,
            Action::Decrease30 => -0.30,
            Action::Increase10 => 0.10,
            Action::Increase30 => 0.30,
        }
    }

    /// Actions that grow the spot share.
    pub fn is_increase(&self) -> bool {
        matches!(self, Action::Increase10 | Action::Increase30)
    }

    /// Actions that shrink the spot share, including the emergency exit.
    pub fn is_decrease(&self) -> bool {
        matches!(
            self,
            Action::Decrease10 | Action::Decrease30 | Action::EmergencyExit
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Hold => "hold",
            Action::Decrease10 => "decrease_10",
            Action::Decrease30 => "decrease_30",
            Action::Increase10 => "increase_10",
            Action::Increase30 => "increase_30",
            Action::EmergencyExit => "emergency_exit",
        }
    }
}

/// Where a node's action came from, for the decision_source metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// Q-values from the RL policy model.
    Rl,
    /// The rule-based policy ladder.
    Deterministic,
    /// Instance family outside the model contract allowlist.
    UnsupportedFamily,
    /// Capacity score crossed the risk threshold after the policy ran.
    PrimeDirective,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionSource::Rl => "rl",
            DecisionSource::Deterministic => "deterministic",
            DecisionSource::UnsupportedFamily => "unsupported_family",
            DecisionSource::PrimeDirective => "prime_directive",
        }
    }
}

/// Per-node inference input, assembled fresh every tick.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub spot_price: f64,
    pub on_demand_price: f64,
    /// Recent spot prices, oldest first.
    pub price_history: Vec<f64>,
    pub cpu_utilization: f64,
    pub memory_utilization: f64,
    pub cluster_utilization: f64,
    pub is_spot: bool,
    pub startup_time_secs: f64,
    pub outage_penalty_hours: f64,
    pub migration_cost_usd: f64,
    pub time_since_migration_steps: f64,
    pub current_spot_ratio: f64,
    pub target_spot_ratio: f64,
    pub priority_score: f64,
    /// Filled by the forecast pass before the policy tensor is built.
    pub runtime_score: f64,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            spot_price: 0.1,
            on_demand_price: 0.3,
            price_history: Vec::new(),
            cpu_utilization: 0.5,
            memory_utilization: 0.5,
            cluster_utilization: 0.5,
            is_spot: false,
            startup_time_secs: 300.0,
            outage_penalty_hours: 5.0,
            migration_cost_usd: 1.0,
            time_since_migration_steps: 0.0,
            current_spot_ratio: 0.0,
            target_spot_ratio: 0.0,
            priority_score: 0.5,
            runtime_score: 0.0,
        }
    }
}

/// The outcome of assessing one node.
#[derive(Debug, Clone)]
pub struct NodeAssessment {
    pub node_name: String,
    pub action: Action,
    pub capacity_score: f64,
    pub runtime_score: f64,
    pub confidence: f64,
    pub source: DecisionSource,
}
