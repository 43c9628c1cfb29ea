//! Tensor construction for the forecast and policy models.
//!
//! The normalization constants here must match training exactly; drift is a
//! silent correctness bug, which is why each divisor is a named constant
//! with a test pinning its value.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use ndarray::{Array2, Array3};

use super::types::NodeState;

/// Features per forecast timestep.
pub const FORECAST_FEATURES: usize = 10;
/// Flat policy input width.
pub const POLICY_FEATURES: usize = 13;

/// Window for the rolling price standard deviation.
pub const VOLATILITY_WINDOW: usize = 12;

// Policy input divisors, fixed at training time.
pub const PRICE_DIVISOR: f64 = 100.0;
pub const STARTUP_DIVISOR: f64 = 300.0;
pub const MIGRATION_COST_DIVISOR: f64 = 10.0;
pub const STEPS_DIVISOR: f64 = 100.0;
pub const OUTAGE_DIVISOR: f64 = 10.0;

/// Build the forecast input tensor, shape `[1, H, F]`.
///
/// History shorter than H is padded at the front with the current price;
/// longer history is truncated to its tail. Each timestep carries its own
/// calendar features, stepping back `step_secs` per row from `now`.
pub fn build_forecast_input(
    state: &NodeState,
    now: DateTime<Utc>,
    history_steps: usize,
    step_secs: u64,
) -> Array3<f32> {
    let h = history_steps;
    let current = state
        .price_history
        .last()
        .copied()
        .unwrap_or(state.spot_price);

    // Normalize history to exactly H points ending at the current price.
    let mut prices = Vec::with_capacity(h);
    if state.price_history.len() >= h {
        prices.extend_from_slice(&state.price_history[state.price_history.len() - h..]);
    } else {
        prices.resize(h - state.price_history.len(), current);
        prices.extend_from_slice(&state.price_history);
    }

    let mut input = Array3::<f32>::zeros((1, h, FORECAST_FEATURES));
    for t in 0..h {
        let ts = now - chrono::Duration::seconds(((h - 1 - t) as i64) * step_secs as i64);
        let lag1 = prices[t.saturating_sub(1)];
        let lag3 = prices[t.saturating_sub(3)];
        let window_start = t.saturating_sub(VOLATILITY_WINDOW - 1);
        let rolling_std = std_dev(&prices[window_start..=t]);

        let row = [
            prices[t] as f32,
            state.on_demand_price as f32,
            lag1 as f32,
            lag3 as f32,
            rolling_std as f32,
            ts.hour() as f32 / 24.0,
            ts.weekday().num_days_from_monday() as f32 / 7.0,
            if is_weekend(ts.weekday()) { 1.0 } else { 0.0 },
            t as f32 - (h as f32 - 1.0),
            h as f32,
        ];
        for (f, v) in row.into_iter().enumerate() {
            input[[0, t, f]] = v;
        }
    }
    input
}

/// Build the policy input tensor, shape `[1, 13]`.
pub fn build_policy_input(state: &NodeState, capacity_score: f64) -> Array2<f32> {
    let features = [
        state.spot_price / PRICE_DIVISOR,
        state.on_demand_price / PRICE_DIVISOR,
        price_volatility(&state.price_history),
        capacity_score,
        state.runtime_score,
        state.startup_time_secs / STARTUP_DIVISOR,
        state.migration_cost_usd / MIGRATION_COST_DIVISOR,
        state.cluster_utilization,
        state.time_since_migration_steps / STEPS_DIVISOR,
        state.outage_penalty_hours / OUTAGE_DIVISOR,
        if state.is_spot { 1.0 } else { 0.0 },
        state.current_spot_ratio,
        state.target_spot_ratio,
    ];

    Array2::from_shape_fn((1, POLICY_FEATURES), |(_, i)| features[i] as f32)
}

/// Rolling standard deviation of the most recent price window.
pub fn price_volatility(history: &[f64]) -> f64 {
    let start = history.len().saturating_sub(VOLATILITY_WINDOW);
    std_dev(&history[start..])
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

fn is_weekend(day: Weekday) -> bool {
    matches!(day, Weekday::Sat | Weekday::Sun)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_divisors_pinned_to_training() {
        assert_eq!(PRICE_DIVISOR, 100.0);
        assert_eq!(STARTUP_DIVISOR, 300.0);
        assert_eq!(MIGRATION_COST_DIVISOR, 10.0);
        assert_eq!(STEPS_DIVISOR, 100.0);
        assert_eq!(OUTAGE_DIVISOR, 10.0);
        assert_eq!(FORECAST_FEATURES, 10);
        assert_eq!(POLICY_FEATURES, 13);
    }

    #[test]
    fn test_forecast_shape_and_padding() {
        let state = NodeState {
            price_history: vec![0.5, 0.6],
            ..Default::default()
        };
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        let input = build_forecast_input(&state, now, 8, 300);
        assert_eq!(input.shape(), &[1, 8, FORECAST_FEATURES]);

        // The first 6 rows are padded with the current (last) price.
        assert_eq!(input[[0, 0, 0]], 0.6);
        assert_eq!(input[[0, 5, 0]], 0.6);
        // The real history occupies the tail.
        assert_eq!(input[[0, 6, 0]], 0.5);
        assert_eq!(input[[0, 7, 0]], 0.6);
    }

    #[test]
    fn test_forecast_truncates_to_tail() {
        let state = NodeState {
            price_history: (0..20).map(|i| i as f64).collect(),
            ..Default::default()
        };
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        let input = build_forecast_input(&state, now, 4, 300);
        assert_eq!(input[[0, 0, 0]], 16.0);
        assert_eq!(input[[0, 3, 0]], 19.0);
    }

    #[test]
    fn test_forecast_relative_index_and_encoder_len() {
        let state = NodeState::default();
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        let input = build_forecast_input(&state, now, 4, 300);
        // Relative time index runs -(H-1)..0.
        assert_eq!(input[[0, 0, 8]], -3.0);
        assert_eq!(input[[0, 3, 8]], 0.0);
        assert_eq!(input[[0, 0, 9]], 4.0);
    }

    #[test]
    fn test_weekend_flag() {
        let state = NodeState::default();
        // A Saturday noon.
        let now = Utc.with_ymd_and_hms(2025, 6, 7, 12, 0, 0).unwrap();
        let input = build_forecast_input(&state, now, 1, 300);
        assert_eq!(input[[0, 0, 7]], 1.0);
    }

    #[test]
    fn test_policy_input_normalization() {
        let state = NodeState {
            spot_price: 50.0,
            on_demand_price: 100.0,
            startup_time_secs: 150.0,
            migration_cost_usd: 5.0,
            time_since_migration_steps: 50.0,
            outage_penalty_hours: 5.0,
            is_spot: true,
            current_spot_ratio: 0.3,
            target_spot_ratio: 0.6,
            runtime_score: 0.25,
            cluster_utilization: 0.7,
            price_history: Vec::new(),
            ..Default::default()
        };
        let input = build_policy_input(&state, 0.4);
        assert_eq!(input.shape(), &[1, POLICY_FEATURES]);
        assert_eq!(input[[0, 0]], 0.5); // spot / 100
        assert_eq!(input[[0, 1]], 1.0); // od / 100
        assert_eq!(input[[0, 3]], 0.4); // capacity score raw
        assert_eq!(input[[0, 4]], 0.25); // runtime score raw
        assert_eq!(input[[0, 5]], 0.5); // startup / 300
        assert_eq!(input[[0, 6]], 0.5); // migration cost / 10
        assert_eq!(input[[0, 8]], 0.5); // steps / 100
        assert_eq!(input[[0, 9]], 0.5); // outage / 10
        assert_eq!(input[[0, 10]], 1.0); // is_spot
        assert!((input[[0, 11]] - 0.3).abs() < 1e-6);
        assert!((input[[0, 12]] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_volatility_window() {
        let flat = vec![1.0; 40];
        assert_eq!(price_volatility(&flat), 0.0);

        // Early noise outside the window must not contribute.
        let mut history = vec![100.0, 0.0, 100.0, 0.0];
        history.extend(vec![1.0; VOLATILITY_WINDOW]);
        assert_eq!(price_volatility(&history), 0.0);
    }
}
