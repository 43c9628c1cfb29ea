//! Metrics for every decision, guardrail hit, and action outcome.
//!
//! One naming scheme, registered once at startup, emitted through thin
//! helpers so call sites stay greppable. Suppressed and overridden actions
//! always leave a counter behind — operators must be able to audit what the
//! agent would have done and why it did not.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

use crate::model::types::{Action, DecisionSource};

// Pool-level gauges.
pub const GAUGE_CAPACITY_SCORE: &str = "spotvortex_capacity_score";
pub const GAUGE_RUNTIME_SCORE: &str = "spotvortex_runtime_score";
pub const GAUGE_CURRENT_SPOT_RATIO: &str = "spotvortex_current_spot_ratio";
pub const GAUGE_TARGET_SPOT_RATIO: &str = "spotvortex_target_spot_ratio";
pub const GAUGE_WORKLOAD_CAP: &str = "spotvortex_workload_spot_cap";
pub const GAUGE_OOD: &str = "spotvortex_out_of_distribution";

// Decision and outcome counters.
pub const COUNTER_ACTION_TAKEN: &str = "spotvortex_action_taken_total";
pub const COUNTER_GUARDRAIL_BLOCKED: &str = "spotvortex_guardrail_blocked_total";
pub const COUNTER_DECISION_SOURCE: &str = "spotvortex_decision_source_total";
pub const COUNTER_UNSUPPORTED_FAMILY: &str = "spotvortex_unsupported_instance_family_total";
pub const COUNTER_DETERMINISTIC_REASON: &str = "spotvortex_deterministic_decision_reason_total";
pub const COUNTER_OUTAGES_AVOIDED: &str = "spotvortex_outages_avoided_total";
pub const COUNTER_DRAIN_FAILED: &str = "spotvortex_drain_failed_total";
pub const COUNTER_TICK_SKIPPED: &str = "spotvortex_tick_skipped_total";

// Savings reporting.
pub const COUNTER_DRY_RUN_SAVINGS_USD: &str = "spotvortex_dry_run_cumulative_savings_usd";
pub const GAUGE_POTENTIAL_SAVINGS_HOURLY: &str = "spotvortex_potential_savings_hourly_usd";
pub const GAUGE_POTENTIAL_SAVINGS_MONTHLY: &str = "spotvortex_potential_savings_monthly_usd";
pub const GAUGE_RECOMMENDED_ACTION: &str = "spotvortex_recommended_action";
pub const GAUGE_OPTIMIZABLE_OD_NODES: &str = "spotvortex_optimizable_od_nodes";

// Tick timing.
pub const HISTOGRAM_TICK_DURATION: &str = "spotvortex_reconcile_duration_seconds";

/// Install the Prometheus exporter and register metric descriptions.
/// Called once from startup; a second call would fail, which is fine — two
/// recorders is a bug worth crashing on.
pub fn install(listen_addr: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    describe_all();
    log::info!("Metrics exporter listening on {}", addr);
    Ok(())
}

fn describe_all() {
    describe_gauge!(GAUGE_CAPACITY_SCORE, "Forecast capacity risk score per pool");
    describe_gauge!(GAUGE_RUNTIME_SCORE, "Forecast runtime risk score per pool");
    describe_gauge!(GAUGE_CURRENT_SPOT_RATIO, "Observed spot ratio per pool");
    describe_gauge!(GAUGE_TARGET_SPOT_RATIO, "Target spot ratio per pool");
    describe_gauge!(GAUGE_WORKLOAD_CAP, "Workload-derived spot ratio cap per pool");
    describe_gauge!(GAUGE_OOD, "1 when any workload feature is out of distribution");
    describe_counter!(COUNTER_ACTION_TAKEN, "Actions executed, by action");
    describe_counter!(COUNTER_GUARDRAIL_BLOCKED, "Actions blocked or downgraded, by guardrail");
    describe_counter!(COUNTER_DECISION_SOURCE, "Decisions made, by source and action");
    describe_counter!(
        COUNTER_UNSUPPORTED_FAMILY,
        "Nodes forced to emergency exit for an unsupported instance family"
    );
    describe_counter!(
        COUNTER_DETERMINISTIC_REASON,
        "Deterministic policy decisions, by reason code"
    );
    describe_counter!(COUNTER_OUTAGES_AVOIDED, "Risky spot nodes drained before interruption");
    describe_counter!(COUNTER_DRAIN_FAILED, "Drain attempts that failed");
    describe_counter!(COUNTER_TICK_SKIPPED, "Ticks skipped, by cause");
    describe_counter!(
        COUNTER_DRY_RUN_SAVINGS_USD,
        "Cumulative potential savings observed in shadow mode, USD"
    );
    describe_gauge!(GAUGE_POTENTIAL_SAVINGS_HOURLY, "Potential hourly savings per pool, USD");
    describe_gauge!(GAUGE_POTENTIAL_SAVINGS_MONTHLY, "Potential monthly savings per pool, USD");
    describe_gauge!(GAUGE_RECOMMENDED_ACTION, "Recommended action index per node");
    describe_gauge!(GAUGE_OPTIMIZABLE_OD_NODES, "On-demand nodes cheaper on spot, per pool");
    describe_histogram!(HISTOGRAM_TICK_DURATION, "Wall-clock seconds per reconcile tick");
}

pub fn record_pool_scores(pool: &str, capacity: f64, runtime: f64) {
    metrics::gauge!(GAUGE_CAPACITY_SCORE, capacity, "pool" => pool.to_string());
    metrics::gauge!(GAUGE_RUNTIME_SCORE, runtime, "pool" => pool.to_string());
}

pub fn record_pool_ratios(pool: &str, current: f64, target: f64) {
    metrics::gauge!(GAUGE_CURRENT_SPOT_RATIO, current, "pool" => pool.to_string());
    metrics::gauge!(GAUGE_TARGET_SPOT_RATIO, target, "pool" => pool.to_string());
}

pub fn record_workload_cap(pool: &str, cap: f64, ood: bool) {
    metrics::gauge!(GAUGE_WORKLOAD_CAP, cap, "pool" => pool.to_string());
    metrics::gauge!(GAUGE_OOD, if ood { 1.0 } else { 0.0 }, "pool" => pool.to_string());
}

pub fn record_action_taken(action: Action) {
    metrics::counter!(COUNTER_ACTION_TAKEN, 1, "action" => action.as_str());
}

pub fn record_guardrail(guardrail: &'static str) {
    metrics::counter!(COUNTER_GUARDRAIL_BLOCKED, 1, "guardrail" => guardrail);
}

pub fn record_decision(source: DecisionSource, action: Action) {
    metrics::counter!(
        COUNTER_DECISION_SOURCE, 1,
        "source" => source.as_str(),
        "action" => action.as_str()
    );
}

pub fn record_unsupported_family(family: &str) {
    metrics::counter!(COUNTER_UNSUPPORTED_FAMILY, 1, "family" => family.to_string());
}

pub fn record_deterministic_reason(reason: &'static str) {
    metrics::counter!(COUNTER_DETERMINISTIC_REASON, 1, "reason" => reason);
}

pub fn record_tick_skipped(cause: &'static str) {
    metrics::counter!(COUNTER_TICK_SKIPPED, 1, "cause" => cause);
}

pub fn record_drain_failed(node: &str) {
    metrics::counter!(COUNTER_DRAIN_FAILED, 1, "node" => node.to_string());
}

pub fn record_outage_avoided() {
    metrics::counter!(COUNTER_OUTAGES_AVOIDED, 1);
}

pub fn record_tick_duration(seconds: f64) {
    metrics::histogram!(HISTOGRAM_TICK_DURATION, seconds);
}
