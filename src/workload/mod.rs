//! Workload feature collection.
//!
//! Walks pods, PodDisruptionBudgets, and replica owners to produce the
//! per-pool workload features inference consumes and the per-node safety
//! flags the guardrails consume. A single P0 pod must not dominate the
//! pool averages but must trip the safety maxima, so both a CPU-weighted
//! mean and a true max are kept for every feature.

pub mod collector;
pub mod features;

pub use collector::{CollectorError, WorkloadCollector};
pub use features::{
    parse_hours, NodeWorkloadFlags, PodFacts, WorkloadFeatures, WorkloadSnapshot,
};
