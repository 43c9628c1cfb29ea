//! # SpotVortex Agent
//!
//! A Kubernetes control-plane agent that continuously rebalances cluster
//! compute between preemptible ("spot") and guaranteed ("on-demand")
//! instance pools. Per workload pool it forecasts near-term interruption
//! risk, chooses a target spot:on-demand ratio, and executes the choice
//! safely: steering provisioner weights, scaling sibling capacity groups,
//! and draining risky nodes without violating disruption contracts.
//!
//! ## Architecture
//!
//! The per-tick pipeline turns (node metrics, price history, workload
//! features, cluster topology) into (per-pool action, per-node drain plan,
//! provisioner mutations):
//!
//! ```text
//! telemetry + workload ─> features ─> inference ─> policy ─> assessments
//!   ─> filters ─> drain budget ─> weight steering ─> drains ─> metrics
//! ```
//!
//! The capacity router dispatches per-node operations to the provisioner
//! backend that owns the node (Karpenter, Cluster Autoscaler, or Managed
//! Nodegroup).

pub mod capacity;
pub mod cli;
pub mod config;
pub mod controller;
pub mod drain;
pub mod error;
pub mod guardrails;
pub mod model;
pub mod node;
pub mod observability;
pub mod policy;
pub mod telemetry;
pub mod workload;

pub use error::{AgentError, Result};

/// The current version of the agent.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
