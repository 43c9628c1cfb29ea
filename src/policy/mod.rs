//! Rule-based decision policy.
//!
//! Shares the `(state, capacity_score, runtime_score) -> Action` contract
//! with the learned policy so the reconciler can swap between them from
//! runtime config without touching anything else.

pub mod deterministic;

pub use deterministic::{decide, DeterministicDecision};
