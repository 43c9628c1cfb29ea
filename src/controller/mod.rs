//! The reconciliation controller and its supporting state.

pub mod marks;
pub mod planner;
pub mod pool_state;
pub mod reconciler;
pub mod savings;

pub use pool_state::PoolStateStore;
pub use reconciler::{Reconciler, TickSummary};
pub use savings::SavingsReporter;
