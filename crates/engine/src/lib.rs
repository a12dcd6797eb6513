//! Per-user polling and threshold detection engine.
//!
//! This crate contains the scheduler that polls every registered user at
//! their own cadence, the evaluator that turns snapshots into edge-triggered
//! notifications, and the seams (notifier gateway, persistence) that the
//! outer layers implement.

pub mod control;
pub mod evaluator;
pub mod gateway;
pub mod poller;
pub mod registry;
pub mod scheduler;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use control::*;
pub use evaluator::*;
pub use gateway::*;
pub use poller::*;
pub use registry::*;
pub use scheduler::*;
pub use store::*;
