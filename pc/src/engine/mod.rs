//! Coupled Picard iteration engine
//!
//! One [`CouplingEngine`] runs on every rank of the world. The engine advances
//! all ranks in lock-step through initialization, the time-step loop and the
//! Picard loop nested inside it, moving data between the two solver groups
//! through [`crate::exchange::FieldExchange`].

mod core;
mod summary;

pub use core::{CouplingEngine, Phase};
pub use summary::{IterationRecord, RunSummary, TimestepSummary};
