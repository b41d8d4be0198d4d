//! Coupling error types

use thiserror::Error;

use crate::driver::{DriverError, ElementIndex, Position};
use crate::transport::{Rank, TransportError};

/// Errors that abort a coupled run
///
/// Every variant is fatal: ranks run in lock-step, so once one of them has
/// failed the others cannot make progress and nothing is retried.
#[derive(Debug, Error)]
pub enum CouplingError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Process pool of {pool} ranks is too small for {requested} requested ranks")]
    PoolTooSmall { pool: usize, requested: usize },

    #[error("Element {element} on rank {rank} at {position} does not lie in any field cell")]
    UnmappedElement {
        rank: Rank,
        element: ElementIndex,
        position: Position,
    },

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Rank {rank} stopped abnormally: {reason}")]
    Aborted { rank: Rank, reason: String },

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl CouplingError {
    /// Check if this error is raised while validating the run setup
    pub fn is_config(&self) -> bool {
        matches!(self, CouplingError::Config(_) | CouplingError::PoolTooSmall { .. })
    }
}

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, CouplingError>;
