//! Transport error types

use thiserror::Error;

use super::Rank;

/// Errors that can occur while moving data between ranks
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Rank {rank} is outside a communicator of size {size}")]
    InvalidRank { rank: usize, size: usize },

    #[error("Rank {rank} is not a member of this communicator")]
    Inactive { rank: Rank },

    #[error("Channel to rank {rank} closed")]
    Disconnected { rank: Rank },

    #[error("Failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode payload from rank {rank}")]
    Decode {
        rank: Rank,
        #[source]
        source: serde_json::Error,
    },

    #[error("Collective protocol error: {0}")]
    Protocol(String),
}
