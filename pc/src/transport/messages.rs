//! Message types for the transport layer

use serde::{Deserialize, Serialize};

/// World rank of a process
pub type Rank = usize;

/// Message-matching namespace
pub type Context = u32;

/// Identifier of a communicator; each one owns two contexts
pub type CommId = u32;

/// A payload in flight between two ranks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub source: Rank,
    pub context: Context,
    pub payload: serde_json::Value,
}

/// Context used for point-to-point traffic on a communicator
pub fn p2p_context(id: CommId) -> Context {
    id * 2
}

/// Context used for collective traffic on a communicator
pub fn collective_context(id: CommId) -> Context {
    id * 2 + 1
}
