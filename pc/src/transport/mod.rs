//! Message passing between ranks
//!
//! Every cross-process data movement in the coupling goes through this module.
//! Ranks exchange serialized payloads through a [`Transport`] endpoint; a
//! [`Comm`] is a view over the endpoint restricted to one group of ranks and
//! provides the point-to-point and collective primitives the engine uses:
//! - **send / recv / send_and_recv:** point-to-point transfer between two ranks
//! - **broadcast / reduce / allreduce / allgather:** group collectives rooted at one rank
//! - **barrier:** lock-step synchronization of a group

mod channel;
mod comm;
mod error;
mod messages;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use serde_json::Value;

pub use channel::ChannelTransport;
pub use comm::{Comm, ReduceOp};
pub use error::TransportError;
pub use messages::{CommId, Context, Envelope, Rank};

/// Point-to-point endpoint owned by one rank
///
/// Messages sent by one rank to another within the same context are received
/// in the order they were sent. A receive blocks until a matching message
/// arrives; messages for other (source, context) pairs are held back until
/// they are asked for.
#[async_trait]
pub trait Transport: Send + Sync {
    /// World rank of this endpoint
    fn rank(&self) -> Rank;

    /// Number of ranks in the world
    fn size(&self) -> usize;

    /// Deliver a payload to `dest` under `context`
    async fn send(&self, dest: Rank, context: Context, payload: Value) -> Result<(), TransportError>;

    /// Wait for the next payload from `source` under `context`
    async fn recv(&self, source: Rank, context: Context) -> Result<Value, TransportError>;
}
