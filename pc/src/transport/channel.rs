//! In-process transport built on tokio channels

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use super::messages::{Context, Envelope, Rank};
use super::{Transport, TransportError};

/// Receiving side of an endpoint
struct Inbox {
    rx: mpsc::UnboundedReceiver<Envelope>,

    /// Payloads that arrived before anyone asked for them, keyed by (source, context)
    stash: HashMap<(Rank, Context), VecDeque<Value>>,
}

/// Transport endpoint connected to every other rank through unbounded channels
///
/// Sends never block, so a rank can always post its data and move on to the
/// next receive; this mirrors eager point-to-point delivery.
pub struct ChannelTransport {
    rank: Rank,
    peers: Vec<mpsc::UnboundedSender<Envelope>>,
    inbox: Mutex<Inbox>,
}

impl ChannelTransport {
    /// Create `size` fully connected endpoints, one per rank
    pub fn mesh(size: usize) -> Vec<Self> {
        debug!(size, "ChannelTransport::mesh: called");
        let (txs, rxs): (Vec<_>, Vec<_>) = (0..size).map(|_| mpsc::unbounded_channel()).unzip();

        rxs.into_iter()
            .enumerate()
            .map(|(rank, rx)| Self {
                rank,
                peers: txs.clone(),
                inbox: Mutex::new(Inbox {
                    rx,
                    stash: HashMap::new(),
                }),
            })
            .collect()
    }

    fn check_rank(&self, rank: Rank) -> Result<(), TransportError> {
        if rank < self.peers.len() {
            Ok(())
        } else {
            Err(TransportError::InvalidRank {
                rank,
                size: self.peers.len(),
            })
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    async fn send(&self, dest: Rank, context: Context, payload: Value) -> Result<(), TransportError> {
        self.check_rank(dest)?;
        self.peers[dest]
            .send(Envelope {
                source: self.rank,
                context,
                payload,
            })
            .map_err(|_| TransportError::Disconnected { rank: dest })
    }

    async fn recv(&self, source: Rank, context: Context) -> Result<Value, TransportError> {
        self.check_rank(source)?;
        let mut guard = self.inbox.lock().await;
        let inbox = &mut *guard;

        if let Some(payload) = inbox.stash.get_mut(&(source, context)).and_then(VecDeque::pop_front) {
            return Ok(payload);
        }

        loop {
            let envelope = inbox
                .rx
                .recv()
                .await
                .ok_or(TransportError::Disconnected { rank: source })?;

            if envelope.source == source && envelope.context == context {
                return Ok(envelope.payload);
            }

            debug!(
                rank = self.rank,
                from = envelope.source,
                context = envelope.context,
                "ChannelTransport::recv: stashing out-of-order message"
            );
            inbox
                .stash
                .entry((envelope.source, envelope.context))
                .or_default()
                .push_back(envelope.payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mesh_ranks() {
        let mesh = ChannelTransport::mesh(3);

        assert_eq!(mesh.len(), 3);
        for (i, endpoint) in mesh.iter().enumerate() {
            assert_eq!(endpoint.rank(), i);
            assert_eq!(endpoint.size(), 3);
        }
    }

    #[tokio::test]
    async fn test_send_recv_roundtrip() {
        let mesh = ChannelTransport::mesh(2);

        mesh[0].send(1, 0, json!({"t": 300.0})).await.unwrap();
        let payload = mesh[1].recv(0, 0).await.unwrap();

        assert_eq!(payload["t"], 300.0);
    }

    #[tokio::test]
    async fn test_out_of_order_messages_are_stashed() {
        let mesh = ChannelTransport::mesh(3);

        mesh[0].send(2, 1, json!("from 0 on context 1")).await.unwrap();
        mesh[1].send(2, 0, json!("from 1 on context 0")).await.unwrap();
        mesh[0].send(2, 0, json!("from 0 on context 0")).await.unwrap();

        assert_eq!(mesh[2].recv(0, 0).await.unwrap(), json!("from 0 on context 0"));
        assert_eq!(mesh[2].recv(1, 0).await.unwrap(), json!("from 1 on context 0"));
        assert_eq!(mesh[2].recv(0, 1).await.unwrap(), json!("from 0 on context 1"));
    }

    #[tokio::test]
    async fn test_messages_are_non_overtaking() {
        let mesh = ChannelTransport::mesh(2);

        for i in 0..5 {
            mesh[0].send(1, 0, json!(i)).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(mesh[1].recv(0, 0).await.unwrap(), json!(i));
        }
    }

    #[tokio::test]
    async fn test_invalid_rank() {
        let mesh = ChannelTransport::mesh(2);

        let err = mesh[0].send(5, 0, json!(null)).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidRank { rank: 5, size: 2 }));
    }

    #[tokio::test]
    async fn test_send_to_dropped_peer() {
        let mut mesh = ChannelTransport::mesh(2);
        let survivor = mesh.remove(0);
        drop(mesh);

        let err = survivor.send(1, 0, json!(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::Disconnected { rank: 1 }));
    }
}
