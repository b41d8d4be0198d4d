//! Communicator views over a transport endpoint

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};

use super::messages::{CommId, Context, Rank, collective_context, p2p_context};
use super::{Transport, TransportError};

/// Reduction operator for scalar collectives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
}

impl ReduceOp {
    /// Combine two partial results
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Max => a.max(b),
            ReduceOp::Min => a.min(b),
        }
    }
}

/// A group of ranks that can talk to each other
///
/// Ranks passed to and returned from a `Comm` are ranks *within the group*
/// (0..size); the group root is rank 0. A process that is not a member holds
/// a null view: [`Comm::active`] is false, collectives return immediately and
/// point-to-point calls fail with [`TransportError::Inactive`].
///
/// Collectives are linear through the root and fold contributions in group
/// rank order, so a reduction gives the same bits on every run.
#[derive(Clone)]
pub struct Comm {
    transport: Arc<dyn Transport>,
    id: CommId,
    members: Arc<[Rank]>,
    rank: Option<usize>,
}

impl fmt::Debug for Comm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Comm")
            .field("id", &self.id)
            .field("world_rank", &self.transport.rank())
            .field("rank", &self.rank)
            .field("size", &self.members.len())
            .finish()
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Value, TransportError> {
    serde_json::to_value(value).map_err(TransportError::Encode)
}

fn decode<T: DeserializeOwned>(rank: Rank, payload: Value) -> Result<T, TransportError> {
    serde_json::from_value(payload).map_err(|source| TransportError::Decode { rank, source })
}

impl Comm {
    /// Communicator spanning every rank of the transport
    pub fn world(transport: Arc<dyn Transport>) -> Self {
        let members: Arc<[Rank]> = (0..transport.size()).collect();
        let rank = Some(transport.rank());
        Self {
            transport,
            id: 0,
            members,
            rank,
        }
    }

    /// Communicator over an explicit list of world ranks
    ///
    /// The position of a world rank in `members` is its rank in the group.
    pub fn group(transport: Arc<dyn Transport>, id: CommId, members: Vec<Rank>) -> Self {
        let rank = members.iter().position(|&r| r == transport.rank());
        debug!(id, world_rank = transport.rank(), ?rank, size = members.len(), "Comm::group: called");
        Self {
            transport,
            id,
            members: members.into(),
            rank,
        }
    }

    /// Communicator over `members` sharing this communicator's endpoint
    pub fn subgroup(&self, id: CommId, members: Vec<Rank>) -> Self {
        Self::group(self.transport.clone(), id, members)
    }

    /// Whether the calling process belongs to this group
    pub fn active(&self) -> bool {
        self.rank.is_some()
    }

    /// Rank of the calling process within the group, if a member
    pub fn rank(&self) -> Option<usize> {
        self.rank
    }

    /// Number of ranks in the group
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Whether the calling process is the group root
    pub fn is_root(&self) -> bool {
        self.rank == Some(0)
    }

    /// World rank of the calling process
    pub fn world_rank(&self) -> Rank {
        self.transport.rank()
    }

    /// World ranks of the group, in group rank order
    pub fn members(&self) -> &[Rank] {
        &self.members
    }

    /// Communicator identifier
    pub fn id(&self) -> CommId {
        self.id
    }

    /// Log a message once per group, from the root
    pub fn message(&self, msg: &str) {
        if self.is_root() {
            info!(comm = self.id, "{}", msg);
        }
    }

    fn check_rank(&self, rank: usize) -> Result<(), TransportError> {
        if rank < self.members.len() {
            Ok(())
        } else {
            Err(TransportError::InvalidRank {
                rank,
                size: self.members.len(),
            })
        }
    }

    fn me(&self) -> Result<usize, TransportError> {
        self.rank.ok_or(TransportError::Inactive {
            rank: self.transport.rank(),
        })
    }

    async fn send_raw(&self, dest: usize, context: Context, payload: Value) -> Result<(), TransportError> {
        self.check_rank(dest)?;
        self.transport.send(self.members[dest], context, payload).await
    }

    async fn recv_raw<T: DeserializeOwned>(&self, source: usize, context: Context) -> Result<T, TransportError> {
        self.check_rank(source)?;
        let world_source = self.members[source];
        let payload = self.transport.recv(world_source, context).await?;
        decode(world_source, payload)
    }

    /// Send a value to `dest`
    pub async fn send<T>(&self, dest: usize, value: &T) -> Result<(), TransportError>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.me()?;
        let payload = encode(value)?;
        self.send_raw(dest, p2p_context(self.id), payload).await
    }

    /// Receive a value from `source`
    pub async fn recv<T: DeserializeOwned>(&self, source: usize) -> Result<T, TransportError> {
        self.me()?;
        self.recv_raw(source, p2p_context(self.id)).await
    }

    /// Move `buf` from `source` to `dest`
    ///
    /// On `source` the buffer is sent, on `dest` it is overwritten with what
    /// was received; every other rank does nothing. When `source == dest` the
    /// data is already in place and nothing moves.
    pub async fn send_and_recv<T>(&self, buf: &mut T, dest: usize, source: usize) -> Result<(), TransportError>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
    {
        if source == dest {
            return Ok(());
        }
        let Some(me) = self.rank else {
            return Ok(());
        };

        if me == source {
            self.send(dest, &*buf).await?;
        } else if me == dest {
            *buf = self.recv(source).await?;
        }
        Ok(())
    }

    /// Copy `value` from `root` to every member
    pub async fn broadcast<T>(&self, value: &mut T, root: usize) -> Result<(), TransportError>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
    {
        let Some(me) = self.rank else {
            return Ok(());
        };
        self.check_rank(root)?;
        let context = collective_context(self.id);

        if me == root {
            let payload = encode(&*value)?;
            for rank in (0..self.size()).filter(|&r| r != root) {
                self.send_raw(rank, context, payload.clone()).await?;
            }
        } else {
            *value = self.recv_raw(root, context).await?;
        }
        Ok(())
    }

    /// Collect one value per member on `root`, in group rank order
    pub async fn gather<T>(&self, value: T, root: usize) -> Result<Option<Vec<T>>, TransportError>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
    {
        let Some(me) = self.rank else {
            return Ok(None);
        };
        self.check_rank(root)?;
        let context = collective_context(self.id);

        if me != root {
            self.send_raw(root, context, encode(&value)?).await?;
            return Ok(None);
        }

        let mut values = Vec::with_capacity(self.size());
        let mut own = Some(value);
        for rank in 0..self.size() {
            if rank == me {
                values.extend(own.take());
            } else {
                values.push(self.recv_raw(rank, context).await?);
            }
        }
        Ok(Some(values))
    }

    /// Collect one value per member on every member
    ///
    /// A non-member gets an empty list.
    pub async fn allgather<T>(&self, value: T) -> Result<Vec<T>, TransportError>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
    {
        if !self.active() {
            return Ok(Vec::new());
        }
        let mut gathered = self.gather(value, 0).await?;
        self.broadcast(&mut gathered, 0).await?;
        gathered.ok_or_else(|| TransportError::Protocol("allgather delivered no values".to_string()))
    }

    /// Fold every member's value with `op` onto `root`
    ///
    /// Returns `Some` on the root only.
    pub async fn reduce_with<T, F>(&self, local: T, root: usize, op: F) -> Result<Option<T>, TransportError>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: Fn(T, T) -> T + Send,
    {
        let gathered = self.gather(local, root).await?;
        Ok(gathered.and_then(|values| values.into_iter().reduce(op)))
    }

    /// Reduce a scalar onto `root`
    pub async fn reduce(&self, local: f64, op: ReduceOp, root: usize) -> Result<Option<f64>, TransportError> {
        self.reduce_with(local, root, |a, b| op.apply(a, b)).await
    }

    /// Fold every member's value with `op` and hand the result to every member
    ///
    /// A non-member gets its own value back.
    pub async fn allreduce_with<T, F>(&self, local: T, op: F) -> Result<T, TransportError>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: Fn(T, T) -> T + Send,
    {
        if !self.active() {
            return Ok(local);
        }
        let mut reduced = self.reduce_with(local, 0, op).await?;
        self.broadcast(&mut reduced, 0).await?;
        reduced.ok_or_else(|| TransportError::Protocol("allreduce delivered no value".to_string()))
    }

    /// All-reduce a scalar
    pub async fn allreduce(&self, local: f64, op: ReduceOp) -> Result<f64, TransportError> {
        self.allreduce_with(local, |a, b| op.apply(a, b)).await
    }

    /// Block until every member has reached the barrier
    pub async fn barrier(&self) -> Result<(), TransportError> {
        // a unit payload would encode as null and read back as a missing value
        self.allreduce_with(0u8, |a, _| a).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use crate::transport::testing::world;

    #[test]
    fn test_reduce_op_apply() {
        assert_eq!(ReduceOp::Sum.apply(1.0, 2.0), 3.0);
        assert_eq!(ReduceOp::Max.apply(1.0, 2.0), 2.0);
        assert_eq!(ReduceOp::Min.apply(1.0, 2.0), 1.0);
    }

    #[tokio::test]
    async fn test_group_membership() {
        let mesh = ChannelTransport::mesh(4);
        let transport: Arc<dyn Transport> = Arc::new(mesh.into_iter().nth(2).unwrap());

        let heat = Comm::group(transport.clone(), 2, vec![2, 3]);
        assert!(heat.active());
        assert!(heat.is_root());
        assert_eq!(heat.rank(), Some(0));
        assert_eq!(heat.size(), 2);
        assert_eq!(heat.members(), &[2, 3]);

        let field = Comm::group(transport, 1, vec![0, 1]);
        assert!(!field.active());
        assert_eq!(field.rank(), None);
    }

    #[tokio::test]
    async fn test_inactive_comm_is_noop_for_collectives() {
        let mesh = ChannelTransport::mesh(2);
        let transport: Arc<dyn Transport> = Arc::new(mesh.into_iter().next().unwrap());
        let other = Comm::group(transport, 1, vec![1]);

        let mut value = 5.0;
        other.broadcast(&mut value, 0).await.unwrap();
        other.barrier().await.unwrap();
        assert_eq!(value, 5.0);
        assert_eq!(other.allreduce(3.0, ReduceOp::Sum).await.unwrap(), 3.0);
        assert!(other.allgather(1u32).await.unwrap().is_empty());
        assert!(matches!(
            other.send(0, &1.0).await.unwrap_err(),
            TransportError::Inactive { rank: 0 }
        ));
    }

    #[tokio::test]
    async fn test_send_and_recv() {
        let results = world(3, |comm| async move {
            let mut buf = vec![comm.world_rank() as f64; 2];
            comm.send_and_recv(&mut buf, 0, 2).await.unwrap();
            buf
        })
        .await;

        assert_eq!(results[0], vec![2.0, 2.0]);
        assert_eq!(results[1], vec![1.0, 1.0]);
        assert_eq!(results[2], vec![2.0, 2.0]);
    }

    #[tokio::test]
    async fn test_send_and_recv_same_rank_is_noop() {
        let results = world(2, |comm| async move {
            let mut buf = comm.world_rank();
            comm.send_and_recv(&mut buf, 1, 1).await.unwrap();
            buf
        })
        .await;

        assert_eq!(results, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_broadcast() {
        let results = world(4, |comm| async move {
            let mut value = if comm.rank() == Some(2) {
                vec![1.0, 2.0, 3.0]
            } else {
                Vec::new()
            };
            comm.broadcast(&mut value, 2).await.unwrap();
            value
        })
        .await;

        for value in results {
            assert_eq!(value, vec![1.0, 2.0, 3.0]);
        }
    }

    #[tokio::test]
    async fn test_reduce_only_on_root() {
        let results = world(4, |comm| async move {
            let local = comm.world_rank() as f64 + 1.0;
            comm.reduce(local, ReduceOp::Sum, 1).await.unwrap()
        })
        .await;

        assert_eq!(results, vec![None, Some(10.0), None, None]);
    }

    #[tokio::test]
    async fn test_allreduce_max_of_root_flags() {
        let results = world(5, |comm| async move {
            let mine: i64 = if comm.world_rank() == 3 { 3 } else { -1 };
            comm.allreduce_with(mine, i64::max).await.unwrap()
        })
        .await;

        assert!(results.iter().all(|&r| r == 3));
    }

    #[tokio::test]
    async fn test_allgather_in_rank_order() {
        let results = world(3, |comm| async move { comm.allgather(comm.world_rank() * 10).await.unwrap() }).await;

        for gathered in results {
            assert_eq!(gathered, vec![0, 10, 20]);
        }
    }

    #[tokio::test]
    async fn test_subgroup_collectives_do_not_cross_talk() {
        let results = world(4, |world| async move {
            let low = world.subgroup(1, vec![0, 1]);
            let high = world.subgroup(2, vec![2, 3]);

            let mut tag = world.world_rank() as f64;
            low.broadcast(&mut tag, 0).await.unwrap();
            high.broadcast(&mut tag, 1).await.unwrap();
            world.barrier().await.unwrap();
            tag
        })
        .await;

        assert_eq!(results, vec![0.0, 0.0, 3.0, 3.0]);
    }

    #[tokio::test]
    async fn test_barrier_completes() {
        let results = world(6, |comm| async move {
            for _ in 0..3 {
                comm.barrier().await.unwrap();
            }
            true
        })
        .await;

        assert_eq!(results.len(), 6);
    }
}
