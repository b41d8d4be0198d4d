//! Helpers for running a whole world inside one test

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use super::{ChannelTransport, Comm};

/// Run `f` on every rank of a fresh world and return results in rank order
///
/// Panics if the world has not finished after five seconds.
pub async fn world<F, Fut, T>(size: usize, f: F) -> Vec<T>
where
    F: Fn(Comm) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let mut set = JoinSet::new();
    for endpoint in ChannelTransport::mesh(size) {
        let comm = Comm::world(Arc::new(endpoint));
        let rank = comm.world_rank();
        let fut = f(comm);
        set.spawn(async move { (rank, fut.await) });
    }

    let mut results: Vec<(usize, T)> = Vec::new();
    while let Some(joined) = tokio::time::timeout(Duration::from_secs(5), set.join_next())
        .await
        .expect("world deadlocked")
    {
        results.push(joined.expect("rank panicked"));
    }
    results.sort_by_key(|(rank, _)| *rank);
    results.into_iter().map(|(_, value)| value).collect()
}
