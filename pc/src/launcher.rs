//! Spawns one task per rank and wires them into a world

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::driver::{FieldDriver, HeatFluidsDriver, create_field_driver, create_heat_driver};
use crate::engine::{CouplingEngine, RunSummary};
use crate::error::{CouplingError, Result};
use crate::topology::{Partition, Topology};
use crate::transport::{ChannelTransport, Comm, Rank};

/// The two drivers a rank runs
pub type Drivers = (Box<dyn FieldDriver>, Box<dyn HeatFluidsDriver>);

/// Run `rank_main` on every rank of an in-process world of `size` ranks
///
/// Results come back in rank order. The first rank to fail (or panic) takes
/// the whole world down: every other rank task is aborted and that failure
/// is returned.
pub async fn run_world<F, Fut, T>(size: usize, rank_main: F) -> Result<Vec<T>>
where
    F: Fn(Comm) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    debug!(size, "run_world: called");
    let mut set = JoinSet::new();
    let mut task_ranks = std::collections::HashMap::new();
    for endpoint in ChannelTransport::mesh(size) {
        let world = Comm::world(Arc::new(endpoint));
        let rank = world.world_rank();
        let fut = rank_main(world);
        let handle = set.spawn(async move { (rank, fut.await) });
        task_ranks.insert(handle.id(), rank);
    }

    let mut results: Vec<(Rank, T)> = Vec::with_capacity(size);
    while let Some(joined) = set.join_next_with_id().await {
        match joined {
            Ok((_, (rank, Ok(value)))) => {
                debug!(rank, "run_world: rank finished");
                results.push((rank, value));
            }
            Ok((_, (rank, Err(e)))) => {
                error!(rank, error = %e, "Rank failed, aborting world");
                set.abort_all();
                return Err(e);
            }
            Err(join_error) => {
                let rank = task_ranks.get(&join_error.id()).copied().unwrap_or(usize::MAX);
                error!(rank, error = %join_error, "Rank task stopped, aborting world");
                set.abort_all();
                return Err(CouplingError::Aborted {
                    rank,
                    reason: join_error.to_string(),
                });
            }
        }
    }

    results.sort_by_key(|(rank, _)| *rank);
    Ok(results.into_iter().map(|(_, value)| value).collect())
}

/// Run a coupled simulation with drivers built by `make_drivers`
///
/// `make_drivers` is called once per rank with that rank's topology. The
/// returned summary is the world root's.
pub async fn launch_with<F>(config: &Config, make_drivers: F) -> Result<RunSummary>
where
    F: Fn(&Topology) -> Result<Drivers> + Send + Sync + 'static,
{
    config.validate()?;
    let partition = Partition::new(config.pool_size(), config.field.ranks(), config.heat_fluids.ranks())?;
    let run_id = Uuid::now_v7();
    info!(
        %run_id,
        pool = partition.pool,
        field = partition.n_field,
        heat = partition.n_heat,
        idle = partition.idle_ranks().len(),
        "Launching coupled run"
    );

    let coupling = config.coupling.clone();
    let make_drivers = Arc::new(make_drivers);
    let summaries = run_world(partition.pool, move |world| {
        let coupling = coupling.clone();
        let make_drivers = make_drivers.clone();
        async move {
            let topology = Topology::build(world, partition.n_field, partition.n_heat).await?;
            let (field, heat) = make_drivers(&topology)?;
            CouplingEngine::new(coupling, topology, field, heat, run_id).run().await
        }
    })
    .await?;

    let summary = summaries
        .into_iter()
        .next()
        .ok_or_else(|| CouplingError::Invariant("world finished without ranks".to_string()))?;
    info!(
        %run_id,
        iterations = summary.total_iterations(),
        converged = summary.converged(),
        "Coupled run finished"
    );
    Ok(summary)
}

/// Run a coupled simulation with the drivers named in `config`
pub async fn launch(config: &Config) -> Result<RunSummary> {
    debug!("launch: called");
    let field_config = config.field.clone();
    let heat_config = config.heat_fluids.clone();
    launch_with(config, move |topology| {
        let field = create_field_driver(&field_config, topology.field.clone())?;
        let heat = create_heat_driver(&heat_config, topology.heat.clone())?;
        Ok((field, heat))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_world_returns_in_rank_order() {
        let results = run_world(4, |world| async move {
            let sum = world.allreduce(world.world_rank() as f64, crate::transport::ReduceOp::Sum).await?;
            Ok((world.world_rank(), sum))
        })
        .await
        .unwrap();

        assert_eq!(results, vec![(0, 6.0), (1, 6.0), (2, 6.0), (3, 6.0)]);
    }

    #[tokio::test]
    async fn test_failing_rank_aborts_blocked_ranks() {
        let result: Result<Vec<()>> = run_world(3, |world| async move {
            if world.world_rank() == 2 {
                return Err(CouplingError::Invariant("rank 2 gave up".to_string()));
            }
            // would block forever without rank 2
            world.barrier().await?;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(CouplingError::Invariant(msg)) if msg.contains("rank 2")));
    }

    #[tokio::test]
    async fn test_panicking_rank_aborts_world() {
        let result: Result<Vec<()>> = run_world(2, |world| async move {
            if world.world_rank() == 1 {
                panic!("solver crashed");
            }
            world.barrier().await?;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(CouplingError::Aborted { rank: 1, .. })));
    }
}
