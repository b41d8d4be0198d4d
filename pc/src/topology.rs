//! Partition of the process pool into the field and heat-fluids groups

use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CouplingError, Result};
use crate::transport::{Comm, CommId, Rank};

/// Identifier of the world communicator
pub const WORLD_COMM: CommId = 0;

/// Identifier of the field group communicator
pub const FIELD_COMM: CommId = 1;

/// Identifier of the heat-fluids group communicator
pub const HEAT_COMM: CommId = 2;

/// Assignment of world ranks to groups, computed without communication
///
/// The field group takes world ranks `[0, n_field)`, the heat-fluids group
/// the next `n_heat` ranks; anything left over belongs to neither group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Partition {
    pub pool: usize,
    pub n_field: usize,
    pub n_heat: usize,
}

impl Partition {
    pub fn new(pool: usize, n_field: usize, n_heat: usize) -> Result<Self> {
        debug!(pool, n_field, n_heat, "Partition::new: called");
        if n_field == 0 {
            return Err(CouplingError::Config("field group has no ranks".to_string()));
        }
        if n_heat == 0 {
            return Err(CouplingError::Config("heat-fluids group has no ranks".to_string()));
        }
        if n_field + n_heat > pool {
            return Err(CouplingError::PoolTooSmall {
                pool,
                requested: n_field + n_heat,
            });
        }
        Ok(Self { pool, n_field, n_heat })
    }

    pub fn field_ranks(&self) -> Range<Rank> {
        0..self.n_field
    }

    pub fn heat_ranks(&self) -> Range<Rank> {
        self.n_field..self.n_field + self.n_heat
    }

    /// Ranks that take part in world collectives only
    pub fn idle_ranks(&self) -> Range<Rank> {
        self.n_field + self.n_heat..self.pool
    }
}

/// One line of the communicator layout report
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LayoutRow {
    hostname: String,
    world: Rank,
    field: Option<usize>,
    heat: Option<usize>,
}

/// Communicators and rank bookkeeping seen by one process
#[derive(Debug, Clone)]
pub struct Topology {
    pub world: Comm,
    pub field: Comm,
    pub heat: Comm,
    field_root: Rank,
    heat_root: Rank,
    field_ranks: Vec<Rank>,
    heat_ranks: Vec<Rank>,
}

impl Topology {
    /// Split `world` into the two groups
    ///
    /// Collective over the world: every rank must call it with the same sizes.
    pub async fn build(world: Comm, n_field: usize, n_heat: usize) -> Result<Self> {
        debug!(world_rank = world.world_rank(), n_field, n_heat, "Topology::build: called");
        let partition = Partition::new(world.size(), n_field, n_heat)?;

        let field = world.subgroup(FIELD_COMM, partition.field_ranks().collect());
        let heat = world.subgroup(HEAT_COMM, partition.heat_ranks().collect());

        let field_root = find_root(&world, &field).await?;
        let heat_root = find_root(&world, &heat).await?;
        let field_ranks = gather_ranks(&world, &field).await?;
        let heat_ranks = gather_ranks(&world, &heat).await?;

        Ok(Self {
            world,
            field,
            heat,
            field_root,
            heat_root,
            field_ranks,
            heat_ranks,
        })
    }

    /// World rank of the field group root
    pub fn field_root(&self) -> Rank {
        self.field_root
    }

    /// World rank of the heat-fluids group root
    pub fn heat_root(&self) -> Rank {
        self.heat_root
    }

    /// World ranks of the field group, in group rank order
    pub fn field_ranks(&self) -> &[Rank] {
        &self.field_ranks
    }

    /// World ranks of the heat-fluids group, in group rank order
    pub fn heat_ranks(&self) -> &[Rank] {
        &self.heat_ranks
    }

    pub fn is_field(&self) -> bool {
        self.field.active()
    }

    pub fn is_heat(&self) -> bool {
        self.heat.active()
    }

    /// Log the communicator layout from the world root
    pub async fn report(&self) -> Result<()> {
        debug!(world_rank = self.world.world_rank(), "Topology::report: called");
        let row = LayoutRow {
            hostname: hostname(),
            world: self.world.world_rank(),
            field: self.field.rank(),
            heat: self.heat.rank(),
        };

        if let Some(rows) = self.world.gather(row, 0).await? {
            info!(
                "Communicator layout: field root {}, heat-fluids root {}",
                self.field_root, self.heat_root
            );
            info!("{:<24} {:>8} {:>8} {:>8}", "hostname", "world", "field", "heat");
            for row in rows {
                info!(
                    "{:<24} {:>8} {:>8} {:>8}",
                    row.hostname,
                    row.world,
                    format_rank(row.field),
                    format_rank(row.heat)
                );
            }
        }
        Ok(())
    }
}

/// World rank of the root of `group`, agreed on by every process
async fn find_root(world: &Comm, group: &Comm) -> Result<Rank> {
    let mine: i64 = if group.is_root() { world.world_rank() as i64 } else { -1 };
    let root = world.allreduce_with(mine, i64::max).await?;
    usize::try_from(root).map_err(|_| CouplingError::Invariant(format!("communicator {} has no root", group.id())))
}

/// World ranks of `group` in group rank order, known to every process
async fn gather_ranks(world: &Comm, group: &Comm) -> Result<Vec<Rank>> {
    let mine = group.rank().map(|rank| (rank, world.world_rank()));
    let mut members: Vec<(usize, Rank)> = world.allgather(mine).await?.into_iter().flatten().collect();
    members.sort_unstable();
    Ok(members.into_iter().map(|(_, world_rank)| world_rank).collect())
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn format_rank(rank: Option<usize>) -> String {
    rank.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::world;

    #[test]
    fn test_partition_ranges() {
        let partition = Partition::new(6, 2, 3).unwrap();

        assert_eq!(partition.field_ranks(), 0..2);
        assert_eq!(partition.heat_ranks(), 2..5);
        assert_eq!(partition.idle_ranks(), 5..6);
    }

    #[test]
    fn test_partition_rejects_small_pool() {
        let err = Partition::new(3, 2, 2).unwrap_err();
        assert!(matches!(err, CouplingError::PoolTooSmall { pool: 3, requested: 4 }));
    }

    #[test]
    fn test_partition_rejects_empty_group() {
        assert!(matches!(Partition::new(4, 0, 2), Err(CouplingError::Config(_))));
        assert!(matches!(Partition::new(4, 2, 0), Err(CouplingError::Config(_))));
    }

    #[tokio::test]
    async fn test_build_agrees_on_every_rank() {
        let results = world(5, |comm| async move {
            let topology = Topology::build(comm, 1, 3).await.unwrap();
            topology.report().await.unwrap();
            (
                topology.field_root(),
                topology.heat_root(),
                topology.field_ranks().to_vec(),
                topology.heat_ranks().to_vec(),
                topology.is_field(),
                topology.is_heat(),
            )
        })
        .await;

        for (rank, (field_root, heat_root, field_ranks, heat_ranks, is_field, is_heat)) in
            results.into_iter().enumerate()
        {
            assert_eq!(field_root, 0);
            assert_eq!(heat_root, 1);
            assert_eq!(field_ranks, vec![0]);
            assert_eq!(heat_ranks, vec![1, 2, 3]);
            assert_eq!(is_field, rank == 0);
            assert_eq!(is_heat, (1..4).contains(&rank));
        }
    }

    #[tokio::test]
    async fn test_build_fails_before_any_collective() {
        let results = world(2, |comm| async move { Topology::build(comm, 2, 1).await.map(|_| ()) }).await;

        for result in results {
            assert!(matches!(result, Err(CouplingError::PoolTooSmall { .. })));
        }
    }
}
