//! Movement of per-cell fields between the two groups
//!
//! Three patterns are used by the engine:
//! - **push:** the field root computes a full-domain field that only it holds
//! - **pull:** every heat-fluids rank asks the field root for the values of its own cells
//! - **accumulate:** every heat-fluids rank's per-cell contribution reaches every field rank,
//!   which sums value times volume and volume per cell

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::driver::{CellHandle, FieldDriver};
use crate::error::{CouplingError, Result};
use crate::topology::Topology;

/// Per-cell values one heat-fluids rank sends to the field group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellContribution {
    pub cells: Vec<CellHandle>,
    pub values: Vec<f64>,
    pub volumes: Vec<f64>,

    /// Cells whose flag is false are left out of the sums
    pub mask: Option<Vec<bool>>,
}

impl CellContribution {
    fn check(&self) -> Result<()> {
        let n = self.cells.len();
        let mask_len = self.mask.as_ref().map_or(n, Vec::len);
        if self.values.len() != n || self.volumes.len() != n || mask_len != n {
            return Err(CouplingError::Invariant(format!(
                "contribution for {} cells carries {} values, {} volumes and {} mask flags",
                n,
                self.values.len(),
                self.volumes.len(),
                mask_len
            )));
        }
        Ok(())
    }

    fn included(&self, index: usize) -> bool {
        self.mask.as_ref().is_none_or(|mask| mask[index])
    }
}

/// Running sums for one cell
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Accumulated {
    /// Sum of value times volume
    pub weighted: f64,
    /// Sum of volume
    pub volume: f64,
}

impl Accumulated {
    pub fn average(&self) -> f64 {
        self.weighted / self.volume
    }
}

/// Exchange patterns over one topology
pub struct FieldExchange<'a> {
    topology: &'a Topology,
}

impl<'a> FieldExchange<'a> {
    pub fn new(topology: &'a Topology) -> Self {
        Self { topology }
    }

    /// Heat source of every cell, present on the field root only
    pub fn push_heat_source(&self, field: &dyn FieldDriver, power: f64) -> Result<BTreeMap<CellHandle, f64>> {
        if self.topology.world.world_rank() != self.topology.field_root() {
            return Ok(BTreeMap::new());
        }
        debug!(power, "FieldExchange::push_heat_source: called");
        Ok(field.heat_source(power)?)
    }

    /// Values of each heat-fluids rank's `cells`, evaluated on the field root
    ///
    /// Heat-fluids ranks are served in order. `lookup` only runs on the field
    /// root. Every rank outside the heat-fluids group gets an empty vector.
    pub async fn pull_from_field_root<F>(&self, cells: &[CellHandle], mut lookup: F) -> Result<Vec<f64>>
    where
        F: FnMut(CellHandle) -> Result<f64> + Send,
    {
        let world = &self.topology.world;
        let me = world.world_rank();
        let field_root = self.topology.field_root();
        debug!(world_rank = me, n_cells = cells.len(), "FieldExchange::pull_from_field_root: called");

        let mut received = Vec::new();
        for &heat_rank in self.topology.heat_ranks() {
            let mut request: Vec<CellHandle> = if me == heat_rank { cells.to_vec() } else { Vec::new() };
            world.send_and_recv(&mut request, field_root, heat_rank).await?;

            let mut values: Vec<f64> = Vec::new();
            if me == field_root {
                values = request.iter().map(|&cell| lookup(cell)).collect::<Result<_>>()?;
            }
            world.send_and_recv(&mut values, heat_rank, field_root).await?;

            if me == heat_rank {
                received = values;
            }
        }
        Ok(received)
    }

    /// Sum every heat-fluids rank's contribution on every field rank
    ///
    /// Ranks outside the heat-fluids group pass an empty contribution; ranks
    /// outside the field group get an empty map back.
    pub async fn accumulate(&self, local: &CellContribution) -> Result<BTreeMap<CellHandle, Accumulated>> {
        let world = &self.topology.world;
        let field = &self.topology.field;
        let me = world.world_rank();
        let field_root = self.topology.field_root();
        debug!(world_rank = me, n_cells = local.cells.len(), "FieldExchange::accumulate: called");

        let mut sums: BTreeMap<CellHandle, Accumulated> = BTreeMap::new();
        let mut buffer = CellContribution::default();
        for &heat_rank in self.topology.heat_ranks() {
            if me == heat_rank {
                local.check()?;
                buffer.clone_from(local);
            }
            world.send_and_recv(&mut buffer, field_root, heat_rank).await?;
            field.broadcast(&mut buffer, 0).await?;

            if field.active() {
                buffer.check()?;
                for (i, &cell) in buffer.cells.iter().enumerate() {
                    if buffer.included(i) {
                        let entry = sums.entry(cell).or_default();
                        entry.weighted += buffer.values[i] * buffer.volumes[i];
                        entry.volume += buffer.volumes[i];
                    }
                }
            }
        }
        Ok(sums)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::traits::mock::MockFieldDriver;
    use crate::transport::testing::world;

    const A: CellHandle = CellHandle(1);
    const B: CellHandle = CellHandle(2);

    fn contribution(rank: usize) -> CellContribution {
        match rank {
            2 => CellContribution {
                cells: vec![A],
                values: vec![150.0],
                volumes: vec![2.0],
                mask: None,
            },
            3 => CellContribution {
                cells: vec![A, B],
                values: vec![300.0, 350.0],
                volumes: vec![1.0, 4.0],
                mask: None,
            },
            _ => CellContribution::default(),
        }
    }

    #[tokio::test]
    async fn test_accumulate_reaches_every_field_rank() {
        let results = world(5, |world| async move {
            let topology = Topology::build(world.clone(), 2, 2).await.unwrap();
            let exchange = FieldExchange::new(&topology);
            exchange.accumulate(&contribution(world.world_rank())).await.unwrap()
        })
        .await;

        for sums in &results[..2] {
            assert_eq!(sums[&A], Accumulated { weighted: 600.0, volume: 3.0 });
            assert_eq!(sums[&A].average(), 200.0);
            assert_eq!(sums[&B].average(), 350.0);
        }
        for sums in &results[2..] {
            assert!(sums.is_empty());
        }
    }

    #[tokio::test]
    async fn test_accumulate_skips_masked_cells() {
        let results = world(2, |world| async move {
            let topology = Topology::build(world.clone(), 1, 1).await.unwrap();
            let local = if world.world_rank() == 1 {
                CellContribution {
                    cells: vec![A, B],
                    values: vec![0.7, 10.0],
                    volumes: vec![1.0, 1.0],
                    mask: Some(vec![true, false]),
                }
            } else {
                CellContribution::default()
            };
            FieldExchange::new(&topology).accumulate(&local).await.unwrap()
        })
        .await;

        assert_eq!(results[0].len(), 1);
        assert_eq!(results[0][&A].average(), 0.7);
    }

    #[tokio::test]
    async fn test_accumulate_rejects_ragged_contribution() {
        let results = world(2, |world| async move {
            let topology = Topology::build(world.clone(), 1, 1).await.unwrap();
            let local = CellContribution {
                cells: vec![A, B],
                values: vec![1.0],
                volumes: vec![1.0, 1.0],
                mask: None,
            };
            if world.world_rank() == 1 {
                Some(FieldExchange::new(&topology).accumulate(&local).await.map(|_| ()))
            } else {
                None
            }
        })
        .await;

        assert!(matches!(results[1], Some(Err(CouplingError::Invariant(_)))));
    }

    #[tokio::test]
    async fn test_pull_returns_values_for_own_cells() {
        let results = world(3, |world| async move {
            let topology = Topology::build(world.clone(), 1, 2).await.unwrap();
            let field = MockFieldDriver::new(topology.field.clone(), vec![500.0, 510.0, 520.0]);
            let h = MockFieldDriver::handle;
            let cells = match world.world_rank() {
                1 => vec![h(2), h(0)],
                2 => vec![h(1)],
                _ => Vec::new(),
            };
            FieldExchange::new(&topology)
                .pull_from_field_root(&cells, |cell| Ok(field.temperature(cell)?))
                .await
                .unwrap()
        })
        .await;

        assert!(results[0].is_empty());
        assert_eq!(results[1], vec![520.0, 500.0]);
        assert_eq!(results[2], vec![510.0]);
    }

    #[tokio::test]
    async fn test_push_only_on_field_root() {
        let results = world(2, |world| async move {
            let topology = Topology::build(world.clone(), 1, 1).await.unwrap();
            let field = MockFieldDriver::new(topology.field.clone(), vec![300.0, 300.0]);
            FieldExchange::new(&topology).push_heat_source(&field, 1.0).unwrap().len()
        })
        .await;

        assert_eq!(results, vec![2, 0]);
    }
}
