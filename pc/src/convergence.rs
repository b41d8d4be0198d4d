//! Norm-based convergence test for the Picard iteration

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CouplingError, Result};
use crate::topology::Topology;
use crate::transport::ReduceOp;

/// Norm of the change in cell temperatures between two iterates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Norm {
    L1,
    L2,
    #[default]
    #[serde(alias = "LINF", alias = "linf")]
    Linf,
}

impl Norm {
    /// This rank's share of the norm, before any reduction
    pub fn local(self, current: &[f64], previous: &[f64]) -> f64 {
        let deltas = current.iter().zip(previous).map(|(x, p)| (x - p).abs());
        match self {
            Norm::L1 => deltas.sum(),
            Norm::L2 => deltas.map(|d| d * d).sum(),
            Norm::Linf => deltas.fold(0.0, f64::max),
        }
    }

    /// Operator combining the local shares
    pub fn reduce_op(self) -> ReduceOp {
        match self {
            Norm::L1 | Norm::L2 => ReduceOp::Sum,
            Norm::Linf => ReduceOp::Max,
        }
    }

    /// Turn the reduced shares into the norm
    pub fn finish(self, reduced: f64) -> f64 {
        match self {
            Norm::L2 => reduced.sqrt(),
            Norm::L1 | Norm::Linf => reduced,
        }
    }
}

impl fmt::Display for Norm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Norm::L1 => write!(f, "L1"),
            Norm::L2 => write!(f, "L2"),
            Norm::Linf => write!(f, "Linf"),
        }
    }
}

/// Decides world-wide whether the temperature iterate has settled
#[derive(Debug, Clone, Copy)]
pub struct ConvergenceMonitor {
    norm: Norm,
    epsilon: f64,
}

impl ConvergenceMonitor {
    pub fn new(norm: Norm, epsilon: f64) -> Self {
        Self { norm, epsilon }
    }

    pub fn norm(&self) -> Norm {
        self.norm
    }

    /// Norm of `current - previous` over all heat-fluids ranks and whether it
    /// is below the tolerance
    ///
    /// The heat-fluids root decides and every rank in the world receives the
    /// same answer. Ranks outside the heat-fluids group pass empty slices.
    pub async fn check(&self, topology: &Topology, current: &[f64], previous: &[f64]) -> Result<(f64, bool)> {
        debug!(world_rank = topology.world.world_rank(), norm = %self.norm, "ConvergenceMonitor::check: called");

        let mut decision = (0.0, false);
        if topology.is_heat() {
            let local = self.norm.local(current, previous);
            let op = self.norm.reduce_op();
            if let Some(reduced) = topology.heat.reduce(local, op, 0).await? {
                let norm = self.norm.finish(reduced);
                if !norm.is_finite() {
                    return Err(CouplingError::Invariant(format!("{} norm of the temperature change is {}", self.norm, norm)));
                }
                decision = (norm, norm < self.epsilon);
            }
        }

        let heat_root = topology.heat_root();
        topology.world.broadcast(&mut decision, heat_root).await?;
        Ok(decision)
    }
}
