//! Run summary and iteration history

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::convergence::Norm;

/// Norm recorded after one Picard iteration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub timestep: usize,
    pub picard: usize,
    pub norm: f64,
}

/// Outcome of one time step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimestepSummary {
    pub timestep: usize,
    /// Picard iterations performed
    pub iterations: usize,
    pub converged: bool,
    /// Norm after the last iteration, absent if no iteration ran
    pub final_norm: Option<f64>,
}

/// Everything a finished run reports
///
/// The iteration history is the same on every rank because each rank
/// records the norm broadcast by the heat-fluids root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub norm: Norm,
    pub epsilon: f64,
    pub timesteps: Vec<TimestepSummary>,
    pub history: Vec<IterationRecord>,
}

impl RunSummary {
    pub fn new(run_id: Uuid, norm: Norm, epsilon: f64) -> Self {
        debug!(%run_id, %norm, epsilon, "RunSummary::new: called");
        Self {
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            norm,
            epsilon,
            timesteps: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn record_iteration(&mut self, timestep: usize, picard: usize, norm: f64) {
        debug!(timestep, picard, norm, "RunSummary::record_iteration: called");
        self.history.push(IterationRecord { timestep, picard, norm });
    }

    /// Close a time step from the iterations recorded for it
    pub fn finish_timestep(&mut self, timestep: usize, converged: bool) {
        debug!(timestep, converged, "RunSummary::finish_timestep: called");
        let records: Vec<&IterationRecord> = self.history.iter().filter(|r| r.timestep == timestep).collect();
        self.timesteps.push(TimestepSummary {
            timestep,
            iterations: records.len(),
            converged,
            final_norm: records.last().map(|r| r.norm),
        });
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Whether every time step converged
    pub fn converged(&self) -> bool {
        !self.timesteps.is_empty() && self.timesteps.iter().all(|t| t.converged)
    }

    pub fn total_iterations(&self) -> usize {
        self.history.len()
    }

    /// Wall time of the run in seconds, once finished
    pub fn elapsed_secs(&self) -> Option<f64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }
}
