//! Driver trait definitions

use std::collections::BTreeMap;

use super::{CellHandle, DriverError, ElementIndex, Position};
use crate::transport::Comm;

/// Lifecycle shared by every solver driver
///
/// The engine calls `init_step`, `solve_step`, `write_step` and
/// `finalize_step` once per Picard iteration on each member rank.
pub trait Driver: Send + Sync {
    /// Communicator of the solver's group
    fn comm(&self) -> &Comm;

    /// Whether the calling process runs this solver
    fn active(&self) -> bool {
        self.comm().active()
    }

    fn init_step(&mut self) -> Result<(), DriverError>;

    fn solve_step(&mut self) -> Result<(), DriverError>;

    /// Write per-iteration output
    fn write_step(&mut self, timestep: usize, iteration: usize) -> Result<(), DriverError>;

    /// Write output once the whole run is over
    fn write_final(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn finalize_step(&mut self) -> Result<(), DriverError>;
}

/// Field (neutronics) solver as seen by the coupling
///
/// Cell-level accessors are only meaningful on the field group root.
pub trait FieldDriver: Driver {
    /// Cell containing each position, `None` if outside the geometry
    fn find(&self, positions: &[Position]) -> Vec<Option<CellHandle>>;

    /// Volumetric heat source per cell, normalized to `power`
    fn heat_source(&self, power: f64) -> Result<BTreeMap<CellHandle, f64>, DriverError>;

    fn temperature(&self, cell: CellHandle) -> Result<f64, DriverError>;

    fn set_temperature(&mut self, cell: CellHandle, temperature: f64) -> Result<(), DriverError>;

    fn density(&self, cell: CellHandle) -> Result<f64, DriverError>;

    fn set_density(&mut self, cell: CellHandle, density: f64) -> Result<(), DriverError>;

    fn volume(&self, cell: CellHandle) -> Result<f64, DriverError>;

    /// Prepare the heat source tally; called once before the first solve
    fn create_tallies(&mut self) -> Result<(), DriverError>;

    /// Human readable name of a cell, for logs
    fn cell_label(&self, cell: CellHandle) -> String {
        format!("cell {}", cell)
    }
}

/// Heat-fluids solver as seen by the coupling
///
/// All `*_local` vectors are indexed by the local element index.
pub trait HeatFluidsDriver: Driver {
    /// Whether this rank owns elements that take part in the coupling
    fn has_coupling_data(&self) -> bool;

    fn temperature_local(&self) -> Vec<f64>;

    fn density_local(&self) -> Vec<f64>;

    fn volume_local(&self) -> Vec<f64>;

    /// True for elements that hold fluid
    fn fluid_mask_local(&self) -> Vec<bool>;

    fn centroid_local(&self) -> Vec<Position>;

    fn set_heat_source_at(&mut self, element: ElementIndex, heat: f64) -> Result<(), DriverError>;
}
