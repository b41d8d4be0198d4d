//! Analytic lattice stand-in for a neutron transport solver

use std::collections::BTreeMap;
use std::f64::consts::PI;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::{CellHandle, Driver, DriverError, FieldDriver, Position};
use crate::config::SurrogateFieldConfig;
use crate::error::CouplingError;
use crate::transport::Comm;

/// Extrapolated height of the chopped cosine, relative to the box height
const AXIAL_EXTRAPOLATION: f64 = 1.2;

/// Uniform `nx × ny × nz` lattice of cells over `[0, extent]`
///
/// A solve assigns every cell a fission weight from a chopped cosine axial
/// shape, scaled by linear temperature and density feedback. Cell handles are
/// the row-major lattice index (x fastest).
pub struct SurrogateFieldDriver {
    comm: Comm,
    config: SurrogateFieldConfig,
    pitch: [f64; 3],
    temperatures: Vec<f64>,
    densities: Vec<f64>,
    weights: Option<Vec<f64>>,
    tallies: bool,
    rng: StdRng,
    solves: usize,
}

impl SurrogateFieldDriver {
    pub fn new(config: &SurrogateFieldConfig, comm: Comm) -> Result<Self, CouplingError> {
        debug!(lattice = ?config.lattice, extent = ?config.extent, "SurrogateFieldDriver::new: called");
        if config.lattice.contains(&0) {
            return Err(CouplingError::Config(format!(
                "field lattice must have at least one cell per axis, got {:?}",
                config.lattice
            )));
        }
        if config.extent.iter().any(|&e| e.is_nan() || e <= 0.0) {
            return Err(CouplingError::Config(format!(
                "field extent must be positive, got {:?}",
                config.extent
            )));
        }

        let pitch = [
            config.extent[0] / config.lattice[0] as f64,
            config.extent[1] / config.lattice[1] as f64,
            config.extent[2] / config.lattice[2] as f64,
        ];
        let n_cells = config.lattice.iter().product();

        Ok(Self {
            comm,
            pitch,
            temperatures: vec![config.initial_temperature; n_cells],
            densities: vec![config.initial_density; n_cells],
            weights: None,
            tallies: false,
            rng: StdRng::seed_from_u64(config.seed),
            solves: 0,
            config: config.clone(),
        })
    }

    pub fn n_cells(&self) -> usize {
        self.temperatures.len()
    }

    fn index(&self, cell: CellHandle) -> Result<usize, DriverError> {
        usize::try_from(cell.0)
            .ok()
            .filter(|&i| i < self.n_cells())
            .ok_or(DriverError::UnknownCell(cell))
    }

    fn lattice_coords(&self, index: usize) -> [usize; 3] {
        let [nx, ny, _] = self.config.lattice;
        [index % nx, (index / nx) % ny, index / (nx * ny)]
    }

    fn cell_volume(&self) -> f64 {
        self.pitch.iter().product()
    }

    /// Lattice index along one axis, or `None` outside the box
    fn axis_index(&self, axis: usize, coordinate: f64) -> Option<usize> {
        let extent = self.config.extent[axis];
        if !(0.0..=extent).contains(&coordinate) {
            return None;
        }
        // points on the upper face belong to the last cell
        let i = (coordinate / self.pitch[axis]) as usize;
        Some(i.min(self.config.lattice[axis] - 1))
    }

    fn locate(&self, position: &Position) -> Option<CellHandle> {
        let ix = self.axis_index(0, position.x)?;
        let iy = self.axis_index(1, position.y)?;
        let iz = self.axis_index(2, position.z)?;
        let [nx, ny, _] = self.config.lattice;
        Some(CellHandle((ix + nx * (iy + ny * iz)) as u64))
    }

    /// Unnormalized fission weight of one cell at its current state
    fn weight(&self, index: usize) -> f64 {
        let [_, _, iz] = self.lattice_coords(index);
        let z = (iz as f64 + 0.5) * self.pitch[2];
        let height = self.config.extent[2];
        let shape = (PI * (z / height - 0.5) / AXIAL_EXTRAPOLATION).cos();

        let feedback = 1.0 - self.config.doppler_coefficient * (self.temperatures[index] - self.config.reference_temperature)
            + self.config.density_coefficient * (self.densities[index] - self.config.reference_density);

        (shape * feedback).max(0.0)
    }
}

impl Driver for SurrogateFieldDriver {
    fn comm(&self) -> &Comm {
        &self.comm
    }

    fn init_step(&mut self) -> Result<(), DriverError> {
        debug!(solve = self.solves, "SurrogateFieldDriver::init_step: called");
        if !self.tallies {
            return Err(DriverError::OutOfOrder {
                operation: "init_step",
                prerequisite: "create_tallies",
            });
        }
        self.weights = None;
        Ok(())
    }

    fn solve_step(&mut self) -> Result<(), DriverError> {
        debug!(solve = self.solves, "SurrogateFieldDriver::solve_step: called");
        let mut weights: Vec<f64> = (0..self.n_cells()).map(|i| self.weight(i)).collect();

        if self.config.noise > 0.0 {
            for w in &mut weights {
                let perturbation: f64 = self.rng.random_range(-1.0..=1.0);
                *w *= (1.0 + self.config.noise * perturbation).max(0.0);
            }
        }

        self.weights = Some(weights);
        self.solves += 1;
        Ok(())
    }

    fn write_step(&mut self, timestep: usize, iteration: usize) -> Result<(), DriverError> {
        let weights = self.weights.as_deref().ok_or(DriverError::OutOfOrder {
            operation: "write_step",
            prerequisite: "solve_step",
        })?;
        let peak = weights.iter().copied().fold(0.0, f64::max);
        let mean = weights.iter().sum::<f64>() / weights.len() as f64;
        debug!(timestep, iteration, peaking = peak / mean, "SurrogateFieldDriver::write_step: tally summary");
        Ok(())
    }

    fn finalize_step(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

impl FieldDriver for SurrogateFieldDriver {
    fn find(&self, positions: &[Position]) -> Vec<Option<CellHandle>> {
        debug!(count = positions.len(), "SurrogateFieldDriver::find: called");
        positions.iter().map(|p| self.locate(p)).collect()
    }

    fn heat_source(&self, power: f64) -> Result<BTreeMap<CellHandle, f64>, DriverError> {
        debug!(power, "SurrogateFieldDriver::heat_source: called");
        let weights = self.weights.as_deref().ok_or(DriverError::OutOfOrder {
            operation: "heat_source",
            prerequisite: "solve_step",
        })?;

        let total = weights.iter().sum::<f64>() * self.cell_volume();
        if total.is_nan() || total <= 0.0 {
            return Err(DriverError::InvalidValue {
                quantity: "total fission weight",
                value: total,
            });
        }

        Ok(weights
            .iter()
            .enumerate()
            .map(|(i, w)| (CellHandle(i as u64), power * w / total))
            .collect())
    }

    fn temperature(&self, cell: CellHandle) -> Result<f64, DriverError> {
        Ok(self.temperatures[self.index(cell)?])
    }

    fn set_temperature(&mut self, cell: CellHandle, temperature: f64) -> Result<(), DriverError> {
        if temperature.is_nan() || temperature <= 0.0 {
            return Err(DriverError::InvalidValue {
                quantity: "temperature",
                value: temperature,
            });
        }
        let i = self.index(cell)?;
        self.temperatures[i] = temperature;
        Ok(())
    }

    fn density(&self, cell: CellHandle) -> Result<f64, DriverError> {
        Ok(self.densities[self.index(cell)?])
    }

    fn set_density(&mut self, cell: CellHandle, density: f64) -> Result<(), DriverError> {
        if density.is_nan() || density <= 0.0 {
            return Err(DriverError::InvalidValue {
                quantity: "density",
                value: density,
            });
        }
        let i = self.index(cell)?;
        self.densities[i] = density;
        Ok(())
    }

    fn volume(&self, cell: CellHandle) -> Result<f64, DriverError> {
        self.index(cell)?;
        Ok(self.cell_volume())
    }

    fn create_tallies(&mut self) -> Result<(), DriverError> {
        debug!(n_cells = self.n_cells(), "SurrogateFieldDriver::create_tallies: called");
        self.tallies = true;
        Ok(())
    }

    fn cell_label(&self, cell: CellHandle) -> String {
        match self.index(cell) {
            Ok(i) => {
                let [x, y, z] = self.lattice_coords(i);
                format!("cell {} [{}, {}, {}]", cell, x, y, z)
            }
            Err(_) => format!("cell {} (unknown)", cell),
        }
    }
}
