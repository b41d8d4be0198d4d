//! Lumped stand-in for a conjugate heat transfer solver

use tracing::{debug, info};

use super::{Driver, DriverError, ElementIndex, HeatFluidsDriver, Position};
use crate::config::SurrogateHeatConfig;
use crate::error::CouplingError;
use crate::transport::Comm;

/// Uniform element lattice split into contiguous blocks across the group
///
/// Each element is cooled independently: a solve sets
/// `T = T_inlet + q / h`, and fluid elements expand linearly with temperature.
pub struct SurrogateHeatDriver {
    comm: Comm,
    config: SurrogateHeatConfig,
    centroids: Vec<Position>,
    volumes: Vec<f64>,
    fluid: Vec<bool>,
    heat: Vec<f64>,
    temperatures: Vec<f64>,
    densities: Vec<f64>,
    solves: usize,
}

impl SurrogateHeatDriver {
    pub fn new(config: &SurrogateHeatConfig, comm: Comm) -> Result<Self, CouplingError> {
        debug!(elements = ?config.elements, rank = ?comm.rank(), "SurrogateHeatDriver::new: called");
        if config.elements.contains(&0) {
            return Err(CouplingError::Config(format!(
                "heat-fluids lattice must have at least one element per axis, got {:?}",
                config.elements
            )));
        }
        if config.extent.iter().any(|&e| e.is_nan() || e <= 0.0) {
            return Err(CouplingError::Config(format!(
                "heat-fluids extent must be positive, got {:?}",
                config.extent
            )));
        }
        if config.heat_transfer_coefficient.is_nan() || config.heat_transfer_coefficient <= 0.0 {
            return Err(CouplingError::Config(format!(
                "heat transfer coefficient must be positive, got {}",
                config.heat_transfer_coefficient
            )));
        }

        let [mx, my, mz] = config.elements;
        let pitch = [
            config.extent[0] / mx as f64,
            config.extent[1] / my as f64,
            config.extent[2] / mz as f64,
        ];

        let owned = match comm.rank() {
            Some(rank) => {
                let total = mx * my * mz;
                let size = comm.size();
                total * rank / size..total * (rank + 1) / size
            }
            None => 0..0,
        };

        let centroids: Vec<Position> = owned
            .map(|g| {
                let (ix, iy, iz) = (g % mx, (g / mx) % my, g / (mx * my));
                Position::new(
                    (ix as f64 + 0.5) * pitch[0],
                    (iy as f64 + 0.5) * pitch[1],
                    (iz as f64 + 0.5) * pitch[2],
                )
            })
            .collect();
        let fluid: Vec<bool> = centroids.iter().map(|c| c.x >= config.fluid_x_min).collect();
        let densities = fluid
            .iter()
            .map(|&f| if f { config.fluid_density } else { config.solid_density })
            .collect();
        let n = centroids.len();

        Ok(Self {
            comm,
            volumes: vec![pitch.iter().product(); n],
            heat: vec![0.0; n],
            temperatures: vec![config.inlet_temperature; n],
            densities,
            fluid,
            centroids,
            solves: 0,
            config: config.clone(),
        })
    }

    fn fluid_density(&self, temperature: f64) -> f64 {
        self.config.fluid_density * (1.0 - self.config.expansion_coefficient * (temperature - self.config.inlet_temperature))
    }
}

impl Driver for SurrogateHeatDriver {
    fn comm(&self) -> &Comm {
        &self.comm
    }

    fn init_step(&mut self) -> Result<(), DriverError> {
        debug!(solve = self.solves, "SurrogateHeatDriver::init_step: called");
        Ok(())
    }

    fn solve_step(&mut self) -> Result<(), DriverError> {
        debug!(solve = self.solves, "SurrogateHeatDriver::solve_step: called");
        let h = self.config.heat_transfer_coefficient;
        for e in 0..self.heat.len() {
            let temperature = self.config.inlet_temperature + self.heat[e] / h;
            self.temperatures[e] = temperature;
            if self.fluid[e] {
                let density = self.fluid_density(temperature);
                if density.is_nan() || density <= 0.0 {
                    return Err(DriverError::InvalidValue {
                        quantity: "fluid density",
                        value: density,
                    });
                }
                self.densities[e] = density;
            }
        }
        self.solves += 1;
        Ok(())
    }

    fn write_step(&mut self, timestep: usize, iteration: usize) -> Result<(), DriverError> {
        let peak = self.temperatures.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        debug!(timestep, iteration, peak_temperature = peak, "SurrogateHeatDriver::write_step: called");
        Ok(())
    }

    fn write_final(&mut self) -> Result<(), DriverError> {
        if let Some(peak) = self.temperatures.iter().copied().reduce(f64::max) {
            info!(
                rank = ?self.comm.rank(),
                elements = self.temperatures.len(),
                solves = self.solves,
                peak_temperature = peak,
                "Heat-fluids surrogate finished"
            );
        }
        Ok(())
    }

    fn finalize_step(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

impl HeatFluidsDriver for SurrogateHeatDriver {
    fn has_coupling_data(&self) -> bool {
        self.active()
    }

    fn temperature_local(&self) -> Vec<f64> {
        self.temperatures.clone()
    }

    fn density_local(&self) -> Vec<f64> {
        self.densities.clone()
    }

    fn volume_local(&self) -> Vec<f64> {
        self.volumes.clone()
    }

    fn fluid_mask_local(&self) -> Vec<bool> {
        self.fluid.clone()
    }

    fn centroid_local(&self) -> Vec<Position> {
        self.centroids.clone()
    }

    fn set_heat_source_at(&mut self, element: ElementIndex, heat: f64) -> Result<(), DriverError> {
        if !heat.is_finite() {
            return Err(DriverError::InvalidValue {
                quantity: "heat source",
                value: heat,
            });
        }
        let count = self.heat.len();
        let slot = self
            .heat
            .get_mut(element)
            .ok_or(DriverError::UnknownElement { element, count })?;
        *slot = heat;
        Ok(())
    }
}
