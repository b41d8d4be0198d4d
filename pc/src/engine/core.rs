//! CouplingEngine - drives the time-step and Picard loops on one rank

use std::fmt;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::RunSummary;
use crate::config::{CouplingConfig, InitialCondition};
use crate::convergence::ConvergenceMonitor;
use crate::driver::{FieldDriver, HeatFluidsDriver};
use crate::error::{CouplingError, Result};
use crate::exchange::{CellContribution, FieldExchange};
use crate::mapping::{CellMapping, SpatialMapper};
use crate::relaxation::FieldVector;
use crate::topology::Topology;

/// Relative difference above which cell volumes are reported as mismatched
const VOLUME_TOLERANCE: f64 = 1e-6;

/// Where the engine is in the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    TimeStep { timestep: usize },
    Picard { timestep: usize, iteration: usize },
    Converged { timestep: usize, iteration: usize },
    TimeStepDone { timestep: usize },
    Finished,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Initializing => write!(f, "initializing"),
            Phase::TimeStep { timestep } => write!(f, "time step {}", timestep),
            Phase::Picard { timestep, iteration } => write!(f, "time step {} picard {}", timestep, iteration),
            Phase::Converged { timestep, iteration } => {
                write!(f, "time step {} converged at picard {}", timestep, iteration)
            }
            Phase::TimeStepDone { timestep } => write!(f, "time step {} done", timestep),
            Phase::Finished => write!(f, "finished"),
        }
    }
}

/// Coupled iteration engine for one rank
///
/// Every per-cell vector is indexed by the rank's global cell list and is
/// empty on ranks outside the heat-fluids group.
pub struct CouplingEngine {
    config: CouplingConfig,
    topology: Topology,
    field: Box<dyn FieldDriver>,
    heat: Box<dyn HeatFluidsDriver>,
    monitor: ConvergenceMonitor,
    phase: Phase,
    mapping: CellMapping,
    element_volumes: Vec<f64>,
    cell_volumes: Vec<f64>,
    fluid_mask: Vec<bool>,
    temperature: FieldVector,
    density: FieldVector,
    heat_source: FieldVector,
    summary: RunSummary,
}

impl CouplingEngine {
    pub fn new(
        config: CouplingConfig,
        topology: Topology,
        field: Box<dyn FieldDriver>,
        heat: Box<dyn HeatFluidsDriver>,
        run_id: Uuid,
    ) -> Self {
        debug!(world_rank = topology.world.world_rank(), %run_id, "CouplingEngine::new: called");
        let monitor = ConvergenceMonitor::new(config.convergence_norm, config.epsilon);
        let summary = RunSummary::new(run_id, config.convergence_norm, config.epsilon);
        Self {
            config,
            topology,
            field,
            heat,
            monitor,
            phase: Phase::Initializing,
            mapping: CellMapping::default(),
            element_volumes: Vec::new(),
            cell_volumes: Vec::new(),
            fluid_mask: Vec::new(),
            temperature: FieldVector::default(),
            density: FieldVector::default(),
            heat_source: FieldVector::default(),
            summary,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    pub fn mapping(&self) -> &CellMapping {
        &self.mapping
    }

    pub fn temperature(&self) -> &FieldVector {
        &self.temperature
    }

    pub fn density(&self) -> &FieldVector {
        &self.density
    }

    pub fn heat_source(&self) -> &FieldVector {
        &self.heat_source
    }

    pub fn cell_volumes(&self) -> &[f64] {
        &self.cell_volumes
    }

    pub fn fluid_mask(&self) -> &[bool] {
        &self.fluid_mask
    }

    pub fn field_driver(&self) -> &dyn FieldDriver {
        self.field.as_ref()
    }

    pub fn heat_driver(&self) -> &dyn HeatFluidsDriver {
        self.heat.as_ref()
    }

    /// Initialize, iterate and write final output
    pub async fn run(mut self) -> Result<RunSummary> {
        self.initialize().await?;
        self.execute().await?;
        Ok(self.summary)
    }

    fn set_phase(&mut self, phase: Phase) {
        debug!(from = %self.phase, to = %phase, "CouplingEngine::set_phase: called");
        self.phase = phase;
    }

    /// Build the mapping and every per-cell array, and set initial conditions
    pub async fn initialize(&mut self) -> Result<()> {
        self.set_phase(Phase::Initializing);
        self.topology.report().await?;

        self.mapping = SpatialMapper::build(&self.topology, self.field.as_ref(), self.heat.as_ref()).await?;
        self.init_tallies()?;
        self.init_volumes().await?;
        self.init_fluid_mask()?;
        self.init_temperatures().await?;
        self.init_densities().await?;
        self.init_heat_source();
        Ok(())
    }

    /// Run every time step, then write the heat-fluids solver's final output
    pub async fn execute(&mut self) -> Result<()> {
        let world = self.topology.world.clone();

        for timestep in 0..self.config.max_timesteps {
            self.set_phase(Phase::TimeStep { timestep });
            world.message(&format!("i_timestep: {}", timestep));

            let mut converged = false;
            for iteration in 0..self.config.max_picard_iter {
                self.set_phase(Phase::Picard { timestep, iteration });
                world.message(&format!("i_picard: {}", iteration));
                let n = iteration + 1;

                self.solve_field(timestep, iteration)?;
                world.barrier().await?;

                // no previous heat source exists before the very first solve
                let relax_heat = timestep > 0 || iteration > 0;
                self.update_heat_source(relax_heat.then_some(n)).await?;

                self.solve_heat(timestep, iteration)?;
                world.barrier().await?;

                self.update_temperature(Some(n)).await?;
                self.update_density(Some(n)).await?;

                let (norm, done) = self
                    .monitor
                    .check(&self.topology, &self.temperature.current, &self.temperature.previous)
                    .await?;
                self.summary.record_iteration(timestep, iteration, norm);
                world.message(&format!("{} norm of temperature change: {:e}", self.monitor.norm(), norm));

                if done {
                    self.set_phase(Phase::Converged { timestep, iteration });
                    world.message(&format!("converged at i_picard = {}", iteration));
                    converged = true;
                    break;
                }
            }

            if !converged && world.is_root() {
                warn!(
                    timestep,
                    max_picard_iter = self.config.max_picard_iter,
                    epsilon = self.config.epsilon,
                    "Picard iteration did not converge"
                );
            }
            self.summary.finish_timestep(timestep, converged);
            world.barrier().await?;
            self.set_phase(Phase::TimeStepDone { timestep });
        }

        if self.heat.active() {
            self.heat.write_final()?;
        }
        self.summary.finish();
        self.set_phase(Phase::Finished);
        Ok(())
    }

    fn solve_field(&mut self, timestep: usize, iteration: usize) -> Result<()> {
        if self.field.active() {
            self.field.init_step()?;
            self.field.solve_step()?;
            self.field.write_step(timestep, iteration)?;
            self.field.finalize_step()?;
        }
        Ok(())
    }

    fn solve_heat(&mut self, timestep: usize, iteration: usize) -> Result<()> {
        if self.heat.active() {
            self.heat.init_step()?;
            self.heat.solve_step()?;
            self.heat.write_step(timestep, iteration)?;
            self.heat.finalize_step()?;
        }
        Ok(())
    }

    /// Check that a per-element vector from the heat-fluids driver matches the mapping
    fn local_values<T>(&self, what: &str, values: Vec<T>) -> Result<Vec<T>> {
        if values.len() == self.mapping.n_elements() {
            Ok(values)
        } else {
            Err(CouplingError::Invariant(format!(
                "heat-fluids driver returned {} {} for {} mapped elements",
                values.len(),
                what,
                self.mapping.n_elements()
            )))
        }
    }

    fn init_tallies(&mut self) -> Result<()> {
        self.topology.world.message("Initializing tallies");
        if self.field.active() {
            self.field.create_tallies()?;
        }
        Ok(())
    }

    async fn init_volumes(&mut self) -> Result<()> {
        self.topology.world.message("Initializing volumes");
        if self.heat.active() {
            self.element_volumes = self.local_values("volumes", self.heat.volume_local())?;
            self.cell_volumes = self.mapping.cell_volumes(&self.element_volumes)?;
        }

        if self.config.check_volumes {
            self.check_volumes().await?;
        }
        Ok(())
    }

    /// Compare heat-fluids cell volumes summed over all ranks with the field solver's
    async fn check_volumes(&self) -> Result<()> {
        let contribution = CellContribution {
            cells: self.mapping.cells().to_vec(),
            values: vec![1.0; self.cell_volumes.len()],
            volumes: self.cell_volumes.clone(),
            mask: None,
        };
        let sums = FieldExchange::new(&self.topology).accumulate(&contribution).await?;

        if self.topology.world.world_rank() == self.topology.field_root() {
            for (cell, accumulated) in &sums {
                let field_volume = self.field.volume(*cell)?;
                let label = self.field.cell_label(*cell);
                let difference = (field_volume - accumulated.volume).abs() / field_volume;
                if difference > VOLUME_TOLERANCE {
                    warn!(
                        "{}: V = {} (field), {} (accumulated from heat-fluids)",
                        label, field_volume, accumulated.volume
                    );
                } else {
                    info!(
                        "{}: V = {} (field), {} (accumulated from heat-fluids)",
                        label, field_volume, accumulated.volume
                    );
                }
            }
        }
        Ok(())
    }

    fn init_fluid_mask(&mut self) -> Result<()> {
        self.topology.world.message("Initializing cell fluid mask");
        if self.heat.active() {
            let element_mask = self.local_values("fluid flags", self.heat.fluid_mask_local())?;
            self.fluid_mask = self.mapping.fluid_mask(&element_mask)?;
        }
        Ok(())
    }

    async fn init_temperatures(&mut self) -> Result<()> {
        self.topology.world.message("Initializing temperatures");
        self.temperature = FieldVector::zeros(self.mapping.n_cells());

        match self.config.temperature_ic {
            InitialCondition::Field => {
                let field = self.field.as_ref();
                let values = FieldExchange::new(&self.topology)
                    .pull_from_field_root(self.mapping.cells(), |cell| Ok(field.temperature(cell)?))
                    .await?;
                if self.heat.active() {
                    self.temperature.current = values;
                }
            }
            InitialCondition::HeatFluids => self.update_temperature(None).await?,
        }

        self.temperature.store_previous();
        Ok(())
    }

    async fn init_densities(&mut self) -> Result<()> {
        self.topology.world.message("Initializing densities");
        self.density = FieldVector::zeros(self.mapping.n_cells());

        match self.config.density_ic {
            InitialCondition::Field => {
                let field = self.field.as_ref();
                let values = FieldExchange::new(&self.topology)
                    .pull_from_field_root(self.mapping.cells(), |cell| Ok(field.density(cell)?))
                    .await?;
                if self.heat.active() {
                    self.density.current = values;
                }
            }
            InitialCondition::HeatFluids => {
                // solid cells are never updated again, so they start from the heat-fluids state too
                if self.heat.active() {
                    let elements = self.local_values("densities", self.heat.density_local())?;
                    self.density.current = self.mapping.volume_average("density", &elements, &self.element_volumes)?;
                }
                self.update_density(None).await?;
            }
        }

        self.density.store_previous();
        Ok(())
    }

    fn init_heat_source(&mut self) {
        self.topology.world.message("Initializing heat source");
        self.heat_source = FieldVector::zeros(self.mapping.n_cells());
    }

    /// Hand the field solver's heat source to every heat-fluids element
    ///
    /// `relax` carries the 1-based Picard index, or `None` to take the new
    /// heat source as is.
    async fn update_heat_source(&mut self, relax: Option<usize>) -> Result<()> {
        self.topology.world.message("Updating heat source");
        if relax.is_some() && self.heat.active() {
            self.heat_source.store_previous();
        }

        let exchange = FieldExchange::new(&self.topology);
        let source = exchange.push_heat_source(self.field.as_ref(), self.config.power)?;
        let values = exchange
            .pull_from_field_root(self.mapping.cells(), |cell| {
                source
                    .get(&cell)
                    .copied()
                    .ok_or_else(|| {
                        CouplingError::Invariant(format!("field heat source has no entry for cell {}", cell))
                    })
            })
            .await?;

        if self.heat.active() {
            self.heat_source.current = values;
            if let Some(n) = relax {
                self.heat_source.relax(self.config.alpha, n);
            }

            for (i, &cell) in self.mapping.cells().iter().enumerate() {
                for &element in self.mapping.elements_of(cell) {
                    self.heat.set_heat_source_at(element, self.heat_source.current[i])?;
                }
            }
        }
        Ok(())
    }

    /// Volume-average heat-fluids temperatures into cells and set them on the field solver
    async fn update_temperature(&mut self, relax: Option<usize>) -> Result<()> {
        self.topology.world.message("Updating temperature");

        if self.heat.active() {
            if relax.is_some() {
                self.temperature.store_previous();
            }
            let elements = self.local_values("temperatures", self.heat.temperature_local())?;
            self.temperature.current = self
                .mapping
                .volume_average("temperature", &elements, &self.element_volumes)?;
            if let Some(n) = relax {
                self.temperature.relax(self.config.alpha_t, n);
            }
        }

        let contribution = CellContribution {
            cells: self.mapping.cells().to_vec(),
            values: self.temperature.current.clone(),
            volumes: self.cell_volumes.clone(),
            mask: None,
        };
        let sums = FieldExchange::new(&self.topology).accumulate(&contribution).await?;

        if self.field.active() {
            for (cell, accumulated) in sums {
                self.field.set_temperature(cell, accumulated.average())?;
            }
        }
        Ok(())
    }

    /// Same as [`Self::update_temperature`] for density, restricted to fluid cells
    async fn update_density(&mut self, relax: Option<usize>) -> Result<()> {
        self.topology.world.message("Updating density");

        if self.heat.active() {
            if relax.is_some() {
                self.density.store_previous();
            }
            let elements = self.local_values("densities", self.heat.density_local())?;
            self.mapping.volume_average_masked(
                "density",
                &elements,
                &self.element_volumes,
                &self.fluid_mask,
                &mut self.density.current,
            )?;
            if let Some(n) = relax {
                self.density.relax_masked(self.config.alpha_rho, &self.fluid_mask, n);
            }
        }

        let contribution = CellContribution {
            cells: self.mapping.cells().to_vec(),
            values: self.density.current.clone(),
            volumes: self.cell_volumes.clone(),
            mask: Some(self.fluid_mask.clone()),
        };
        let sums = FieldExchange::new(&self.topology).accumulate(&contribution).await?;

        if self.field.active() {
            for (cell, accumulated) in sums {
                self.field.set_density(cell, accumulated.average())?;
            }
        }
        Ok(())
    }
}
