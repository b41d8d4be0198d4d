//! Picard configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::convergence::Norm;
use crate::error::CouplingError;
use crate::relaxation::Relaxation;

/// Main Picard configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Size of the process pool; defaults to exactly the ranks both groups need
    #[serde(rename = "world-size")]
    pub world_size: Option<usize>,

    /// Coupling iteration settings
    pub coupling: CouplingConfig,

    /// Field solver (neutronics) settings
    pub field: FieldConfig,

    /// Heat-fluids solver settings
    #[serde(rename = "heat-fluids")]
    pub heat_fluids: HeatFluidsConfig,
}

impl Config {
    /// Number of ranks in the process pool
    pub fn pool_size(&self) -> usize {
        self.world_size
            .unwrap_or_else(|| self.field.ranks() + self.heat_fluids.ranks())
    }

    /// Validate configuration before use
    ///
    /// Every check here fails the run before any rank is started.
    pub fn validate(&self) -> std::result::Result<(), CouplingError> {
        let coupling = &self.coupling;
        if !coupling.power.is_finite() || coupling.power <= 0.0 {
            return Err(CouplingError::Config(format!(
                "power must be positive and finite, got {}",
                coupling.power
            )));
        }
        if !coupling.epsilon.is_finite() || coupling.epsilon <= 0.0 {
            return Err(CouplingError::Config(format!(
                "epsilon must be positive and finite, got {}",
                coupling.epsilon
            )));
        }
        for (name, relaxation) in [
            ("alpha", coupling.alpha),
            ("alpha-t", coupling.alpha_t),
            ("alpha-rho", coupling.alpha_rho),
        ] {
            relaxation
                .validate()
                .map_err(|e| CouplingError::Config(format!("{}: {}", name, e)))?;
        }

        if self.field.ranks() == 0 {
            return Err(CouplingError::Config("field group has no ranks".to_string()));
        }
        if self.heat_fluids.ranks() == 0 {
            return Err(CouplingError::Config("heat-fluids group has no ranks".to_string()));
        }

        let requested = self.field.ranks() + self.heat_fluids.ranks();
        if self.pool_size() < requested {
            return Err(CouplingError::PoolTooSmall {
                pool: self.pool_size(),
                requested,
            });
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: ./picard.yml
        let local_config = PathBuf::from("picard.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/picard/picard.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("picard").join("picard.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up
    ///
    /// Errors are swallowed: a broken file is reported later by [`Config::load`].
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let candidates: Vec<PathBuf> = match config_path {
            Some(path) => vec![path.clone()],
            None => {
                let mut paths = vec![PathBuf::from("picard.yml")];
                if let Some(config_dir) = dirs::config_dir() {
                    paths.push(config_dir.join("picard").join("picard.yml"));
                }
                paths
            }
        };

        candidates
            .iter()
            .find(|path| path.exists())
            .and_then(|path| Self::load_from_file(path).ok())
            .and_then(|config| config.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Which solver supplies the starting value of a coupled quantity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitialCondition {
    /// Read the field solver's cell values
    #[default]
    #[serde(rename = "field", alias = "neutronics")]
    Field,

    /// Volume-average the heat-fluids solver's element values
    #[serde(rename = "heat-fluids", alias = "heat_fluids")]
    HeatFluids,
}

/// Coupling iteration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CouplingConfig {
    /// Total power normalizing the heat source [W]
    pub power: f64,

    /// Number of time steps
    #[serde(rename = "max-timesteps")]
    pub max_timesteps: usize,

    /// Picard iteration budget per time step
    #[serde(rename = "max-picard-iter")]
    pub max_picard_iter: usize,

    /// Convergence tolerance on the temperature change
    pub epsilon: f64,

    /// Heat source relaxation
    pub alpha: Relaxation,

    /// Temperature relaxation
    #[serde(rename = "alpha-t", alias = "alpha-T")]
    pub alpha_t: Relaxation,

    /// Density relaxation
    #[serde(rename = "alpha-rho")]
    pub alpha_rho: Relaxation,

    /// Norm of the temperature change
    #[serde(rename = "convergence-norm")]
    pub convergence_norm: Norm,

    #[serde(rename = "temperature-ic")]
    pub temperature_ic: InitialCondition,

    #[serde(rename = "density-ic")]
    pub density_ic: InitialCondition,

    /// Compare heat-fluids volumes against the field solver's cell volumes
    #[serde(rename = "check-volumes")]
    pub check_volumes: bool,
}

impl Default for CouplingConfig {
    fn default() -> Self {
        Self {
            power: 1.0e4,
            max_timesteps: 1,
            max_picard_iter: 20,
            epsilon: 1.0e-3,
            alpha: Relaxation::default(),
            alpha_t: Relaxation::default(),
            alpha_rho: Relaxation::default(),
            convergence_norm: Norm::default(),
            temperature_ic: InitialCondition::default(),
            density_ic: InitialCondition::default(),
            check_volumes: false,
        }
    }
}

/// Field solver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldConfig {
    /// Driver implementation (currently only "surrogate")
    pub driver: String,

    pub nodes: usize,

    #[serde(rename = "procs-per-node")]
    pub procs_per_node: usize,

    /// Surrogate driver parameters
    pub surrogate: SurrogateFieldConfig,
}

impl FieldConfig {
    /// Ranks requested for the field group
    pub fn ranks(&self) -> usize {
        self.nodes * self.procs_per_node
    }
}

impl Default for FieldConfig {
    fn default() -> Self {
        Self {
            driver: "surrogate".to_string(),
            nodes: 1,
            procs_per_node: 1,
            surrogate: SurrogateFieldConfig::default(),
        }
    }
}

/// Heat-fluids solver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatFluidsConfig {
    /// Driver implementation (currently only "surrogate")
    pub driver: String,

    pub nodes: usize,

    #[serde(rename = "procs-per-node")]
    pub procs_per_node: usize,

    /// Surrogate driver parameters
    pub surrogate: SurrogateHeatConfig,
}

impl HeatFluidsConfig {
    /// Ranks requested for the heat-fluids group
    pub fn ranks(&self) -> usize {
        self.nodes * self.procs_per_node
    }
}

impl Default for HeatFluidsConfig {
    fn default() -> Self {
        Self {
            driver: "surrogate".to_string(),
            nodes: 1,
            procs_per_node: 2,
            surrogate: SurrogateHeatConfig::default(),
        }
    }
}

/// Parameters of the lattice field surrogate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SurrogateFieldConfig {
    /// Cells along x, y, z
    pub lattice: [usize; 3],

    /// Box extent along x, y, z [cm]
    pub extent: [f64; 3],

    #[serde(rename = "initial-temperature")]
    pub initial_temperature: f64,

    #[serde(rename = "initial-density")]
    pub initial_density: f64,

    #[serde(rename = "reference-temperature")]
    pub reference_temperature: f64,

    #[serde(rename = "reference-density")]
    pub reference_density: f64,

    /// Fractional weight loss per kelvin above the reference temperature
    #[serde(rename = "doppler-coefficient")]
    pub doppler_coefficient: f64,

    /// Fractional weight gain per g/cm3 above the reference density
    #[serde(rename = "density-coefficient")]
    pub density_coefficient: f64,

    /// Relative amplitude of uniform noise on the tallies
    pub noise: f64,

    pub seed: u64,
}

impl Default for SurrogateFieldConfig {
    fn default() -> Self {
        Self {
            lattice: [2, 2, 4],
            extent: [1.26, 1.26, 4.0],
            initial_temperature: 565.0,
            initial_density: 0.74,
            reference_temperature: 565.0,
            reference_density: 0.74,
            doppler_coefficient: 2.0e-4,
            density_coefficient: 0.1,
            noise: 0.0,
            seed: 1,
        }
    }
}

/// Parameters of the lumped heat-fluids surrogate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SurrogateHeatConfig {
    /// Elements along x, y, z
    pub elements: [usize; 3],

    /// Box extent along x, y, z [cm]
    pub extent: [f64; 3],

    #[serde(rename = "inlet-temperature")]
    pub inlet_temperature: f64,

    /// Volumetric heat transfer coefficient [W/cm3/K]
    #[serde(rename = "heat-transfer-coefficient")]
    pub heat_transfer_coefficient: f64,

    /// Elements whose centroid lies at x >= this value are fluid
    #[serde(rename = "fluid-x-min")]
    pub fluid_x_min: f64,

    /// Fluid density at the inlet temperature [g/cm3]
    #[serde(rename = "fluid-density")]
    pub fluid_density: f64,

    /// Volumetric thermal expansion of the fluid [1/K]
    #[serde(rename = "expansion-coefficient")]
    pub expansion_coefficient: f64,

    #[serde(rename = "solid-density")]
    pub solid_density: f64,
}

impl Default for SurrogateHeatConfig {
    fn default() -> Self {
        Self {
            elements: [4, 4, 8],
            extent: [1.26, 1.26, 4.0],
            inlet_temperature: 565.0,
            heat_transfer_coefficient: 10.0,
            fluid_x_min: 0.63,
            fluid_density: 0.74,
            expansion_coefficient: 1.0e-3,
            solid_density: 10.4,
        }
    }
}
