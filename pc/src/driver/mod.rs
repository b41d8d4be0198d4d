//! Physics solver drivers
//!
//! The coupling talks to each solver through a narrow driver trait. Concrete
//! drivers are chosen once per run by name from the configuration.

use tracing::debug;

mod error;
mod surrogate_field;
mod surrogate_heat;
pub mod traits;
mod types;

pub use error::DriverError;
pub use surrogate_field::SurrogateFieldDriver;
pub use surrogate_heat::SurrogateHeatDriver;
pub use traits::{Driver, FieldDriver, HeatFluidsDriver};
pub use types::{CellHandle, ElementIndex, Position};

use crate::config::{FieldConfig, HeatFluidsConfig};
use crate::error::CouplingError;
use crate::transport::Comm;

/// Create the field driver named in the config
///
/// `comm` is the field group communicator; non-members get a driver that
/// reports itself inactive.
pub fn create_field_driver(config: &FieldConfig, comm: Comm) -> Result<Box<dyn FieldDriver>, CouplingError> {
    debug!(driver = %config.driver, "create_field_driver: called");
    match config.driver.as_str() {
        "surrogate" => {
            debug!("create_field_driver: creating surrogate field driver");
            Ok(Box::new(SurrogateFieldDriver::new(&config.surrogate, comm)?))
        }
        other => {
            debug!(driver = %other, "create_field_driver: unknown driver");
            Err(CouplingError::Config(format!(
                "Unknown field driver: '{}'. Supported: surrogate",
                other
            )))
        }
    }
}

/// Create the heat-fluids driver named in the config
pub fn create_heat_driver(config: &HeatFluidsConfig, comm: Comm) -> Result<Box<dyn HeatFluidsDriver>, CouplingError> {
    debug!(driver = %config.driver, "create_heat_driver: called");
    match config.driver.as_str() {
        "surrogate" => {
            debug!("create_heat_driver: creating surrogate heat-fluids driver");
            Ok(Box::new(SurrogateHeatDriver::new(&config.surrogate, comm)?))
        }
        other => {
            debug!(driver = %other, "create_heat_driver: unknown driver");
            Err(CouplingError::Config(format!(
                "Unknown heat-fluids driver: '{}'. Supported: surrogate",
                other
            )))
        }
    }
}
