//! Picard - relaxed fixed-point coupling of two physics solvers
//!
//! Picard runs a field solver (neutron transport) and a heat-fluids solver
//! (conjugate heat transfer) side by side on disjoint groups of ranks and
//! iterates them to a joint solution. Every Picard iteration the field
//! solver's heat source is handed to the heat-fluids elements, and the
//! resulting temperatures and densities are volume-averaged back onto the
//! field solver's cells, with under-relaxation on every exchanged quantity.
//!
//! # Core Concepts
//!
//! - **Disjoint Groups**: Each solver runs on its own ranks; idle ranks only join world collectives
//! - **Explicit Messages**: All data motion goes through point-to-point and collective calls on a [`Comm`]
//! - **Lock-Step Ranks**: Every rank takes the same convergence decision, broadcast from the heat-fluids root
//! - **Pluggable Solvers**: Drivers are chosen by name; surrogate drivers make the crate runnable on its own
//!
//! # Modules
//!
//! - [`transport`] - Message passing between ranks
//! - [`topology`] - Partition of the pool into solver groups
//! - [`mapping`] - Element to cell mapping
//! - [`exchange`] - Field movement between the groups
//! - [`relaxation`] - Under-relaxation policies
//! - [`convergence`] - Convergence test
//! - [`engine`] - Time-step and Picard loops
//! - [`driver`] - Solver driver traits and surrogate solvers
//! - [`launcher`] - One task per rank
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod convergence;
pub mod driver;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod launcher;
pub mod mapping;
pub mod relaxation;
pub mod topology;
pub mod transport;

// Re-export commonly used types
pub use config::{Config, CouplingConfig, FieldConfig, HeatFluidsConfig, InitialCondition};
pub use convergence::{ConvergenceMonitor, Norm};
pub use driver::{
    CellHandle, Driver, DriverError, ElementIndex, FieldDriver, HeatFluidsDriver, Position, create_field_driver,
    create_heat_driver,
};
pub use engine::{CouplingEngine, IterationRecord, Phase, RunSummary, TimestepSummary};
pub use error::{CouplingError, Result};
pub use exchange::{Accumulated, CellContribution, FieldExchange};
pub use launcher::{Drivers, launch, launch_with, run_world};
pub use mapping::{CellMapping, SpatialMapper};
pub use relaxation::{FieldVector, Relaxation};
pub use topology::{Partition, Topology};
pub use transport::{ChannelTransport, Comm, Rank, ReduceOp, Transport, TransportError};
