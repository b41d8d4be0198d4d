//! Integration tests for Picard
//!
//! These tests run whole coupled simulations with the surrogate drivers.

use std::time::Duration;

use picard::config::{Config, InitialCondition};
use picard::convergence::Norm;
use picard::driver::{
    Driver, DriverError, ElementIndex, HeatFluidsDriver, Position, create_field_driver, create_heat_driver,
};
use picard::error::CouplingError;
use picard::launcher::{launch, launch_with};
use picard::relaxation::Relaxation;
use picard::transport::Comm;

/// Every coupled run in here must finish well within this
const RUN_TIMEOUT: Duration = Duration::from_secs(30);

fn config() -> Config {
    let mut config = Config::default();
    config.coupling.max_picard_iter = 30;
    config
}

async fn run(config: &Config) -> Result<picard::RunSummary, CouplingError> {
    tokio::time::timeout(RUN_TIMEOUT, launch(config))
        .await
        .expect("coupled run hung")
}

// =============================================================================
// Convergence
// =============================================================================

#[tokio::test]
async fn test_surrogate_run_converges_under_each_norm() {
    for norm in [Norm::L1, Norm::L2, Norm::Linf] {
        let mut config = config();
        config.coupling.convergence_norm = norm;

        let summary = run(&config).await.unwrap();

        assert!(summary.converged(), "{} run did not converge: {:?}", norm, summary.history);
        assert_eq!(summary.norm, norm);
        assert!(summary.total_iterations() > 1, "first iteration moves temperatures");
        let last = summary.history.last().unwrap();
        assert!(last.norm < config.coupling.epsilon);
    }
}

#[tokio::test]
async fn test_surrogate_run_converges_with_robbins_monro() {
    let mut config = config();
    config.coupling.alpha = Relaxation::RobbinsMonro;
    config.coupling.alpha_t = Relaxation::RobbinsMonro;
    config.coupling.alpha_rho = Relaxation::RobbinsMonro;
    config.coupling.epsilon = 1e-2;

    let summary = run(&config).await.unwrap();

    assert!(summary.converged(), "history: {:?}", summary.history);
}

#[tokio::test]
async fn test_fixed_relaxation_converges() {
    let mut config = config();
    config.coupling.alpha = Relaxation::Fixed(0.7);
    config.coupling.alpha_t = Relaxation::Fixed(0.8);

    let summary = run(&config).await.unwrap();

    assert!(summary.converged());
}

#[tokio::test]
async fn test_multiple_timesteps_and_groups_with_idle_rank() {
    let mut config = config();
    config.world_size = Some(6);
    config.field.procs_per_node = 2;
    config.heat_fluids.procs_per_node = 3;
    config.coupling.max_timesteps = 2;
    config.coupling.temperature_ic = InitialCondition::HeatFluids;
    config.coupling.density_ic = InitialCondition::HeatFluids;
    config.coupling.check_volumes = true;

    let summary = run(&config).await.unwrap();

    assert_eq!(summary.timesteps.len(), 2);
    assert!(summary.converged());
    assert_eq!(summary.timesteps[1].timestep, 1);
    assert!(summary.timesteps.iter().all(|t| t.iterations >= 1));
}

// =============================================================================
// Non-convergence is not an error
// =============================================================================

#[tokio::test]
async fn test_exhausted_budget_is_not_an_error() {
    let mut config = config();
    config.coupling.max_picard_iter = 2;
    config.coupling.epsilon = 1e-12;

    let summary = run(&config).await.unwrap();

    assert!(!summary.converged());
    assert_eq!(summary.total_iterations(), 2);
    assert_eq!(summary.timesteps[0].iterations, 2);
    assert!(summary.timesteps[0].final_norm.is_some());
    assert!(summary.finished_at.is_some());
}

#[tokio::test]
async fn test_noisy_tallies_run_to_budget() {
    let mut config = config();
    config.field.surrogate.noise = 0.05;
    config.coupling.alpha = Relaxation::RobbinsMonro;
    config.coupling.max_picard_iter = 6;
    config.coupling.epsilon = 1e-9;

    let summary = run(&config).await.unwrap();

    assert_eq!(summary.total_iterations(), 6);
    assert!(!summary.converged());
}

// =============================================================================
// Fatal errors
// =============================================================================

#[tokio::test]
async fn test_pool_too_small() {
    let mut config = config();
    config.world_size = Some(2);

    let err = run(&config).await.unwrap_err();
    assert!(matches!(err, CouplingError::PoolTooSmall { pool: 2, requested: 3 }));
}

#[tokio::test]
async fn test_unknown_driver() {
    let mut config = config();
    config.heat_fluids.driver = "nek5000".to_string();

    let err = run(&config).await.unwrap_err();
    assert!(err.is_config());
    assert!(err.to_string().contains("nek5000"));
}

#[tokio::test]
async fn test_unmapped_element_aborts_world() {
    let mut config = config();
    // heat-fluids domain sticks out of the field lattice along x
    config.heat_fluids.surrogate.extent = [2.0, 1.26, 4.0];

    let err = run(&config).await.unwrap_err();
    match err {
        CouplingError::UnmappedElement { position, .. } => assert!(position.x > 1.26),
        other => panic!("expected unmapped element, got {}", other),
    }
}

/// Heat-fluids driver that fails its solve on one rank after a few solves
struct FailingHeat {
    inner: Box<dyn HeatFluidsDriver>,
    fail_after: Option<usize>,
    solves: usize,
}

impl Driver for FailingHeat {
    fn comm(&self) -> &Comm {
        self.inner.comm()
    }

    fn init_step(&mut self) -> Result<(), DriverError> {
        self.inner.init_step()
    }

    fn solve_step(&mut self) -> Result<(), DriverError> {
        self.solves += 1;
        if self.fail_after.is_some_and(|n| self.solves > n) {
            return Err(DriverError::InvalidValue {
                quantity: "wall temperature",
                value: f64::NAN,
            });
        }
        self.inner.solve_step()
    }

    fn write_step(&mut self, timestep: usize, iteration: usize) -> Result<(), DriverError> {
        self.inner.write_step(timestep, iteration)
    }

    fn finalize_step(&mut self) -> Result<(), DriverError> {
        self.inner.finalize_step()
    }
}

impl HeatFluidsDriver for FailingHeat {
    fn has_coupling_data(&self) -> bool {
        self.inner.has_coupling_data()
    }

    fn temperature_local(&self) -> Vec<f64> {
        self.inner.temperature_local()
    }

    fn density_local(&self) -> Vec<f64> {
        self.inner.density_local()
    }

    fn volume_local(&self) -> Vec<f64> {
        self.inner.volume_local()
    }

    fn fluid_mask_local(&self) -> Vec<bool> {
        self.inner.fluid_mask_local()
    }

    fn centroid_local(&self) -> Vec<Position> {
        self.inner.centroid_local()
    }

    fn set_heat_source_at(&mut self, element: ElementIndex, heat: f64) -> Result<(), DriverError> {
        self.inner.set_heat_source_at(element, heat)
    }
}

#[tokio::test]
async fn test_driver_failure_on_one_rank_aborts_world() {
    let config = config();
    let field_config = config.field.clone();
    let heat_config = config.heat_fluids.clone();

    let result = tokio::time::timeout(
        RUN_TIMEOUT,
        launch_with(&config, move |topology| {
            let field = create_field_driver(&field_config, topology.field.clone())?;
            let inner = create_heat_driver(&heat_config, topology.heat.clone())?;
            // only the second heat-fluids rank fails
            let fail_after = (topology.heat.rank() == Some(1)).then_some(1);
            let heat: Box<dyn HeatFluidsDriver> = Box::new(FailingHeat {
                inner,
                fail_after,
                solves: 0,
            });
            Ok((field, heat))
        }),
    )
    .await
    .expect("world did not abort");

    assert!(matches!(
        result,
        Err(CouplingError::Driver(DriverError::InvalidValue {
            quantity: "wall temperature",
            ..
        }))
    ));
}
