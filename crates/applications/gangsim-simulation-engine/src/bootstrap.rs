//! Participant assembly
//!
//! Wires configuration, catalog, forecasts, policy and barrier into a ready
//! `MPCSimulator`. Forecasts are fetched here, once, so missing demand data
//! fails before the control loop starts.

use tracing::info;

use gangsim_core::{Barrier, DecisionPolicy, Environment, ForecastProvider, Result, Workload};

use crate::config::SimulationConfig;
use crate::configurer::ResourceConfigurer;
use crate::controller::ReinforcementMPController;
use crate::env::SimulatorEnv;
use crate::simulator::MPCSimulator;
use crate::workloads::{validate_catalog, workload_ids};

/// Build one participant's simulator with its environment already reset
pub fn build_simulator(
    config: &SimulationConfig,
    workloads: &[Workload],
    forecast: &dyn ForecastProvider,
    policy: Box<dyn DecisionPolicy>,
    barrier: Option<Box<dyn Barrier>>,
) -> Result<MPCSimulator<SimulatorEnv>> {
    config.validate()?;
    validate_catalog(workloads)?;

    let ids = workload_ids(workloads);
    let predictions = forecast.predictions(&ids)?;
    let actual = forecast.actuals(&ids)?;

    let configurer = ResourceConfigurer::new(workloads, &predictions, config.num_actions, config.scale_step)?;
    let mut env = SimulatorEnv::new(configurer, actual.clone(), config)?;
    env.reset();

    info!(
        workloads = workloads.len(),
        policy = policy.name(),
        window_size = config.window_size,
        "Participant assembled"
    );

    let controller = ReinforcementMPController::new(env, policy);
    MPCSimulator::new(controller, workloads.to_vec(), actual, config, barrier)
}
