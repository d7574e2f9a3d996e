//! Gangsim Simulation Engine
//!
//! Model-predictive control loop for gang-scheduled batch workloads, with
//! optional lockstep coordination across participants through a barrier.

pub mod barrier;
pub mod bootstrap;
pub mod config;
pub mod configurer;
pub mod controller;
pub mod env;
pub mod forecast;
pub mod policies;
pub mod simulator;
pub mod workloads;

pub use config::SimulationConfig;
pub use configurer::{ResourceAction, ResourceConfigurer};
pub use controller::{ControlOutcome, ControllerState, HorizonOutcome, ReinforcementMPController};
pub use env::SimulatorEnv;
pub use simulator::{MPCSimulator, SimulationResult, StepRecord};
