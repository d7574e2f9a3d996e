//! Simulation configuration
//!
//! One explicit structure passed to constructors at startup. Defaults: a
//! 6-snapshot window, 200 s steps, 4 actions and job batches lasting
//! 75-150 minutes.

use serde::{Deserialize, Serialize};
use std::path::Path;

use gangsim_core::{GangError, Result};

use crate::configurer::{DEFAULT_SCALE_STEP, ResourceAction};

/// Default barrier path shared by all participants
pub const DEFAULT_BARRIER_PATH: &str = "/gangsim/barrier";

/// Default coordinator endpoint
pub const DEFAULT_BARRIER_ENDPOINT: &str = "127.0.0.1:2181";

/// Configuration for one simulation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of snapshots in the observation window
    pub window_size: usize,

    /// Reward at an exact allocation/demand match
    pub default_reward: f64,

    /// Simulated seconds per step
    pub time_step: f64,

    /// Size of the action space (prefix of the action table)
    pub num_actions: usize,

    /// Episode duration bounds (minutes)
    pub duration_low: f64,
    pub duration_high: f64,

    /// Number of simulator steps in a run
    pub simulation_length: u64,

    /// Units added/removed by scale actions
    pub scale_step: f64,

    /// RNG seed (None = entropy)
    pub seed: Option<u64>,

    /// Synchronize every step through the barrier
    pub real_simulation: bool,

    /// Barrier path known to all participants
    pub barrier_path: String,

    /// Coordinator address (host:port)
    pub barrier_endpoint: String,

    /// Expected number of participants at the barrier
    pub participants: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            window_size: 6,
            default_reward: 0.0,
            time_step: 200.0,
            num_actions: ResourceAction::TABLE.len(),
            duration_low: 75.0,
            duration_high: 150.0,
            simulation_length: 10,
            scale_step: DEFAULT_SCALE_STEP,
            seed: None,
            real_simulation: false,
            barrier_path: DEFAULT_BARRIER_PATH.to_string(),
            barrier_endpoint: DEFAULT_BARRIER_ENDPOINT.to_string(),
            participants: 1,
        }
    }
}

impl SimulationConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Set window size
    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    /// Set simulation length
    pub fn with_simulation_length(mut self, steps: u64) -> Self {
        self.simulation_length = steps;
        self
    }

    /// Set episode duration bounds (minutes)
    pub fn with_duration(mut self, low: f64, high: f64) -> Self {
        self.duration_low = low;
        self.duration_high = high;
        self
    }

    /// Set RNG seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Enable barrier synchronization for `participants` participants
    pub fn with_barrier(mut self, path: impl Into<String>, participants: usize) -> Self {
        self.real_simulation = true;
        self.barrier_path = path.into();
        self.participants = participants;
        self
    }

    /// Reject inconsistent values before any component is built
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(GangError::config("window_size must be at least 1"));
        }
        if !(self.time_step.is_finite() && self.time_step > 0.0) {
            return Err(GangError::config(format!(
                "time_step must be positive, got {}",
                self.time_step
            )));
        }
        if self.num_actions == 0 || self.num_actions > ResourceAction::TABLE.len() {
            return Err(GangError::config(format!(
                "num_actions must be in 1..={}, got {}",
                ResourceAction::TABLE.len(),
                self.num_actions
            )));
        }
        if !(self.duration_low > 0.0 && self.duration_low <= self.duration_high) {
            return Err(GangError::config(format!(
                "duration bounds must satisfy 0 < low <= high, got [{}, {}]",
                self.duration_low, self.duration_high
            )));
        }
        if !self.default_reward.is_finite() {
            return Err(GangError::config("default_reward must be finite"));
        }
        if !(self.scale_step.is_finite() && self.scale_step > 0.0) {
            return Err(GangError::config(format!(
                "scale_step must be positive, got {}",
                self.scale_step
            )));
        }
        if self.participants == 0 {
            return Err(GangError::config("participants must be at least 1"));
        }
        if self.real_simulation && !self.barrier_path.starts_with('/') {
            return Err(GangError::config(format!(
                "barrier_path must be absolute, got {:?}",
                self.barrier_path
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SimulationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.window_size, 6);
        assert_eq!(config.time_step, 200.0);
        assert_eq!(config.num_actions, 4);
        assert!(!config.real_simulation);
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: SimulationConfig =
            serde_json::from_str(r#"{"simulation_length": 3, "real_simulation": true}"#).unwrap();
        assert_eq!(config.simulation_length, 3);
        assert!(config.real_simulation);
        assert_eq!(config.barrier_path, DEFAULT_BARRIER_PATH);
        assert_eq!(config.duration_high, 150.0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases = [
            SimulationConfig::default().with_window_size(0),
            SimulationConfig::default().with_duration(150.0, 75.0),
            SimulationConfig::default().with_duration(0.0, 10.0),
            SimulationConfig::default().with_barrier("relative/path", 2),
            SimulationConfig::default().with_barrier("/ok", 0),
            SimulationConfig {
                num_actions: 5,
                ..Default::default()
            },
            SimulationConfig {
                time_step: 0.0,
                ..Default::default()
            },
        ];

        for config in cases {
            assert!(
                matches!(config.validate(), Err(GangError::Config(_))),
                "{config:?} should be rejected"
            );
        }
    }
}
