//! Simulated resource environment
//!
//! Maintains the rolling observation window, reward bookkeeping and the
//! simulated clock behind the `Environment` reset/step contract.
//!
//! ## Reward
//!
//! ```text
//! reward = default_reward - mean_w( |allocation_w - actual_w| / max(actual_w, 1) )
//! ```
//!
//! An exact match scores `default_reward`; over- and under-provisioning are
//! penalised symmetrically, so reward never increases as the gap grows.
//!
//! ## Episodes
//!
//! Each `reset` samples a job-batch duration (minutes) uniformly from
//! `[duration_low, duration_high]`. The episode is done once elapsed
//! simulated seconds reach that duration.

use rand::prelude::*;
use tracing::{debug, info};

use gangsim_core::{
    Action, DemandMap, Environment, GangError, Observation, ResourceAllocation, Result, Snapshot,
    StepInfo, Transition, WorkloadId,
};

use crate::config::SimulationConfig;
use crate::configurer::ResourceConfigurer;

/// Seconds per unit of `duration_low`/`duration_high`
pub const DURATION_UNIT_SECS: f64 = 60.0;

/// Step counter and simulated time within an episode
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SimulationClock {
    pub step: u64,
    /// Simulated seconds
    pub time: f64,
}

impl SimulationClock {
    fn advance(&mut self, time_step: f64) {
        self.step += 1;
        self.time += time_step;
    }
}

/// Provisioning reward for an allocation against actual demand
pub fn provisioning_reward(allocation: &ResourceAllocation, actual: &DemandMap, default_reward: f64) -> f64 {
    if actual.is_empty() {
        return default_reward;
    }

    let penalty: f64 = actual
        .iter()
        .map(|(id, demand)| {
            let allocated = allocation.get(id).unwrap_or(0.0);
            (allocated - demand).abs() / demand.max(1.0)
        })
        .sum::<f64>()
        / actual.len() as f64;

    default_reward - penalty
}

/// `allocation - actual` per workload
pub fn demand_gap(allocation: &ResourceAllocation, actual: &DemandMap) -> DemandMap {
    actual
        .iter()
        .map(|(id, demand)| (id.clone(), allocation.get(id).unwrap_or(0.0) - demand))
        .collect()
}

/// Gym-style environment over a `ResourceConfigurer`
pub struct SimulatorEnv {
    configurer: ResourceConfigurer,
    actual: DemandMap,
    workload_ids: Vec<WorkloadId>,

    // Configuration
    window_size: usize,
    default_reward: f64,
    time_step: f64,
    duration_low: f64,
    duration_high: f64,

    // Episode state (`window` is None until the first reset)
    window: Option<Observation>,
    clock: SimulationClock,
    duration_secs: f64,
    done: bool,
    episodes: u64,

    rng: StdRng,
}

impl SimulatorEnv {
    /// Create an environment; call `reset` before the first `step`
    pub fn new(configurer: ResourceConfigurer, actual: DemandMap, config: &SimulationConfig) -> Result<Self> {
        config.validate()?;

        let workload_ids = configurer.workload_ids().to_vec();
        for id in &workload_ids {
            if !actual.contains_key(id) {
                return Err(GangError::ForecastUnavailable {
                    workload: id.to_string(),
                });
            }
        }
        let actual: DemandMap = workload_ids
            .iter()
            .filter_map(|id| actual.get(id).map(|v| (id.clone(), *v)))
            .collect();

        let rng = match config.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            configurer,
            actual,
            workload_ids,
            window_size: config.window_size,
            default_reward: config.default_reward,
            time_step: config.time_step,
            duration_low: config.duration_low,
            duration_high: config.duration_high,
            window: None,
            clock: SimulationClock::default(),
            duration_secs: 0.0,
            done: false,
            episodes: 0,
            rng,
        })
    }

    fn sample_duration_secs(&mut self) -> f64 {
        let minutes = if self.duration_high > self.duration_low {
            self.rng.gen_range(self.duration_low..=self.duration_high)
        } else {
            self.duration_low
        };
        minutes * DURATION_UNIT_SECS
    }

    fn snapshot(&self, allocation: &ResourceAllocation) -> Snapshot {
        Snapshot::from_pairs(self.workload_ids.iter().map(|id| {
            (
                allocation.get(id).unwrap_or(0.0),
                self.actual.get(id).copied().unwrap_or(0.0),
            )
        }))
    }

    pub fn configurer(&self) -> &ResourceConfigurer {
        &self.configurer
    }

    pub fn clock(&self) -> SimulationClock {
        self.clock
    }

    /// Sampled duration of the current episode (seconds)
    pub fn duration_secs(&self) -> f64 {
        self.duration_secs
    }

    pub fn actual(&self) -> &DemandMap {
        &self.actual
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Episodes started so far
    pub fn episodes(&self) -> u64 {
        self.episodes
    }
}

impl Environment for SimulatorEnv {
    fn reset(&mut self) -> Observation {
        self.configurer.reset();
        self.clock = SimulationClock::default();
        self.done = false;
        self.episodes += 1;
        self.duration_secs = self.sample_duration_secs();

        let observation = Observation::filled(self.window_size, self.workload_ids.len());
        self.window = Some(observation.clone());

        info!(
            episode = self.episodes,
            duration_secs = self.duration_secs,
            "Environment reset"
        );

        observation
    }

    fn step(&mut self, action: Action) -> Result<Transition> {
        if self.window.is_none() || self.done {
            return Err(GangError::EnvironmentNotReset);
        }

        let allocation = self.configurer.configure(action)?;
        let reward = provisioning_reward(&allocation, &self.actual, self.default_reward);
        let gap = demand_gap(&allocation, &self.actual);
        let snapshot = self.snapshot(&allocation);

        self.clock.advance(self.time_step);
        self.done = self.clock.time >= self.duration_secs;

        let observation = match self.window.as_mut() {
            Some(window) => {
                window.push(snapshot);
                window.clone()
            }
            None => return Err(GangError::EnvironmentNotReset),
        };

        debug!(
            step = self.clock.step,
            elapsed_secs = self.clock.time,
            reward,
            done = self.done,
            "Environment step"
        );

        Ok(Transition {
            observation,
            reward,
            done: self.done,
            info: StepInfo {
                step: self.clock.step,
                elapsed_secs: self.clock.time,
                allocation,
                gap,
            },
        })
    }

    fn observation(&self) -> Result<Observation> {
        self.window.clone().ok_or(GangError::EnvironmentNotReset)
    }

    fn num_actions(&self) -> usize {
        self.configurer.num_actions()
    }
}
