//! MPC simulation driver
//!
//! Runs the control loop for `simulation_length` steps and, in real
//! simulation mode, holds every participant at the barrier after each step
//! so gang-scheduled jobs start in lockstep across the fleet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

use gangsim_core::{
    Action, Barrier, Component, DemandMap, Environment, GangError, ResourceAllocation, Result, Workload,
};

use crate::config::SimulationConfig;
use crate::controller::ReinforcementMPController;

/// Participant name used when running without a barrier
pub const LOCAL_PARTICIPANT: &str = "local";

/// Outcome of one simulator step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: u64,
    /// Episode (job batch) the step belonged to, starting at 1
    pub episode: u64,
    /// Simulated seconds into the episode after the step
    pub sim_time: f64,
    pub action: Action,
    pub allocation: ResourceAllocation,
    pub reward: f64,
    /// `allocation - actual` per workload
    pub gap: DemandMap,
    /// The episode finished on this step
    pub done: bool,
    /// All participants cleared the barrier for this step
    pub barrier_released: bool,
    /// Sequence number taken before planning
    pub planned_seq: u64,
    /// Sequence number taken once the action was applied
    pub completed_seq: u64,
    pub completed_at: DateTime<Utc>,
}

/// Result of a simulation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResult {
    pub participant: String,
    pub policy_name: String,
    pub steps_completed: usize,
    pub episodes_finished: usize,
    pub total_reward: f64,
    pub mean_reward: f64,
    /// Mean absolute allocation gap per workload and step
    pub mean_abs_gap: f64,
    pub records: Vec<StepRecord>,
}

/// Top-level driver: controller loop plus barrier coordination
pub struct MPCSimulator<E: Environment> {
    mpc: ReinforcementMPController<E>,
    workloads: Vec<Workload>,
    actual: DemandMap,
    barrier: Option<Box<dyn Barrier>>,

    // Configuration
    simulation_length: u64,
    real_simulation: bool,
    barrier_path: String,
    participant: String,

    // Ordering across participants sharing a sequencer
    sequencer: Arc<AtomicU64>,

    // Run state
    episode: u64,
    records: Vec<StepRecord>,
}

impl<E: Environment> MPCSimulator<E> {
    /// Create a simulator around a controller whose environment is already reset
    pub fn new(
        mpc: ReinforcementMPController<E>,
        workloads: Vec<Workload>,
        actual: DemandMap,
        config: &SimulationConfig,
        barrier: Option<Box<dyn Barrier>>,
    ) -> Result<Self> {
        config.validate()?;

        if config.real_simulation && barrier.is_none() {
            return Err(GangError::config(
                "real_simulation requires a barrier backend",
            ));
        }
        for workload in &workloads {
            if !actual.contains_key(&workload.id) {
                return Err(GangError::ForecastUnavailable {
                    workload: workload.id.to_string(),
                });
            }
        }

        let participant = barrier
            .as_ref()
            .map(|b| b.participant().to_string())
            .unwrap_or_else(|| LOCAL_PARTICIPANT.to_string());

        Ok(Self {
            mpc,
            workloads,
            actual,
            barrier,
            simulation_length: config.simulation_length,
            real_simulation: config.real_simulation,
            barrier_path: config.barrier_path.clone(),
            participant,
            sequencer: Arc::new(AtomicU64::new(0)),
            episode: 1,
            records: Vec::new(),
        })
    }

    /// Share a sequence counter with other participants in this process
    pub fn with_sequencer(mut self, sequencer: Arc<AtomicU64>) -> Self {
        self.sequencer = sequencer;
        self
    }

    /// Run all steps
    ///
    /// On a fatal error the run halts, the barrier is aborted for every other
    /// participant and the error names the failing step and component. Steps
    /// recorded before the failure remain available through `records()`.
    pub async fn simulate(&mut self) -> Result<SimulationResult> {
        info!(
            participant = %self.participant,
            policy = self.mpc.policy_name(),
            steps = self.simulation_length,
            real_simulation = self.real_simulation,
            "Starting simulation"
        );

        for step in 0..self.simulation_length {
            if let Err(e) = self.run_step(step).await {
                error!(participant = %self.participant, step, error = %e, "Simulation halted");
                self.abort_barrier(&e).await;
                return Err(e);
            }
        }

        if let Some(barrier) = self.barrier.as_ref().filter(|_| self.real_simulation) {
            barrier
                .leave(&self.barrier_path)
                .await
                .map_err(|e| e.at_step(self.simulation_length, Component::Barrier))?;
        }

        let result = self.result();
        info!(
            participant = %result.participant,
            steps = result.steps_completed,
            total_reward = result.total_reward,
            "Simulation complete"
        );
        Ok(result)
    }

    async fn run_step(&mut self, step: u64) -> Result<()> {
        let planned_seq = self.next_seq();

        let outcome = self.mpc.control_step().map_err(|e| {
            let component = self.mpc.failure_component().unwrap_or(Component::Controller);
            e.at_step(step, component)
        })?;
        let completed_seq = self.next_seq();

        let transition = outcome.transition;
        self.records.push(StepRecord {
            step,
            episode: self.episode,
            sim_time: transition.info.elapsed_secs,
            action: outcome.action,
            allocation: transition.info.allocation,
            reward: transition.reward,
            gap: transition.info.gap,
            done: transition.done,
            barrier_released: false,
            planned_seq,
            completed_seq,
            completed_at: Utc::now(),
        });

        debug!(
            participant = %self.participant,
            step,
            action = outcome.action,
            reward = transition.reward,
            "Step recorded"
        );

        // Next batch of jobs
        if transition.done {
            self.mpc.env_mut().reset();
            self.episode += 1;
        }

        if self.real_simulation {
            if let Some(barrier) = &self.barrier {
                barrier
                    .arrive(&self.barrier_path, step)
                    .await
                    .map_err(|e| e.at_step(step, Component::Barrier))?;
                if let Some(record) = self.records.last_mut() {
                    record.barrier_released = true;
                }
            }
        }

        Ok(())
    }

    async fn abort_barrier(&self, err: &GangError) {
        if !self.real_simulation {
            return;
        }
        if let Some(barrier) = &self.barrier {
            if let Err(e) = barrier.abort(&self.barrier_path, &err.to_string()).await {
                warn!(participant = %self.participant, error = %e, "Failed to abort barrier");
            }
        }
    }

    fn next_seq(&self) -> u64 {
        self.sequencer.fetch_add(1, Ordering::SeqCst)
    }

    /// Summary of the steps recorded so far
    pub fn result(&self) -> SimulationResult {
        let steps_completed = self.records.len();
        let total_reward: f64 = self.records.iter().map(|r| r.reward).sum();
        let mean_reward = if steps_completed > 0 {
            total_reward / steps_completed as f64
        } else {
            0.0
        };

        let gaps: Vec<f64> = self
            .records
            .iter()
            .flat_map(|r| r.gap.values().map(|g| g.abs()))
            .collect();
        let mean_abs_gap = if gaps.is_empty() {
            0.0
        } else {
            gaps.iter().sum::<f64>() / gaps.len() as f64
        };

        SimulationResult {
            participant: self.participant.clone(),
            policy_name: self.mpc.policy_name().to_string(),
            steps_completed,
            episodes_finished: self.records.iter().filter(|r| r.done).count(),
            total_reward,
            mean_reward,
            mean_abs_gap,
            records: self.records.clone(),
        }
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn controller(&self) -> &ReinforcementMPController<E> {
        &self.mpc
    }

    pub fn workloads(&self) -> &[Workload] {
        &self.workloads
    }

    pub fn actual(&self) -> &DemandMap {
        &self.actual
    }

    pub fn participant(&self) -> &str {
        &self.participant
    }
}
