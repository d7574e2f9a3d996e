//! Core traits for gangsim
//!
//! The simulator works through these interfaces ONLY, so environments,
//! policies, forecast sources and barrier backends are swappable.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::*;

/// Reinforcement-learning style environment contract.
///
/// `reset` must be called before the first `step`; stepping an environment
/// that was never reset fails with `GangError::EnvironmentNotReset`.
pub trait Environment: Send {
    /// Start a new episode and return the initial (padding) observation
    fn reset(&mut self) -> Observation;

    /// Apply one action and advance simulated time
    fn step(&mut self, action: Action) -> Result<Transition>;

    /// Copy of the current observation window
    fn observation(&self) -> Result<Observation>;

    /// Size of the discrete action space
    fn num_actions(&self) -> usize;
}

/// A fitted decision policy: observation in, discrete action out.
///
/// Implementations must be deterministic and side-effect free.
pub trait DecisionPolicy: Send + Sync {
    fn predict(&self, observation: &Observation) -> Result<Action>;

    /// Policy name (for results and logs)
    fn name(&self) -> &str;
}

/// Source of predicted and actual demand. Queried once before the loop starts.
pub trait ForecastProvider {
    fn predictions(&self, workloads: &[WorkloadId]) -> Result<DemandMap>;
    fn actuals(&self, workloads: &[WorkloadId]) -> Result<DemandMap>;
}

/// Distributed barrier shared by all participants of a gang-scheduled run.
#[async_trait]
pub trait Barrier: Send + Sync {
    /// Register arrival at `path` for `step` and block until every expected
    /// participant has arrived.
    async fn arrive(&self, path: &str, step: u64) -> Result<()>;

    /// Leave `path` cleanly at the end of a run
    async fn leave(&self, path: &str) -> Result<()>;

    /// Abandon `path` after a fatal error; every other participant waiting
    /// there observes a `BarrierDisconnect`
    async fn abort(&self, path: &str, reason: &str) -> Result<()>;

    /// Identity of this participant
    fn participant(&self) -> &str;
}
