//! gangsim Core - Shared types and traits
//!
//! This crate defines the core abstractions used across:
//! - gangsim-simulation-engine (MPC control loop, `gangsim` binary)
//! - gangsim-coordinator (barrier coordination service)
//!
//! Key types:
//! - Environment, DecisionPolicy, ForecastProvider and Barrier traits
//! - Workloads, observations, actions and allocations
//! - Barrier wire protocol
//! - Error types

pub mod types;
pub mod traits;
pub mod error;
pub mod protocol;

pub use types::*;
pub use traits::*;
pub use error::*;
