//! Error types for gangsim

use crate::types::Component;
use thiserror::Error;

/// Result type for gangsim operations
pub type Result<T> = std::result::Result<T, GangError>;

/// Core error type for gangsim operations
///
/// Every variant is fatal for the step it occurs in; nothing is retried.
#[derive(Error, Debug)]
pub enum GangError {
    /// Action index outside the configured action table
    #[error("Invalid action {action}: expected an index in [0, {num_actions})")]
    InvalidAction { action: usize, num_actions: usize },

    /// `step` called before `reset` (or after the episode ended)
    #[error("Environment stepped before reset")]
    EnvironmentNotReset,

    /// Decision policy failed to produce an action
    #[error("Policy error: {0}")]
    Policy(String),

    /// A participant failed to reach or hold the barrier
    #[error("Barrier disconnect at {path} (step {step}): {reason}")]
    BarrierDisconnect {
        path: String,
        step: u64,
        reason: String,
    },

    /// Forecast provider has no data for a required workload
    #[error("Forecast unavailable for workload {workload}")]
    ForecastUnavailable { workload: String },

    /// Controller already failed; it accepts no further steps
    #[error("MPC controller is in the failed state")]
    ControllerFailed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Barrier wire protocol violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Fatal failure of a simulation step, tagged with the failing component
    #[error("Step {step} failed in {component}: {source}")]
    StepFailed {
        step: u64,
        component: Component,
        #[source]
        source: Box<GangError>,
    },
}

impl GangError {
    /// Create a policy error
    pub fn policy(msg: impl Into<String>) -> Self {
        Self::Policy(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a barrier disconnect error
    pub fn barrier_disconnect(path: impl Into<String>, step: u64, reason: impl Into<String>) -> Self {
        Self::BarrierDisconnect {
            path: path.into(),
            step,
            reason: reason.into(),
        }
    }

    /// Wrap this error with the step and component it occurred in
    pub fn at_step(self, step: u64, component: Component) -> Self {
        match self {
            // Already attributed
            err @ Self::StepFailed { .. } => err,
            err => Self::StepFailed {
                step,
                component,
                source: Box::new(err),
            },
        }
    }

    /// The underlying error, looking through `StepFailed`
    pub fn root(&self) -> &GangError {
        match self {
            Self::StepFailed { source, .. } => source.root(),
            err => err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_failed_message_names_step_and_component() {
        let err = GangError::InvalidAction {
            action: 7,
            num_actions: 4,
        }
        .at_step(3, Component::Configurer);

        let msg = err.to_string();
        assert!(msg.contains("Step 3"));
        assert!(msg.contains("resource-configurer"));
        assert!(matches!(err.root(), GangError::InvalidAction { action: 7, .. }));
    }

    #[test]
    fn test_at_step_does_not_double_wrap() {
        let err = GangError::EnvironmentNotReset
            .at_step(1, Component::Environment)
            .at_step(2, Component::Controller);

        match err {
            GangError::StepFailed { step, component, .. } => {
                assert_eq!(step, 1);
                assert_eq!(component, Component::Environment);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
