//! Reinforcement-learning MPC controller
//!
//! Each control step asks the decision policy for an action on the current
//! observation window and applies it to the environment. The policy is a
//! black box: it is queried exactly once per step and never retried.
//!
//! ## State machine
//!
//! ```text
//! Idle ──► Planning ──► Acting ──► Idle
//!             │            │
//!             └────► Failed ◄┘   (terminal)
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use gangsim_core::{
    Action, Component, DecisionPolicy, Environment, GangError, Observation, Result, Transition,
};

/// Controller lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerState {
    /// Waiting for the next step
    Idle,
    /// Querying the decision policy
    Planning,
    /// Applying the chosen action to the environment
    Acting,
    /// A step failed; no further steps are accepted
    Failed,
}

/// Outcome of one control step
#[derive(Debug, Clone)]
pub struct ControlOutcome {
    pub action: Action,
    pub transition: Transition,
}

/// Outcome of a receding-horizon run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HorizonOutcome {
    /// Control steps actually taken
    pub steps: usize,
    pub total_reward: f64,
    /// The episode ended inside the horizon
    pub done: bool,
    pub actions: Vec<Action>,
}

/// MPC controller over an environment and an injected decision policy
pub struct ReinforcementMPController<E: Environment> {
    env: E,
    policy: Box<dyn DecisionPolicy>,
    state: ControllerState,
    failed_in: Option<Component>,
}

impl<E: Environment> ReinforcementMPController<E> {
    pub fn new(env: E, policy: Box<dyn DecisionPolicy>) -> Self {
        Self {
            env,
            policy,
            state: ControllerState::Idle,
            failed_in: None,
        }
    }

    /// Choose an action for `observation` without applying it
    pub fn plan_and_act(&mut self, observation: &Observation) -> Result<Action> {
        let action = self.plan(observation)?;
        self.state = ControllerState::Idle;
        Ok(action)
    }

    /// Plan on the environment's current observation and apply the action
    pub fn control_step(&mut self) -> Result<ControlOutcome> {
        self.ensure_usable()?;

        let observation = match self.env.observation() {
            Ok(obs) => obs,
            Err(e) => return Err(self.fail(Component::Environment, e)),
        };
        let action = self.plan(&observation)?;

        self.state = ControllerState::Acting;
        let transition = match self.env.step(action) {
            Ok(t) => t,
            Err(e) => {
                let component = match e {
                    GangError::InvalidAction { .. } => Component::Configurer,
                    _ => Component::Environment,
                };
                return Err(self.fail(component, e));
            }
        };
        self.state = ControllerState::Idle;

        debug!(
            policy = self.policy.name(),
            action,
            reward = transition.reward,
            done = transition.done,
            "Control step applied"
        );

        Ok(ControlOutcome { action, transition })
    }

    /// Run control steps for `window_size` steps or until the episode is done
    pub fn run_horizon(&mut self, window_size: usize) -> Result<HorizonOutcome> {
        let mut outcome = HorizonOutcome::default();

        for _ in 0..window_size {
            let step = self.control_step()?;
            outcome.steps += 1;
            outcome.total_reward += step.transition.reward;
            outcome.actions.push(step.action);

            if step.transition.done {
                outcome.done = true;
                break;
            }
        }

        Ok(outcome)
    }

    fn plan(&mut self, observation: &Observation) -> Result<Action> {
        self.ensure_usable()?;
        self.state = ControllerState::Planning;

        let action = match self.policy.predict(observation) {
            Ok(a) => a,
            Err(e) => return Err(self.fail(Component::Policy, e)),
        };

        let num_actions = self.env.num_actions();
        if action >= num_actions {
            return Err(self.fail(
                Component::Controller,
                GangError::InvalidAction {
                    action,
                    num_actions,
                },
            ));
        }

        Ok(action)
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.state == ControllerState::Failed {
            return Err(GangError::ControllerFailed);
        }
        Ok(())
    }

    fn fail(&mut self, component: Component, err: GangError) -> GangError {
        error!(
            policy = self.policy.name(),
            %component,
            error = %err,
            "Controller failed"
        );
        self.state = ControllerState::Failed;
        self.failed_in = Some(component);
        err
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Component responsible for the failure, once `Failed`
    pub fn failure_component(&self) -> Option<Component> {
        self.failed_in
    }

    pub fn policy_name(&self) -> &str {
        self.policy.name()
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut E {
        &mut self.env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::configurer::{ResourceAction, ResourceConfigurer};
    use crate::env::SimulatorEnv;
    use crate::policies::{ConstantPolicy, GapFollowingPolicy};
    use gangsim_core::{DemandMap, Workload, WorkloadId};

    struct BrokenPolicy;

    impl DecisionPolicy for BrokenPolicy {
        fn predict(&self, _observation: &Observation) -> Result<Action> {
            Err(GangError::policy("model artifact corrupted"))
        }

        fn name(&self) -> &str {
            "Broken"
        }
    }

    fn env(config: &SimulationConfig) -> SimulatorEnv {
        let workloads = vec![Workload::new("solo", (80.0, 140.0), (75.0, 150.0))];
        let mut predictions = DemandMap::new();
        predictions.insert(WorkloadId::new("solo"), 100.0);
        let mut actual = DemandMap::new();
        actual.insert(WorkloadId::new("solo"), 120.0);

        let configurer =
            ResourceConfigurer::new(&workloads, &predictions, config.num_actions, config.scale_step).unwrap();
        let mut env = SimulatorEnv::new(configurer, actual, config).unwrap();
        env.reset();
        env
    }

    #[test]
    fn test_control_step_returns_to_idle() {
        let config = SimulationConfig::default().with_seed(1);
        let mut controller = ReinforcementMPController::new(env(&config), Box::new(GapFollowingPolicy::default()));

        // Padding window carries no gap yet
        let first = controller.control_step().unwrap();
        assert_eq!(first.action, ResourceAction::Hold.index());
        assert_eq!(controller.state(), ControllerState::Idle);

        // 100 allocated vs 120 actual is now visible
        let second = controller.control_step().unwrap();
        assert_eq!(second.action, ResourceAction::ScaleUp.index());
        assert_eq!(controller.env().clock().step, 2);
    }

    #[test]
    fn test_plan_and_act_does_not_step_env() {
        let config = SimulationConfig::default().with_seed(1);
        let mut controller = ReinforcementMPController::new(env(&config), Box::new(ConstantPolicy::new(2)));

        let observation = controller.env().observation().unwrap();
        assert_eq!(controller.plan_and_act(&observation).unwrap(), 2);
        assert_eq!(controller.env().clock().step, 0);
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[test]
    fn test_policy_error_is_terminal() {
        let config = SimulationConfig::default().with_seed(1);
        let mut controller = ReinforcementMPController::new(env(&config), Box::new(BrokenPolicy));

        assert!(matches!(controller.control_step(), Err(GangError::Policy(_))));
        assert_eq!(controller.state(), ControllerState::Failed);
        assert_eq!(controller.failure_component(), Some(Component::Policy));

        // No retry, no recovery
        assert!(matches!(controller.control_step(), Err(GangError::ControllerFailed)));
        assert_eq!(controller.env().clock().step, 0);
    }

    #[test]
    fn test_out_of_range_action_rejected_before_apply() {
        let config = SimulationConfig {
            num_actions: 2,
            ..SimulationConfig::default().with_seed(1)
        };
        let mut controller = ReinforcementMPController::new(env(&config), Box::new(ConstantPolicy::new(3)));

        match controller.control_step() {
            Err(GangError::InvalidAction { action, num_actions }) => {
                assert_eq!(action, 3);
                assert_eq!(num_actions, 2);
            }
            other => panic!("expected InvalidAction, got {other:?}"),
        }
        assert_eq!(controller.failure_component(), Some(Component::Controller));
        assert_eq!(controller.env().clock().step, 0);
    }

    #[test]
    fn test_step_on_unreset_env_fails_in_environment() {
        let config = SimulationConfig::default().with_seed(1);
        let workloads = vec![Workload::new("solo", (80.0, 140.0), (75.0, 150.0))];
        let demand: DemandMap = [(WorkloadId::new("solo"), 100.0)].into_iter().collect();
        let configurer = ResourceConfigurer::new(&workloads, &demand, 4, 10.0).unwrap();
        let fresh = SimulatorEnv::new(configurer, demand, &config).unwrap();

        let mut controller = ReinforcementMPController::new(fresh, Box::new(ConstantPolicy::hold()));
        assert!(matches!(controller.control_step(), Err(GangError::EnvironmentNotReset)));
        assert_eq!(controller.failure_component(), Some(Component::Environment));
    }

    #[test]
    fn test_run_horizon_accumulates_reward() {
        let config = SimulationConfig::default().with_seed(4).with_duration(1000.0, 1000.0);
        let mut controller = ReinforcementMPController::new(env(&config), Box::new(ConstantPolicy::hold()));

        let outcome = controller.run_horizon(6).unwrap();
        assert_eq!(outcome.steps, 6);
        assert!(!outcome.done);
        assert_eq!(outcome.actions, vec![0; 6]);
        // Hold at 100 vs 120: each step costs 20/120
        assert!((outcome.total_reward - 6.0 * (-20.0 / 120.0)).abs() < 1e-9);
    }

    #[test]
    fn test_run_horizon_stops_when_done() {
        // 10 minutes at 200 s per step: done on the third step
        let config = SimulationConfig::default().with_seed(4).with_duration(10.0, 10.0);
        let mut controller = ReinforcementMPController::new(env(&config), Box::new(ConstantPolicy::hold()));

        let outcome = controller.run_horizon(6).unwrap();
        assert_eq!(outcome.steps, 3);
        assert!(outcome.done);
    }
}
