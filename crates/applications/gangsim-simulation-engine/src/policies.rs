//! Decision policies for resource configuration
//!
//! Implements multiple policies to compare:
//! - Linear: pretrained model artifact (weights + bias), argmax over action scores
//! - GapFollowing: scale toward actual demand observed in the latest snapshot
//! - Constant: always the same action (baseline, e.g. Hold)
//!
//! Policies are fitted elsewhere and only consumed here; nothing is retrained.

use serde::{Deserialize, Serialize};
use std::path::Path;

use gangsim_core::{Action, DecisionPolicy, GangError, Observation, Result};

use crate::configurer::ResourceAction;

/// Persisted linear model: `scores = weights · features + bias`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    /// One row per action, one column per observation feature
    pub weights: Vec<Vec<f64>>,
    /// One entry per action
    pub bias: Vec<f64>,
}

/// Linear policy loaded from a model artifact
pub struct LinearPolicy {
    name: String,
    model: LinearModel,
}

impl LinearPolicy {
    /// Build from an in-memory model, validating its shape
    pub fn new(name: impl Into<String>, model: LinearModel) -> Result<Self> {
        if model.weights.is_empty() {
            return Err(GangError::config("linear model has no action rows"));
        }
        if model.weights.len() != model.bias.len() {
            return Err(GangError::config(format!(
                "linear model has {} weight rows but {} bias entries",
                model.weights.len(),
                model.bias.len()
            )));
        }
        let width = model.weights[0].len();
        if model.weights.iter().any(|row| row.len() != width) {
            return Err(GangError::config("linear model weight rows differ in length"));
        }

        Ok(Self {
            name: name.into(),
            model,
        })
    }

    /// Load a JSON model artifact from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let model: LinearModel = serde_json::from_str(&raw)?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| format!("Linear({s})"))
            .unwrap_or_else(|| "Linear".to_string());
        Self::new(name, model)
    }

    /// Number of observation features the model expects
    pub fn input_width(&self) -> usize {
        self.model.weights[0].len()
    }
}

impl DecisionPolicy for LinearPolicy {
    fn predict(&self, observation: &Observation) -> Result<Action> {
        let features = observation.features();
        if features.len() != self.input_width() {
            return Err(GangError::policy(format!(
                "observation has {} features, model expects {}",
                features.len(),
                self.input_width()
            )));
        }

        let mut best: Option<(Action, f64)> = None;
        for (action, (row, bias)) in self.model.weights.iter().zip(&self.model.bias).enumerate() {
            let score = row.iter().zip(&features).map(|(w, x)| w * x).sum::<f64>() + bias;
            if !score.is_finite() {
                return Err(GangError::policy(format!(
                    "non-finite score for action {action}"
                )));
            }
            // First maximum wins ties
            if best.is_none_or(|(_, top)| score > top) {
                best = Some((action, score));
            }
        }

        best.map(|(action, _)| action)
            .ok_or_else(|| GangError::policy("linear model produced no scores"))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// GapFollowing policy: close the gap between allocation and actual demand
///
/// Reads the latest snapshot, compares total allocation with total actual
/// demand and scales up when under-provisioned beyond `tolerance` (a fraction
/// of demand), down when over-provisioned, and holds otherwise.
pub struct GapFollowingPolicy {
    tolerance: f64,
}

impl GapFollowingPolicy {
    pub fn new(tolerance: f64) -> Self {
        GapFollowingPolicy {
            tolerance: tolerance.max(0.0),
        }
    }
}

impl Default for GapFollowingPolicy {
    fn default() -> Self {
        Self::new(0.05)
    }
}

impl DecisionPolicy for GapFollowingPolicy {
    fn predict(&self, observation: &Observation) -> Result<Action> {
        let latest = observation
            .latest()
            .ok_or_else(|| GangError::policy("empty observation window"))?;

        let (allocated, actual) = latest
            .values
            .chunks_exact(2)
            .fold((0.0, 0.0), |(a, d), pair| (a + pair[0], d + pair[1]));

        let relative_gap = (allocated - actual) / actual.max(1.0);
        let action = if relative_gap < -self.tolerance {
            ResourceAction::ScaleUp
        } else if relative_gap > self.tolerance {
            ResourceAction::ScaleDown
        } else {
            ResourceAction::Hold
        };

        Ok(action.index())
    }

    fn name(&self) -> &str {
        "GapFollowing"
    }
}

/// Baseline policy: always the same action
pub struct ConstantPolicy {
    action: Action,
}

impl ConstantPolicy {
    pub fn new(action: Action) -> Self {
        ConstantPolicy { action }
    }

    /// Always hold the baseline allocation
    pub fn hold() -> Self {
        Self::new(ResourceAction::Hold.index())
    }
}

impl DecisionPolicy for ConstantPolicy {
    fn predict(&self, _observation: &Observation) -> Result<Action> {
        Ok(self.action)
    }

    fn name(&self) -> &str {
        "Constant"
    }
}
