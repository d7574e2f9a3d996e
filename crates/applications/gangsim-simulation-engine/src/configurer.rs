//! Resource configuration actions
//!
//! The configurer owns per-workload allocations and translates discrete
//! action indices into allocation changes.
//!
//! Action table (`num_actions` selects a prefix):
//!
//! | Index | Action      | Effect per workload                |
//! |-------|-------------|------------------------------------|
//! | 0     | `Hold`      | unchanged                          |
//! | 1     | `ScaleUp`   | `+ scale_step`                     |
//! | 2     | `ScaleDown` | `- scale_step`, floored at zero    |
//! | 3     | `Rebalance` | reset to the predicted demand      |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use gangsim_core::{Action, DemandMap, GangError, ResourceAllocation, Result, Workload, WorkloadId};

/// Default allocation change for scale actions (resource units)
pub const DEFAULT_SCALE_STEP: f64 = 10.0;

/// Concrete configuration action behind an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceAction {
    Hold,
    ScaleUp,
    ScaleDown,
    Rebalance,
}

impl ResourceAction {
    /// Full action table, in index order
    pub const TABLE: [ResourceAction; 4] = [
        ResourceAction::Hold,
        ResourceAction::ScaleUp,
        ResourceAction::ScaleDown,
        ResourceAction::Rebalance,
    ];

    pub fn from_index(index: Action) -> Option<Self> {
        Self::TABLE.get(index).copied()
    }

    pub fn index(self) -> Action {
        match self {
            ResourceAction::Hold => 0,
            ResourceAction::ScaleUp => 1,
            ResourceAction::ScaleDown => 2,
            ResourceAction::Rebalance => 3,
        }
    }
}

/// Owns and mutates per-workload resource allocations
#[derive(Debug, Clone)]
pub struct ResourceConfigurer {
    /// Workloads in catalog order
    order: Vec<WorkloadId>,
    /// Predicted demand; also the reset baseline
    predictions: DemandMap,
    allocation: ResourceAllocation,
    num_actions: usize,
    scale_step: f64,
}

impl ResourceConfigurer {
    /// Create a configurer whose baseline allocation is the predicted demand
    pub fn new(
        workloads: &[Workload],
        predictions: &DemandMap,
        num_actions: usize,
        scale_step: f64,
    ) -> Result<Self> {
        if num_actions == 0 || num_actions > ResourceAction::TABLE.len() {
            return Err(GangError::config(format!(
                "num_actions must be in 1..={}, got {num_actions}",
                ResourceAction::TABLE.len()
            )));
        }
        if !(scale_step.is_finite() && scale_step > 0.0) {
            return Err(GangError::config(format!(
                "scale_step must be positive, got {scale_step}"
            )));
        }

        let mut baseline = BTreeMap::new();
        for workload in workloads {
            let predicted = predictions.get(&workload.id).copied().ok_or_else(|| {
                GangError::ForecastUnavailable {
                    workload: workload.id.to_string(),
                }
            })?;
            baseline.insert(workload.id.clone(), predicted);
        }

        Ok(Self {
            order: workloads.iter().map(|w| w.id.clone()).collect(),
            allocation: ResourceAllocation::new(baseline.clone()),
            predictions: baseline,
            num_actions,
            scale_step,
        })
    }

    /// Apply an action and return the resulting allocation
    ///
    /// Only `Hold` is idempotent; every other action is a stateful delta.
    pub fn configure(&mut self, action: Action) -> Result<ResourceAllocation> {
        let resource_action = self.resolve(action)?;

        match resource_action {
            ResourceAction::Hold => {}
            ResourceAction::ScaleUp => {
                for (_, units) in self.allocation.iter_mut() {
                    *units += self.scale_step;
                }
            }
            ResourceAction::ScaleDown => {
                for (_, units) in self.allocation.iter_mut() {
                    *units = (*units - self.scale_step).max(0.0);
                }
            }
            ResourceAction::Rebalance => {
                self.allocation = ResourceAllocation::new(self.predictions.clone());
            }
        }

        debug!(
            action,
            ?resource_action,
            total_units = self.allocation.total(),
            "Applied resource action"
        );

        Ok(self.allocation.clone())
    }

    /// Current allocation
    pub fn current_state(&self) -> ResourceAllocation {
        self.allocation.clone()
    }

    /// Restore the baseline allocation (predicted demand)
    pub fn reset(&mut self) {
        self.allocation = ResourceAllocation::new(self.predictions.clone());
    }

    /// Map an index to its action, rejecting indices outside the configured range
    pub fn resolve(&self, action: Action) -> Result<ResourceAction> {
        if action >= self.num_actions {
            return Err(GangError::InvalidAction {
                action,
                num_actions: self.num_actions,
            });
        }
        ResourceAction::from_index(action).ok_or(GangError::InvalidAction {
            action,
            num_actions: self.num_actions,
        })
    }

    pub fn num_actions(&self) -> usize {
        self.num_actions
    }

    pub fn scale_step(&self) -> f64 {
        self.scale_step
    }

    /// Workload ids in catalog order
    pub fn workload_ids(&self) -> &[WorkloadId] {
        &self.order
    }

    pub fn predictions(&self) -> &DemandMap {
        &self.predictions
    }
}
