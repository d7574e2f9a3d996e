//! Core types shared across gangsim components

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Unique identifier for a workload
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadId(pub String);

impl WorkloadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Catalog entry for a batch workload
///
/// Size bounds are in resource units, duration bounds in minutes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub id: WorkloadId,
    pub size_low: f64,
    pub size_high: f64,
    pub duration_low: f64,
    pub duration_high: f64,
}

impl Workload {
    pub fn new(id: impl Into<String>, size: (f64, f64), duration: (f64, f64)) -> Self {
        Self {
            id: WorkloadId::new(id),
            size_low: size.0,
            size_high: size.1,
            duration_low: duration.0,
            duration_high: duration.1,
        }
    }
}

/// Discrete action index in `[0, num_actions)`
pub type Action = usize;

/// Per-workload demand mapping (predicted or actual)
pub type DemandMap = BTreeMap<WorkloadId, f64>;

/// Current allocated capacity per workload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceAllocation {
    units: BTreeMap<WorkloadId, f64>,
}

impl ResourceAllocation {
    pub fn new(units: BTreeMap<WorkloadId, f64>) -> Self {
        Self { units }
    }

    pub fn get(&self, id: &WorkloadId) -> Option<f64> {
        self.units.get(id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&WorkloadId, &f64)> {
        self.units.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&WorkloadId, &mut f64)> {
        self.units.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Sum of all allocated units
    pub fn total(&self) -> f64 {
        self.units.values().sum()
    }
}

/// One resource-state snapshot: `(allocation, actual demand)` per workload, in workload order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub values: Vec<f64>,
}

impl Snapshot {
    /// Number of features per workload in a snapshot
    pub const FEATURES_PER_WORKLOAD: usize = 2;

    /// Padding snapshot used before enough history accumulates
    pub fn zeroed(workloads: usize) -> Self {
        Self {
            values: vec![0.0; workloads * Self::FEATURES_PER_WORKLOAD],
        }
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (f64, f64)>) -> Self {
        let values = pairs
            .into_iter()
            .flat_map(|(allocated, actual)| [allocated, actual])
            .collect();
        Self { values }
    }
}

/// Rolling window of the most recent snapshots, oldest first
///
/// Always holds exactly `window_size` snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    window_size: usize,
    snapshots: VecDeque<Snapshot>,
}

impl Observation {
    /// A window padded entirely with zero snapshots
    pub fn filled(window_size: usize, workloads: usize) -> Self {
        let snapshots = (0..window_size).map(|_| Snapshot::zeroed(workloads)).collect();
        Self {
            window_size,
            snapshots,
        }
    }

    /// Append a snapshot, evicting the oldest once the window is full
    pub fn push(&mut self, snapshot: Snapshot) {
        if self.window_size == 0 {
            return;
        }
        while self.snapshots.len() >= self.window_size {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(snapshot);
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.back()
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.iter()
    }

    /// Flattened feature vector handed to decision policies
    pub fn features(&self) -> Vec<f64> {
        self.snapshots
            .iter()
            .flat_map(|s| s.values.iter().copied())
            .collect()
    }
}

/// Diagnostic data returned alongside each environment step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    /// Env-local step counter after this step
    pub step: u64,
    /// Simulated seconds elapsed in the current episode
    pub elapsed_secs: f64,
    pub allocation: ResourceAllocation,
    /// `allocation - actual` per workload (negative = under-provisioned)
    pub gap: DemandMap,
}

/// Result of applying one action to an environment
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub observation: Observation,
    pub reward: f64,
    pub done: bool,
    pub info: StepInfo,
}

/// Component that raised a fatal error during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Component {
    Configurer,
    Environment,
    Controller,
    Policy,
    Barrier,
    Forecast,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Component::Configurer => write!(f, "resource-configurer"),
            Component::Environment => write!(f, "environment"),
            Component::Controller => write!(f, "mpc-controller"),
            Component::Policy => write!(f, "decision-policy"),
            Component::Barrier => write!(f, "barrier"),
            Component::Forecast => write!(f, "forecast-provider"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observation_window_never_exceeds_size() {
        let mut obs = Observation::filled(3, 1);
        assert_eq!(obs.len(), 3);

        for i in 0..10 {
            obs.push(Snapshot::from_pairs([(i as f64, 1.0)]));
            assert_eq!(obs.len(), 3);
        }

        // Oldest first: the last three pushes remain
        let firsts: Vec<f64> = obs.snapshots().map(|s| s.values[0]).collect();
        assert_eq!(firsts, vec![7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_observation_features_flatten_oldest_first() {
        let mut obs = Observation::filled(2, 1);
        obs.push(Snapshot::from_pairs([(5.0, 6.0)]));

        assert_eq!(obs.features(), vec![0.0, 0.0, 5.0, 6.0]);
        assert_eq!(obs.latest().unwrap().values, vec![5.0, 6.0]);
    }

    #[test]
    fn test_workload_id_serializes_as_plain_string() {
        let mut units = BTreeMap::new();
        units.insert(WorkloadId::new("etl"), 12.5);
        let allocation = ResourceAllocation::new(units);

        let json = serde_json::to_string(&allocation).unwrap();
        assert_eq!(json, r#"{"etl":12.5}"#);

        let back: ResourceAllocation = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get(&WorkloadId::new("etl")), Some(12.5));
        assert_eq!(back.total(), 12.5);
    }
}
