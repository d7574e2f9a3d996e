//! Demand forecast providers
//!
//! Forecasts are queried once before the control loop starts. Two sources:
//! - `StaticForecast`: fixed predicted/actual maps (in code or from JSON)
//! - `SyntheticForecast`: seeded synthetic demand for catalog workloads

use std::path::Path;

use rand::prelude::*;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use gangsim_core::{DemandMap, ForecastProvider, GangError, Result, Workload, WorkloadId};

/// Fixed predicted and actual demand per workload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticForecast {
    pub predicted: DemandMap,
    pub actual: DemandMap,
}

impl StaticForecast {
    pub fn new(predicted: DemandMap, actual: DemandMap) -> Self {
        Self { predicted, actual }
    }

    /// Load from a JSON file of the form `{"predicted": {...}, "actual": {...}}`
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Add one workload's predicted and actual demand
    pub fn with_workload(mut self, id: impl Into<String>, predicted: f64, actual: f64) -> Self {
        let id = WorkloadId::new(id);
        self.predicted.insert(id.clone(), predicted);
        self.actual.insert(id, actual);
        self
    }

    fn lookup(map: &DemandMap, workloads: &[WorkloadId]) -> Result<DemandMap> {
        workloads
            .iter()
            .map(|id| match map.get(id) {
                Some(value) if value.is_finite() => Ok((id.clone(), *value)),
                _ => Err(GangError::ForecastUnavailable {
                    workload: id.to_string(),
                }),
            })
            .collect()
    }
}

impl ForecastProvider for StaticForecast {
    fn predictions(&self, workloads: &[WorkloadId]) -> Result<DemandMap> {
        Self::lookup(&self.predicted, workloads)
    }

    fn actuals(&self, workloads: &[WorkloadId]) -> Result<DemandMap> {
        Self::lookup(&self.actual, workloads)
    }
}

/// Synthetic demand generator
///
/// For each workload:
/// - actual demand is drawn uniformly from the workload's size bounds
/// - predicted demand is the actual demand plus Gaussian error with
///   standard deviation `relative_noise * actual`, clamped at zero
pub struct SyntheticForecast {
    inner: StaticForecast,
}

impl SyntheticForecast {
    /// Generate demand for the catalog
    ///
    /// # Arguments
    /// * `workloads` - Catalog to generate demand for
    /// * `relative_noise` - Forecast error as a fraction of actual demand (e.g., 0.1 = 10%)
    /// * `seed` - RNG seed (None = entropy)
    pub fn generate(workloads: &[Workload], relative_noise: f64, seed: Option<u64>) -> Result<Self> {
        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        if !relative_noise.is_finite() || relative_noise < 0.0 {
            return Err(GangError::config(format!(
                "forecast noise must be a finite non-negative fraction, got {relative_noise}"
            )));
        }
        let error = Normal::new(0.0, relative_noise)
            .map_err(|e| GangError::config(format!("invalid forecast noise {relative_noise}: {e}")))?;

        let mut forecast = StaticForecast::default();
        for workload in workloads {
            let actual = if workload.size_high > workload.size_low {
                rng.gen_range(workload.size_low..=workload.size_high)
            } else {
                workload.size_low
            };
            let predicted = (actual * (1.0 + error.sample(&mut rng))).max(0.0);

            forecast.actual.insert(workload.id.clone(), actual);
            forecast.predicted.insert(workload.id.clone(), predicted);
        }

        Ok(Self { inner: forecast })
    }

    /// The generated maps
    pub fn as_static(&self) -> &StaticForecast {
        &self.inner
    }
}

impl ForecastProvider for SyntheticForecast {
    fn predictions(&self, workloads: &[WorkloadId]) -> Result<DemandMap> {
        self.inner.predictions(workloads)
    }

    fn actuals(&self, workloads: &[WorkloadId]) -> Result<DemandMap> {
        self.inner.actuals(workloads)
    }
}
