//! Workload catalog
//!
//! The catalog is a static, ordered list of workload descriptors loaded once
//! at startup and read-only for the rest of the run.

use std::collections::HashSet;
use std::path::Path;

use gangsim_core::{GangError, Result, Workload, WorkloadId};

/// Built-in catalog used when no `--workloads` file is given
pub fn default_catalog() -> Vec<Workload> {
    vec![
        // Sizes in resource units, durations in minutes
        Workload::new("etl-nightly", (40.0, 120.0), (75.0, 150.0)),
        Workload::new("model-training", (100.0, 400.0), (90.0, 150.0)),
        Workload::new("analytics-batch", (20.0, 80.0), (75.0, 120.0)),
    ]
}

/// Load a catalog from a JSON array of workloads
pub fn load_catalog(path: impl AsRef<Path>) -> Result<Vec<Workload>> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    let workloads: Vec<Workload> = serde_json::from_str(&raw)?;
    validate_catalog(&workloads)?;
    Ok(workloads)
}

/// Reject empty catalogs, duplicate ids and inverted bounds
pub fn validate_catalog(workloads: &[Workload]) -> Result<()> {
    if workloads.is_empty() {
        return Err(GangError::config("workload catalog is empty"));
    }

    let mut seen = HashSet::new();
    for workload in workloads {
        if !seen.insert(&workload.id) {
            return Err(GangError::config(format!(
                "duplicate workload id: {}",
                workload.id
            )));
        }
        if workload.size_low < 0.0 || workload.size_low > workload.size_high {
            return Err(GangError::config(format!(
                "workload {} has invalid size bounds [{}, {}]",
                workload.id, workload.size_low, workload.size_high
            )));
        }
        if workload.duration_low <= 0.0 || workload.duration_low > workload.duration_high {
            return Err(GangError::config(format!(
                "workload {} has invalid duration bounds [{}, {}]",
                workload.id, workload.duration_low, workload.duration_high
            )));
        }
    }

    Ok(())
}

/// Workload ids in catalog order
pub fn workload_ids(workloads: &[Workload]) -> Vec<WorkloadId> {
    workloads.iter().map(|w| w.id.clone()).collect()
}
