//! src/tracker/report.rs
//!
//! Serializes one JSON document per finished experiment. The documents are
//! the system's only persistent output; they deserialize back into the same
//! types for downstream analysis and for the test suite.

use crate::{
    error::Result,
    tracker::experiment::{Experiment, ExperimentSettings, ExpectedCrash, ReportedCrash},
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::BufWriter,
    path::{Path, PathBuf},
};

/// The on-disk shape of one experiment report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentReport {
    pub id: usize,
    pub seed: u64,
    pub repetition: u32,
    pub settings: ExperimentSettings,
    pub result: ExperimentResult,
}

/// Timing and crash outcome of one experiment. Times are epoch
/// milliseconds; deltas are milliseconds since experiment start.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentResult {
    pub start_time: u64,
    pub end_time: u64,
    pub expected_crashes: Vec<ExpectedCrash>,
    pub reported_crashes: Vec<ReportedCrash>,
}

impl ExperimentReport {
    /// Builds the report document for a finished experiment. Calling this
    /// before `start()`/`stop()` is an orchestrator bug.
    pub fn from_experiment(experiment: &Experiment) -> Self {
        let start_time = experiment
            .start_time()
            .unwrap_or_else(|| panic!("experiment {}: report before start", experiment.id));
        let end_time = experiment
            .stop_time()
            .unwrap_or_else(|| panic!("experiment {}: report before stop", experiment.id));
        Self {
            id: experiment.id,
            seed: experiment.seed,
            repetition: experiment.repetition,
            settings: experiment.settings.clone(),
            result: ExperimentResult {
                start_time,
                end_time,
                expected_crashes: experiment.expected_crashes.clone(),
                reported_crashes: experiment.reported_crashes().to_vec(),
            },
        }
    }
}

/// Writes experiment reports into a configured directory.
pub struct Reporter {
    directory: PathBuf,
}

impl Reporter {
    /// Creates the report directory if needed.
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(Self { directory })
    }

    /// Serializes one experiment to `experiment-NNNN.json`.
    pub fn write(&self, experiment: &Experiment) -> Result<PathBuf> {
        let report = ExperimentReport::from_experiment(experiment);
        let path = self.path_for(report.id);
        let file = fs::File::create(&path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), &report)?;
        Ok(path)
    }

    pub fn path_for(&self, id: usize) -> PathBuf {
        self.directory.join(format!("experiment-{id:04}.json"))
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

// --- Unit Tests ---
