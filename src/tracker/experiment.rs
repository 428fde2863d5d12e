//! src/tracker/experiment.rs
//!
//! The experiment record and the deterministic matrix generator. The
//! generator enumerates the full Cartesian product of tuning parameters and
//! fixes, per experiment, which nodes crash and when. All of that randomness
//! comes from a ChaCha rng seeded with the experiment seed, so a report can
//! be reproduced from its seed alone.

use crate::{
    config::TrackerConfig,
    domain::{NodeId, PickStrategy},
    error::{Error, Result},
};
use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// All tuning parameters of one experiment. Immutable after generation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentSettings {
    pub catastrophe: bool,
    pub duration_ms: u64,
    pub gossip_delta: u64,
    pub failure_delta: u64,
    pub miss_delta: u64,
    pub push_pull: bool,
    pub pick_strategy: PickStrategy,
    pub enable_multicast: bool,
    pub multicast_param: u32,
    pub multicast_max_wait: u32,
    pub number_of_nodes: usize,
}

/// A crash the tracker schedules: `node` is told to die `delta` ms in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedCrash {
    pub delta: u64,
    pub node: NodeId,
}

/// A suspicion that reached the tracker `delta` ms into the experiment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedCrash {
    pub delta: u64,
    pub node: NodeId,
    pub reporter: NodeId,
}

/// One experiment: its settings, the crashes the tracker will inject, and
/// the crashes the nodes reported back.
///
/// `start()`, `add_crash()` and `stop()` follow a strict partial order;
/// violating it is an orchestrator bug and panics.
#[derive(Debug)]
pub struct Experiment {
    pub id: usize,
    pub seed: u64,
    pub repetition: u32,
    pub settings: ExperimentSettings,
    pub expected_crashes: Vec<ExpectedCrash>,
    start: Option<u64>,
    stop: Option<u64>,
    reported_crashes: Vec<ReportedCrash>,
}

impl Experiment {
    pub fn new(
        id: usize,
        seed: u64,
        repetition: u32,
        settings: ExperimentSettings,
        expected_crashes: Vec<ExpectedCrash>,
    ) -> Self {
        Self {
            id,
            seed,
            repetition,
            settings,
            expected_crashes,
            start: None,
            stop: None,
            reported_crashes: Vec::new(),
        }
    }

    /// Marks the experiment as started at `now_ms` (epoch milliseconds).
    pub fn start(&mut self, now_ms: u64) {
        assert!(self.start.is_none(), "experiment {} started twice", self.id);
        self.start = Some(now_ms);
    }

    /// Records one crash report. Legal only between `start()` and `stop()`.
    pub fn add_crash(&mut self, node: NodeId, reporter: NodeId, now_ms: u64) {
        let start = self
            .start
            .unwrap_or_else(|| panic!("experiment {}: crash recorded before start", self.id));
        assert!(
            self.stop.is_none(),
            "experiment {}: crash recorded after stop",
            self.id
        );
        self.reported_crashes.push(ReportedCrash {
            delta: now_ms.saturating_sub(start),
            node,
            reporter,
        });
    }

    /// Marks the experiment as stopped at `now_ms`.
    pub fn stop(&mut self, now_ms: u64) {
        assert!(
            self.start.is_some(),
            "experiment {} stopped before start",
            self.id
        );
        assert!(self.stop.is_none(), "experiment {} stopped twice", self.id);
        self.stop = Some(now_ms);
    }

    pub fn start_time(&self) -> Option<u64> {
        self.start
    }

    pub fn stop_time(&self) -> Option<u64> {
        self.stop
    }

    pub fn reported_crashes(&self) -> &[ReportedCrash] {
        &self.reported_crashes
    }
}

/// The axes of the experiment matrix, extracted from the tracker
/// configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatrixSettings {
    pub duration_ms: u64,
    pub experiments: u64,
    pub repetitions: u32,
    pub initial_seed: u64,
    pub gossip_delta_ms: u64,
    pub min_failure_rounds: u32,
    pub max_failure_rounds: u32,
    pub miss_delta_rounds: u32,
}

impl From<&TrackerConfig> for MatrixSettings {
    fn from(config: &TrackerConfig) -> Self {
        Self {
            duration_ms: config.duration_ms,
            experiments: config.experiments,
            repetitions: config.repetitions,
            initial_seed: config.initial_seed,
            gossip_delta_ms: config.gossip_delta_ms,
            min_failure_rounds: config.min_failure_rounds,
            max_failure_rounds: config.max_failure_rounds,
            miss_delta_rounds: config.miss_delta_rounds,
        }
    }
}

/// Enumerates the full experiment matrix over the registered node set.
///
/// Loop order is fixed (seed, repetition, catastrophe, failure rounds
/// descending by two, push-pull, pick strategy, multicast and its
/// parameters); experiment ids are the enumeration order.
pub fn generate_experiments(matrix: &MatrixSettings, nodes: &[NodeId]) -> Result<Vec<Experiment>> {
    if nodes.is_empty() {
        return Err(Error::InvalidConfig(
            "cannot generate experiments over an empty node set".into(),
        ));
    }

    let mut sorted_nodes = nodes.to_vec();
    sorted_nodes.sort();

    let mut experiments = Vec::new();
    for seed in matrix.initial_seed..matrix.initial_seed + matrix.experiments {
        for repetition in 0..matrix.repetitions {
            for catastrophe in [false, true] {
                for round in (matrix.min_failure_rounds..=matrix.max_failure_rounds)
                    .rev()
                    .step_by(2)
                {
                    for push_pull in [false, true] {
                        for pick_strategy in PickStrategy::ALL {
                            for (enable_multicast, multicast_param, multicast_max_wait) in
                                multicast_variants()
                            {
                                let settings = ExperimentSettings {
                                    catastrophe,
                                    duration_ms: matrix.duration_ms,
                                    gossip_delta: matrix.gossip_delta_ms,
                                    failure_delta: matrix.gossip_delta_ms * u64::from(round),
                                    miss_delta: matrix.gossip_delta_ms
                                        * u64::from(matrix.miss_delta_rounds),
                                    push_pull,
                                    pick_strategy,
                                    enable_multicast,
                                    multicast_param,
                                    multicast_max_wait,
                                    number_of_nodes: sorted_nodes.len(),
                                };
                                let expected_crashes = select_crashes(
                                    seed,
                                    &sorted_nodes,
                                    catastrophe,
                                    matrix.duration_ms,
                                );
                                experiments.push(Experiment::new(
                                    experiments.len(),
                                    seed,
                                    repetition,
                                    settings,
                                    expected_crashes,
                                ));
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(experiments)
}

/// (enable, param a, max_wait): one disabled variant, then a ∈ {1,2} crossed
/// with max_wait ∈ {1,2}.
fn multicast_variants() -> [(bool, u32, u32); 5] {
    [
        (false, 1, 1),
        (true, 1, 1),
        (true, 1, 2),
        (true, 2, 1),
        (true, 2, 2),
    ]
}

/// Picks the crash set for one experiment: shuffle the sorted node list,
/// then draw a single crash time in the first half of the run. The call
/// order (shuffle, then time draw) is part of the reproducibility contract.
fn select_crashes(
    seed: u64,
    sorted_nodes: &[NodeId],
    catastrophe: bool,
    duration_ms: u64,
) -> Vec<ExpectedCrash> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut shuffled = sorted_nodes.to_vec();
    shuffled.shuffle(&mut rng);

    // ⌈2N/3⌉ simultaneous crashes in a catastrophe, one otherwise.
    let crashes = if catastrophe {
        (2 * sorted_nodes.len() + 2) / 3
    } else {
        1
    };
    let crash_time = rng.gen_range(0..(duration_ms / 2).max(1));

    shuffled
        .into_iter()
        .take(crashes)
        .map(|node| ExpectedCrash {
            delta: crash_time,
            node,
        })
        .collect()
}

// --- Unit Tests ---
