//! src/config.rs
//!
//! Defines the strongly-typed configuration for both binaries, loaded from
//! files and environment variables via `figment`. A bad configuration is a
//! fatal start-up error; `validate()` runs before any actor is spawned.

use crate::error::{Error, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Configuration for the tracker binary: the experiment matrix knobs plus
/// the output directory for reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Address the tracker's QUIC endpoint binds to.
    pub bind_addr: SocketAddr,
    /// Number of nodes expected to register before experiments begin.
    pub nodes: usize,
    /// Duration of a single experiment, in milliseconds.
    pub duration_ms: u64,
    /// Number of distinct seeds to enumerate.
    pub experiments: u64,
    /// Repetitions per seed.
    pub repetitions: u32,
    /// First seed of the range.
    pub initial_seed: u64,
    /// Gossip period Δg in milliseconds.
    pub gossip_delta_ms: u64,
    /// Smallest failure timeout, in gossip rounds.
    pub min_failure_rounds: u32,
    /// Largest failure timeout, in gossip rounds.
    pub max_failure_rounds: u32,
    /// Miss grace period, in gossip rounds.
    pub miss_delta_rounds: u32,
    /// Idle gap between consecutive experiments, in milliseconds.
    pub time_between_experiments_ms: u64,
    /// Directory the per-experiment JSON reports are written to.
    pub report_path: PathBuf,
}

impl TrackerConfig {
    /// Loads configuration from `tracker.toml` and `TRACKER_`-prefixed
    /// environment variables, on top of the `Default` base layer.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(TrackerConfig::default()))
            .merge(Toml::file("tracker.toml"))
            .merge(Env::prefixed("TRACKER_"))
            .extract()
    }

    /// Rejects configurations the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.nodes < 2 {
            return Err(Error::InvalidConfig(
                "at least two nodes are required for gossip".into(),
            ));
        }
        if self.duration_ms == 0 {
            return Err(Error::InvalidConfig("duration_ms must be positive".into()));
        }
        if self.experiments == 0 || self.repetitions == 0 {
            return Err(Error::InvalidConfig(
                "experiments and repetitions must be positive".into(),
            ));
        }
        if self.gossip_delta_ms == 0 {
            return Err(Error::InvalidConfig(
                "gossip_delta_ms must be positive".into(),
            ));
        }
        if self.min_failure_rounds == 0 || self.min_failure_rounds > self.max_failure_rounds {
            return Err(Error::InvalidConfig(
                "failure rounds must satisfy 0 < min <= max".into(),
            ));
        }
        if self.miss_delta_rounds == 0 {
            return Err(Error::InvalidConfig(
                "miss_delta_rounds must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 6000),
            nodes: 3,
            duration_ms: 60_000,
            experiments: 1,
            repetitions: 1,
            initial_seed: 42,
            gossip_delta_ms: 200,
            min_failure_rounds: 4,
            max_failure_rounds: 6,
            miss_delta_rounds: 6,
            time_between_experiments_ms: 2_000,
            report_path: PathBuf::from("reports"),
        }
    }
}

/// Configuration for a single node binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Launcher-assigned node identifier.
    pub id: String,
    /// Address the node's QUIC endpoint binds to.
    pub bind_addr: SocketAddr,
    /// Address of the tracker endpoint to register with.
    pub tracker_addr: SocketAddr,
}

impl NodeConfig {
    /// Loads configuration from `node.toml` and `NODE_`-prefixed
    /// environment variables, on top of the `Default` base layer.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(NodeConfig::default()))
            .merge(Toml::file("node.toml"))
            .merge(Env::prefixed("NODE_"))
            .extract()
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvalidConfig("id must not be empty".into()));
        }
        if self.bind_addr == self.tracker_addr {
            return Err(Error::InvalidConfig(
                "bind_addr and tracker_addr must differ".into(),
            ));
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: String::from("n0"),
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 5000),
            tracker_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 6000),
        }
    }
}
