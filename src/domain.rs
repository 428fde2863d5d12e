//! src/domain.rs
//!
//! Consolidates core data structures shared across the tracker and the
//! nodes. This module is the single source of truth for node identity, peer
//! state tags, experiment tuning knobs, and the wire message set.

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, net::SocketAddr};

/// A unique, launcher-assigned identifier for a node.
///
/// Identifiers are opaque strings; equality and ordering are lexicographic,
/// which is what the experiment generator relies on when it sorts the node
/// set before shuffling.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node::{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// The liveness verdict a node currently holds about one of its peers.
///
/// `Failed` peers are excluded from gossip targeting and from outgoing
/// heartbeat sets; they linger only until their cleanup timer erases them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    Correct,
    Missing,
    Failed,
}

/// The probability distribution used to draw a gossip target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickStrategy {
    /// Every correct peer is equally likely.
    Uniform,
    /// Weight `quiescence + 1`: stale peers are contacted more often.
    Linear,
    /// Weight `quiescence² + 1`: strongly favors the stalest peers.
    Quadratic,
}

impl PickStrategy {
    pub const ALL: [PickStrategy; 3] = [
        PickStrategy::Uniform,
        PickStrategy::Linear,
        PickStrategy::Quadratic,
    ];
}

impl fmt::Display for PickStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PickStrategy::Uniform => "uniform",
            PickStrategy::Linear => "linear",
            PickStrategy::Quadratic => "quadratic",
        };
        write!(f, "{name}")
    }
}

/// Heartbeat counters keyed by node, as carried in gossip messages.
pub type BeatMap = HashMap<NodeId, u64>;

/// One (identity, address) entry of the experiment roster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub id: NodeId,
    pub addr: SocketAddr,
}

/// Everything a node needs to take part in one experiment.
///
/// The tracker builds one bundle per node; `simulate_crash_at_delta` is
/// present only for nodes chosen to crash, so the absence of the field is
/// the "correct node" encoding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartBundle {
    /// The full node set of the experiment, including the receiver itself.
    pub peers: Vec<PeerEntry>,
    /// Milliseconds after Start at which this node must crash itself.
    pub simulate_crash_at_delta: Option<u64>,
    /// Gossip period Δg in milliseconds.
    pub gossip_delta: u64,
    /// Failure timeout Δf in milliseconds.
    pub failure_delta: u64,
    /// Miss grace period Δm in milliseconds (catastrophe mode only).
    pub miss_delta: u64,
    /// Whether a received Gossip provokes a GossipReply.
    pub push_pull: bool,
    pub pick_strategy: PickStrategy,
    pub enable_multicast: bool,
    /// Multicast probability exponent `a`.
    pub multicast_param: u32,
    /// Multicast saturation point: `wait == max_wait` sends with probability 1.
    pub multicast_max_wait: u32,
}

/// The complete wire message set, bincode-framed by the transport.
///
/// Control messages flow between nodes and the tracker; protocol messages
/// flow between nodes. Every message is fire-and-forget.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    // --- Control (node <-> tracker) ---
    /// A node announcing itself and its listen address to the tracker.
    Register { node: NodeId, addr: SocketAddr },
    StartExperiment(StartBundle),
    StopExperiment,
    Shutdown,
    /// Informational: a node executed its scheduled self-crash.
    Crash { node: NodeId },
    /// A suspicion report: `reporter` has decided that `node` has failed.
    CrashReport { reporter: NodeId, node: NodeId },

    // --- Protocol (node <-> node) ---
    Gossip { from: NodeId, beats: BeatMap },
    GossipReply { from: NodeId, beats: BeatMap },
    CatastropheMulticast { from: NodeId, beats: BeatMap },
    CatastropheReply { from: NodeId, beats: BeatMap },
}

impl Message {
    /// Short tag for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Register { .. } => "Register",
            Message::StartExperiment(_) => "StartExperiment",
            Message::StopExperiment => "StopExperiment",
            Message::Shutdown => "Shutdown",
            Message::Crash { .. } => "Crash",
            Message::CrashReport { .. } => "CrashReport",
            Message::Gossip { .. } => "Gossip",
            Message::GossipReply { .. } => "GossipReply",
            Message::CatastropheMulticast { .. } => "CatastropheMulticast",
            Message::CatastropheReply { .. } => "CatastropheReply",
        }
    }
}

// --- Unit Tests ---
