//! src/view.rs
//!
//! The heartbeat view: everything one node believes about its peers. The
//! owning engine actor is the only writer; the outside world sees snapshots
//! only.

use crate::{
    domain::{BeatMap, NodeId, PeerStatus},
    scheduler::TimerHandle,
};
use serde::Serialize;
use std::collections::HashMap;

/// Per-peer record of the heartbeat view.
#[derive(Debug)]
pub struct PeerInfo {
    /// Highest heartbeat counter observed for this peer.
    pub beat_count: u64,
    /// Consecutive gossip exchanges during which the counter did not advance.
    pub quiescence: u32,
    pub status: PeerStatus,
    /// Identifier of the current outstanding Fail/Miss/Cleanup timer.
    /// Firings carrying an older token are stale and must be dropped.
    pub timeout_token: u64,
    /// Handle for the scheduled event, if any. Replacing or dropping it
    /// aborts the underlying timer task.
    pub timeout_handle: Option<TimerHandle>,
}

impl PeerInfo {
    fn new() -> Self {
        Self {
            beat_count: 0,
            quiescence: 0,
            status: PeerStatus::Correct,
            timeout_token: 0,
            timeout_handle: None,
        }
    }
}

/// The per-peer heartbeat table owned by one node, plus the node's own
/// counter. Peers leave the table only through [`HeartbeatView::remove`];
/// until then they are in exactly one of the CORRECT/MISSING/FAILED states.
pub struct HeartbeatView {
    own_id: NodeId,
    own_beat: u64,
    peers: HashMap<NodeId, PeerInfo>,
}

impl HeartbeatView {
    /// Builds a fresh view over `peer_ids`, all CORRECT with counter 0.
    /// The owner's own id is filtered out if present.
    pub fn new(own_id: NodeId, peer_ids: impl IntoIterator<Item = NodeId>) -> Self {
        let peers = peer_ids
            .into_iter()
            .filter(|id| *id != own_id)
            .map(|id| (id, PeerInfo::new()))
            .collect();
        Self {
            own_id,
            own_beat: 0,
            peers,
        }
    }

    pub fn own_id(&self) -> &NodeId {
        &self.own_id
    }

    pub fn own_beat(&self) -> u64 {
        self.own_beat
    }

    /// Increments the owner's own heartbeat counter.
    pub fn heartbeat(&mut self) -> u64 {
        self.own_beat += 1;
        self.own_beat
    }

    pub fn get(&self, peer: &NodeId) -> Option<&PeerInfo> {
        self.peers.get(peer)
    }

    pub fn status(&self, peer: &NodeId) -> Option<PeerStatus> {
        self.peers.get(peer).map(|info| info.status)
    }

    /// Records a higher counter for `peer`. Counters never move backwards.
    pub fn set_beat(&mut self, peer: &NodeId, value: u64) {
        if let Some(info) = self.peers.get_mut(peer) {
            debug_assert!(value >= info.beat_count, "heartbeat counter regressed");
            info.beat_count = value;
        }
    }

    /// Notes one more gossip exchange without a counter advance for `peer`.
    pub fn mark_quiescent(&mut self, peer: &NodeId) {
        if let Some(info) = self.peers.get_mut(peer) {
            info.quiescence = info.quiescence.saturating_add(1);
        }
    }

    pub fn reset_quiescence(&mut self, peer: &NodeId) {
        if let Some(info) = self.peers.get_mut(peer) {
            info.quiescence = 0;
        }
    }

    pub fn set_missing(&mut self, peer: &NodeId) {
        if let Some(info) = self.peers.get_mut(peer) {
            info.status = PeerStatus::Missing;
        }
    }

    pub fn unset_missing(&mut self, peer: &NodeId) {
        if let Some(info) = self.peers.get_mut(peer) {
            if info.status == PeerStatus::Missing {
                info.status = PeerStatus::Correct;
            }
        }
    }

    pub fn set_failed(&mut self, peer: &NodeId) {
        if let Some(info) = self.peers.get_mut(peer) {
            info.status = PeerStatus::Failed;
        }
    }

    /// Erases `peer` entirely. Dropping its record aborts any live timer.
    pub fn remove(&mut self, peer: &NodeId) {
        self.peers.remove(peer);
    }

    /// Invalidates the current timer for `peer` and returns the fresh token
    /// the replacement timer must carry. The old handle is dropped, which
    /// aborts its task; a firing already in flight fails the token check.
    pub fn bump_token(&mut self, peer: &NodeId) -> Option<u64> {
        self.peers.get_mut(peer).map(|info| {
            info.timeout_handle = None;
            info.timeout_token += 1;
            info.timeout_token
        })
    }

    /// Installs the handle of the one outstanding timer for `peer`.
    pub fn install_timer(&mut self, peer: &NodeId, handle: TimerHandle) {
        if let Some(info) = self.peers.get_mut(peer) {
            info.timeout_handle = Some(handle);
        }
    }

    /// Drops every outstanding timer handle, aborting the timer tasks.
    pub fn cancel_all_timers(&mut self) {
        for info in self.peers.values_mut() {
            info.timeout_handle = None;
        }
    }

    /// The heartbeat map advertised in outgoing gossip: every CORRECT or
    /// MISSING peer plus the owner itself. FAILED peers are never
    /// re-advertised.
    pub fn current_beats(&self) -> BeatMap {
        let mut beats: BeatMap = self
            .peers
            .iter()
            .filter(|(_, info)| info.status != PeerStatus::Failed)
            .map(|(id, info)| (id.clone(), info.beat_count))
            .collect();
        beats.insert(self.own_id.clone(), self.own_beat);
        beats
    }

    /// CORRECT peers with their quiescence values, the selector's input.
    pub fn correct_peers(&self) -> Vec<(NodeId, u32)> {
        self.peers
            .iter()
            .filter(|(_, info)| info.status == PeerStatus::Correct)
            .map(|(id, info)| (id.clone(), info.quiescence))
            .collect()
    }

    /// CORRECT and MISSING peers: the recipients of a catastrophe multicast.
    pub fn live_peers(&self) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|(_, info)| info.status != PeerStatus::Failed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        ViewSnapshot {
            own_beat: self.own_beat,
            peers: self
                .peers
                .iter()
                .map(|(id, info)| {
                    (
                        id.clone(),
                        PeerSnapshot {
                            beat_count: info.beat_count,
                            quiescence: info.quiescence,
                            status: info.status,
                            timeout_token: info.timeout_token,
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Copyable projection of one peer record, without the timer handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PeerSnapshot {
    pub beat_count: u64,
    pub quiescence: u32,
    pub status: PeerStatus,
    pub timeout_token: u64,
}

/// Projection of the whole view, published after every handled event.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ViewSnapshot {
    pub own_beat: u64,
    pub peers: HashMap<NodeId, PeerSnapshot>,
}

// --- Unit Tests ---
