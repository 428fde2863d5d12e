//! src/engine/mod.rs
//!
//! Defines the `Engine`, the node's protocol actor. It owns the heartbeat
//! view, drives gossip dispatch, raises Fail/Miss/Cleanup timeouts on quiet
//! peers, and reports suspicions to the tracker.

use crate::{
    domain::{BeatMap, Message, NodeId, PeerStatus, StartBundle},
    scheduler::{Scheduler, TimerHandle},
    transport::{InboundMessage, TransportCommand},
    view::{HeartbeatView, ViewSnapshot},
};
use rand::{thread_rng, Rng};
use std::{collections::HashMap, net::SocketAddr, time::Duration};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

pub mod select;

/// Cadence of the catastrophe multicast reminder. Deliberately independent
/// of the gossip period: the multicast probe is a slow background defense,
/// not part of the regular gossip schedule.
pub const MULTICAST_REMINDER_MS: u64 = 1_000;

/// Which per-peer timer expired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Δf elapsed without a counter advance: suspect the peer.
    Fail,
    /// Δm elapsed while MISSING: declare the peer failed.
    Miss,
    /// The failed peer can now be forgotten.
    Cleanup,
}

/// Everything the engine's inbox can deliver. Timer firings arrive here as
/// self-messages, so they interleave with network traffic at the inbox
/// boundary only.
#[derive(Debug)]
pub enum NodeEvent {
    Network(InboundMessage),
    GossipReminder,
    MulticastReminder,
    SelfCrash,
    PeerTimeout {
        peer: NodeId,
        token: u64,
        kind: TimeoutKind,
    },
}

/// Published after every handled event; the only externally visible state.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct EngineSnapshot {
    pub ready: bool,
    pub view: ViewSnapshot,
}

/// Live state of one experiment, present only between Start and Stop.
struct Active {
    view: HeartbeatView,
    roster: HashMap<NodeId, SocketAddr>,
    settings: StartBundle,
    cleanup_delay: u64,
    multicast_wait: u32,
    gossip_timer: Option<TimerHandle>,
    multicast_timer: Option<TimerHandle>,
    _self_crash_timer: Option<TimerHandle>,
}

impl Active {
    /// Applies an incoming heartbeat map. A strictly greater counter revives
    /// the peer, zeroes its quiescence and restarts its Fail timer under a
    /// fresh token; anything else counts one more quiet exchange.
    fn merge(&mut self, scheduler: &Scheduler<NodeEvent>, incoming: &BeatMap) {
        for (peer, &incoming_beat) in incoming {
            if peer == self.view.own_id() {
                continue;
            }
            let Some(info) = self.view.get(peer) else {
                continue;
            };
            if info.status == PeerStatus::Failed {
                continue;
            }
            if incoming_beat > info.beat_count {
                self.view.set_beat(peer, incoming_beat);
                self.view.reset_quiescence(peer);
                self.view.unset_missing(peer);
                if let Some(token) = self.view.bump_token(peer) {
                    let handle = scheduler.schedule(
                        Duration::from_millis(self.settings.failure_delta),
                        NodeEvent::PeerTimeout {
                            peer: peer.clone(),
                            token,
                            kind: TimeoutKind::Fail,
                        },
                    );
                    self.view.install_timer(peer, handle);
                }
            } else {
                self.view.mark_quiescent(peer);
            }
        }
    }
}

enum State {
    /// Initial state, and the state after Stop or a self-crash. Only Start,
    /// Stop and Shutdown are honored here.
    NotReady,
    Ready(Box<Active>),
}

/// The node protocol actor.
pub struct Engine {
    id: NodeId,
    addr: SocketAddr,
    tracker_addr: SocketAddr,
    inbound_rx: mpsc::Receiver<InboundMessage>,
    events_rx: mpsc::Receiver<NodeEvent>,
    scheduler: Scheduler<NodeEvent>,
    transport_tx: mpsc::Sender<TransportCommand>,
    snapshot_tx: watch::Sender<EngineSnapshot>,
    state: State,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: NodeId,
        addr: SocketAddr,
        tracker_addr: SocketAddr,
        inbound_rx: mpsc::Receiver<InboundMessage>,
        events_tx: mpsc::Sender<NodeEvent>,
        events_rx: mpsc::Receiver<NodeEvent>,
        transport_tx: mpsc::Sender<TransportCommand>,
        snapshot_tx: watch::Sender<EngineSnapshot>,
    ) -> Self {
        Self {
            id,
            addr,
            tracker_addr,
            inbound_rx,
            events_rx,
            scheduler: Scheduler::new(events_tx),
            transport_tx,
            snapshot_tx,
            state: State::NotReady,
        }
    }

    /// The main run loop. Registers with the tracker once, then processes
    /// network messages and timer self-messages serially until shutdown.
    pub async fn run(mut self, shutdown_token: CancellationToken) {
        tracing::info!(node_id = %self.id, "Engine service started");

        Self::send(
            &self.transport_tx,
            self.tracker_addr,
            Message::Register {
                node: self.id.clone(),
                addr: self.addr,
            },
        )
        .await;

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    tracing::info!(node_id = %self.id, "Engine service received shutdown signal.");
                    break;
                },
                Some(inbound) = self.inbound_rx.recv() => {
                    self.handle_message(inbound.message, &shutdown_token).await;
                    self.publish_snapshot();
                },
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event, &shutdown_token).await;
                    self.publish_snapshot();
                },
                else => {
                    tracing::info!(node_id = %self.id, "Channel closed. Engine service shutting down.");
                    break;
                }
            }
        }
    }

    async fn handle_event(&mut self, event: NodeEvent, shutdown_token: &CancellationToken) {
        match event {
            NodeEvent::Network(inbound) => {
                self.handle_message(inbound.message, shutdown_token).await;
            }
            NodeEvent::GossipReminder => self.on_gossip_reminder().await,
            NodeEvent::MulticastReminder => self.on_multicast_reminder().await,
            NodeEvent::SelfCrash => self.on_self_crash().await,
            NodeEvent::PeerTimeout { peer, token, kind } => {
                self.on_peer_timeout(peer, token, kind).await;
            }
        }
    }

    async fn handle_message(&mut self, message: Message, shutdown_token: &CancellationToken) {
        match message {
            Message::StartExperiment(bundle) => self.on_start(bundle),
            Message::StopExperiment => self.on_stop(),
            Message::Shutdown => {
                tracing::info!(node_id = %self.id, "Shutdown requested by tracker.");
                shutdown_token.cancel();
            }
            Message::Gossip { from, beats } => self.on_gossip(from, beats).await,
            Message::GossipReply { from: _, beats } => self.on_gossip_reply(beats),
            Message::CatastropheMulticast { from, beats } => {
                self.on_catastrophe_multicast(from, beats).await;
            }
            Message::CatastropheReply { from: _, beats } => self.on_catastrophe_reply(beats),
            other => {
                tracing::warn!(node_id = %self.id, kind = other.kind(), "Dropping unexpected message");
            }
        }
    }

    /// Enters READY: builds the peer view, arms one Fail timer per peer, the
    /// gossip reminder, and optionally the self-crash and multicast timers.
    fn on_start(&mut self, bundle: StartBundle) {
        if matches!(self.state, State::Ready(_)) {
            tracing::warn!(node_id = %self.id, "StartExperiment received while already running; dropped");
            return;
        }

        tracing::info!(
            node_id = %self.id,
            peers = bundle.peers.len(),
            gossip_delta = bundle.gossip_delta,
            failure_delta = bundle.failure_delta,
            strategy = %bundle.pick_strategy,
            multicast = bundle.enable_multicast,
            "Starting experiment"
        );

        let roster: HashMap<NodeId, SocketAddr> = bundle
            .peers
            .iter()
            .map(|entry| (entry.id.clone(), entry.addr))
            .collect();
        let mut view = HeartbeatView::new(self.id.clone(), roster.keys().cloned());

        // Every peer starts with an armed Fail timer under token 0.
        for peer in roster.keys().filter(|peer| *peer != &self.id) {
            let handle = self.scheduler.schedule(
                Duration::from_millis(bundle.failure_delta),
                NodeEvent::PeerTimeout {
                    peer: peer.clone(),
                    token: 0,
                    kind: TimeoutKind::Fail,
                },
            );
            view.install_timer(peer, handle);
        }

        let gossip_timer = Some(self.scheduler.schedule(
            Duration::from_millis(bundle.gossip_delta),
            NodeEvent::GossipReminder,
        ));
        let multicast_timer = bundle.enable_multicast.then(|| {
            self.scheduler.schedule(
                Duration::from_millis(MULTICAST_REMINDER_MS),
                NodeEvent::MulticastReminder,
            )
        });
        let self_crash_timer = bundle.simulate_crash_at_delta.map(|delta| {
            tracing::info!(node_id = %self.id, crash_at = delta, "Self-crash scheduled");
            self.scheduler
                .schedule(Duration::from_millis(delta), NodeEvent::SelfCrash)
        });

        self.state = State::Ready(Box::new(Active {
            view,
            roster,
            cleanup_delay: 2 * bundle.failure_delta,
            multicast_wait: 0,
            gossip_timer,
            multicast_timer,
            _self_crash_timer: self_crash_timer,
            settings: bundle,
        }));
    }

    /// Leaves READY: cancels every timer and clears the peer map.
    fn on_stop(&mut self) {
        match &mut self.state {
            State::NotReady => {
                tracing::debug!(node_id = %self.id, "StopExperiment while idle; nothing to do");
            }
            State::Ready(active) => {
                tracing::info!(node_id = %self.id, "Stopping experiment");
                active.view.cancel_all_timers();
                self.state = State::NotReady;
            }
        }
    }

    /// The scheduled crash: indistinguishable from a real crash for the rest
    /// of the network, except for the informational note to the tracker.
    async fn on_self_crash(&mut self) {
        let State::Ready(active) = &mut self.state else {
            tracing::trace!(node_id = %self.id, "Self-crash while idle; dropped");
            return;
        };
        tracing::info!(node_id = %self.id, "Executing scheduled self-crash");
        active.view.cancel_all_timers();
        self.state = State::NotReady;
        Self::send(
            &self.transport_tx,
            self.tracker_addr,
            Message::Crash {
                node: self.id.clone(),
            },
        )
        .await;
    }

    /// One gossip round: advance the own counter, draw a target among the
    /// CORRECT peers, push the current view, re-arm.
    async fn on_gossip_reminder(&mut self) {
        let State::Ready(active) = &mut self.state else {
            tracing::trace!(node_id = %self.id, "Gossip reminder while idle; dropped");
            return;
        };

        active.view.heartbeat();

        let target = {
            let candidates = active.view.correct_peers();
            let mut rng = thread_rng();
            select::pick_gossip_target(&candidates, active.settings.pick_strategy, &mut rng)
        };

        if let Some(target) = target {
            active.view.reset_quiescence(&target);
            if let Some(&addr) = active.roster.get(&target) {
                tracing::debug!(node_id = %self.id, target = %target, "Gossiping view");
                Self::send(
                    &self.transport_tx,
                    addr,
                    Message::Gossip {
                        from: self.id.clone(),
                        beats: active.view.current_beats(),
                    },
                )
                .await;
            }
        } else {
            tracing::debug!(node_id = %self.id, "No correct peer to gossip with this round");
        }

        active.gossip_timer = Some(self.scheduler.schedule(
            Duration::from_millis(active.settings.gossip_delta),
            NodeEvent::GossipReminder,
        ));
    }

    async fn on_gossip(&mut self, from: NodeId, beats: BeatMap) {
        let State::Ready(active) = &mut self.state else {
            tracing::debug!(node_id = %self.id, "Gossip while idle; dropped");
            return;
        };
        active.merge(&self.scheduler, &beats);
        if active.settings.push_pull {
            if let Some(&addr) = active.roster.get(&from) {
                Self::send(
                    &self.transport_tx,
                    addr,
                    Message::GossipReply {
                        from: self.id.clone(),
                        beats: active.view.current_beats(),
                    },
                )
                .await;
            }
        }
    }

    fn on_gossip_reply(&mut self, beats: BeatMap) {
        let State::Ready(active) = &mut self.state else {
            tracing::debug!(node_id = %self.id, "GossipReply while idle; dropped");
            return;
        };
        active.merge(&self.scheduler, &beats);
    }

    /// A multicast probe always provokes a reply, independent of push-pull:
    /// after a catastrophe the sender may know nobody live, and the replies
    /// rebuild its view.
    async fn on_catastrophe_multicast(&mut self, from: NodeId, beats: BeatMap) {
        let State::Ready(active) = &mut self.state else {
            tracing::debug!(node_id = %self.id, "CatastropheMulticast while idle; dropped");
            return;
        };
        active.merge(&self.scheduler, &beats);
        active.multicast_wait = 0;
        if let Some(&addr) = active.roster.get(&from) {
            Self::send(
                &self.transport_tx,
                addr,
                Message::CatastropheReply {
                    from: self.id.clone(),
                    beats: active.view.current_beats(),
                },
            )
            .await;
        }
    }

    fn on_catastrophe_reply(&mut self, beats: BeatMap) {
        let State::Ready(active) = &mut self.state else {
            tracing::debug!(node_id = %self.id, "CatastropheReply while idle; dropped");
            return;
        };
        active.merge(&self.scheduler, &beats);
    }

    /// The multicast coin flip: probability `(wait / max_wait)^a`, so a node
    /// that has heard nothing for a while becomes ever more likely to probe
    /// the whole network.
    async fn on_multicast_reminder(&mut self) {
        let State::Ready(active) = &mut self.state else {
            tracing::trace!(node_id = %self.id, "Multicast reminder while idle; dropped");
            return;
        };

        let max_wait = active.settings.multicast_max_wait.max(1);
        let probability = (f64::from(active.multicast_wait) / f64::from(max_wait))
            .powi(active.settings.multicast_param as i32);
        let roll: f64 = thread_rng().gen();

        if roll < probability {
            tracing::info!(node_id = %self.id, "Sending catastrophe multicast");
            active.view.heartbeat();
            let beats = active.view.current_beats();
            let recipients = active.view.live_peers();
            for peer in &recipients {
                active.view.reset_quiescence(peer);
            }
            active.multicast_wait = 0;
            for peer in recipients {
                if let Some(&addr) = active.roster.get(&peer) {
                    Self::send(
                        &self.transport_tx,
                        addr,
                        Message::CatastropheMulticast {
                            from: self.id.clone(),
                            beats: beats.clone(),
                        },
                    )
                    .await;
                }
            }
        } else {
            active.multicast_wait = (active.multicast_wait + 1).min(max_wait);
        }

        active.multicast_timer = Some(self.scheduler.schedule(
            Duration::from_millis(MULTICAST_REMINDER_MS),
            NodeEvent::MulticastReminder,
        ));
    }

    /// A Fail/Miss/Cleanup expiry. The token snapshot taken at scheduling
    /// time must still match the peer's current token; otherwise the firing
    /// is stale and leaves no state change.
    async fn on_peer_timeout(&mut self, peer: NodeId, token: u64, kind: TimeoutKind) {
        let State::Ready(active) = &mut self.state else {
            tracing::trace!(node_id = %self.id, peer = %peer, "Timeout while idle; dropped");
            return;
        };
        let Some(info) = active.view.get(&peer) else {
            tracing::trace!(node_id = %self.id, peer = %peer, "Timeout for unknown peer; dropped");
            return;
        };
        if info.timeout_token != token {
            tracing::trace!(
                node_id = %self.id,
                peer = %peer,
                stale = token,
                current = info.timeout_token,
                "Stale timeout dropped"
            );
            return;
        }

        match kind {
            TimeoutKind::Fail if active.settings.enable_multicast => {
                // Catastrophe mode: give the peer a grace period as MISSING
                // before the final verdict.
                tracing::info!(node_id = %self.id, peer = %peer, "Peer missing; starting grace period");
                active.view.set_missing(&peer);
                if let Some(token) = active.view.bump_token(&peer) {
                    let handle = self.scheduler.schedule(
                        Duration::from_millis(active.settings.miss_delta),
                        NodeEvent::PeerTimeout {
                            peer: peer.clone(),
                            token,
                            kind: TimeoutKind::Miss,
                        },
                    );
                    active.view.install_timer(&peer, handle);
                }
            }
            TimeoutKind::Fail | TimeoutKind::Miss => {
                tracing::info!(node_id = %self.id, peer = %peer, "Peer declared failed");
                active.view.set_failed(&peer);
                if let Some(token) = active.view.bump_token(&peer) {
                    let handle = self.scheduler.schedule(
                        Duration::from_millis(active.cleanup_delay),
                        NodeEvent::PeerTimeout {
                            peer: peer.clone(),
                            token,
                            kind: TimeoutKind::Cleanup,
                        },
                    );
                    active.view.install_timer(&peer, handle);
                }
                Self::send(
                    &self.transport_tx,
                    self.tracker_addr,
                    Message::CrashReport {
                        reporter: self.id.clone(),
                        node: peer,
                    },
                )
                .await;
            }
            TimeoutKind::Cleanup => {
                tracing::debug!(node_id = %self.id, peer = %peer, "Forgetting failed peer");
                active.view.remove(&peer);
            }
        }
    }

    /// Fire-and-forget send through the transport actor.
    async fn send(
        transport_tx: &mpsc::Sender<TransportCommand>,
        addr: SocketAddr,
        message: Message,
    ) {
        if transport_tx
            .send(TransportCommand::SendMessage(addr, message))
            .await
            .is_err()
        {
            tracing::warn!("Transport channel closed; dropping outbound message");
        }
    }

    fn publish_snapshot(&self) {
        let snapshot = match &self.state {
            State::NotReady => EngineSnapshot::default(),
            State::Ready(active) => EngineSnapshot {
                ready: true,
                view: active.view.snapshot(),
            },
        };
        if let Ok(json) = serde_json::to_string(&snapshot) {
            tracing::trace!(payload = %json, "Publishing engine snapshot");
        }
        let _ = self.snapshot_tx.send(snapshot);
    }
}
