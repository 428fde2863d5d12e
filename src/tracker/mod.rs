//! src/tracker/mod.rs
//!
//! Defines the `Tracker`, the central coordinator actor. It collects node
//! registrations, runs the experiment schedule strictly sequentially,
//! gathers crash reports, and hands each finished experiment to the
//! reporter.

use crate::{
    domain::{Message, NodeId, PeerEntry, StartBundle},
    scheduler::{Scheduler, TimerHandle},
    tracker::{
        experiment::{generate_experiments, Experiment, MatrixSettings},
        report::Reporter,
    },
    transport::{InboundMessage, TransportCommand},
};
use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod experiment;
pub mod report;

/// Timer self-messages of the tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackerEvent {
    StartExperiment(usize),
    StopExperiment(usize),
}

/// Where the experiment schedule comes from.
pub enum ExperimentPlan {
    /// Enumerate the configured Cartesian matrix over the registered nodes.
    Matrix(MatrixSettings),
    /// A hand-built schedule, e.g. for harness runs or one-off campaigns.
    Fixed(Vec<Experiment>),
}

/// The coordinator actor.
pub struct Tracker {
    expected_nodes: usize,
    time_between_experiments: u64,
    plan: Option<ExperimentPlan>,
    registered: HashMap<NodeId, SocketAddr>,
    experiments: Vec<Experiment>,
    /// Index of the experiment currently in `[start, stop]`, if any.
    current: Option<usize>,
    reporter: Reporter,
    inbound_rx: mpsc::Receiver<InboundMessage>,
    events_rx: mpsc::Receiver<TrackerEvent>,
    scheduler: Scheduler<TrackerEvent>,
    transport_tx: mpsc::Sender<TransportCommand>,
    /// The one outstanding start/stop timer. Replacing it aborts the old one.
    pending_timer: Option<TimerHandle>,
}

impl Tracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        expected_nodes: usize,
        time_between_experiments: u64,
        plan: ExperimentPlan,
        reporter: Reporter,
        inbound_rx: mpsc::Receiver<InboundMessage>,
        events_tx: mpsc::Sender<TrackerEvent>,
        events_rx: mpsc::Receiver<TrackerEvent>,
        transport_tx: mpsc::Sender<TransportCommand>,
    ) -> Self {
        Self {
            expected_nodes,
            time_between_experiments,
            plan: Some(plan),
            registered: HashMap::new(),
            experiments: Vec::new(),
            current: None,
            reporter,
            inbound_rx,
            events_rx,
            scheduler: Scheduler::new(events_tx),
            transport_tx,
            pending_timer: None,
        }
    }

    /// The main run loop: registrations and crash reports from the network,
    /// start/stop transitions from the scheduler. The loop exits once the
    /// last experiment has been reported and Shutdown has been broadcast.
    pub async fn run(mut self, shutdown_token: CancellationToken) {
        tracing::info!(
            expected_nodes = self.expected_nodes,
            "Tracker service started; waiting for registrations"
        );

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    tracing::info!("Tracker service received shutdown signal.");
                    break;
                },
                Some(inbound) = self.inbound_rx.recv() => {
                    self.handle_message(inbound, &shutdown_token).await;
                },
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event, &shutdown_token).await;
                },
                else => {
                    tracing::info!("Channel closed. Tracker service shutting down.");
                    break;
                }
            }
        }
    }

    async fn handle_message(&mut self, inbound: InboundMessage, shutdown_token: &CancellationToken) {
        match inbound.message {
            Message::Register { node, addr } => self.on_register(node, addr, shutdown_token).await,
            Message::CrashReport { reporter, node } => self.on_crash_report(reporter, node),
            Message::Crash { node } => {
                tracing::debug!(node = %node, "Node executed its scheduled crash");
            }
            other => {
                tracing::warn!(
                    kind = other.kind(),
                    from = %inbound.peer_addr,
                    "Dropping unexpected message"
                );
            }
        }
    }

    async fn handle_event(&mut self, event: TrackerEvent, shutdown_token: &CancellationToken) {
        match event {
            TrackerEvent::StartExperiment(index) => self.start_experiment(index).await,
            TrackerEvent::StopExperiment(index) => {
                self.stop_experiment(index, shutdown_token).await;
            }
        }
    }

    /// Adds a node to the roster. Once the expected count is reached the
    /// schedule is resolved and experiment 0 begins; later registrations
    /// are refused.
    async fn on_register(
        &mut self,
        node: NodeId,
        addr: SocketAddr,
        shutdown_token: &CancellationToken,
    ) {
        if self.plan.is_none() || self.registered.len() == self.expected_nodes {
            tracing::warn!(node = %node, "Registration refused; roster is complete");
            return;
        }
        if let Some(previous) = self.registered.insert(node.clone(), addr) {
            tracing::warn!(node = %node, old = %previous, new = %addr, "Node re-registered");
            return;
        }
        tracing::info!(
            node = %node,
            addr = %addr,
            registered = self.registered.len(),
            expected = self.expected_nodes,
            "Node registered"
        );

        if self.registered.len() == self.expected_nodes {
            let plan = self.plan.take().expect("plan present until roster completes");
            let node_ids: Vec<NodeId> = self.registered.keys().cloned().collect();
            let experiments = match plan {
                ExperimentPlan::Matrix(matrix) => match generate_experiments(&matrix, &node_ids) {
                    Ok(experiments) => experiments,
                    Err(e) => {
                        tracing::error!(error = %e, "Experiment generation failed");
                        return;
                    }
                },
                ExperimentPlan::Fixed(experiments) => experiments,
            };
            tracing::info!(count = experiments.len(), "Roster complete; schedule resolved");
            self.experiments = experiments;
            if self.experiments.is_empty() {
                self.finish(shutdown_token).await;
            } else {
                self.start_experiment(0).await;
            }
        }
    }

    async fn start_experiment(&mut self, index: usize) {
        let experiment = &self.experiments[index];
        let crash_deltas: HashMap<NodeId, u64> = experiment
            .expected_crashes
            .iter()
            .map(|crash| (crash.node.clone(), crash.delta))
            .collect();
        let peers: Vec<PeerEntry> = self
            .registered
            .iter()
            .map(|(id, &addr)| PeerEntry {
                id: id.clone(),
                addr,
            })
            .collect();

        tracing::info!(
            experiment = experiment.id,
            seed = experiment.seed,
            repetition = experiment.repetition,
            crashes = experiment.expected_crashes.len(),
            catastrophe = experiment.settings.catastrophe,
            "Starting experiment"
        );

        let outgoing: Vec<(SocketAddr, Message)> = self
            .registered
            .iter()
            .map(|(node, &addr)| {
                let bundle = StartBundle {
                    peers: peers.clone(),
                    simulate_crash_at_delta: crash_deltas.get(node).copied(),
                    gossip_delta: experiment.settings.gossip_delta,
                    failure_delta: experiment.settings.failure_delta,
                    miss_delta: experiment.settings.miss_delta,
                    push_pull: experiment.settings.push_pull,
                    pick_strategy: experiment.settings.pick_strategy,
                    enable_multicast: experiment.settings.enable_multicast,
                    multicast_param: experiment.settings.multicast_param,
                    multicast_max_wait: experiment.settings.multicast_max_wait,
                };
                (addr, Message::StartExperiment(bundle))
            })
            .collect();
        let duration = experiment.settings.duration_ms;

        for (addr, message) in outgoing {
            self.send(addr, message).await;
        }

        self.experiments[index].start(now_ms());
        self.current = Some(index);
        self.pending_timer = Some(self.scheduler.schedule(
            Duration::from_millis(duration),
            TrackerEvent::StopExperiment(index),
        ));
    }

    async fn stop_experiment(&mut self, index: usize, shutdown_token: &CancellationToken) {
        tracing::info!(experiment = self.experiments[index].id, "Stopping experiment");
        self.broadcast(Message::StopExperiment).await;
        self.experiments[index].stop(now_ms());
        self.current = None;

        // A failed report loses one experiment's data, not the campaign.
        match self.reporter.write(&self.experiments[index]) {
            Ok(path) => {
                tracing::info!(experiment = self.experiments[index].id, path = %path.display(), "Report written");
            }
            Err(e) => {
                tracing::error!(
                    experiment = self.experiments[index].id,
                    error = %e,
                    "Report writing failed; continuing with next experiment"
                );
            }
        }

        if index + 1 == self.experiments.len() {
            self.finish(shutdown_token).await;
        } else {
            self.pending_timer = Some(self.scheduler.schedule(
                Duration::from_millis(self.time_between_experiments),
                TrackerEvent::StartExperiment(index + 1),
            ));
        }
    }

    /// Appends a crash report to the active experiment.
    fn on_crash_report(&mut self, reporter: NodeId, node: NodeId) {
        match self.current {
            Some(index) => {
                tracing::debug!(reporter = %reporter, node = %node, "Crash report");
                self.experiments[index].add_crash(node, reporter, now_ms());
            }
            None => {
                tracing::error!(
                    reporter = %reporter,
                    node = %node,
                    "Crash report with no active experiment"
                );
            }
        }
    }

    async fn finish(&mut self, shutdown_token: &CancellationToken) {
        tracing::info!("All experiments done; broadcasting shutdown");
        self.broadcast(Message::Shutdown).await;
        shutdown_token.cancel();
    }

    async fn broadcast(&self, message: Message) {
        for &addr in self.registered.values() {
            self.send(addr, message.clone()).await;
        }
    }

    async fn send(&self, addr: SocketAddr, message: Message) {
        if self
            .transport_tx
            .send(TransportCommand::SendMessage(addr, message))
            .await
            .is_err()
        {
            tracing::warn!("Transport channel closed; dropping outbound message");
        }
    }
}

/// Epoch milliseconds, the clock all report timestamps use.
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}
