//! tests/component/tracker.rs
//!
//! In-memory component tests for the `Tracker` actor: registrations and
//! crash reports are injected through its channels, outbound control
//! messages are captured, and the written reports are read back from disk.

use gossip_fd::{
    domain::{Message, NodeId, PickStrategy},
    tracker::{
        experiment::{Experiment, ExperimentSettings, ExpectedCrash},
        report::{ExperimentReport, Reporter},
        ExperimentPlan, Tracker,
    },
    transport::{InboundMessage, TransportCommand},
};
use std::{net::SocketAddr, time::Duration};
use tempfile::TempDir;
use test_log::test;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;

struct TrackerHarness {
    transport_rx: mpsc::Receiver<TransportCommand>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    shutdown_token: CancellationToken,
    report_dir: TempDir,
}

fn short_settings(number_of_nodes: usize, duration_ms: u64) -> ExperimentSettings {
    ExperimentSettings {
        catastrophe: false,
        duration_ms,
        gossip_delta: 100,
        failure_delta: 100_000,
        miss_delta: 100_000,
        push_pull: false,
        pick_strategy: PickStrategy::Uniform,
        enable_multicast: false,
        multicast_param: 1,
        multicast_max_wait: 1,
        number_of_nodes,
    }
}

fn spawn_tracker(expected_nodes: usize, experiments: Vec<Experiment>) -> TrackerHarness {
    let report_dir = tempfile::tempdir().unwrap();
    let reporter = Reporter::new(report_dir.path().join("reports")).unwrap();
    let (transport_tx, transport_rx) = mpsc::channel(64);
    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let (events_tx, events_rx) = mpsc::channel(64);

    let tracker = Tracker::new(
        expected_nodes,
        200,
        ExperimentPlan::Fixed(experiments),
        reporter,
        inbound_rx,
        events_tx,
        events_rx,
        transport_tx,
    );
    let shutdown_token = CancellationToken::new();
    tokio::spawn(tracker.run(shutdown_token.clone()));

    TrackerHarness {
        transport_rx,
        inbound_tx,
        shutdown_token,
        report_dir,
    }
}

fn node_addr(index: u16) -> SocketAddr {
    format!("127.0.0.1:{}", 7200 + index).parse().unwrap()
}

impl TrackerHarness {
    async fn inject(&self, message: Message) {
        self.inbound_tx
            .send(InboundMessage {
                peer_addr: "127.0.0.1:9999".parse().unwrap(),
                message,
            })
            .await
            .unwrap();
    }

    async fn register(&self, index: u16) {
        self.inject(Message::Register {
            node: NodeId::new(format!("n{index}")),
            addr: node_addr(index),
        })
        .await;
    }

    async fn recv_command(&mut self) -> (SocketAddr, Message) {
        let command = time::timeout(Duration::from_secs(2), self.transport_rx.recv())
            .await
            .expect("Timed out waiting for an outbound message")
            .expect("Transport channel closed");
        let TransportCommand::SendMessage(addr, message) = command;
        (addr, message)
    }

    /// Collects `count` outbound messages, in send order.
    async fn recv_commands(&mut self, count: usize) -> Vec<(SocketAddr, Message)> {
        let mut commands = Vec::new();
        for _ in 0..count {
            commands.push(self.recv_command().await);
        }
        commands
    }
}

#[test(tokio::test)]
async fn test_full_roster_triggers_experiment_start() {
    let experiment = Experiment::new(
        0,
        1,
        0,
        short_settings(2, 60_000),
        vec![ExpectedCrash {
            delta: 500,
            node: NodeId::from("n1"),
        }],
    );
    let mut harness = spawn_tracker(2, vec![experiment]);

    harness.register(0).await;
    // One registration is not enough; nothing may be sent yet.
    time::sleep(Duration::from_millis(50)).await;
    assert!(harness.transport_rx.try_recv().is_err());

    harness.register(1).await;
    let commands = harness.recv_commands(2).await;
    let mut crash_bundles = 0;
    for (addr, message) in commands {
        let Message::StartExperiment(bundle) = message else {
            panic!("expected StartExperiment, got something else");
        };
        assert_eq!(bundle.peers.len(), 2);
        assert_eq!(bundle.gossip_delta, 100);
        if addr == node_addr(1) {
            // The scheduled victim gets the crash delta.
            assert_eq!(bundle.simulate_crash_at_delta, Some(500));
            crash_bundles += 1;
        } else {
            assert_eq!(addr, node_addr(0));
            assert_eq!(bundle.simulate_crash_at_delta, None);
        }
    }
    assert_eq!(crash_bundles, 1);
    harness.shutdown_token.cancel();
}

#[test(tokio::test)]
async fn test_surplus_registration_is_refused() {
    let experiment = Experiment::new(0, 1, 0, short_settings(2, 60_000), Vec::new());
    let mut harness = spawn_tracker(2, vec![experiment]);

    harness.register(0).await;
    harness.register(1).await;
    let commands = harness.recv_commands(2).await;
    let addrs: Vec<SocketAddr> = commands.iter().map(|(addr, _)| *addr).collect();
    assert!(!addrs.contains(&node_addr(2)));

    // The roster is complete; a third node is ignored and receives nothing.
    harness.register(2).await;
    time::sleep(Duration::from_millis(50)).await;
    assert!(harness.transport_rx.try_recv().is_err());
    harness.shutdown_token.cancel();
}

#[test(tokio::test)]
async fn test_crash_report_without_active_experiment_is_ignored() {
    let experiment = Experiment::new(0, 1, 0, short_settings(2, 60_000), Vec::new());
    let mut harness = spawn_tracker(2, vec![experiment]);

    // Before any experiment is running, a report must be dropped without
    // disturbing the registration flow.
    harness
        .inject(Message::CrashReport {
            reporter: NodeId::from("n0"),
            node: NodeId::from("n1"),
        })
        .await;
    harness.register(0).await;
    harness.register(1).await;
    let commands = harness.recv_commands(2).await;
    assert!(commands
        .iter()
        .all(|(_, message)| matches!(message, Message::StartExperiment(_))));
    harness.shutdown_token.cancel();
}

#[test(tokio::test)]
async fn test_campaign_stops_reports_and_shuts_down() {
    let experiment = Experiment::new(3, 9, 1, short_settings(2, 300), Vec::new());
    let mut harness = spawn_tracker(2, vec![experiment]);

    harness.register(0).await;
    harness.register(1).await;
    let _start = harness.recv_commands(2).await;

    // A crash report while the experiment is running is recorded.
    harness
        .inject(Message::CrashReport {
            reporter: NodeId::from("n0"),
            node: NodeId::from("n1"),
        })
        .await;

    // After the duration: StopExperiment everywhere, then Shutdown.
    let stops = harness.recv_commands(2).await;
    assert!(stops
        .iter()
        .all(|(_, message)| matches!(message, Message::StopExperiment)));
    let shutdowns = harness.recv_commands(2).await;
    assert!(shutdowns
        .iter()
        .all(|(_, message)| matches!(message, Message::Shutdown)));

    // The campaign is over; the run loop must have exited.
    time::timeout(Duration::from_secs(1), harness.shutdown_token.cancelled())
        .await
        .expect("tracker should cancel the token when the campaign ends");

    let reports = report_files(harness.report_dir.path().join("reports").as_path());
    assert_eq!(reports.len(), 1);
    let raw = std::fs::read_to_string(&reports[0]).unwrap();
    let report: ExperimentReport = serde_json::from_str(&raw).unwrap();
    assert_eq!(report.id, 3);
    assert_eq!(report.seed, 9);
    assert_eq!(report.repetition, 1);
    assert_eq!(report.result.reported_crashes.len(), 1);
    assert_eq!(report.result.reported_crashes[0].node, NodeId::from("n1"));
    assert_eq!(report.result.reported_crashes[0].reporter, NodeId::from("n0"));
}

fn report_files(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    paths.sort();
    paths
}

#[test(tokio::test)]
async fn test_consecutive_experiments_wait_for_the_gap() {
    let experiments = vec![
        Experiment::new(0, 1, 0, short_settings(2, 200), Vec::new()),
        Experiment::new(1, 1, 1, short_settings(2, 200), Vec::new()),
    ];
    let mut harness = spawn_tracker(2, experiments);

    harness.register(0).await;
    harness.register(1).await;

    // First experiment: start x2, stop x2; second: start x2, stop x2; then
    // shutdown x2, strictly in that order per receiver.
    let expected_kinds = ["Start", "Stop", "Start", "Stop", "Shutdown"];
    for expected in expected_kinds {
        let pair = harness.recv_commands(2).await;
        for (_, message) in pair {
            let kind = match message {
                Message::StartExperiment(_) => "Start",
                Message::StopExperiment => "Stop",
                Message::Shutdown => "Shutdown",
                other => panic!("unexpected message {other:?}"),
            };
            assert_eq!(kind, expected);
        }
    }

    let reports = report_files(harness.report_dir.path().join("reports").as_path());
    assert_eq!(reports.len(), 2);
}
