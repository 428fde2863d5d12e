//! tests/component/transport.rs
//!
//! Loopback tests for the QUIC transport: two endpoints, real sockets,
//! bincode framing end to end.

use gossip_fd::{
    domain::{Message, NodeId},
    transport::{InboundMessage, Transport, TransportCommand},
};
use std::time::Duration;
use test_log::test;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;

struct TransportHarness {
    addr: std::net::SocketAddr,
    command_tx: mpsc::Sender<TransportCommand>,
    inbound_rx: mpsc::Receiver<InboundMessage>,
    shutdown_token: CancellationToken,
}

fn spawn_transport() -> TransportHarness {
    let (command_tx, command_rx) = mpsc::channel(16);
    let (inbound_tx, inbound_rx) = mpsc::channel(16);
    let transport =
        Transport::new("127.0.0.1:0".parse().unwrap(), command_rx, inbound_tx).unwrap();
    let addr = transport.local_addr().unwrap();
    let shutdown_token = CancellationToken::new();
    tokio::spawn(transport.run(shutdown_token.clone()));
    TransportHarness {
        addr,
        command_tx,
        inbound_rx,
        shutdown_token,
    }
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_message_round_trip_between_two_endpoints() {
    let sender = spawn_transport();
    let mut receiver = spawn_transport();

    let message = Message::CrashReport {
        reporter: NodeId::from("n0"),
        node: NodeId::from("n4"),
    };
    sender
        .command_tx
        .send(TransportCommand::SendMessage(receiver.addr, message.clone()))
        .await
        .unwrap();

    let inbound = time::timeout(Duration::from_secs(5), receiver.inbound_rx.recv())
        .await
        .expect("Timed out waiting for delivery")
        .expect("Inbound channel closed");
    assert_eq!(inbound.message, message);

    sender.shutdown_token.cancel();
    receiver.shutdown_token.cancel();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_messages_to_one_peer_arrive_in_send_order() {
    let sender = spawn_transport();
    let mut receiver = spawn_transport();

    for beat in 1..=5u64 {
        let message = Message::Gossip {
            from: NodeId::from("n0"),
            beats: [(NodeId::from("n0"), beat)].into_iter().collect(),
        };
        sender
            .command_tx
            .send(TransportCommand::SendMessage(receiver.addr, message))
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    while seen.len() < 5 {
        let inbound = time::timeout(Duration::from_secs(5), receiver.inbound_rx.recv())
            .await
            .expect("Timed out waiting for delivery")
            .expect("Inbound channel closed");
        if let Message::Gossip { beats, .. } = inbound.message {
            seen.push(beats[&NodeId::from("n0")]);
        }
    }
    // The strict-greater merge rule tolerates reordering, but all five
    // messages must arrive.
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);

    sender.shutdown_token.cancel();
    receiver.shutdown_token.cancel();
}
