//! src/transport/mod.rs
//!
//! Defines the `Transport` service, responsible for all low-level network
//! I/O using the QUIC protocol. Both binaries share it: one endpoint, one
//! unidirectional stream per message, bincode framing.

use crate::{
    domain::Message,
    error::Result,
    transport::{connection::handle_connection, tls::configure_tls},
};
use quinn::{Connection, Endpoint, TokioRuntime};
use socket2::{Domain, Protocol, Socket, Type};
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

pub mod connection;
pub mod tls;

/// The maximum allowed size for a single incoming message on a QUIC stream.
const MAX_MESSAGE_SIZE: usize = 1_024 * 1_024; // 1 MiB
/// Limit for concurrently handled inbound streams.
const MAX_CONCURRENT_STREAMS: usize = 256;

/// Commands that can be sent to the `Transport` service.
#[derive(Debug)]
pub enum TransportCommand {
    SendMessage(SocketAddr, Message),
}

/// A message received from a peer, bundled with its network address.
#[derive(Debug)]
pub struct InboundMessage {
    pub peer_addr: SocketAddr,
    pub message: Message,
}

/// The network transport actor.
pub struct Transport {
    endpoint: Endpoint,
    command_rx: mpsc::Receiver<TransportCommand>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    connections: Arc<Mutex<HashMap<SocketAddr, Connection>>>,
    stream_semaphore: Arc<Semaphore>,
}

impl Transport {
    pub fn new(
        bind_addr: SocketAddr,
        command_rx: mpsc::Receiver<TransportCommand>,
        inbound_tx: mpsc::Sender<InboundMessage>,
    ) -> Result<Self> {
        let (server_config, client_config) = configure_tls()?;

        let socket = Socket::new(
            Domain::for_address(bind_addr),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&bind_addr.into())?;
        let std_socket: std::net::UdpSocket = socket.into();
        std_socket.set_nonblocking(true)?;

        let mut endpoint = Endpoint::new(
            Default::default(),
            Some(server_config),
            std_socket,
            Arc::new(TokioRuntime),
        )?;
        endpoint.set_default_client_config(client_config);

        Ok(Self {
            endpoint,
            command_rx,
            inbound_tx,
            connections: Arc::new(Mutex::new(HashMap::new())),
            stream_semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_STREAMS)),
        })
    }

    /// The address the endpoint actually bound to. Needed when the
    /// configuration asked for an ephemeral port.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// The main run loop for the `Transport` service.
    pub async fn run(mut self, shutdown_token: CancellationToken) {
        let local_addr = self.endpoint.local_addr();
        tracing::info!(listen_addr = ?local_addr, "Transport service started");

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    tracing::info!("Transport service received shutdown signal.");
                    break;
                },
                Some(conn) = self.endpoint.accept() => {
                    let connections = self.connections.clone();
                    let inbound_tx = self.inbound_tx.clone();
                    let stream_semaphore = self.stream_semaphore.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(conn, connections, inbound_tx, stream_semaphore).await {
                            tracing::debug!(error = %e, "Connection handling failed");
                        }
                    });
                },
                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command).await;
                }
                else => {
                    tracing::info!("Command channel closed. Transport service shutting down.");
                    break;
                }
            }
        }

        // Flush queued sends so control messages like Shutdown still make it
        // out, then close; open connections would otherwise keep the
        // endpoint from ever becoming idle.
        while let Ok(command) = self.command_rx.try_recv() {
            self.handle_command(command).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.endpoint.close(0u32.into(), b"shutdown");
        self.endpoint.wait_idle().await;
    }

    async fn handle_command(&self, command: TransportCommand) {
        match command {
            TransportCommand::SendMessage(addr, msg) => {
                let endpoint = self.endpoint.clone();
                let connections = self.connections.clone();
                tokio::spawn(async move {
                    if let Err(e) = connection::send_message_to_peer(endpoint, connections, addr, msg).await {
                        tracing::warn!(peer = %addr, error = %e, "Failed to send message");
                    }
                });
            }
        }
    }
}
