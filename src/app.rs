//! src/app.rs
//!
//! Defines the two application shells, `NodeApp` and `TrackerApp`. Each
//! encapsulates its configuration, wires the channels between the services,
//! spawns them as Tokio tasks, and manages graceful shutdown.

use crate::{
    config::{NodeConfig, TrackerConfig},
    domain::NodeId,
    engine::{Engine, EngineSnapshot},
    error::Result,
    tracker::{experiment::MatrixSettings, report::Reporter, ExperimentPlan, Tracker},
    transport::Transport,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// One detector node: a transport service plus the protocol engine.
pub struct NodeApp {
    config: NodeConfig,
    shutdown_token: CancellationToken,
}

impl NodeApp {
    /// Creates a new `NodeApp`, rejecting invalid configuration up front.
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Handle for external shutdown, e.g. from a test harness.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// The main run loop: spawns transport and engine, then waits for
    /// shutdown (Ctrl+C, a tracker `Shutdown` message, or the token).
    pub async fn run(self) -> Result<()> {
        let (transport_command_tx, transport_command_rx) = mpsc::channel(100);
        let (inbound_message_tx, inbound_message_rx) = mpsc::channel(100);
        let (events_tx, events_rx) = mpsc::channel(100);
        let (snapshot_tx, _snapshot_rx) = watch::channel(EngineSnapshot::default());

        let transport = Transport::new(
            self.config.bind_addr,
            transport_command_rx,
            inbound_message_tx,
        )?;
        // The configuration may have asked for an ephemeral port.
        let local_addr = transport.local_addr()?;

        tracing::info!(
            node_id = %self.config.id,
            listen_addr = %local_addr,
            tracker_addr = %self.config.tracker_addr,
            "🚀 Starting node..."
        );

        let transport_task = tokio::spawn(transport.run(self.shutdown_token.clone()));
        tracing::debug!("Transport service spawned.");

        let engine = Engine::new(
            NodeId::new(&self.config.id),
            local_addr,
            self.config.tracker_addr,
            inbound_message_rx,
            events_tx,
            events_rx,
            transport_command_tx,
            snapshot_tx,
        );
        let engine_task = tokio::spawn(engine.run(self.shutdown_token.clone()));
        tracing::debug!("Engine service spawned.");

        let shutdown_token = self.shutdown_token.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
            tracing::info!("Ctrl+C received. Initiating graceful shutdown...");
            shutdown_token.cancel();
        });

        self.shutdown_token.cancelled().await;

        if let Err(e) = transport_task.await {
            tracing::error!(error = ?e, "Transport service task failed");
        }
        if let Err(e) = engine_task.await {
            tracing::error!(error = ?e, "Engine service task failed");
        }
        tracing::info!(node_id = %self.config.id, "👋 Node has shut down gracefully.");

        Ok(())
    }
}

/// The experiment coordinator: a transport service plus the tracker actor.
pub struct TrackerApp {
    config: TrackerConfig,
    plan: ExperimentPlan,
    shutdown_token: CancellationToken,
}

impl TrackerApp {
    /// Creates a `TrackerApp` running the configured experiment matrix.
    pub fn new(config: TrackerConfig) -> Result<Self> {
        let plan = ExperimentPlan::Matrix(MatrixSettings::from(&config));
        Self::with_plan(config, plan)
    }

    /// Creates a `TrackerApp` with an explicit experiment plan, e.g. a
    /// hand-built schedule.
    pub fn with_plan(config: TrackerConfig, plan: ExperimentPlan) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            plan,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Handle for external shutdown, e.g. from a test harness.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// The main run loop. Returns once the whole campaign has finished (the
    /// tracker cancels the token itself) or shutdown is requested.
    pub async fn run(self) -> Result<()> {
        let reporter = Reporter::new(&self.config.report_path)?;

        let (transport_command_tx, transport_command_rx) = mpsc::channel(100);
        let (inbound_message_tx, inbound_message_rx) = mpsc::channel(100);
        let (events_tx, events_rx) = mpsc::channel(100);

        let transport = Transport::new(
            self.config.bind_addr,
            transport_command_rx,
            inbound_message_tx,
        )?;
        let local_addr = transport.local_addr()?;

        tracing::info!(
            listen_addr = %local_addr,
            expected_nodes = self.config.nodes,
            report_path = %self.config.report_path.display(),
            "🚀 Starting tracker..."
        );

        let transport_task = tokio::spawn(transport.run(self.shutdown_token.clone()));
        tracing::debug!("Transport service spawned.");

        let tracker = Tracker::new(
            self.config.nodes,
            self.config.time_between_experiments_ms,
            self.plan,
            reporter,
            inbound_message_rx,
            events_tx,
            events_rx,
            transport_command_tx,
        );
        let tracker_task = tokio::spawn(tracker.run(self.shutdown_token.clone()));
        tracing::debug!("Tracker service spawned.");

        let shutdown_token = self.shutdown_token.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
            tracing::info!("Ctrl+C received. Initiating graceful shutdown...");
            shutdown_token.cancel();
        });

        self.shutdown_token.cancelled().await;

        if let Err(e) = transport_task.await {
            tracing::error!(error = ?e, "Transport service task failed");
        }
        if let Err(e) = tracker_task.await {
            tracing::error!(error = ?e, "Tracker service task failed");
        }
        tracing::info!("👋 Tracker has shut down gracefully.");

        Ok(())
    }
}
