//! federationd server - main service loop

use crate::config::Config;
use crate::evaluator::{Evaluator, StaticEvaluator};
use crate::node::{FederationNode, NodeError};
use crate::storage::{Storage, StorageError};
use federation_net::transport::messages::{Hello, WireMessage};
use federation_net::transport::serve_connection;
use federation_net::{Inbound, TcpTransport, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Idle time after which an inbound connection is closed
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Node error: {0}")]
    Node(#[from] NodeError),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Bind failed: {0}")]
    BindFailed(SocketAddr),
}

/// Hosts a [`FederationNode`] over TCP
pub struct Server {
    config: Config,
    node: Arc<FederationNode>,
    transport: Arc<TcpTransport>,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a server with the built-in evaluator from the configuration
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let evaluator = Arc::new(StaticEvaluator::new(config.decision.into()));
        Self::with_evaluator(config, evaluator)
    }

    /// Create a server that consults `evaluator` on every proposal
    pub fn with_evaluator(config: Config, evaluator: Arc<dyn Evaluator>) -> Result<Self, ServerError> {
        config
            .validate()
            .map_err(|e| ServerError::Config(format!("{:#}", e)))?;
        let ruleset_hash = config
            .ruleset_hash()
            .map_err(|e| ServerError::Config(format!("{:#}", e)))?;
        let storage = Arc::new(Storage::open(&config.data_dir)?);
        let transport = Arc::new(TcpTransport::new(Duration::from_millis(config.send_timeout_ms)));
        let node_transport: Arc<dyn Transport> = transport.clone();

        let node = FederationNode::builder()
            .storage(storage)
            .ruleset_hash(ruleset_hash)
            .transport(node_transport)
            .evaluator(evaluator)
            .label(config.label.clone())
            .address(config.advertised_address())
            .registry_config(config.registry_config())
            .gossip_config(config.gossip_config())
            .consensus_config(config.consensus_config())
            .build()?;

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            node,
            transport,
            shutdown_tx,
        })
    }

    pub fn node(&self) -> &Arc<FederationNode> {
        &self.node
    }

    /// Run the server until shutdown
    pub async fn run(&self) -> Result<(), ServerError> {
        info!(
            "Starting federationd on {} (instance {}, label {})",
            self.config.listen,
            self.node.local_id(),
            self.node.label()
        );

        let listener = TcpListener::bind(&self.config.listen)
            .await
            .map_err(|_| ServerError::BindFailed(self.config.listen))?;
        info!("Listening on {}", self.config.listen);

        self.bootstrap().await;

        let tasks = [
            self.spawn_heartbeat_task(),
            self.spawn_anti_entropy_task(),
            self.spawn_maintenance_task(),
        ];

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let inbound: Arc<dyn Inbound> = self.node.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("Accepted connection from {}", addr);
                            let inbound = inbound.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, inbound, IDLE_TIMEOUT).await {
                                    debug!("Connection error from {}: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutting down...");
                    break;
                }
            }
        }

        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        self.node.storage().flush()?;
        info!("Storage flushed");
        Ok(())
    }

    /// Exchange hellos with every bootstrap address
    async fn bootstrap(&self) {
        for addr in &self.config.bootstrap {
            match self.introduce(addr).await {
                Ok(()) => {}
                Err(e) => warn!("Bootstrap peer {} unavailable: {}", addr, e),
            }
        }
    }

    async fn introduce(&self, addr: &str) -> Result<(), ServerError> {
        let response = self
            .transport
            .request_addr(addr, self.node.hello_frame()?)
            .await
            .map_err(NodeError::from)?;
        let hello = Hello::from_frame(&response).map_err(NodeError::from)?;
        let peer = self.node.accept_hello(hello).await?;
        info!("Bootstrapped with {} ({}) at {}", peer.instance_id, peer.display_label, addr);
        Ok(())
    }

    /// Spawn background heartbeat task
    fn spawn_heartbeat_task(&self) -> JoinHandle<()> {
        let node = self.node.clone();
        let period = Duration::from_secs(self.config.heartbeat_interval_secs);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match node.heartbeat().await {
                            Ok(outcome) => debug!("Heartbeat reached {} peers", outcome.delivered()),
                            Err(e) => warn!("Heartbeat failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    /// Spawn background anti-entropy task
    fn spawn_anti_entropy_task(&self) -> JoinHandle<()> {
        let node = self.node.clone();
        let period = Duration::from_secs(self.config.anti_entropy_interval_secs);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Failures are logged and counted by the sync state
                        if let Ok(report) = node.run_anti_entropy_round().await {
                            if report.accepted > 0 {
                                info!("Anti-entropy recovered {} messages", report.accepted);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    /// Spawn background maintenance task
    fn spawn_maintenance_task(&self) -> JoinHandle<()> {
        let node = self.node.clone();
        let period = Duration::from_secs(self.config.maintenance_interval_secs);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = node.maintain().await;
                        debug!("Maintenance: {:?}", report);
                        for (id, status) in &report.proposals_settled {
                            info!("Overdue proposal {} settled as {}", id, status);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Handle for shutting down from another task
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }
}
