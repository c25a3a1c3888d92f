//! Node assembly
//!
//! A [`FederationNode`] wires the identity registry, gossip engine,
//! anti-entropy and consensus over one storage handle, and answers inbound
//! frames for whichever transport hosts it.

use crate::consensus::{Consensus, ConsensusConfig, ConsensusError, ConsensusStats};
use crate::evaluator::{Evaluator, StaticEvaluator};
use crate::gossip::{
    BroadcastOutcome, GossipConfig, GossipEngine, GossipError, GossipStats, MessageHandler,
    ReceiveOutcome, RejectReason,
};
use crate::registry::{
    ruleset_fingerprint, IdentityError, IdentityRegistry, InstanceIdentity, RegistryConfig,
    RegistryStats,
};
use crate::storage::{Storage, StorageError};
use crate::sync::{AntiEntropy, SyncError, SyncReport, SyncStats};
use async_trait::async_trait;
use federation_core::canonical::{canonical_bytes, decode_payload};
use federation_core::{
    now_millis, Decision, GossipMessage, InstanceId, MessageType, PeerAnnouncement, PeerRecord,
    ProposalId, ProposalStatus, RulesetHash,
};
use federation_net::transport::messages::{
    DigestRequest, FetchRequest, GossipPush, Hello, WireMessage,
};
use federation_net::{Frame, FrameType, Inbound, PeerEndpoint, TcpTransport, Transport, TransportError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Node errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),
    #[error("Gossip error: {0}")]
    Gossip(#[from] GossipError),
    #[error("Encoding error: {0}")]
    Core(#[from] federation_core::Error),
    #[error("Frame encoding error: {0}")]
    Frame(#[from] postcard::Error),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Status encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Hello rejected: {0}")]
    HelloRejected(RejectReason),
    #[error("Hello was not a heartbeat")]
    NotAHeartbeat,
    #[error("Unsupported frame: {0:?}")]
    Unsupported(FrameType),
}

type TransportFactory = Box<dyn FnOnce(InstanceId) -> Arc<dyn Transport> + Send>;

/// Builder for [`FederationNode`]
pub struct FederationNodeBuilder {
    storage: Option<Arc<Storage>>,
    identity: Option<InstanceIdentity>,
    ruleset_hash: RulesetHash,
    transport: Option<TransportFactory>,
    evaluator: Option<Arc<dyn Evaluator>>,
    label: String,
    address: Option<String>,
    registry: RegistryConfig,
    gossip: GossipConfig,
    consensus: ConsensusConfig,
}

impl Default for FederationNodeBuilder {
    fn default() -> Self {
        Self {
            storage: None,
            identity: None,
            ruleset_hash: ruleset_fingerprint(&[]),
            transport: None,
            evaluator: None,
            label: "federation-node".to_string(),
            address: None,
            registry: RegistryConfig::default(),
            gossip: GossipConfig::default(),
            consensus: ConsensusConfig::default(),
        }
    }
}

impl FederationNodeBuilder {
    /// Storage to use; a temporary database if unset
    pub fn storage(mut self, storage: Arc<Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Explicit identity; otherwise loaded from (or created in) storage
    pub fn identity(mut self, identity: InstanceIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Rule-set document this instance governs itself by
    pub fn ruleset(mut self, ruleset: &[u8]) -> Self {
        self.ruleset_hash = ruleset_fingerprint(ruleset);
        self
    }

    pub fn ruleset_hash(mut self, ruleset_hash: RulesetHash) -> Self {
        self.ruleset_hash = ruleset_hash;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(Box::new(move |_: InstanceId| transport));
        self
    }

    /// Transport built once the instance id is known
    pub fn transport_fn<F>(mut self, f: F) -> Self
    where
        F: FnOnce(InstanceId) -> Arc<dyn Transport> + Send + 'static,
    {
        self.transport = Some(Box::new(f));
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Address peers should use to reach this node
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn registry_config(mut self, config: RegistryConfig) -> Self {
        self.registry = config;
        self
    }

    pub fn gossip_config(mut self, config: GossipConfig) -> Self {
        self.gossip = config;
        self
    }

    pub fn consensus_config(mut self, config: ConsensusConfig) -> Self {
        self.consensus = config;
        self
    }

    pub fn build(self) -> Result<Arc<FederationNode>, NodeError> {
        let storage = match self.storage {
            Some(storage) => storage,
            None => Arc::new(Storage::temporary()?),
        };
        let identity = match self.identity {
            Some(identity) => identity,
            None => InstanceIdentity::load_or_create(&storage, self.ruleset_hash)?,
        };
        let instance_id = identity.instance_id();

        let transport: Arc<dyn Transport> = match self.transport {
            Some(factory) => factory(instance_id),
            None => Arc::new(TcpTransport::new(self.gossip.send_timeout)),
        };
        let evaluator: Arc<dyn Evaluator> = match self.evaluator {
            Some(evaluator) => evaluator,
            None => Arc::new(StaticEvaluator::new(Decision::Abstain)),
        };

        let registry = Arc::new(IdentityRegistry::new(identity, self.registry, storage.clone())?);
        let gossip = Arc::new(GossipEngine::new(
            registry.clone(),
            transport,
            storage.clone(),
            self.gossip,
        ));
        let consensus = Arc::new(Consensus::new(
            gossip.clone(),
            evaluator,
            storage.clone(),
            self.consensus,
        )?);

        gossip.register_handler(
            MessageType::Heartbeat,
            Arc::new(HeartbeatHandler(registry.clone())),
        );
        let handler = consensus.handler();
        for message_type in [MessageType::Proposal, MessageType::Vote, MessageType::Outcome] {
            gossip.register_handler(message_type, handler.clone());
        }

        info!("Federation node {} ({}) ready", instance_id, self.label);
        Ok(Arc::new(FederationNode {
            label: self.label,
            address: self.address,
            storage,
            registry,
            sync: AntiEntropy::new(gossip.clone()),
            gossip,
            consensus,
            started_at: Instant::now(),
        }))
    }
}

/// Registers or refreshes the origin of every accepted heartbeat
struct HeartbeatHandler(Arc<IdentityRegistry>);

#[async_trait]
impl MessageHandler for HeartbeatHandler {
    async fn handle(&self, message: &GossipMessage) {
        let announcement: PeerAnnouncement = match decode_payload(message) {
            Ok(announcement) => announcement,
            Err(e) => {
                warn!("Malformed heartbeat from {}: {}", message.origin, e);
                return;
            }
        };
        match self
            .0
            .register_announced(message.origin, message.origin_public_key, &announcement)
        {
            Ok(peer) if !self.0.is_compatible(&peer) => {
                debug!("Peer {} runs a different rule-set", peer.instance_id)
            }
            Ok(_) => {}
            Err(e) => warn!("Heartbeat from {} not registered: {}", message.origin, e),
        }
    }
}

/// Result of one maintenance pass
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub seen_expired: usize,
    pub peers_staled: usize,
    pub peers_evicted: usize,
    pub pending_pruned: usize,
    pub proposals_settled: Vec<(ProposalId, ProposalStatus)>,
}

/// Serializable status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub instance_id: String,
    pub label: String,
    pub address: Option<String>,
    pub ruleset_hash: String,
    pub genesis_timestamp: u64,
    pub uptime_secs: u64,
    pub registry: RegistryStats,
    pub gossip: GossipStats,
    pub sync: SyncStats,
    pub consensus: ConsensusStats,
    pub stored_messages: usize,
    pub stored_votes: usize,
}

/// One federation instance
pub struct FederationNode {
    label: String,
    address: Option<String>,
    storage: Arc<Storage>,
    registry: Arc<IdentityRegistry>,
    gossip: Arc<GossipEngine>,
    sync: AntiEntropy,
    consensus: Arc<Consensus>,
    started_at: Instant,
}

impl FederationNode {
    pub fn builder() -> FederationNodeBuilder {
        FederationNodeBuilder::default()
    }

    pub fn local_id(&self) -> InstanceId {
        self.registry.local_id()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn identity(&self) -> &InstanceIdentity {
        self.registry.identity()
    }

    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    pub fn gossip(&self) -> &Arc<GossipEngine> {
        &self.gossip
    }

    pub fn consensus(&self) -> &Arc<Consensus> {
        &self.consensus
    }

    pub fn sync(&self) -> &AntiEntropy {
        &self.sync
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Endpoint other nodes use to reach this one
    pub fn endpoint(&self) -> PeerEndpoint {
        PeerEndpoint {
            instance_id: self.local_id(),
            address: self.address.clone(),
        }
    }

    /// How this node describes itself in heartbeats
    pub fn announcement(&self) -> PeerAnnouncement {
        let identity = self.identity();
        PeerAnnouncement {
            display_label: self.label.clone(),
            ruleset_hash: identity.ruleset_hash(),
            address: self.address.clone(),
            genesis_timestamp: identity.genesis_timestamp(),
            sent_at: now_millis(),
        }
    }

    /// Gossip a heartbeat to refresh our entry in peers' registries
    pub async fn heartbeat(&self) -> Result<BroadcastOutcome, NodeError> {
        let payload = canonical_bytes(&self.announcement())?;
        Ok(self.gossip.broadcast(MessageType::Heartbeat, payload).await?)
    }

    /// Subscribe to application `Pattern` messages
    pub fn on_pattern(&self, handler: Arc<dyn MessageHandler>) {
        self.gossip.register_handler(MessageType::Pattern, handler);
    }

    /// Gossip an application `Pattern` message
    pub async fn publish_pattern(&self, payload: Vec<u8>) -> Result<BroadcastOutcome, NodeError> {
        Ok(self.gossip.broadcast(MessageType::Pattern, payload).await?)
    }

    /// Hello frame carrying a freshly signed heartbeat
    pub fn hello_frame(&self) -> Result<Frame, NodeError> {
        let payload = canonical_bytes(&self.announcement())?;
        let heartbeat = self.gossip.seal(
            MessageType::Heartbeat,
            payload,
            self.gossip.config().default_ttl,
        )?;
        Ok(Hello { heartbeat }.to_frame()?)
    }

    /// Verify a peer's hello and register its origin
    pub async fn accept_hello(&self, hello: Hello) -> Result<PeerRecord, NodeError> {
        let heartbeat = hello.heartbeat;
        if heartbeat.message_type != MessageType::Heartbeat {
            return Err(NodeError::NotAHeartbeat);
        }
        let origin = heartbeat.origin;
        if let ReceiveOutcome::Rejected(reason) = self.gossip.receive(None, heartbeat).await {
            return Err(NodeError::HelloRejected(reason));
        }
        self.registry
            .get(&origin)
            .ok_or(NodeError::Identity(IdentityError::UnknownPeer(origin)))
    }

    /// Exchange hellos with a peer over this node's transport
    pub async fn connect(&self, peer: &PeerEndpoint) -> Result<PeerRecord, NodeError> {
        let response = self
            .gossip
            .transport()
            .request(peer, self.hello_frame()?)
            .await?;
        let record = self.accept_hello(Hello::from_frame(&response)?).await?;
        info!("Connected to {} ({})", record.instance_id, record.display_label);
        Ok(record)
    }

    /// Reconcile with one random peer
    pub async fn run_anti_entropy_round(&self) -> Result<SyncReport, SyncError> {
        self.sync.run_round().await
    }

    /// Periodic housekeeping: expire seen hashes, sweep peers, prune
    /// early votes and settle overdue proposals
    pub async fn maintain(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport {
            seen_expired: self.gossip.expire_seen(),
            pending_pruned: self.consensus.prune_pending(),
            ..Default::default()
        };
        match self.registry.sweep() {
            Ok(sweep) => {
                report.peers_staled = sweep.staled.len();
                report.peers_evicted = sweep.evicted.len();
            }
            Err(e) => warn!("Peer sweep failed: {}", e),
        }
        report.proposals_settled = self.consensus.expire_overdue().await;
        report
    }

    pub fn status(&self) -> NodeStatus {
        let identity = self.identity();
        NodeStatus {
            instance_id: identity.instance_id().to_hex(),
            label: self.label.clone(),
            address: self.address.clone(),
            ruleset_hash: hex::encode(identity.ruleset_hash().0),
            genesis_timestamp: identity.genesis_timestamp(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            registry: self.registry.stats(),
            gossip: self.gossip.stats(),
            sync: self.sync.stats(),
            consensus: self.consensus.stats(),
            stored_messages: self.storage.message_count(),
            stored_votes: self.storage.vote_count(),
        }
    }

    async fn dispatch(&self, frame: Frame) -> Result<Frame, NodeError> {
        match frame.frame_type {
            FrameType::Ping => Ok(Frame::pong()),
            FrameType::Hello => {
                let record = self.accept_hello(Hello::from_frame(&frame)?).await?;
                debug!("Hello from {} ({})", record.instance_id, record.display_label);
                self.hello_frame()
            }
            FrameType::GossipPush => {
                let push = GossipPush::from_frame(&frame)?;
                Ok(self.gossip.handle_push(push).await)
            }
            FrameType::DigestRequest => {
                let request = DigestRequest::from_frame(&frame)?;
                Ok(self.sync.handle_digest(request).to_frame()?)
            }
            FrameType::FetchRequest => {
                let request = FetchRequest::from_frame(&frame)?;
                Ok(self.sync.handle_fetch(request).to_frame()?)
            }
            FrameType::StatusRequest => {
                let status = serde_json::to_vec(&self.status())?;
                Ok(Frame::new(FrameType::StatusResponse, status))
            }
            other => Err(NodeError::Unsupported(other)),
        }
    }
}

#[async_trait]
impl Inbound for FederationNode {
    async fn on_frame(&self, frame: Frame) -> Frame {
        let frame_type = frame.frame_type;
        match self.dispatch(frame).await {
            Ok(response) => response,
            Err(e) => {
                debug!("Failed to serve {:?}: {}", frame_type, e);
                Frame::error(e.to_string())
            }
        }
    }
}
