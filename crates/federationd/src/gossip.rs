//! Epidemic dissemination of signed envelopes
//!
//! Every instance re-gossips what it accepts to a few random peers, so a
//! message reaches the federation with high probability despite unreliable
//! links. Duplicates are recognised by content hash and dropped; the hop
//! budget (`ttl_hops`) bounds how far any message travels.

use crate::registry::{self, IdentityRegistry};
use crate::seen::SeenSet;
use crate::storage::{Storage, StorageError};
use async_trait::async_trait;
use federation_core::crypto::{compute_message_hash, envelope_sign_bytes, verify_envelope_integrity};
use federation_core::{now_millis, GossipMessage, InstanceId, MessageHash, MessageType, TrustState};
use federation_net::transport::messages::{GossipPush, WireMessage};
use federation_net::{Frame, FrameType, PeerEndpoint, Transport};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

/// Gossip errors
#[derive(Debug, Error)]
pub enum GossipError {
    #[error("Encoding error: {0}")]
    Core(#[from] federation_core::Error),
    #[error("Frame encoding error: {0}")]
    Frame(#[from] postcard::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Why an inbound envelope was dropped
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("integrity check failed: {0}")]
    Integrity(String),
    #[error("bad signature")]
    BadSignature,
    #[error("origin key differs from the registered key")]
    IdentityConflict,
    #[error("origin is quarantined")]
    Quarantined,
    #[error("created {age_ms} ms ago, outside the replay window")]
    Expired { age_ms: u64 },
    #[error("created {ahead_ms} ms in the future")]
    FromFuture { ahead_ms: u64 },
}

/// Gossip configuration
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Peers contacted per broadcast or relay
    pub fanout: usize,
    /// Hop budget given to locally originated messages
    pub default_ttl: u8,
    /// Per-peer send deadline
    pub send_timeout: Duration,
    /// Seen-set capacity
    pub seen_capacity: usize,
    /// How long a seen hash suppresses duplicates. Envelopes created
    /// longer ago than this are refused, so replays cannot outlive it.
    pub seen_retention: Duration,
    /// Tolerated lead of an origin's clock over ours
    pub max_clock_skew: Duration,
    /// Hashes offered per anti-entropy digest
    pub digest_size: usize,
    /// Envelopes served per anti-entropy fetch
    pub max_fetch: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            fanout: 3,
            default_ttl: 6,
            send_timeout: Duration::from_secs(2),
            seen_capacity: 10_000,
            seen_retention: Duration::from_secs(600),
            max_clock_skew: Duration::from_secs(60),
            digest_size: 256,
            max_fetch: 128,
        }
    }
}

/// Consumer of accepted envelopes of one message type
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &GossipMessage);
}

/// Result of a local broadcast
#[derive(Debug, Clone)]
pub enum BroadcastOutcome {
    /// Nobody to send to; the message exists only locally
    LocalOnly(GossipMessage),
    /// Sent to `delivered + failed` peers
    Sent {
        message: GossipMessage,
        delivered: usize,
        failed: usize,
    },
}

impl BroadcastOutcome {
    pub fn message(&self) -> &GossipMessage {
        match self {
            BroadcastOutcome::LocalOnly(message) => message,
            BroadcastOutcome::Sent { message, .. } => message,
        }
    }

    pub fn is_local_only(&self) -> bool {
        matches!(self, BroadcastOutcome::LocalOnly(_))
    }

    pub fn delivered(&self) -> usize {
        match self {
            BroadcastOutcome::LocalOnly(_) => 0,
            BroadcastOutcome::Sent { delivered, .. } => *delivered,
        }
    }
}

/// Result of handling an inbound envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// New and valid: delivered to handlers and relayed to `forwarded` peers
    Accepted { forwarded: usize },
    /// Already seen; dropped
    Duplicate,
    /// Failed verification; dropped
    Rejected(RejectReason),
}

impl ReceiveOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ReceiveOutcome::Accepted { .. })
    }
}

/// Gossip statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct GossipStats {
    pub broadcasts: u64,
    pub local_only: u64,
    pub received: u64,
    pub accepted: u64,
    pub duplicates: u64,
    pub verification_failures: u64,
    pub expired: u64,
    pub forwarded: u64,
    pub ttl_exhausted: u64,
    pub send_failures: u64,
    pub seen_size: usize,
}

/// The gossip engine for one instance
pub struct GossipEngine {
    registry: Arc<IdentityRegistry>,
    transport: Arc<dyn Transport>,
    storage: Arc<Storage>,
    config: GossipConfig,
    seen: Mutex<SeenSet>,
    handlers: RwLock<HashMap<MessageType, Vec<Arc<dyn MessageHandler>>>>,
    stats: Mutex<GossipStats>,
}

impl GossipEngine {
    pub fn new(
        registry: Arc<IdentityRegistry>,
        transport: Arc<dyn Transport>,
        storage: Arc<Storage>,
        config: GossipConfig,
    ) -> Self {
        let seen = SeenSet::new(config.seen_capacity, config.seen_retention);
        Self {
            registry,
            transport,
            storage,
            config,
            seen: Mutex::new(seen),
            handlers: RwLock::new(HashMap::new()),
            stats: Mutex::new(GossipStats::default()),
        }
    }

    pub fn local_id(&self) -> InstanceId {
        self.registry.local_id()
    }

    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    /// Subscribe a handler to accepted envelopes of one type
    pub fn register_handler(&self, message_type: MessageType, handler: Arc<dyn MessageHandler>) {
        self.handlers
            .write()
            .entry(message_type)
            .or_default()
            .push(handler);
    }

    /// Build and sign an envelope originating here
    pub fn seal(
        &self,
        message_type: MessageType,
        payload: Vec<u8>,
        ttl_hops: u8,
    ) -> Result<GossipMessage, GossipError> {
        let identity = self.registry.identity();
        let origin = identity.instance_id();
        let message_hash = compute_message_hash(message_type, &origin, &payload)?;
        let created_at = now_millis();
        let signature = identity.sign(&envelope_sign_bytes(&message_hash, created_at));

        Ok(GossipMessage {
            message_hash,
            origin,
            origin_public_key: identity.public_key(),
            message_type,
            payload,
            signature,
            ttl_hops,
            created_at,
        })
    }

    /// Originate a message with the default hop budget
    pub async fn broadcast(
        &self,
        message_type: MessageType,
        payload: Vec<u8>,
    ) -> Result<BroadcastOutcome, GossipError> {
        self.broadcast_with_ttl(message_type, payload, self.config.default_ttl)
            .await
    }

    /// Originate a message and push it to a random subset of peers.
    ///
    /// An empty peer set is not an error: the message stays local.
    pub async fn broadcast_with_ttl(
        &self,
        message_type: MessageType,
        payload: Vec<u8>,
        ttl_hops: u8,
    ) -> Result<BroadcastOutcome, GossipError> {
        let message = self.seal(message_type, payload, ttl_hops)?;
        self.seen.lock().insert(message.clone());
        if let Err(e) = self.storage.append_message(&message) {
            warn!("Failed to persist message {}: {}", message.message_hash, e);
        }
        self.stats.lock().broadcasts += 1;

        let targets = self.select_targets(&[]);
        if targets.is_empty() {
            self.stats.lock().local_only += 1;
            info!(
                "No gossip targets, {} {} stays local",
                message_type, message.message_hash
            );
            return Ok(BroadcastOutcome::LocalOnly(message));
        }

        let (delivered, failed) = self.fan_out(&message, targets).await?;
        debug!(
            "Broadcast {} {}: {} delivered, {} failed",
            message_type, message.message_hash, delivered, failed
        );
        Ok(BroadcastOutcome::Sent {
            message,
            delivered,
            failed,
        })
    }

    /// Handle an envelope pushed by `from` (None when the relaying hop is unknown).
    pub async fn receive(&self, from: Option<InstanceId>, message: GossipMessage) -> ReceiveOutcome {
        self.stats.lock().received += 1;
        let hash = message.message_hash;

        if message.origin == self.local_id() || self.seen.lock().contains(&hash) {
            self.stats.lock().duplicates += 1;
            trace!("Duplicate {} {}", message.message_type, hash);
            return ReceiveOutcome::Duplicate;
        }

        if let Err(reason) = self.check_freshness(&message, now_millis()) {
            self.stats.lock().expired += 1;
            debug!(
                "Dropping {} {} from origin {}: {}",
                message.message_type, hash, message.origin, reason
            );
            return ReceiveOutcome::Rejected(reason);
        }

        if let Err(reason) = self.verify(&message) {
            self.stats.lock().verification_failures += 1;
            warn!(
                "Dropping {} {} from origin {}: {}",
                message.message_type, hash, message.origin, reason
            );
            return ReceiveOutcome::Rejected(reason);
        }

        // Authoritative duplicate check: a concurrent copy may have won the race
        if !self.seen.lock().insert(message.clone()) {
            self.stats.lock().duplicates += 1;
            return ReceiveOutcome::Duplicate;
        }
        self.stats.lock().accepted += 1;

        if let Err(e) = self.registry.mark_verified(&message.origin) {
            warn!("Failed to refresh peer {}: {}", message.origin, e);
        }
        if let Err(e) = self.storage.append_message(&message) {
            warn!("Failed to persist message {}: {}", hash, e);
        }

        self.deliver(&message).await;
        let forwarded = self.relay(from, &message).await;
        ReceiveOutcome::Accepted { forwarded }
    }

    /// Answer a pushed envelope with an ack, or a failure frame if it was rejected
    pub async fn handle_push(&self, push: GossipPush) -> Frame {
        match self.receive(Some(push.sender), push.message).await {
            ReceiveOutcome::Rejected(reason) => Frame::error(format!("rejected: {}", reason)),
            _ => Frame::ack(),
        }
    }

    /// Refuse envelopes whose age puts them outside the seen-set window
    fn check_freshness(&self, message: &GossipMessage, now: u64) -> Result<(), RejectReason> {
        let skew = self.config.max_clock_skew.as_millis() as u64;
        if message.created_at > now.saturating_add(skew) {
            return Err(RejectReason::FromFuture {
                ahead_ms: message.created_at - now,
            });
        }
        let age_ms = now.saturating_sub(message.created_at);
        if age_ms > self.config.seen_retention.as_millis() as u64 {
            return Err(RejectReason::Expired { age_ms });
        }
        Ok(())
    }

    fn verify(&self, message: &GossipMessage) -> Result<(), RejectReason> {
        verify_envelope_integrity(message).map_err(|e| RejectReason::Integrity(e.to_string()))?;

        if let Some(peer) = self.registry.get(&message.origin) {
            if peer.public_key != message.origin_public_key {
                self.registry.record_conflict(
                    message.origin,
                    peer.public_key,
                    message.origin_public_key,
                    &peer.display_label,
                );
                return Err(RejectReason::IdentityConflict);
            }
            if peer.trust_state == TrustState::Quarantined {
                return Err(RejectReason::Quarantined);
            }
        }

        let signed = envelope_sign_bytes(&message.message_hash, message.created_at);
        if !registry::verify(&signed, &message.signature, &message.origin_public_key) {
            return Err(RejectReason::BadSignature);
        }
        Ok(())
    }

    async fn deliver(&self, message: &GossipMessage) {
        let handlers = self
            .handlers
            .read()
            .get(&message.message_type)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler.handle(message).await;
        }
    }

    async fn relay(&self, from: Option<InstanceId>, message: &GossipMessage) -> usize {
        let ttl_hops = message.ttl_hops.saturating_sub(1);
        if ttl_hops == 0 {
            self.stats.lock().ttl_exhausted += 1;
            trace!("Hop budget exhausted for {}", message.message_hash);
            return 0;
        }

        let mut exclude = vec![message.origin];
        exclude.extend(from);
        let targets = self.select_targets(&exclude);
        if targets.is_empty() {
            return 0;
        }

        let mut relayed = message.clone();
        relayed.ttl_hops = ttl_hops;
        match self.fan_out(&relayed, targets).await {
            Ok((delivered, _)) => {
                self.stats.lock().forwarded += delivered as u64;
                delivered
            }
            Err(e) => {
                warn!("Failed to relay {}: {}", message.message_hash, e);
                0
            }
        }
    }

    fn select_targets(&self, exclude: &[InstanceId]) -> Vec<PeerEndpoint> {
        let mut candidates: Vec<PeerEndpoint> = self
            .registry
            .gossip_targets()
            .into_iter()
            .filter(|peer| !exclude.contains(&peer.instance_id))
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(self.config.fanout);
        candidates
    }

    /// Push to every target concurrently, each under its own deadline
    async fn fan_out(
        &self,
        message: &GossipMessage,
        targets: Vec<PeerEndpoint>,
    ) -> Result<(usize, usize), GossipError> {
        let frame = GossipPush {
            sender: self.local_id(),
            message: message.clone(),
        }
        .to_frame()?;

        let mut sends = JoinSet::new();
        for target in targets {
            let transport = self.transport.clone();
            let frame = frame.clone();
            let timeout = self.config.send_timeout;
            sends.spawn(async move {
                let result = tokio::time::timeout(timeout, transport.request(&target, frame)).await;
                (target, result)
            });
        }

        let mut delivered = 0;
        let mut failed = 0;
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((_, Ok(Ok(response)))) if response.frame_type == FrameType::Ack => delivered += 1,
                Ok((target, Ok(Ok(response)))) => {
                    failed += 1;
                    debug!("{} answered push with {:?}", target, response.frame_type);
                }
                Ok((target, Ok(Err(e)))) => {
                    failed += 1;
                    debug!("Push to {} failed: {}", target, e);
                }
                Ok((target, Err(_))) => {
                    failed += 1;
                    debug!("Push to {} timed out", target);
                }
                Err(e) => {
                    failed += 1;
                    warn!("Push task failed: {}", e);
                }
            }
        }

        self.stats.lock().send_failures += failed as u64;
        Ok((delivered, failed))
    }

    /// Most recent seen hashes, newest first
    pub fn digest(&self, max: usize) -> Vec<MessageHash> {
        self.seen.lock().recent(max.min(self.config.digest_size))
    }

    /// Envelopes for the requested hashes that are still held
    pub fn fetch(&self, hashes: &[MessageHash]) -> Vec<GossipMessage> {
        let seen = self.seen.lock();
        hashes
            .iter()
            .filter_map(|hash| seen.get(hash).cloned())
            .take(self.config.max_fetch)
            .collect()
    }

    pub fn has_seen(&self, hash: &MessageHash) -> bool {
        self.seen.lock().contains(hash)
    }

    /// Drop seen entries past the retention window
    pub fn expire_seen(&self) -> usize {
        self.seen.lock().expire(Instant::now())
    }

    /// Get gossip statistics
    pub fn stats(&self) -> GossipStats {
        let mut stats = self.stats.lock().clone();
        stats.seen_size = self.seen.lock().len();
        stats
    }
}
