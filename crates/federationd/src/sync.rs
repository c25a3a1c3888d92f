//! Anti-entropy: pull-based repair of missed gossip
//!
//! Periodically a node asks one random peer for a digest of its most recent
//! message hashes, fetches the ones it has not seen, and runs them through
//! the normal receive path. Push gossip is fast but lossy; this closes gaps
//! left by partitions and dropped sends.

use crate::gossip::GossipEngine;
use federation_core::InstanceId;
use federation_net::transport::messages::{
    DigestRequest, DigestResponse, FetchRequest, FetchResponse, WireMessage,
};
use federation_net::{PeerEndpoint, TransportError};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

/// Sync protocol errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Encoding error: {0}")]
    Encoding(#[from] postcard::Error),
}

/// Anti-entropy state for a peer
#[derive(Debug, Default, Clone)]
pub struct PeerSyncState {
    /// Last successful round
    pub last_sync: Option<Instant>,
    /// Number of successful rounds
    pub sync_count: u64,
    /// Consecutive failures
    pub failures: u32,
    /// Messages recovered from this peer
    pub recovered: u64,
}

/// Outcome of one round
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Peer contacted, if any was eligible
    pub peer: Option<InstanceId>,
    /// Hashes the peer offered
    pub offered: usize,
    /// Offered hashes we lacked
    pub missing: usize,
    /// Fetched envelopes accepted
    pub accepted: usize,
}

/// Sync statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    pub peer_count: usize,
    pub total_syncs: u64,
    pub total_failures: u64,
    pub recovered: u64,
}

/// Anti-entropy manager
pub struct AntiEntropy {
    gossip: Arc<GossipEngine>,
    peers: RwLock<HashMap<InstanceId, PeerSyncState>>,
    failures: RwLock<u64>,
}

impl AntiEntropy {
    pub fn new(gossip: Arc<GossipEngine>) -> Self {
        Self {
            gossip,
            peers: RwLock::new(HashMap::new()),
            failures: RwLock::new(0),
        }
    }

    /// Handle incoming digest request
    pub fn handle_digest(&self, request: DigestRequest) -> DigestResponse {
        debug!("Digest request from {}", request.sender);
        DigestResponse {
            hashes: self.gossip.digest(request.max_hashes as usize),
        }
    }

    /// Handle incoming fetch request
    pub fn handle_fetch(&self, request: FetchRequest) -> FetchResponse {
        debug!(
            "Fetch request from {} for {} hashes",
            request.sender,
            request.hashes.len()
        );
        FetchResponse {
            messages: self.gossip.fetch(&request.hashes),
        }
    }

    /// Reconcile with one random eligible peer
    pub async fn run_round(&self) -> Result<SyncReport, SyncError> {
        let target = self
            .gossip
            .registry()
            .gossip_targets()
            .choose(&mut rand::thread_rng())
            .cloned();
        match target {
            Some(peer) => self.sync_with(&peer).await,
            None => Ok(SyncReport::default()),
        }
    }

    /// Reconcile with a specific peer
    pub async fn sync_with(&self, peer: &PeerEndpoint) -> Result<SyncReport, SyncError> {
        match self.exchange(peer).await {
            Ok(report) => {
                let mut peers = self.peers.write();
                let state = peers.entry(peer.instance_id).or_default();
                state.last_sync = Some(Instant::now());
                state.sync_count += 1;
                state.failures = 0;
                state.recovered += report.accepted as u64;
                if report.accepted > 0 {
                    debug!("Recovered {} messages from {}", report.accepted, peer);
                }
                Ok(report)
            }
            Err(e) => {
                self.peers
                    .write()
                    .entry(peer.instance_id)
                    .or_default()
                    .failures += 1;
                *self.failures.write() += 1;
                warn!("Anti-entropy with {} failed: {}", peer, e);
                Err(e)
            }
        }
    }

    async fn exchange(&self, peer: &PeerEndpoint) -> Result<SyncReport, SyncError> {
        let local = self.gossip.local_id();
        let config = self.gossip.config();
        let transport = self.gossip.transport();

        let request = DigestRequest {
            sender: local,
            max_hashes: config.digest_size as u32,
        };
        let response = transport.request(peer, request.to_frame()?).await?;
        let digest = DigestResponse::from_frame(&response)?;

        let missing: Vec<_> = digest
            .hashes
            .iter()
            .filter(|hash| !self.gossip.has_seen(hash))
            .take(config.max_fetch)
            .copied()
            .collect();
        let mut report = SyncReport {
            peer: Some(peer.instance_id),
            offered: digest.hashes.len(),
            missing: missing.len(),
            accepted: 0,
        };
        if missing.is_empty() {
            return Ok(report);
        }

        let request = FetchRequest {
            sender: local,
            hashes: missing.clone(),
        };
        let response = transport.request(peer, request.to_frame()?).await?;
        let fetched = FetchResponse::from_frame(&response)?;

        let wanted: HashSet<_> = missing.into_iter().collect();
        for message in fetched.messages {
            if !wanted.contains(&message.message_hash) {
                debug!("Ignoring unrequested message {} from {}", message.message_hash, peer);
                continue;
            }
            if self
                .gossip
                .receive(Some(peer.instance_id), message)
                .await
                .is_accepted()
            {
                report.accepted += 1;
            }
        }
        Ok(report)
    }

    /// Per-peer state
    pub fn peer_state(&self, peer: &InstanceId) -> Option<PeerSyncState> {
        self.peers.read().get(peer).cloned()
    }

    /// Get sync statistics
    pub fn stats(&self) -> SyncStats {
        let peers = self.peers.read();
        SyncStats {
            peer_count: peers.len(),
            total_syncs: peers.values().map(|s| s.sync_count).sum(),
            total_failures: *self.failures.read(),
            recovered: peers.values().map(|s| s.recovered).sum(),
        }
    }
}
