//! Instance identity and the registry of known peers
//!
//! Every instance owns one long-lived Ed25519 keypair. Its [`InstanceId`] is
//! derived from the public key, so a peer's id and key are bound together:
//! once learned, a peer's key never changes. An offer of a different key for
//! a known id is an identity conflict, recorded and refused.

use crate::storage::{Storage, StorageError, StoredIdentity};
use federation_core::canonical::normalize_label;
use federation_core::crypto::{derive_instance_id, derive_ruleset_hash};
use federation_core::{now_millis, Bytes32, InstanceId, PeerAnnouncement, PeerRecord, RulesetHash, TrustState};
use federation_net::{CryptoError, KeyPair, PeerEndpoint};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Identity errors
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(#[from] CryptoError),
    #[error("Identity conflict for {instance_id}: known key {known}, offered key {offered}")]
    IdentityConflict {
        instance_id: InstanceId,
        known: String,
        offered: String,
    },
    #[error("Instance id {0} is not derived from the offered public key")]
    NotDerived(InstanceId),
    #[error("Refusing to register the local instance as a peer")]
    LocalInstance,
    #[error("Unknown peer: {0}")]
    UnknownPeer(InstanceId),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

// =============================================================================
// LOCAL IDENTITY
// =============================================================================

/// The local instance's identity. The private key never leaves this struct.
#[derive(Debug, Clone)]
pub struct InstanceIdentity {
    instance_id: InstanceId,
    keypair: KeyPair,
    genesis_timestamp: u64,
    ruleset_hash: RulesetHash,
}

impl InstanceIdentity {
    /// Create a fresh identity bound to a rule-set fingerprint
    pub fn create(ruleset_hash: RulesetHash) -> Result<Self, IdentityError> {
        let keypair = KeyPair::generate()?;
        Ok(Self::from_keypair(keypair, now_millis(), ruleset_hash))
    }

    /// Rebuild an identity from its persisted parts
    pub fn from_keypair(keypair: KeyPair, genesis_timestamp: u64, ruleset_hash: RulesetHash) -> Self {
        Self {
            instance_id: derive_instance_id(&keypair.public_key()),
            keypair,
            genesis_timestamp,
            ruleset_hash,
        }
    }

    /// Load the persisted identity, or create and persist a new one.
    ///
    /// The key survives rule-set changes; only the fingerprint is updated.
    pub fn load_or_create(storage: &Storage, ruleset_hash: RulesetHash) -> Result<Self, IdentityError> {
        if let Some(stored) = storage.get_identity()? {
            let mut identity = Self::from_keypair(
                KeyPair::from_seed(&stored.seed),
                stored.genesis_timestamp,
                stored.ruleset_hash,
            );
            if stored.ruleset_hash != ruleset_hash {
                warn!(
                    "Rule-set changed for {}: {} -> {}",
                    identity.instance_id, stored.ruleset_hash, ruleset_hash
                );
                identity.ruleset_hash = ruleset_hash;
                identity.persist(storage)?;
            }
            return Ok(identity);
        }

        let identity = Self::create(ruleset_hash)?;
        identity.persist(storage)?;
        info!("Created instance identity {}", identity.instance_id);
        Ok(identity)
    }

    fn persist(&self, storage: &Storage) -> Result<(), IdentityError> {
        storage.put_identity(&StoredIdentity {
            seed: self.keypair.seed(),
            genesis_timestamp: self.genesis_timestamp,
            ruleset_hash: self.ruleset_hash,
        })?;
        Ok(())
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn public_key(&self) -> Bytes32 {
        self.keypair.public_key()
    }

    pub fn genesis_timestamp(&self) -> u64 {
        self.genesis_timestamp
    }

    pub fn ruleset_hash(&self) -> RulesetHash {
        self.ruleset_hash
    }

    /// Sign a payload with the instance key
    pub fn sign(&self, payload: &[u8]) -> Vec<u8> {
        self.keypair.sign(payload).to_vec()
    }
}

/// Check a signature. Malformed keys or signatures are simply invalid.
pub fn verify(payload: &[u8], signature: &[u8], public_key: &Bytes32) -> bool {
    KeyPair::verify(public_key, payload, signature).is_ok()
}

/// Fingerprint the bytes of a rule-set document
pub fn ruleset_fingerprint(ruleset: &[u8]) -> RulesetHash {
    derive_ruleset_hash(ruleset)
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Registry timing configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Silence after which a peer is marked stale
    pub stale_after: Duration,
    /// Silence after which a stale peer is forgotten
    pub evict_after: Duration,
    /// Conflict log capacity
    pub max_conflicts: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(300),
            evict_after: Duration::from_secs(3600),
            max_conflicts: 256,
        }
    }
}

/// A refused attempt to bind a known instance id to a new key
#[derive(Debug, Clone, Serialize)]
pub struct ConflictRecord {
    pub instance_id: InstanceId,
    pub known_key: Bytes32,
    pub offered_key: Bytes32,
    pub offered_label: String,
    pub detected_at: u64,
}

/// Result of a sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub staled: Vec<InstanceId>,
    pub evicted: Vec<InstanceId>,
}

/// Registry statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub unverified: usize,
    pub verified: usize,
    pub stale: usize,
    pub quarantined: usize,
    /// Peers on a different rule-set
    pub incompatible: usize,
    pub conflicts: usize,
}

/// Known remote instances, keyed by instance id
pub struct IdentityRegistry {
    identity: InstanceIdentity,
    config: RegistryConfig,
    peers: RwLock<HashMap<InstanceId, PeerRecord>>,
    conflicts: RwLock<VecDeque<ConflictRecord>>,
    storage: Arc<Storage>,
}

impl IdentityRegistry {
    /// Create a registry, restoring peers from storage
    pub fn new(
        identity: InstanceIdentity,
        config: RegistryConfig,
        storage: Arc<Storage>,
    ) -> Result<Self, IdentityError> {
        let peers: HashMap<_, _> = storage
            .all_peers()?
            .into_iter()
            .map(|peer| (peer.instance_id, peer))
            .collect();
        if !peers.is_empty() {
            info!("Restored {} peers from storage", peers.len());
        }

        Ok(Self {
            identity,
            config,
            peers: RwLock::new(peers),
            conflicts: RwLock::new(VecDeque::new()),
            storage,
        })
    }

    /// The local identity
    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    pub fn local_id(&self) -> InstanceId {
        self.identity.instance_id
    }

    /// Sign with the local key
    pub fn sign(&self, payload: &[u8]) -> Vec<u8> {
        self.identity.sign(payload)
    }

    /// Register (or refresh) a remote instance.
    ///
    /// Idempotent for an unchanged key. A known id offered with a different key
    /// is refused and logged; the stored record is left untouched.
    pub fn register_peer(
        &self,
        instance_id: InstanceId,
        public_key: Bytes32,
        display_label: &str,
        ruleset_hash: RulesetHash,
    ) -> Result<PeerRecord, IdentityError> {
        self.upsert(instance_id, public_key, display_label, ruleset_hash, None)
    }

    /// Register the origin of a verified heartbeat and mark it verified
    pub fn register_announced(
        &self,
        instance_id: InstanceId,
        public_key: Bytes32,
        announcement: &PeerAnnouncement,
    ) -> Result<PeerRecord, IdentityError> {
        self.upsert(
            instance_id,
            public_key,
            &announcement.display_label,
            announcement.ruleset_hash,
            announcement.address.clone(),
        )?;
        self.mark_verified(&instance_id)?
            .ok_or(IdentityError::UnknownPeer(instance_id))
    }

    fn upsert(
        &self,
        instance_id: InstanceId,
        public_key: Bytes32,
        display_label: &str,
        ruleset_hash: RulesetHash,
        address: Option<String>,
    ) -> Result<PeerRecord, IdentityError> {
        if instance_id == self.identity.instance_id {
            return Err(IdentityError::LocalInstance);
        }

        let mut peers = self.peers.write();
        if let Some(existing) = peers.get_mut(&instance_id) {
            if existing.public_key != public_key {
                let known = existing.public_key;
                drop(peers);
                return Err(self.record_conflict(instance_id, known, public_key, display_label));
            }

            existing.display_label = normalize_label(display_label);
            existing.ruleset_hash = ruleset_hash;
            if address.is_some() {
                existing.address = address;
            }
            let record = existing.clone();
            drop(peers);
            self.storage.put_peer(&record)?;
            return Ok(record);
        }

        if derive_instance_id(&public_key) != instance_id {
            return Err(IdentityError::NotDerived(instance_id));
        }

        let record = PeerRecord {
            instance_id,
            public_key,
            display_label: normalize_label(display_label),
            ruleset_hash,
            address,
            last_seen: now_millis(),
            trust_state: TrustState::Unverified,
        };
        peers.insert(instance_id, record.clone());
        drop(peers);

        self.storage.put_peer(&record)?;
        info!("Registered peer {} ({})", instance_id, record.display_label);
        Ok(record)
    }

    /// Log a conflicting key offer and build the error to return
    pub fn record_conflict(
        &self,
        instance_id: InstanceId,
        known_key: Bytes32,
        offered_key: Bytes32,
        offered_label: &str,
    ) -> IdentityError {
        warn!(
            "Identity conflict for {}: known key {}, offered {}",
            instance_id,
            hex::encode(known_key),
            hex::encode(offered_key)
        );

        let mut conflicts = self.conflicts.write();
        if conflicts.len() >= self.config.max_conflicts {
            conflicts.pop_front();
        }
        conflicts.push_back(ConflictRecord {
            instance_id,
            known_key,
            offered_key,
            offered_label: normalize_label(offered_label),
            detected_at: now_millis(),
        });

        IdentityError::IdentityConflict {
            instance_id,
            known: hex::encode(known_key),
            offered: hex::encode(offered_key),
        }
    }

    /// Refresh a peer after a verified message. Unknown peers are ignored.
    pub fn mark_verified(&self, instance_id: &InstanceId) -> Result<Option<PeerRecord>, IdentityError> {
        let record = {
            let mut peers = self.peers.write();
            let Some(peer) = peers.get_mut(instance_id) else {
                return Ok(None);
            };
            peer.last_seen = now_millis();
            if matches!(peer.trust_state, TrustState::Unverified | TrustState::Stale) {
                debug!("Peer {} verified", instance_id);
                peer.trust_state = TrustState::Verified;
            }
            peer.clone()
        };
        self.storage.put_peer(&record)?;
        Ok(Some(record))
    }

    /// Set a peer aside; it stops being a gossip target and its messages are dropped
    pub fn quarantine(&self, instance_id: &InstanceId) -> Result<(), IdentityError> {
        self.set_trust(instance_id, TrustState::Quarantined)?;
        warn!("Peer {} quarantined", instance_id);
        Ok(())
    }

    /// Lift a quarantine
    pub fn release(&self, instance_id: &InstanceId) -> Result<(), IdentityError> {
        self.set_trust(instance_id, TrustState::Unverified)?;
        info!("Peer {} released from quarantine", instance_id);
        Ok(())
    }

    fn set_trust(&self, instance_id: &InstanceId, state: TrustState) -> Result<(), IdentityError> {
        let record = {
            let mut peers = self.peers.write();
            let peer = peers
                .get_mut(instance_id)
                .ok_or(IdentityError::UnknownPeer(*instance_id))?;
            peer.trust_state = state;
            peer.clone()
        };
        self.storage.put_peer(&record)?;
        Ok(())
    }

    /// Forget a peer entirely (manual conflict resolution)
    pub fn forget(&self, instance_id: &InstanceId) -> Result<bool, IdentityError> {
        let removed = self.peers.write().remove(instance_id).is_some();
        if removed {
            self.storage.remove_peer(instance_id)?;
            info!("Forgot peer {}", instance_id);
        }
        Ok(removed)
    }

    /// Look up a peer
    pub fn get(&self, instance_id: &InstanceId) -> Option<PeerRecord> {
        self.peers.read().get(instance_id).cloned()
    }

    /// Snapshot of all known peers
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peers.read().values().cloned().collect()
    }

    /// Whether a peer runs a rule-set we will exchange gossip with
    pub fn is_compatible(&self, peer: &PeerRecord) -> bool {
        peer.ruleset_hash == self.identity.ruleset_hash
    }

    /// Peers eligible to receive gossip: live, not quarantined, same rule-set
    pub fn gossip_targets(&self) -> Vec<PeerEndpoint> {
        self.peers
            .read()
            .values()
            .filter(|peer| matches!(peer.trust_state, TrustState::Unverified | TrustState::Verified))
            .filter(|peer| self.is_compatible(peer))
            .map(PeerEndpoint::from)
            .collect()
    }

    /// Age out silent peers
    pub fn sweep(&self) -> Result<SweepReport, IdentityError> {
        self.sweep_at(now_millis())
    }

    /// Age out silent peers as of `now` (unix millis)
    pub fn sweep_at(&self, now: u64) -> Result<SweepReport, IdentityError> {
        let stale_after = self.config.stale_after.as_millis() as u64;
        let evict_after = self.config.evict_after.as_millis() as u64;
        let mut report = SweepReport::default();
        let mut changed = Vec::new();

        {
            let mut peers = self.peers.write();
            for peer in peers.values_mut() {
                let silence = now.saturating_sub(peer.last_seen);
                match peer.trust_state {
                    TrustState::Unverified | TrustState::Verified if silence > stale_after => {
                        peer.trust_state = TrustState::Stale;
                        report.staled.push(peer.instance_id);
                        changed.push(peer.clone());
                    }
                    TrustState::Stale if silence > evict_after => {
                        report.evicted.push(peer.instance_id);
                    }
                    _ => {}
                }
            }
            for id in &report.evicted {
                peers.remove(id);
            }
        }

        for peer in &changed {
            self.storage.put_peer(peer)?;
        }
        for id in &report.evicted {
            self.storage.remove_peer(id)?;
        }
        if !report.staled.is_empty() || !report.evicted.is_empty() {
            debug!(
                "Registry sweep: {} stale, {} evicted",
                report.staled.len(),
                report.evicted.len()
            );
        }
        Ok(report)
    }

    /// Recorded identity conflicts, oldest first
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.conflicts.read().iter().cloned().collect()
    }

    /// Get registry statistics
    pub fn stats(&self) -> RegistryStats {
        let peers = self.peers.read();
        let mut stats = RegistryStats {
            total: peers.len(),
            conflicts: self.conflicts.read().len(),
            ..Default::default()
        };
        for peer in peers.values() {
            match peer.trust_state {
                TrustState::Unverified => stats.unverified += 1,
                TrustState::Verified => stats.verified += 1,
                TrustState::Stale => stats.stale += 1,
                TrustState::Quarantined => stats.quarantined += 1,
            }
            if !self.is_compatible(peer) {
                stats.incompatible += 1;
            }
        }
        stats
    }
}
