//! Core protocol types for the federation layer
//!
//! All types here are designed for deterministic serialization via postcard.
//! Field order matters for canonical encoding.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte fixed-size array used for hashes, identifiers and public keys.
pub type Bytes32 = [u8; 32];

// =============================================================================
// IDENTITY TYPES (newtypes for type safety)
// =============================================================================

/// Instance identifier: BLAKE3("instance" || public_key)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub Bytes32);

/// Fingerprint of the rule-set an instance governs itself by: BLAKE3("ruleset" || bytes)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RulesetHash(pub Bytes32);

/// Content address of a gossip message: BLAKE3("message" || type || origin || payload)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageHash(pub Bytes32);

/// Proposal identifier: BLAKE3("proposal" || author || kind || body || created_at || deadline)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProposalId(pub Bytes32);

macro_rules! short_hex_display {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", hex::encode(&self.0[..8]))
                }
            }
        )*
    };
}

short_hex_display!(InstanceId, RulesetHash, MessageHash, ProposalId);

impl InstanceId {
    /// Full hex encoding (the Display impl is abbreviated)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a full 64-character hex string
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: Bytes32 = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

// =============================================================================
// PEERS
// =============================================================================

/// How far a remote instance is trusted by the local registry
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TrustState {
    /// Registered but no verified message seen yet
    Unverified,
    /// At least one verified message within the silence window
    Verified,
    /// Silent for longer than the stale window
    Stale,
    /// Set aside by an operator; never a gossip target
    Quarantined,
}

/// One record per known remote instance
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerRecord {
    pub instance_id: InstanceId,
    /// Immutable once learned
    pub public_key: Bytes32,
    pub display_label: String,
    pub ruleset_hash: RulesetHash,
    /// Network address, when the peer is reachable over TCP
    pub address: Option<String>,
    /// Unix millis of the last verified contact
    pub last_seen: u64,
    pub trust_state: TrustState,
}

/// Content of a heartbeat: how an instance describes itself to the federation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerAnnouncement {
    pub display_label: String,
    pub ruleset_hash: RulesetHash,
    pub address: Option<String>,
    pub genesis_timestamp: u64,
    pub sent_at: u64,
}

// =============================================================================
// GOSSIP
// =============================================================================

/// Message type discriminant
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageType {
    Heartbeat = 1,
    Proposal = 2,
    Vote = 3,
    Outcome = 4,
    Pattern = 5,
}

impl MessageType {
    pub const ALL: [MessageType; 5] = [
        MessageType::Heartbeat,
        MessageType::Proposal,
        MessageType::Vote,
        MessageType::Outcome,
        MessageType::Pattern,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Heartbeat => "heartbeat",
            MessageType::Proposal => "proposal",
            MessageType::Vote => "vote",
            MessageType::Outcome => "outcome",
            MessageType::Pattern => "pattern",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable, signed gossip envelope.
///
/// Only `ttl_hops` changes as the envelope is relayed; it is excluded from
/// both the message hash and the signature.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GossipMessage {
    pub message_hash: MessageHash,
    pub origin: InstanceId,
    /// Key the origin signed with; `origin` must equal its instance-id derivation
    pub origin_public_key: Bytes32,
    pub message_type: MessageType,
    /// Opaque to the gossip layer
    pub payload: Vec<u8>,
    /// Ed25519 signature over ("gossip-sig" || message_hash || created_at)
    pub signature: Vec<u8>,
    pub ttl_hops: u8,
    pub created_at: u64,
}

// =============================================================================
// CONSENSUS
// =============================================================================

/// Local view of a proposal's lifecycle
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ProposalStatus {
    Open,
    Approved,
    Rejected,
    /// Genuine, unresolved disagreement. Terminal and valid, not an error.
    Conflicted,
    Expired,
}

impl ProposalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProposalStatus::Open)
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProposalStatus::Open => "OPEN",
            ProposalStatus::Approved => "APPROVED",
            ProposalStatus::Rejected => "REJECTED",
            ProposalStatus::Conflicted => "CONFLICTED",
            ProposalStatus::Expired => "EXPIRED",
        };
        f.write_str(s)
    }
}

/// Cross-instance unit of work
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Proposal {
    pub proposal_id: ProposalId,
    pub author: InstanceId,
    /// Free-form domain tag
    pub kind: String,
    /// Opaque to consensus
    pub body: Vec<u8>,
    pub created_at: u64,
    /// Unix millis after which an unmet quorum expires the proposal
    pub deadline: u64,
    /// Ed25519 signature over ("proposal-sig" || canonical(proposal_without_signature))
    pub signature: Vec<u8>,
}

/// A voter's answer
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Decision {
    Approve,
    Reject,
    Abstain,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::Approve => "APPROVE",
            Decision::Reject => "REJECT",
            Decision::Abstain => "ABSTAIN",
        };
        f.write_str(s)
    }
}

/// Signed response to a proposal
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vote {
    pub proposal_id: ProposalId,
    pub voter: InstanceId,
    pub decision: Decision,
    /// Opaque to consensus
    pub rationale: String,
    /// Strictly monotonic per voter; the later revision wins
    pub cast_at: u64,
    /// Ed25519 signature over ("vote-sig" || canonical(vote_without_signature))
    pub signature: Vec<u8>,
}

/// A node's finalized local verdict, announced to the federation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutcomeAnnouncement {
    pub proposal_id: ProposalId,
    pub instance: InstanceId,
    pub status: ProposalStatus,
    pub approvals: u32,
    pub rejections: u32,
    pub abstentions: u32,
    pub finalized_at: u64,
}
