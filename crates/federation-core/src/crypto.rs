//! Hash derivations and signing payloads for the federation layer
//!
//! All hash derivations use BLAKE3 with domain separation prefixes.
//! Signing itself lives in the network crate; this module only fixes
//! which bytes get signed.

use crate::canonical::canonical_bytes;
use crate::error::{Error, Result};
use crate::types::*;
use blake3::Hasher;
use serde::Serialize;

// =============================================================================
// DOMAIN SEPARATION PREFIXES
// =============================================================================

/// Domain prefix for InstanceId derivation
pub const DOMAIN_INSTANCE: &[u8] = b"instance";
/// Domain prefix for RulesetHash derivation
pub const DOMAIN_RULESET: &[u8] = b"ruleset";
/// Domain prefix for MessageHash derivation
pub const DOMAIN_MESSAGE: &[u8] = b"message";
/// Domain prefix for ProposalId derivation
pub const DOMAIN_PROPOSAL: &[u8] = b"proposal";
/// Domain prefix for envelope signatures
pub const DOMAIN_GOSSIP_SIG: &[u8] = b"gossip-sig";
/// Domain prefix for proposal signatures
pub const DOMAIN_PROPOSAL_SIG: &[u8] = b"proposal-sig";
/// Domain prefix for vote signatures
pub const DOMAIN_VOTE_SIG: &[u8] = b"vote-sig";

// =============================================================================
// IDENTITY
// =============================================================================

/// Derive InstanceId from an Ed25519 public key.
///
/// `InstanceId = BLAKE3("instance" || public_key)`
pub fn derive_instance_id(public_key: &Bytes32) -> InstanceId {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_INSTANCE);
    hasher.update(public_key);
    InstanceId(*hasher.finalize().as_bytes())
}

/// Fingerprint a governing rule-set.
///
/// `RulesetHash = BLAKE3("ruleset" || ruleset_bytes)`
pub fn derive_ruleset_hash(ruleset: &[u8]) -> RulesetHash {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_RULESET);
    hasher.update(ruleset);
    RulesetHash(*hasher.finalize().as_bytes())
}

// =============================================================================
// GOSSIP ENVELOPE
// =============================================================================

/// Compute the content address of a gossip message.
///
/// `MessageHash = BLAKE3("message" || canonical(message_type, origin, payload))`
///
/// Signature, TTL and creation time are deliberately excluded so a duplicate
/// is recognisable no matter how it was relayed.
pub fn compute_message_hash(
    message_type: MessageType,
    origin: &InstanceId,
    payload: &[u8],
) -> Result<MessageHash> {
    let bytes = canonical_bytes(&(message_type, origin, payload))?;

    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_MESSAGE);
    hasher.update(&bytes);
    Ok(MessageHash(*hasher.finalize().as_bytes()))
}

/// Compute the bytes to sign for a gossip envelope.
///
/// `sign_bytes = "gossip-sig" || message_hash || created_at (le)`
pub fn envelope_sign_bytes(message_hash: &MessageHash, created_at: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(DOMAIN_GOSSIP_SIG.len() + 32 + 8);
    bytes.extend_from_slice(DOMAIN_GOSSIP_SIG);
    bytes.extend_from_slice(&message_hash.0);
    bytes.extend_from_slice(&created_at.to_le_bytes());
    bytes
}

/// Check that an envelope's origin and hash match what it carries.
///
/// Signature verification is done by the caller, which owns the keys.
pub fn verify_envelope_integrity(message: &GossipMessage) -> Result<()> {
    let derived = derive_instance_id(&message.origin_public_key);
    if derived != message.origin {
        return Err(Error::OriginMismatch {
            claimed: hex::encode(message.origin.0),
            derived: hex::encode(derived.0),
        });
    }

    let computed =
        compute_message_hash(message.message_type, &message.origin, &message.payload)?;
    if computed != message.message_hash {
        return Err(Error::HashMismatch {
            computed: hex::encode(computed.0),
            transmitted: hex::encode(message.message_hash.0),
        });
    }
    Ok(())
}

// =============================================================================
// PROPOSALS
// =============================================================================

#[derive(Serialize)]
struct ProposalHashable<'a> {
    author: &'a InstanceId,
    kind: &'a str,
    body: &'a [u8],
    created_at: u64,
    deadline: u64,
}

/// Derive a ProposalId.
///
/// `ProposalId = BLAKE3("proposal" || canonical(author, kind, body, created_at, deadline))`
pub fn derive_proposal_id(
    author: &InstanceId,
    kind: &str,
    body: &[u8],
    created_at: u64,
    deadline: u64,
) -> Result<ProposalId> {
    let bytes = canonical_bytes(&ProposalHashable {
        author,
        kind,
        body,
        created_at,
        deadline,
    })?;

    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_PROPOSAL);
    hasher.update(&bytes);
    Ok(ProposalId(*hasher.finalize().as_bytes()))
}

/// Verify that a Proposal's proposal_id matches the computed value.
pub fn verify_proposal_id(proposal: &Proposal) -> Result<()> {
    let computed = derive_proposal_id(
        &proposal.author,
        &proposal.kind,
        &proposal.body,
        proposal.created_at,
        proposal.deadline,
    )?;
    if computed != proposal.proposal_id {
        return Err(Error::HashMismatch {
            computed: hex::encode(computed.0),
            transmitted: hex::encode(proposal.proposal_id.0),
        });
    }
    Ok(())
}

/// Compute the bytes to sign for a proposal.
///
/// `sign_bytes = "proposal-sig" || canonical(proposal_without_signature)`
pub fn proposal_sign_bytes(proposal: &Proposal) -> Result<Vec<u8>> {
    #[derive(Serialize)]
    struct Unsigned<'a> {
        proposal_id: &'a ProposalId,
        author: &'a InstanceId,
        kind: &'a str,
        body: &'a [u8],
        created_at: u64,
        deadline: u64,
    }

    let unsigned = canonical_bytes(&Unsigned {
        proposal_id: &proposal.proposal_id,
        author: &proposal.author,
        kind: &proposal.kind,
        body: &proposal.body,
        created_at: proposal.created_at,
        deadline: proposal.deadline,
    })?;

    let mut bytes = Vec::with_capacity(DOMAIN_PROPOSAL_SIG.len() + unsigned.len());
    bytes.extend_from_slice(DOMAIN_PROPOSAL_SIG);
    bytes.extend_from_slice(&unsigned);
    Ok(bytes)
}

// =============================================================================
// VOTES
// =============================================================================

/// Compute the bytes to sign for a vote.
///
/// `sign_bytes = "vote-sig" || canonical(vote_without_signature)`
pub fn vote_sign_bytes(vote: &Vote) -> Result<Vec<u8>> {
    #[derive(Serialize)]
    struct Unsigned<'a> {
        proposal_id: &'a ProposalId,
        voter: &'a InstanceId,
        decision: Decision,
        rationale: &'a str,
        cast_at: u64,
    }

    let unsigned = canonical_bytes(&Unsigned {
        proposal_id: &vote.proposal_id,
        voter: &vote.voter,
        decision: vote.decision,
        rationale: &vote.rationale,
        cast_at: vote.cast_at,
    })?;

    let mut bytes = Vec::with_capacity(DOMAIN_VOTE_SIG.len() + unsigned.len());
    bytes.extend_from_slice(DOMAIN_VOTE_SIG);
    bytes.extend_from_slice(&unsigned);
    Ok(bytes)
}
