//! Persistent storage using sled
//!
//! Votes, messages and remote outcomes are append-only; peers and proposals
//! are upserted with their current state.

use crate::consensus::ProposalRecord;
use federation_core::types::*;
use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

/// Locally persisted identity. Holds the private seed; never leaves the node.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoredIdentity {
    pub seed: [u8; 32],
    pub genesis_timestamp: u64,
    pub ruleset_hash: RulesetHash,
}

const IDENTITY_KEY: &str = "identity";

/// Storage backend for federationd
pub struct Storage {
    db: Db,
    /// Metadata tree: key -> value
    metadata: sled::Tree,
    /// Peer tree: instance_id -> PeerRecord
    peers: sled::Tree,
    /// Proposal tree: proposal_id -> ProposalRecord
    proposals: sled::Tree,
    /// Vote tree: proposal_id || voter || cast_at -> Vote
    votes: sled::Tree,
    /// Message tree: message_hash -> GossipMessage
    messages: sled::Tree,
    /// Outcome tree: proposal_id || instance || finalized_at -> OutcomeAnnouncement
    outcomes: sled::Tree,
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// Open a throwaway database that is removed on drop
    pub fn temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let metadata = db.open_tree("metadata")?;
        let peers = db.open_tree("peers")?;
        let proposals = db.open_tree("proposals")?;
        let votes = db.open_tree("votes")?;
        let messages = db.open_tree("messages")?;
        let outcomes = db.open_tree("outcomes")?;

        Ok(Self {
            db,
            metadata,
            peers,
            proposals,
            votes,
            messages,
            outcomes,
        })
    }

    // -------------------------------------------------------------------------
    // identity
    // -------------------------------------------------------------------------

    /// Store the local identity
    pub fn put_identity(&self, identity: &StoredIdentity) -> Result<(), StorageError> {
        let value = postcard::to_allocvec(identity)?;
        self.metadata.insert(IDENTITY_KEY, value)?;
        Ok(())
    }

    /// Load the local identity, if one was created before
    pub fn get_identity(&self) -> Result<Option<StoredIdentity>, StorageError> {
        match self.metadata.get(IDENTITY_KEY)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    // -------------------------------------------------------------------------
    // peers
    // -------------------------------------------------------------------------

    /// Insert or replace a peer record
    pub fn put_peer(&self, peer: &PeerRecord) -> Result<(), StorageError> {
        let value = postcard::to_allocvec(peer)?;
        self.peers.insert(peer.instance_id.0, value)?;
        Ok(())
    }

    /// Remove a peer record
    pub fn remove_peer(&self, instance_id: &InstanceId) -> Result<(), StorageError> {
        self.peers.remove(instance_id.0)?;
        Ok(())
    }

    /// All stored peers
    pub fn all_peers(&self) -> Result<Vec<PeerRecord>, StorageError> {
        self.peers
            .iter()
            .map(|result| {
                let (_, bytes) = result?;
                Ok(postcard::from_bytes(&bytes)?)
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // proposals
    // -------------------------------------------------------------------------

    /// Insert or replace the current state of a proposal
    pub fn put_proposal(&self, record: &ProposalRecord) -> Result<(), StorageError> {
        let value = postcard::to_allocvec(record)?;
        self.proposals.insert(record.proposal.proposal_id.0, value)?;
        Ok(())
    }

    /// Get a proposal by ID
    pub fn get_proposal(&self, id: &ProposalId) -> Result<Option<ProposalRecord>, StorageError> {
        match self.proposals.get(id.0)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All stored proposals
    pub fn all_proposals(&self) -> Result<Vec<ProposalRecord>, StorageError> {
        self.proposals
            .iter()
            .map(|result| {
                let (_, bytes) = result?;
                Ok(postcard::from_bytes(&bytes)?)
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // votes (append-only)
    // -------------------------------------------------------------------------

    fn vote_key(vote: &Vote) -> Vec<u8> {
        let mut key = Vec::with_capacity(72);
        key.extend_from_slice(&vote.proposal_id.0);
        key.extend_from_slice(&vote.voter.0);
        key.extend_from_slice(&vote.cast_at.to_be_bytes());
        key
    }

    /// Append a vote revision. Re-appending the identical revision is a no-op.
    pub fn append_vote(&self, vote: &Vote) -> Result<(), StorageError> {
        let value = postcard::to_allocvec(vote)?;
        // An existing key means this exact revision is already recorded
        let _ = self
            .votes
            .compare_and_swap(Self::vote_key(vote), None as Option<&[u8]>, Some(value))?;
        Ok(())
    }

    /// Every stored revision for a proposal, in (voter, cast_at) order
    pub fn vote_history(&self, proposal_id: &ProposalId) -> Result<Vec<Vote>, StorageError> {
        self.votes
            .scan_prefix(proposal_id.0)
            .map(|result| {
                let (_, bytes) = result?;
                Ok(postcard::from_bytes(&bytes)?)
            })
            .collect()
    }

    /// Count vote revisions
    pub fn vote_count(&self) -> usize {
        self.votes.len()
    }

    // -------------------------------------------------------------------------
    // messages (append-only audit)
    // -------------------------------------------------------------------------

    /// Append an accepted gossip envelope
    pub fn append_message(&self, message: &GossipMessage) -> Result<(), StorageError> {
        let value = postcard::to_allocvec(message)?;
        let _ = self
            .messages
            .compare_and_swap(message.message_hash.0, None as Option<&[u8]>, Some(value))?;
        Ok(())
    }

    /// Get a stored envelope by hash
    pub fn get_message(&self, hash: &MessageHash) -> Result<Option<GossipMessage>, StorageError> {
        match self.messages.get(hash.0)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Count stored envelopes
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    // -------------------------------------------------------------------------
    // remote outcomes (append-only)
    // -------------------------------------------------------------------------

    /// Append an outcome announced by some instance
    pub fn append_outcome(&self, outcome: &OutcomeAnnouncement) -> Result<(), StorageError> {
        let mut key = Vec::with_capacity(72);
        key.extend_from_slice(&outcome.proposal_id.0);
        key.extend_from_slice(&outcome.instance.0);
        key.extend_from_slice(&outcome.finalized_at.to_be_bytes());
        let value = postcard::to_allocvec(outcome)?;
        let _ = self
            .outcomes
            .compare_and_swap(key, None as Option<&[u8]>, Some(value))?;
        Ok(())
    }

    /// Every outcome announced for a proposal
    pub fn outcomes_for(
        &self,
        proposal_id: &ProposalId,
    ) -> Result<Vec<OutcomeAnnouncement>, StorageError> {
        self.outcomes
            .scan_prefix(proposal_id.0)
            .map(|result| {
                let (_, bytes) = result?;
                Ok(postcard::from_bytes(&bytes)?)
            })
            .collect()
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
