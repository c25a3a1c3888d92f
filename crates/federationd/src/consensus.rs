//! Federation consensus
//!
//! Lifecycle of cross-instance proposals: create, propagate, collect votes,
//! finalize. Each node keeps its own view of every proposal and decides its
//! own terminal status. Disagreement is an outcome, not an error: a split
//! vote, or a peer that finalized differently, ends in `Conflicted` or a
//! record flagged divergent. Terminal statuses are never rewritten.

use crate::evaluator::{evaluate_guarded, Evaluator, Verdict};
use crate::gossip::{GossipEngine, GossipError, MessageHandler};
use crate::registry;
use crate::storage::{Storage, StorageError};
use async_trait::async_trait;
use federation_core::canonical::{canonical_bytes, decode_payload};
use federation_core::crypto::{
    derive_proposal_id, proposal_sign_bytes, verify_proposal_id, vote_sign_bytes,
};
use federation_core::{
    now_millis, Decision, GossipMessage, InstanceId, MessageType, OutcomeAnnouncement, Proposal,
    ProposalId, ProposalStatus, Vote,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Consensus errors
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Unknown proposal: {0}")]
    UnknownProposal(ProposalId),
    #[error("Invalid {kind}: {reason}")]
    Invalid { kind: &'static str, reason: String },
    #[error("Encoding error: {0}")]
    Core(#[from] federation_core::Error),
    #[error("Gossip error: {0}")]
    Gossip(#[from] GossipError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

fn invalid(kind: &'static str, reason: impl Into<String>) -> ConsensusError {
    ConsensusError::Invalid {
        kind,
        reason: reason.into(),
    }
}

// =============================================================================
// COMPLETION POLICY
// =============================================================================

/// Fraction of the non-abstaining votes a side must reach
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Threshold {
    pub numerator: u32,
    pub denominator: u32,
}

impl Threshold {
    pub const SIMPLE_MAJORITY: Threshold = Threshold {
        numerator: 1,
        denominator: 2,
    };
    pub const SUPERMAJORITY: Threshold = Threshold {
        numerator: 2,
        denominator: 3,
    };
    pub const UNANIMOUS: Threshold = Threshold {
        numerator: 1,
        denominator: 1,
    };

    /// A threshold between 0 and 1 inclusive
    pub fn new(numerator: u32, denominator: u32) -> Option<Self> {
        (denominator > 0 && numerator <= denominator).then_some(Self {
            numerator,
            denominator,
        })
    }

    /// Whether `side` beats `other` and holds at least this share of both
    pub fn carried_by(&self, side: u32, other: u32) -> bool {
        let voting = side as u64 + other as u64;
        voting > 0
            && side > other
            && side as u64 * self.denominator as u64 >= self.numerator as u64 * voting
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self::SIMPLE_MAJORITY
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

impl FromStr for Threshold {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (n, d) = s
            .split_once('/')
            .ok_or_else(|| format!("expected N/D, got {:?}", s))?;
        let n: u32 = n.trim().parse().map_err(|e| format!("bad numerator: {}", e))?;
        let d: u32 = d.trim().parse().map_err(|e| format!("bad denominator: {}", e))?;
        Threshold::new(n, d).ok_or_else(|| format!("{}/{} is not a fraction in [0, 1]", n, d))
    }
}

/// Counted votes by decision
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTally {
    pub approvals: u32,
    pub rejections: u32,
    pub abstentions: u32,
}

impl VoteTally {
    pub fn from_votes<'a>(votes: impl IntoIterator<Item = &'a Vote>) -> Self {
        let mut tally = Self::default();
        for vote in votes {
            match vote.decision {
                Decision::Approve => tally.approvals += 1,
                Decision::Reject => tally.rejections += 1,
                Decision::Abstain => tally.abstentions += 1,
            }
        }
        tally
    }

    /// Non-abstaining votes
    pub fn voting(&self) -> u32 {
        self.approvals + self.rejections
    }
}

/// When and how a node settles a proposal.
///
/// Abstentions never count. A verdict is `Approved` when approvals beat
/// rejections and reach the threshold share of non-abstaining votes,
/// `Rejected` symmetrically, and `Conflicted` otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionPolicy {
    /// Minimum non-abstaining votes before `finalize` settles early
    pub quorum: u32,
    pub threshold: Threshold,
}

impl Default for CompletionPolicy {
    fn default() -> Self {
        Self {
            quorum: 1,
            threshold: Threshold::SIMPLE_MAJORITY,
        }
    }
}

impl CompletionPolicy {
    pub fn quorum_met(&self, tally: &VoteTally) -> bool {
        tally.voting() >= self.quorum.max(1)
    }

    /// Verdict from the current votes; None when nobody took a side
    pub fn verdict(&self, tally: &VoteTally) -> Option<ProposalStatus> {
        if tally.voting() == 0 {
            return None;
        }
        let status = if self.threshold.carried_by(tally.approvals, tally.rejections) {
            ProposalStatus::Approved
        } else if self.threshold.carried_by(tally.rejections, tally.approvals) {
            ProposalStatus::Rejected
        } else {
            ProposalStatus::Conflicted
        };
        Some(status)
    }
}

/// Consensus configuration
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    pub policy: CompletionPolicy,
    /// Whether the author evaluates its own proposals
    pub self_vote: bool,
    pub evaluation_timeout: Duration,
    /// Votes held for proposals not yet seen
    pub max_pending_votes: usize,
    pub pending_vote_ttl: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            policy: CompletionPolicy::default(),
            self_vote: false,
            evaluation_timeout: Duration::from_secs(30),
            max_pending_votes: 4096,
            pending_vote_ttl: Duration::from_secs(600),
        }
    }
}

// =============================================================================
// PROPOSAL STATE
// =============================================================================

/// Local view of one proposal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalRecord {
    pub proposal: Proposal,
    pub status: ProposalStatus,
    /// Counted vote per voter (latest revision)
    pub votes: BTreeMap<InstanceId, Vote>,
    /// Tally frozen at finalization
    pub tally: Option<VoteTally>,
    pub finalized_at: Option<u64>,
    /// Terminal outcomes announced by other instances
    pub remote_outcomes: BTreeMap<InstanceId, OutcomeAnnouncement>,
    /// Some instance finalized with a different status than ours
    pub divergent: bool,
    pub received_at: u64,
}

impl ProposalRecord {
    fn new(proposal: Proposal) -> Self {
        Self {
            proposal,
            status: ProposalStatus::Open,
            votes: BTreeMap::new(),
            tally: None,
            finalized_at: None,
            remote_outcomes: BTreeMap::new(),
            divergent: false,
            received_at: now_millis(),
        }
    }

    pub fn id(&self) -> ProposalId {
        self.proposal.proposal_id
    }

    /// Tally of the currently counted votes
    pub fn current_tally(&self) -> VoteTally {
        VoteTally::from_votes(self.votes.values())
    }

    /// Remote outcomes that differ from our terminal status
    pub fn divergent_outcomes(&self) -> Vec<&OutcomeAnnouncement> {
        if !self.status.is_terminal() {
            return Vec::new();
        }
        self.remote_outcomes
            .values()
            .filter(|outcome| outcome.status != self.status)
            .collect()
    }
}

/// What happened to an incoming vote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteApplied {
    /// First vote from this voter
    Recorded,
    /// Replaced an older revision
    Superseded,
    /// Not newer than the counted revision; ignored
    Stale,
    /// Proposal not known yet; held for later
    Buffered,
}

/// Last-writer-wins on `cast_at`; ties keep the counted vote
fn apply_vote(votes: &mut BTreeMap<InstanceId, Vote>, vote: Vote) -> VoteApplied {
    match votes.get(&vote.voter) {
        None => {
            votes.insert(vote.voter, vote);
            VoteApplied::Recorded
        }
        Some(existing) if vote.cast_at > existing.cast_at => {
            votes.insert(vote.voter, vote);
            VoteApplied::Superseded
        }
        Some(_) => VoteApplied::Stale,
    }
}

/// Votes that arrived before their proposal
struct PendingVotes {
    entries: VecDeque<(Instant, Vote)>,
    capacity: usize,
    ttl: Duration,
}

impl PendingVotes {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Buffer a vote; returns how many old entries were dropped to make room
    fn push(&mut self, vote: Vote, now: Instant) -> usize {
        let mut dropped = 0;
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
            dropped += 1;
        }
        self.entries.push_back((now, vote));
        dropped
    }

    /// Remove and return the live votes for a proposal
    fn take(&mut self, proposal_id: &ProposalId, now: Instant) -> Vec<Vote> {
        let ttl = self.ttl;
        let mut taken = Vec::new();
        self.entries.retain(|(at, vote)| {
            if vote.proposal_id != *proposal_id {
                return true;
            }
            if now.saturating_duration_since(*at) < ttl {
                taken.push(vote.clone());
            }
            false
        });
        taken
    }

    fn prune(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries
            .retain(|(at, _)| now.saturating_duration_since(*at) < ttl);
        before - self.entries.len()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Consensus statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsensusStats {
    pub open: usize,
    pub approved: usize,
    pub rejected: usize,
    pub conflicted: usize,
    pub expired: usize,
    pub divergent: usize,
    pub pending_votes: usize,
    pub evaluations: u64,
    pub evaluation_failures: u64,
    pub votes_counted: u64,
    pub stale_votes: u64,
    pub pending_dropped: u64,
    pub invalid_messages: u64,
    pub incompatible_votes: u64,
    pub outcomes_received: u64,
}

#[derive(Debug, Default)]
struct Counters {
    evaluations: u64,
    evaluation_failures: u64,
    votes_counted: u64,
    stale_votes: u64,
    pending_dropped: u64,
    invalid_messages: u64,
    incompatible_votes: u64,
    outcomes_received: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settle {
    /// Completion policy: quorum, else deadline
    Policy,
    /// Operator close: whatever the votes say now
    Explicit,
}

// =============================================================================
// CONSENSUS
// =============================================================================

/// Proposal and vote handling for one instance.
///
/// Lock order: proposals, then pending, then counters. None is held across an await.
pub struct Consensus {
    gossip: Arc<GossipEngine>,
    evaluator: Arc<dyn Evaluator>,
    storage: Arc<Storage>,
    config: ConsensusConfig,
    proposals: Mutex<HashMap<ProposalId, ProposalRecord>>,
    /// Proposals this node has evaluated (at most once each)
    evaluated: Mutex<HashSet<ProposalId>>,
    pending: Mutex<PendingVotes>,
    /// Last issued local timestamp
    clock: Mutex<u64>,
    counters: Mutex<Counters>,
}

impl Consensus {
    /// Create the consensus layer, reloading proposals from storage
    pub fn new(
        gossip: Arc<GossipEngine>,
        evaluator: Arc<dyn Evaluator>,
        storage: Arc<Storage>,
        config: ConsensusConfig,
    ) -> Result<Self, ConsensusError> {
        let local = gossip.local_id();
        let mut proposals = HashMap::new();
        let mut evaluated = HashSet::new();
        let mut clock = 0;

        for record in storage.all_proposals()? {
            if let Some(vote) = record.votes.get(&local) {
                evaluated.insert(record.id());
                clock = clock.max(vote.cast_at);
            }
            if record.proposal.author == local {
                clock = clock.max(record.proposal.created_at);
            }
            proposals.insert(record.id(), record);
        }
        if !proposals.is_empty() {
            info!("Restored {} proposals from storage", proposals.len());
        }

        let pending = PendingVotes::new(config.max_pending_votes, config.pending_vote_ttl);
        Ok(Self {
            gossip,
            evaluator,
            storage,
            config,
            proposals: Mutex::new(proposals),
            evaluated: Mutex::new(evaluated),
            pending: Mutex::new(pending),
            clock: Mutex::new(clock),
            counters: Mutex::new(Counters::default()),
        })
    }

    pub fn local_id(&self) -> InstanceId {
        self.gossip.local_id()
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Handler to subscribe to proposal, vote and outcome messages
    pub fn handler(self: &Arc<Self>) -> Arc<dyn MessageHandler> {
        Arc::new(ConsensusHandler(Arc::downgrade(self)))
    }

    /// Strictly increasing local millisecond clock
    fn next_timestamp(&self) -> u64 {
        let mut last = self.clock.lock();
        let now = now_millis().max(*last + 1);
        *last = now;
        now
    }

    // -------------------------------------------------------------------------
    // proposing
    // -------------------------------------------------------------------------

    /// Create, sign, persist and broadcast a proposal.
    ///
    /// `deadline` is unix millis. Propagation problems are logged, not returned.
    pub async fn propose(
        &self,
        kind: &str,
        body: Vec<u8>,
        deadline: u64,
    ) -> Result<Proposal, ConsensusError> {
        let author = self.local_id();
        let created_at = self.next_timestamp();
        let mut proposal = Proposal {
            proposal_id: derive_proposal_id(&author, kind, &body, created_at, deadline)?,
            author,
            kind: kind.to_string(),
            body,
            created_at,
            deadline,
            signature: Vec::new(),
        };
        proposal.signature = self
            .gossip
            .registry()
            .sign(&proposal_sign_bytes(&proposal)?);

        self.admit(proposal.clone())?;
        info!("Proposed {} ({})", proposal.proposal_id, proposal.kind);

        let outcome = self
            .gossip
            .broadcast(MessageType::Proposal, canonical_bytes(&proposal)?)
            .await?;
        if outcome.is_local_only() {
            info!("Proposal {} has no peers to reach yet", proposal.proposal_id);
        }

        if self.config.self_vote {
            self.cast_own_vote(&proposal).await;
        }
        Ok(proposal)
    }

    /// Propose with a deadline relative to now
    pub async fn propose_within(
        &self,
        kind: &str,
        body: Vec<u8>,
        within: Duration,
    ) -> Result<Proposal, ConsensusError> {
        let deadline = now_millis() + within.as_millis() as u64;
        self.propose(kind, body, deadline).await
    }

    /// Track a proposal and apply any votes that beat it here.
    /// Returns false if it was already known.
    fn admit(&self, proposal: Proposal) -> Result<bool, ConsensusError> {
        let id = proposal.proposal_id;
        let mut proposals = self.proposals.lock();
        if proposals.contains_key(&id) {
            return Ok(false);
        }

        let mut record = ProposalRecord::new(proposal);
        let early = self.pending.lock().take(&id, Instant::now());
        for vote in early {
            if apply_vote(&mut record.votes, vote.clone()) != VoteApplied::Stale {
                self.storage.append_vote(&vote)?;
                self.counters.lock().votes_counted += 1;
            }
        }
        if !record.votes.is_empty() {
            debug!("Applied {} early votes to {}", record.votes.len(), id);
        }

        self.storage.put_proposal(&record)?;
        proposals.insert(id, record);
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // voting
    // -------------------------------------------------------------------------

    /// Evaluate a proposal once and broadcast the resulting vote
    async fn cast_own_vote(&self, proposal: &Proposal) {
        let id = proposal.proposal_id;
        if !self.evaluated.lock().insert(id) {
            return;
        }
        self.counters.lock().evaluations += 1;

        let verdict = match evaluate_guarded(
            self.evaluator.clone(),
            proposal.clone(),
            self.config.evaluation_timeout,
        )
        .await
        {
            Ok(verdict) => verdict,
            Err(e) => {
                self.counters.lock().evaluation_failures += 1;
                warn!("Evaluation of {} failed, abstaining: {}", id, e);
                Verdict::abstain(format!("evaluation failed: {}", e))
            }
        };

        if let Err(e) = self.cast(id, verdict).await {
            warn!("Failed to cast vote on {}: {}", id, e);
        }
    }

    /// Issue a superseding vote for the local instance
    pub async fn revise_vote(
        &self,
        proposal_id: ProposalId,
        decision: Decision,
        rationale: impl Into<String>,
    ) -> Result<Vote, ConsensusError> {
        if !self.proposals.lock().contains_key(&proposal_id) {
            return Err(ConsensusError::UnknownProposal(proposal_id));
        }
        self.evaluated.lock().insert(proposal_id);
        self.cast(proposal_id, Verdict::new(decision, rationale)).await
    }

    async fn cast(&self, proposal_id: ProposalId, verdict: Verdict) -> Result<Vote, ConsensusError> {
        let mut vote = Vote {
            proposal_id,
            voter: self.local_id(),
            decision: verdict.decision,
            rationale: verdict.rationale,
            cast_at: self.next_timestamp(),
            signature: Vec::new(),
        };
        vote.signature = self.gossip.registry().sign(&vote_sign_bytes(&vote)?);

        self.record_vote(vote.clone())?;
        debug!("Voted {} on {}", vote.decision, proposal_id);
        self.gossip
            .broadcast(MessageType::Vote, canonical_bytes(&vote)?)
            .await?;
        Ok(vote)
    }

    /// Count a vote, or buffer it until its proposal arrives
    fn record_vote(&self, vote: Vote) -> Result<VoteApplied, ConsensusError> {
        let mut proposals = self.proposals.lock();
        let Some(record) = proposals.get_mut(&vote.proposal_id) else {
            let dropped = self.pending.lock().push(vote, Instant::now());
            if dropped > 0 {
                self.counters.lock().pending_dropped += dropped as u64;
            }
            return Ok(VoteApplied::Buffered);
        };

        let applied = apply_vote(&mut record.votes, vote.clone());
        if applied == VoteApplied::Stale {
            self.counters.lock().stale_votes += 1;
            return Ok(applied);
        }
        self.storage.append_vote(&vote)?;
        self.storage.put_proposal(record)?;
        self.counters.lock().votes_counted += 1;
        Ok(applied)
    }

    // -------------------------------------------------------------------------
    // inbound
    // -------------------------------------------------------------------------

    /// Track an inbound proposal. Returns it if it still needs our vote.
    fn on_proposal(&self, message: &GossipMessage) -> Option<Proposal> {
        let proposal = match validate_proposal(message) {
            Ok(proposal) => proposal,
            Err(e) => {
                self.counters.lock().invalid_messages += 1;
                warn!("Dropping proposal from {}: {}", message.origin, e);
                return None;
            }
        };

        match self.admit(proposal.clone()) {
            Ok(true) => debug!("Learned proposal {} from {}", proposal.proposal_id, proposal.author),
            Ok(false) => {
                trace!("Proposal {} already known", proposal.proposal_id);
                return None;
            }
            Err(e) => {
                warn!("Failed to store proposal {}: {}", proposal.proposal_id, e);
                return None;
            }
        }

        if now_millis() >= proposal.deadline {
            debug!("Proposal {} arrived past its deadline", proposal.proposal_id);
            return None;
        }
        Some(proposal)
    }

    fn on_vote(&self, message: &GossipMessage) {
        let vote = match validate_vote(message) {
            Ok(vote) => vote,
            Err(e) => {
                self.counters.lock().invalid_messages += 1;
                warn!("Dropping vote from {}: {}", message.origin, e);
                return;
            }
        };

        let (voter, proposal_id) = (vote.voter, vote.proposal_id);
        let registry = self.gossip.registry();
        if let Some(peer) = registry.get(&voter) {
            if !registry.is_compatible(&peer) {
                self.counters.lock().incompatible_votes += 1;
                debug!("Ignored vote from {} on {}: rule-set differs", voter, proposal_id);
                return;
            }
        }

        match self.record_vote(vote) {
            Ok(VoteApplied::Buffered) => debug!("Buffered vote from {} on unknown {}", voter, proposal_id),
            Ok(VoteApplied::Stale) => debug!("Ignored stale vote from {} on {}", voter, proposal_id),
            Ok(_) => debug!("Counted vote from {} on {}", voter, proposal_id),
            Err(e) => warn!("Failed to record vote on {}: {}", proposal_id, e),
        }
    }

    fn on_outcome(&self, message: &GossipMessage) {
        let outcome: OutcomeAnnouncement = match decode_payload(message) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.counters.lock().invalid_messages += 1;
                warn!("Dropping outcome from {}: {}", message.origin, e);
                return;
            }
        };
        if outcome.instance != message.origin || !outcome.status.is_terminal() {
            self.counters.lock().invalid_messages += 1;
            warn!("Dropping malformed outcome from {}", message.origin);
            return;
        }

        if let Err(e) = self.storage.append_outcome(&outcome) {
            warn!("Failed to store outcome for {}: {}", outcome.proposal_id, e);
        }
        self.counters.lock().outcomes_received += 1;

        let mut proposals = self.proposals.lock();
        let Some(record) = proposals.get_mut(&outcome.proposal_id) else {
            debug!("Outcome for unknown proposal {}", outcome.proposal_id);
            return;
        };
        record
            .remote_outcomes
            .entry(outcome.instance)
            .or_insert_with(|| outcome.clone());

        if record.status.is_terminal() && record.status != outcome.status && !record.divergent {
            record.divergent = true;
            warn!(
                "Divergent outcome for {}: local {}, {} reports {}",
                outcome.proposal_id, record.status, outcome.instance, outcome.status
            );
        }
        if let Err(e) = self.storage.put_proposal(record) {
            warn!("Failed to store proposal {}: {}", outcome.proposal_id, e);
        }
    }

    // -------------------------------------------------------------------------
    // finalization
    // -------------------------------------------------------------------------

    /// Apply the completion policy now. See [`Consensus::finalize_at`].
    pub async fn finalize(&self, proposal_id: ProposalId) -> Result<ProposalStatus, ConsensusError> {
        self.finalize_at(proposal_id, now_millis()).await
    }

    /// Apply the completion policy as of `now` (unix millis).
    ///
    /// Terminal proposals are returned unchanged. With quorum met the votes
    /// decide; past the deadline without quorum the proposal expires;
    /// otherwise it stays `Open`.
    pub async fn finalize_at(
        &self,
        proposal_id: ProposalId,
        now: u64,
    ) -> Result<ProposalStatus, ConsensusError> {
        let (status, outcome) = self.settle(proposal_id, now, Settle::Policy)?;
        if let Some(outcome) = outcome {
            self.announce(outcome).await;
        }
        Ok(status)
    }

    /// Close a proposal on the current votes regardless of quorum.
    /// Nobody having taken a side means `Expired`.
    pub async fn close(&self, proposal_id: ProposalId) -> Result<ProposalStatus, ConsensusError> {
        let (status, outcome) = self.settle(proposal_id, now_millis(), Settle::Explicit)?;
        if let Some(outcome) = outcome {
            self.announce(outcome).await;
        }
        Ok(status)
    }

    fn settle(
        &self,
        proposal_id: ProposalId,
        now: u64,
        mode: Settle,
    ) -> Result<(ProposalStatus, Option<OutcomeAnnouncement>), ConsensusError> {
        let mut proposals = self.proposals.lock();
        let record = proposals
            .get_mut(&proposal_id)
            .ok_or(ConsensusError::UnknownProposal(proposal_id))?;
        if record.status.is_terminal() {
            return Ok((record.status, None));
        }

        let policy = &self.config.policy;
        let tally = record.current_tally();
        let status = match (mode, policy.verdict(&tally)) {
            (Settle::Policy, Some(verdict)) if policy.quorum_met(&tally) => verdict,
            (Settle::Policy, _) if now >= record.proposal.deadline => ProposalStatus::Expired,
            (Settle::Policy, _) => return Ok((ProposalStatus::Open, None)),
            (Settle::Explicit, Some(verdict)) => verdict,
            (Settle::Explicit, None) => ProposalStatus::Expired,
        };

        // A peer that already reached a different verdict makes this one contested
        let contested = status != ProposalStatus::Expired
            && record.remote_outcomes.values().any(|outcome| {
                outcome.status != ProposalStatus::Expired && outcome.status != status
            });
        let status = if contested {
            ProposalStatus::Conflicted
        } else {
            status
        };

        let mut settled = record.clone();
        settled.status = status;
        settled.tally = Some(tally);
        settled.finalized_at = Some(now);
        settled.divergent = settled
            .remote_outcomes
            .values()
            .any(|outcome| outcome.status != status);
        self.storage.put_proposal(&settled)?;
        *record = settled;

        match status {
            ProposalStatus::Conflicted => warn!(
                "Proposal {} finalized as {} ({} approve, {} reject, {} abstain)",
                proposal_id, status, tally.approvals, tally.rejections, tally.abstentions
            ),
            _ => info!(
                "Proposal {} finalized as {} ({} approve, {} reject, {} abstain)",
                proposal_id, status, tally.approvals, tally.rejections, tally.abstentions
            ),
        }

        let outcome = OutcomeAnnouncement {
            proposal_id,
            instance: self.local_id(),
            status,
            approvals: tally.approvals,
            rejections: tally.rejections,
            abstentions: tally.abstentions,
            finalized_at: now,
        };
        Ok((status, Some(outcome)))
    }

    async fn announce(&self, outcome: OutcomeAnnouncement) {
        let payload = match canonical_bytes(&outcome) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode outcome for {}: {}", outcome.proposal_id, e);
                return;
            }
        };
        if let Err(e) = self.gossip.broadcast(MessageType::Outcome, payload).await {
            warn!("Failed to announce outcome for {}: {}", outcome.proposal_id, e);
        }
    }

    /// Finalize every open proposal whose deadline has passed
    pub async fn expire_overdue(&self) -> Vec<(ProposalId, ProposalStatus)> {
        let now = now_millis();
        let overdue: Vec<ProposalId> = self
            .proposals
            .lock()
            .values()
            .filter(|record| record.status == ProposalStatus::Open && record.proposal.deadline <= now)
            .map(ProposalRecord::id)
            .collect();

        let mut settled = Vec::with_capacity(overdue.len());
        for id in overdue {
            match self.finalize_at(id, now).await {
                Ok(status) => settled.push((id, status)),
                Err(e) => warn!("Failed to finalize overdue {}: {}", id, e),
            }
        }
        settled
    }

    /// Drop buffered votes past their time to live
    pub fn prune_pending(&self) -> usize {
        let pruned = self.pending.lock().prune(Instant::now());
        if pruned > 0 {
            self.counters.lock().pending_dropped += pruned as u64;
            debug!("Pruned {} pending votes", pruned);
        }
        pruned
    }

    // -------------------------------------------------------------------------
    // queries
    // -------------------------------------------------------------------------

    pub fn get_proposal(&self, proposal_id: &ProposalId) -> Option<ProposalRecord> {
        self.proposals.lock().get(proposal_id).cloned()
    }

    /// All proposals, oldest first
    pub fn proposals(&self) -> Vec<ProposalRecord> {
        let mut records: Vec<_> = self.proposals.lock().values().cloned().collect();
        records.sort_by_key(|record| (record.proposal.created_at, record.id()));
        records
    }

    /// Proposals needing operator attention: conflicted or divergent
    pub fn conflicted(&self) -> Vec<ProposalRecord> {
        self.proposals()
            .into_iter()
            .filter(|record| record.status == ProposalStatus::Conflicted || record.divergent)
            .collect()
    }

    /// Every vote revision stored for a proposal
    pub fn vote_history(&self, proposal_id: &ProposalId) -> Result<Vec<Vote>, ConsensusError> {
        Ok(self.storage.vote_history(proposal_id)?)
    }

    /// Get consensus statistics
    pub fn stats(&self) -> ConsensusStats {
        let mut stats = ConsensusStats::default();
        for record in self.proposals.lock().values() {
            match record.status {
                ProposalStatus::Open => stats.open += 1,
                ProposalStatus::Approved => stats.approved += 1,
                ProposalStatus::Rejected => stats.rejected += 1,
                ProposalStatus::Conflicted => stats.conflicted += 1,
                ProposalStatus::Expired => stats.expired += 1,
            }
            if record.divergent {
                stats.divergent += 1;
            }
        }
        stats.pending_votes = self.pending.lock().len();

        let counters = self.counters.lock();
        stats.evaluations = counters.evaluations;
        stats.evaluation_failures = counters.evaluation_failures;
        stats.votes_counted = counters.votes_counted;
        stats.stale_votes = counters.stale_votes;
        stats.pending_dropped = counters.pending_dropped;
        stats.invalid_messages = counters.invalid_messages;
        stats.incompatible_votes = counters.incompatible_votes;
        stats.outcomes_received = counters.outcomes_received;
        stats
    }
}

fn validate_proposal(message: &GossipMessage) -> Result<Proposal, ConsensusError> {
    let proposal: Proposal = decode_payload(message)?;
    if proposal.author != message.origin {
        return Err(invalid("proposal", "author is not the message origin"));
    }
    verify_proposal_id(&proposal)?;
    let signed = proposal_sign_bytes(&proposal)?;
    if !registry::verify(&signed, &proposal.signature, &message.origin_public_key) {
        return Err(invalid("proposal", "bad signature"));
    }
    Ok(proposal)
}

fn validate_vote(message: &GossipMessage) -> Result<Vote, ConsensusError> {
    let vote: Vote = decode_payload(message)?;
    if vote.voter != message.origin {
        return Err(invalid("vote", "voter is not the message origin"));
    }
    let signed = vote_sign_bytes(&vote)?;
    if !registry::verify(&signed, &vote.signature, &message.origin_public_key) {
        return Err(invalid("vote", "bad signature"));
    }
    Ok(vote)
}

/// Routes gossip to a [`Consensus`] without keeping it alive
struct ConsensusHandler(Weak<Consensus>);

#[async_trait]
impl MessageHandler for ConsensusHandler {
    async fn handle(&self, message: &GossipMessage) {
        let Some(consensus) = self.0.upgrade() else {
            return;
        };
        match message.message_type {
            MessageType::Proposal => {
                // Relaying must not wait on the evaluator
                if let Some(proposal) = consensus.on_proposal(message) {
                    tokio::spawn(async move { consensus.cast_own_vote(&proposal).await });
                }
            }
            MessageType::Vote => consensus.on_vote(message),
            MessageType::Outcome => consensus.on_outcome(message),
            MessageType::Heartbeat | MessageType::Pattern => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::StaticEvaluator;
    use crate::gossip::GossipConfig;
    use crate::registry::{IdentityRegistry, InstanceIdentity, RegistryConfig};
    use federation_core::RulesetHash;
    use federation_net::MemoryNetwork;

    fn tally(approvals: u32, rejections: u32, abstentions: u32) -> VoteTally {
        VoteTally {
            approvals,
            rejections,
            abstentions,
        }
    }

    fn vote(voter: u8, cast_at: u64, decision: Decision) -> Vote {
        Vote {
            proposal_id: ProposalId([1; 32]),
            voter: InstanceId([voter; 32]),
            decision,
            rationale: String::new(),
            cast_at,
            signature: vec![],
        }
    }

    fn consensus(config: ConsensusConfig) -> Consensus {
        let network = MemoryNetwork::new();
        let storage = Arc::new(Storage::temporary().unwrap());
        let identity = InstanceIdentity::create(RulesetHash([0; 32])).unwrap();
        let transport = Arc::new(network.transport(identity.instance_id(), Duration::from_secs(1)));
        let registry =
            Arc::new(IdentityRegistry::new(identity, RegistryConfig::default(), storage.clone()).unwrap());
        let gossip = Arc::new(GossipEngine::new(registry, transport, storage.clone(), GossipConfig::default()));
        let evaluator = Arc::new(StaticEvaluator::new(Decision::Approve));
        Consensus::new(gossip, evaluator, storage, config).unwrap()
    }

    #[test]
    fn test_threshold_parsing() {
        assert_eq!("2/3".parse::<Threshold>().unwrap(), Threshold::SUPERMAJORITY);
        assert_eq!(" 1 / 2 ".parse::<Threshold>().unwrap(), Threshold::SIMPLE_MAJORITY);
        assert!("3/2".parse::<Threshold>().is_err());
        assert!("1/0".parse::<Threshold>().is_err());
        assert!("half".parse::<Threshold>().is_err());
        assert_eq!(Threshold::SUPERMAJORITY.to_string(), "2/3");
    }

    #[test]
    fn test_simple_majority_verdicts() {
        let policy = CompletionPolicy::default();
        assert_eq!(policy.verdict(&tally(1, 0, 0)), Some(ProposalStatus::Approved));
        assert_eq!(policy.verdict(&tally(0, 2, 1)), Some(ProposalStatus::Rejected));
        assert_eq!(policy.verdict(&tally(1, 1, 0)), Some(ProposalStatus::Conflicted));
        assert_eq!(policy.verdict(&tally(2, 1, 5)), Some(ProposalStatus::Approved));
        assert_eq!(policy.verdict(&tally(0, 0, 3)), None);
    }

    #[test]
    fn test_supermajority_verdicts() {
        let policy = CompletionPolicy {
            quorum: 3,
            threshold: Threshold::SUPERMAJORITY,
        };
        assert_eq!(policy.verdict(&tally(2, 1, 0)), Some(ProposalStatus::Approved));
        assert_eq!(policy.verdict(&tally(3, 2, 0)), Some(ProposalStatus::Conflicted));
        assert!(!policy.quorum_met(&tally(2, 0, 4)));
        assert!(policy.quorum_met(&tally(2, 1, 0)));
    }

    #[test]
    fn test_later_revision_wins_regardless_of_arrival() {
        let mut votes = BTreeMap::new();
        assert_eq!(apply_vote(&mut votes, vote(2, 20, Decision::Reject)), VoteApplied::Recorded);
        assert_eq!(apply_vote(&mut votes, vote(2, 10, Decision::Approve)), VoteApplied::Stale);
        assert_eq!(votes[&InstanceId([2; 32])].decision, Decision::Reject);

        // Equal timestamps keep the counted vote
        assert_eq!(apply_vote(&mut votes, vote(2, 20, Decision::Approve)), VoteApplied::Stale);
        assert_eq!(apply_vote(&mut votes, vote(2, 30, Decision::Approve)), VoteApplied::Superseded);
        assert_eq!(votes.len(), 1);
    }

    #[test]
    fn test_pending_votes_are_bounded() {
        let mut pending = PendingVotes::new(2, Duration::from_secs(60));
        let now = Instant::now();
        assert_eq!(pending.push(vote(1, 1, Decision::Approve), now), 0);
        assert_eq!(pending.push(vote(2, 1, Decision::Approve), now), 0);
        assert_eq!(pending.push(vote(3, 1, Decision::Approve), now), 1);

        let taken = pending.take(&ProposalId([1; 32]), now);
        let voters: Vec<_> = taken.iter().map(|v| v.voter).collect();
        assert_eq!(voters, vec![InstanceId([2; 32]), InstanceId([3; 32])]);
        assert_eq!(pending.len(), 0);

        pending.push(vote(4, 1, Decision::Approve), now);
        assert_eq!(pending.prune(now + Duration::from_secs(61)), 1);
    }

    #[tokio::test]
    async fn test_propose_persists_open_and_expires() {
        let consensus = consensus(ConsensusConfig::default());
        let proposal = consensus
            .propose("PATTERN", b"{\"x\":1}".to_vec(), now_millis() + 60_000)
            .await
            .unwrap();
        let id = proposal.proposal_id;

        let record = consensus.get_proposal(&id).unwrap();
        assert_eq!(record.status, ProposalStatus::Open);
        assert_eq!(consensus.storage.get_proposal(&id).unwrap().unwrap().status, ProposalStatus::Open);

        // No votes and the deadline not reached: still open
        assert_eq!(consensus.finalize(id).await.unwrap(), ProposalStatus::Open);

        let status = consensus.finalize_at(id, proposal.deadline).await.unwrap();
        assert_eq!(status, ProposalStatus::Expired);

        // Terminal status never changes
        consensus.revise_vote(id, Decision::Approve, "late").await.unwrap();
        assert_eq!(consensus.close(id).await.unwrap(), ProposalStatus::Expired);
    }

    #[tokio::test]
    async fn test_self_vote_and_close() {
        let consensus = consensus(ConsensusConfig {
            self_vote: true,
            policy: CompletionPolicy {
                quorum: 2,
                threshold: Threshold::SIMPLE_MAJORITY,
            },
            ..Default::default()
        });
        let proposal = consensus
            .propose_within("PATTERN", vec![], Duration::from_secs(60))
            .await
            .unwrap();
        let id = proposal.proposal_id;

        let record = consensus.get_proposal(&id).unwrap();
        assert_eq!(record.votes[&consensus.local_id()].decision, Decision::Approve);

        // Quorum of two not met yet
        assert_eq!(consensus.finalize(id).await.unwrap(), ProposalStatus::Open);
        assert_eq!(consensus.close(id).await.unwrap(), ProposalStatus::Approved);
        assert_eq!(consensus.stats().approved, 1);
    }

    #[tokio::test]
    async fn test_revised_vote_supersedes() {
        let consensus = consensus(ConsensusConfig {
            self_vote: true,
            ..Default::default()
        });
        let proposal = consensus
            .propose_within("PATTERN", vec![], Duration::from_secs(60))
            .await
            .unwrap();
        let id = proposal.proposal_id;

        let revised = consensus.revise_vote(id, Decision::Reject, "changed my mind").await.unwrap();
        let record = consensus.get_proposal(&id).unwrap();
        assert_eq!(record.votes[&consensus.local_id()], revised);
        assert_eq!(consensus.vote_history(&id).unwrap().len(), 2);
        assert_eq!(consensus.finalize(id).await.unwrap(), ProposalStatus::Rejected);
    }

    #[tokio::test]
    async fn test_unknown_proposal() {
        let consensus = consensus(ConsensusConfig::default());
        assert!(matches!(
            consensus.finalize(ProposalId([9; 32])).await,
            Err(ConsensusError::UnknownProposal(_))
        ));
    }

    #[tokio::test]
    async fn test_proposals_survive_restart() {
        let network = MemoryNetwork::new();
        let storage = Arc::new(Storage::temporary().unwrap());
        let identity = InstanceIdentity::create(RulesetHash([0; 32])).unwrap();
        let build = |identity: InstanceIdentity| {
            let transport = Arc::new(network.transport(identity.instance_id(), Duration::from_secs(1)));
            let registry = Arc::new(
                IdentityRegistry::new(identity, RegistryConfig::default(), storage.clone()).unwrap(),
            );
            let gossip =
                Arc::new(GossipEngine::new(registry, transport, storage.clone(), GossipConfig::default()));
            let config = ConsensusConfig {
                self_vote: true,
                ..Default::default()
            };
            Consensus::new(gossip, Arc::new(StaticEvaluator::new(Decision::Reject)), storage.clone(), config)
                .unwrap()
        };

        let first = build(identity.clone());
        let proposal = first
            .propose_within("PATTERN", vec![1], Duration::from_secs(60))
            .await
            .unwrap();
        let cast_at = first.get_proposal(&proposal.proposal_id).unwrap().votes[&first.local_id()].cast_at;
        drop(first);

        let second = build(identity);
        let record = second.get_proposal(&proposal.proposal_id).unwrap();
        assert_eq!(record.votes.len(), 1);
        // The clock resumes past what was already issued
        assert!(second.next_timestamp() > cast_at);
    }
}
