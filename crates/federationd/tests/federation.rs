//! Multi-node federation scenarios over the in-process network

use async_trait::async_trait;
use federation_core::canonical::{canonical_bytes, decode_payload};
use federation_core::crypto::vote_sign_bytes;
use federation_core::{
    Decision, GossipMessage, InstanceId, MessageType, Proposal, ProposalId, ProposalStatus, Vote,
};
use federation_net::{KeyPair, MemoryNetwork, PeerEndpoint};
use federationd::consensus::ConsensusConfig;
use federationd::evaluator::{EvaluationError, Evaluator, FnEvaluator, StaticEvaluator, Verdict};
use federationd::gossip::{MessageHandler, ReceiveOutcome, RejectReason};
use federationd::registry::IdentityError;
use federationd::{FederationNode, FederationNodeBuilder, GossipConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counts handler invocations
#[derive(Default)]
struct Counter(AtomicUsize);

impl Counter {
    fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for Counter {
    async fn handle(&self, _message: &GossipMessage) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct Federation {
    network: Arc<MemoryNetwork>,
}

impl Federation {
    fn new() -> Self {
        Self {
            network: MemoryNetwork::new(),
        }
    }

    fn node(&self, label: &str, decision: Decision) -> Arc<FederationNode> {
        self.node_with(label, Arc::new(StaticEvaluator::new(decision)), ConsensusConfig::default())
    }

    fn node_with(
        &self,
        label: &str,
        evaluator: Arc<dyn Evaluator>,
        consensus: ConsensusConfig,
    ) -> Arc<FederationNode> {
        self.node_from(
            FederationNode::builder()
                .label(label)
                .evaluator(evaluator)
                .consensus_config(consensus),
        )
    }

    fn node_from(&self, builder: FederationNodeBuilder) -> Arc<FederationNode> {
        let network = self.network.clone();
        let node = builder
            .transport_fn(move |id| Arc::new(network.transport(id, Duration::from_secs(2))))
            .build()
            .unwrap();
        self.network.attach(node.local_id(), &node);
        node
    }

    fn frames_to(&self, node: &FederationNode) -> u64 {
        self.network.frames_delivered_to(&node.local_id())
    }
}

/// Register two nodes with each other
fn link(a: &FederationNode, b: &FederationNode) {
    for (from, to) in [(a, b), (b, a)] {
        from.registry()
            .register_peer(
                to.local_id(),
                to.identity().public_key(),
                to.label(),
                to.identity().ruleset_hash(),
            )
            .unwrap();
    }
}

/// Poll until `condition` holds, failing after five seconds
async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within five seconds");
}

/// Whether `node` has counted a vote from `voter`
fn has_vote(node: &FederationNode, proposal_id: ProposalId, voter: &FederationNode) -> bool {
    node.consensus()
        .get_proposal(&proposal_id)
        .map(|record| record.votes.contains_key(&voter.local_id()))
        .unwrap_or(false)
}

/// Approves every proposal after a pause
struct SlowEvaluator(Duration);

#[async_trait]
impl Evaluator for SlowEvaluator {
    async fn evaluate(&self, _proposal: &Proposal) -> Result<Verdict, EvaluationError> {
        tokio::time::sleep(self.0).await;
        Ok(Verdict::approve("took a while"))
    }
}

fn counter(node: &FederationNode) -> Arc<Counter> {
    let counter = Arc::new(Counter::default());
    node.on_pattern(counter.clone());
    counter
}

/// The proposal envelope a node originated
fn proposal_envelope(node: &FederationNode, proposal_id: ProposalId) -> GossipMessage {
    let hashes = node.gossip().digest(64);
    node.gossip()
        .fetch(&hashes)
        .into_iter()
        .find(|message| {
            message.message_type == MessageType::Proposal
                && decode_payload::<Proposal>(message)
                    .map(|p| p.proposal_id == proposal_id)
                    .unwrap_or(false)
        })
        .unwrap()
}

/// A signed vote from `voter`, sealed in the voter's own envelope
fn signed_vote(
    voter: &FederationNode,
    proposal_id: ProposalId,
    decision: Decision,
    cast_at: u64,
) -> GossipMessage {
    let mut vote = Vote {
        proposal_id,
        voter: voter.local_id(),
        decision,
        rationale: format!("{} at {}", decision, cast_at),
        cast_at,
        signature: vec![],
    };
    vote.signature = voter.registry().sign(&vote_sign_bytes(&vote).unwrap());
    voter
        .gossip()
        .seal(MessageType::Vote, canonical_bytes(&vote).unwrap(), 1)
        .unwrap()
}

#[tokio::test]
async fn repeated_delivery_is_handled_once() {
    let fed = Federation::new();
    let a = fed.node("a", Decision::Abstain);
    let b = fed.node("b", Decision::Abstain);
    let c = fed.node("c", Decision::Abstain);
    link(&a, &b);
    link(&b, &c);
    let on_b = counter(&b);
    let on_c = counter(&c);

    let message = a
        .gossip()
        .seal(MessageType::Pattern, b"pattern".to_vec(), 6)
        .unwrap();

    let first = b.gossip().receive(Some(a.local_id()), message.clone()).await;
    assert_eq!(first, ReceiveOutcome::Accepted { forwarded: 1 });
    for _ in 0..4 {
        let again = b.gossip().receive(Some(a.local_id()), message.clone()).await;
        assert_eq!(again, ReceiveOutcome::Duplicate);
    }

    assert_eq!(on_b.count(), 1);
    assert_eq!(on_c.count(), 1);
    // One re-propagation: b relayed to c once, c had nobody new to relay to
    assert_eq!(fed.frames_to(&c), 1);
    assert_eq!(b.gossip().stats().duplicates, 4);
}

#[tokio::test]
async fn known_identity_is_never_rebound() {
    let fed = Federation::new();
    let a = fed.node("a", Decision::Abstain);
    let b = fed.node("b", Decision::Abstain);
    link(&a, &b);

    let impostor = KeyPair::generate().unwrap();
    let result = a.registry().register_peer(
        b.local_id(),
        impostor.public_key(),
        "b-impostor",
        b.identity().ruleset_hash(),
    );
    assert!(matches!(result, Err(IdentityError::IdentityConflict { .. })));

    let stored = a.registry().get(&b.local_id()).unwrap();
    assert_eq!(stored.public_key, b.identity().public_key());
    assert_eq!(stored.display_label, "b");

    let conflicts = a.registry().conflicts();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].offered_key, impostor.public_key());

    // Re-registering the true key stays idempotent
    link(&a, &b);
    assert_eq!(a.registry().peers().len(), 1);
}

#[tokio::test]
async fn unverifiable_messages_are_dropped() {
    let fed = Federation::new();
    let a = fed.node("a", Decision::Abstain);
    let b = fed.node("b", Decision::Abstain);
    let c = fed.node("c", Decision::Abstain);
    link(&b, &c);
    let on_b = counter(&b);
    let on_c = counter(&c);

    let genuine = a
        .gossip()
        .seal(MessageType::Pattern, b"pattern".to_vec(), 6)
        .unwrap();

    let mut tampered = genuine.clone();
    tampered.payload = b"tampered".to_vec();
    let mut forged = genuine.clone();
    forged.signature[0] ^= 0xff;
    let mut borrowed_key = genuine.clone();
    borrowed_key.origin_public_key = c.identity().public_key();

    assert!(matches!(
        b.gossip().receive(None, tampered).await,
        ReceiveOutcome::Rejected(RejectReason::Integrity(_))
    ));
    assert_eq!(
        b.gossip().receive(None, forged).await,
        ReceiveOutcome::Rejected(RejectReason::BadSignature)
    );
    assert!(matches!(
        b.gossip().receive(None, borrowed_key).await,
        ReceiveOutcome::Rejected(RejectReason::Integrity(_))
    ));

    assert_eq!(on_b.count(), 0);
    assert_eq!(on_c.count(), 0);
    assert_eq!(fed.frames_to(&c), 0);
    assert_eq!(b.gossip().stats().verification_failures, 3);

    // The genuine envelope still passes after the forgeries
    assert!(b.gossip().receive(None, genuine).await.is_accepted());
    assert_eq!(on_b.count(), 1);
}

#[tokio::test]
async fn forged_proposal_in_valid_envelope_is_ignored() {
    let fed = Federation::new();
    let a = fed.node("a", Decision::Abstain);
    let b = fed.node("b", Decision::Approve);

    let proposal = a
        .consensus()
        .propose_within("PATTERN", b"{}".to_vec(), Duration::from_secs(60))
        .await
        .unwrap();

    // b re-wraps a's proposal as if it were its own
    let mut stolen = proposal.clone();
    stolen.author = b.local_id();
    let envelope = b
        .gossip()
        .seal(MessageType::Proposal, canonical_bytes(&stolen).unwrap(), 1)
        .unwrap();

    let fresh = FederationNode::builder().build().unwrap();
    assert!(fresh.gossip().receive(None, envelope).await.is_accepted());
    assert!(fresh.consensus().get_proposal(&proposal.proposal_id).is_none());
    assert_eq!(fresh.consensus().stats().invalid_messages, 1);
}

#[tokio::test]
async fn later_vote_wins_regardless_of_arrival_order() {
    let fed = Federation::new();
    let a = fed.node("a", Decision::Abstain);
    let voter = fed.node("voter", Decision::Abstain);

    let proposal = a
        .consensus()
        .propose_within("PATTERN", b"{}".to_vec(), Duration::from_secs(60))
        .await
        .unwrap();
    let id = proposal.proposal_id;

    let newer = signed_vote(&voter, id, Decision::Reject, 2_000);
    let older = signed_vote(&voter, id, Decision::Approve, 1_000);
    assert!(a.gossip().receive(None, newer).await.is_accepted());
    assert!(a.gossip().receive(None, older).await.is_accepted());

    let counted = &a.consensus().get_proposal(&id).unwrap().votes[&voter.local_id()];
    assert_eq!(counted.decision, Decision::Reject);
    assert_eq!(counted.cast_at, 2_000);

    let newest = signed_vote(&voter, id, Decision::Approve, 3_000);
    assert!(a.gossip().receive(None, newest).await.is_accepted());
    let record = a.consensus().get_proposal(&id).unwrap();
    assert_eq!(record.votes.len(), 1);
    assert_eq!(record.votes[&voter.local_id()].decision, Decision::Approve);

    // The stale revision was never stored
    assert_eq!(a.consensus().vote_history(&id).unwrap().len(), 2);
    assert_eq!(a.consensus().stats().stale_votes, 1);
    assert_eq!(a.consensus().finalize(id).await.unwrap(), ProposalStatus::Approved);
}

#[tokio::test]
async fn independently_finalized_outcomes_stay_divergent() {
    let fed = Federation::new();
    let self_vote = ConsensusConfig {
        self_vote: true,
        ..Default::default()
    };
    let a = fed.node_with("a", Arc::new(StaticEvaluator::new(Decision::Approve)), self_vote);
    let b = fed.node("b", Decision::Reject);

    let proposal = a
        .consensus()
        .propose_within("PATTERN", b"{}".to_vec(), Duration::from_secs(60))
        .await
        .unwrap();
    let id = proposal.proposal_id;

    // b learns of the proposal out of band and votes in isolation
    let envelope = proposal_envelope(&a, id);
    assert!(b.gossip().receive(None, envelope).await.is_accepted());
    eventually(|| has_vote(&b, id, &b)).await;

    assert_eq!(a.consensus().finalize(id).await.unwrap(), ProposalStatus::Approved);
    assert_eq!(b.consensus().finalize(id).await.unwrap(), ProposalStatus::Rejected);

    // Now they talk
    link(&a, &b);
    b.sync().sync_with(&PeerEndpoint::local(a.local_id())).await.unwrap();
    a.sync().sync_with(&PeerEndpoint::local(b.local_id())).await.unwrap();

    let on_a = a.consensus().get_proposal(&id).unwrap();
    let on_b = b.consensus().get_proposal(&id).unwrap();
    assert_eq!(on_a.status, ProposalStatus::Approved);
    assert_eq!(on_b.status, ProposalStatus::Rejected);
    assert!(on_a.divergent && on_b.divergent);
    assert_eq!(on_a.remote_outcomes[&b.local_id()].status, ProposalStatus::Rejected);
    assert_eq!(on_b.remote_outcomes[&a.local_id()].status, ProposalStatus::Approved);

    // Terminal statuses survive further finalization and are surfaced
    assert_eq!(a.consensus().finalize(id).await.unwrap(), ProposalStatus::Approved);
    assert_eq!(b.consensus().close(id).await.unwrap(), ProposalStatus::Rejected);
    assert_eq!(a.consensus().conflicted().len(), 1);
    assert_eq!(b.consensus().stats().divergent, 1);
    assert_eq!(b.storage().outcomes_for(&id).unwrap().len(), 1);
}

#[tokio::test]
async fn hop_budget_bounds_propagation() {
    let fed = Federation::new();
    let a = fed.node("a", Decision::Abstain);
    let b = fed.node("b", Decision::Abstain);
    let c = fed.node("c", Decision::Abstain);
    let d = fed.node("d", Decision::Abstain);
    link(&a, &b);
    link(&a, &c);
    link(&b, &d);
    link(&c, &d);
    let (on_b, on_c, on_d) = (counter(&b), counter(&c), counter(&d));

    let outcome = a
        .gossip()
        .broadcast_with_ttl(MessageType::Pattern, b"one hop".to_vec(), 1)
        .await
        .unwrap();
    assert_eq!(outcome.delivered(), 2);
    assert_eq!((on_b.count(), on_c.count(), on_d.count()), (1, 1, 0));
    assert_eq!(fed.frames_to(&d), 0);
    assert_eq!(b.gossip().stats().ttl_exhausted, 1);

    // One more hop reaches d, exactly once despite two paths
    a.gossip()
        .broadcast_with_ttl(MessageType::Pattern, b"two hops".to_vec(), 2)
        .await
        .unwrap();
    assert_eq!(on_d.count(), 1);
    assert_eq!(fed.frames_to(&d), 2);
}

#[tokio::test]
async fn approving_peer_approves_proposal() {
    let fed = Federation::new();
    let a = fed.node("a", Decision::Abstain);
    let b = fed.node("b", Decision::Approve);
    link(&a, &b);

    let proposal = a
        .consensus()
        .propose_within("PATTERN", br#"{"x":1}"#.to_vec(), Duration::from_secs(60))
        .await
        .unwrap();
    let id = proposal.proposal_id;
    eventually(|| has_vote(&a, id, &b)).await;

    let record = a.consensus().get_proposal(&id).unwrap();
    assert_eq!(record.votes[&b.local_id()].decision, Decision::Approve);
    assert_eq!(a.consensus().finalize(id).await.unwrap(), ProposalStatus::Approved);

    // b hears the outcome and agrees with it
    let on_b = b.consensus().get_proposal(&id).unwrap();
    assert_eq!(on_b.remote_outcomes[&a.local_id()].status, ProposalStatus::Approved);
    assert!(!on_b.divergent);
    assert_eq!(b.consensus().stats().evaluations, 1);
}

#[tokio::test]
async fn split_vote_is_conflicted() {
    let fed = Federation::new();
    let self_vote = ConsensusConfig {
        self_vote: true,
        ..Default::default()
    };
    let a = fed.node_with("a", Arc::new(StaticEvaluator::new(Decision::Reject)), self_vote);
    let b = fed.node("b", Decision::Approve);
    link(&a, &b);

    let proposal = a
        .consensus()
        .propose_within("PATTERN", b"{}".to_vec(), Duration::from_secs(60))
        .await
        .unwrap();
    let id = proposal.proposal_id;
    eventually(|| has_vote(&a, id, &b) && has_vote(&b, id, &a)).await;

    assert_eq!(a.consensus().finalize(id).await.unwrap(), ProposalStatus::Conflicted);
    assert_eq!(b.consensus().finalize(id).await.unwrap(), ProposalStatus::Conflicted);

    let conflicted = a.consensus().conflicted();
    assert_eq!(conflicted.len(), 1);
    let tally = conflicted[0].tally.unwrap();
    assert_eq!((tally.approvals, tally.rejections), (1, 1));
    assert!(!conflicted[0].divergent);
}

#[tokio::test]
async fn failing_evaluators_abstain() {
    let fed = Federation::new();
    let a = fed.node("a", Decision::Abstain);
    let failing = fed.node_with(
        "failing",
        Arc::new(FnEvaluator::new(|_: &Proposal| {
            Err(EvaluationError::Failed("model offline".into()))
        })),
        ConsensusConfig::default(),
    );
    let panicking = fed.node_with(
        "panicking",
        Arc::new(FnEvaluator::new(|_: &Proposal| -> Result<Verdict, EvaluationError> {
            panic!("evaluator bug")
        })),
        ConsensusConfig::default(),
    );
    link(&a, &failing);
    link(&a, &panicking);

    let proposal = a
        .consensus()
        .propose_within("PATTERN", b"{}".to_vec(), Duration::from_secs(60))
        .await
        .unwrap();
    let id = proposal.proposal_id;
    eventually(|| has_vote(&a, id, &failing) && has_vote(&a, id, &panicking)).await;

    let record = a.consensus().get_proposal(&id).unwrap();
    let from_failing = &record.votes[&failing.local_id()];
    assert_eq!(from_failing.decision, Decision::Abstain);
    assert!(from_failing.rationale.contains("model offline"));
    let from_panicking = &record.votes[&panicking.local_id()];
    assert_eq!(from_panicking.decision, Decision::Abstain);
    assert!(from_panicking.rationale.starts_with("evaluation failed"));
    assert_eq!(failing.consensus().stats().evaluation_failures, 1);

    // Abstentions never make quorum
    assert_eq!(a.consensus().finalize(id).await.unwrap(), ProposalStatus::Open);
    assert_eq!(a.consensus().close(id).await.unwrap(), ProposalStatus::Expired);
}

#[tokio::test]
async fn early_votes_wait_for_their_proposal() {
    let fed = Federation::new();
    let a = fed.node("a", Decision::Abstain);
    let voter = fed.node("voter", Decision::Abstain);
    let c = fed.node("c", Decision::Abstain);

    let proposal = a
        .consensus()
        .propose_within("PATTERN", b"{}".to_vec(), Duration::from_secs(60))
        .await
        .unwrap();
    let id = proposal.proposal_id;

    let vote = signed_vote(&voter, id, Decision::Approve, 1_000);
    assert!(c.gossip().receive(None, vote).await.is_accepted());
    assert!(c.consensus().get_proposal(&id).is_none());
    assert_eq!(c.consensus().stats().pending_votes, 1);

    let envelope = proposal_envelope(&a, id);
    assert!(c.gossip().receive(None, envelope).await.is_accepted());

    let record = c.consensus().get_proposal(&id).unwrap();
    assert_eq!(record.votes[&voter.local_id()].decision, Decision::Approve);
    assert_eq!(c.consensus().stats().pending_votes, 0);
    assert_eq!(c.consensus().finalize(id).await.unwrap(), ProposalStatus::Approved);
}

#[tokio::test]
async fn unmet_quorum_expires_at_deadline() {
    let fed = Federation::new();
    let a = fed.node("a", Decision::Abstain);

    let proposal = a
        .consensus()
        .propose_within("PATTERN", b"{}".to_vec(), Duration::from_millis(200))
        .await
        .unwrap();
    let id = proposal.proposal_id;
    assert_eq!(a.consensus().finalize(id).await.unwrap(), ProposalStatus::Open);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let report = a.maintain().await;
    assert_eq!(report.proposals_settled, vec![(id, ProposalStatus::Expired)]);

    let stored = a.storage().get_proposal(&id).unwrap().unwrap();
    assert_eq!(stored.status, ProposalStatus::Expired);
    assert_eq!(stored.finalized_at.map(|at| at >= proposal.deadline), Some(true));
}

#[tokio::test]
async fn anti_entropy_heals_a_partition() {
    let fed = Federation::new();
    let a = fed.node("a", Decision::Abstain);
    let b = fed.node("b", Decision::Abstain);
    link(&a, &b);
    let on_b = counter(&b);

    fed.network.partition(a.local_id(), b.local_id());
    let outcome = a.publish_pattern(b"while apart".to_vec()).await.unwrap();
    assert_eq!(outcome.delivered(), 0);
    assert_eq!(on_b.count(), 0);

    fed.network.heal(a.local_id(), b.local_id());
    let report = b.run_anti_entropy_round().await.unwrap();
    assert_eq!(report.peer, Some(a.local_id()));
    assert_eq!(report.accepted, 1);
    assert_eq!(on_b.count(), 1);
    assert!(b.gossip().has_seen(&outcome.message().message_hash));
}

#[tokio::test]
async fn hello_introduces_nodes_to_each_other() {
    let fed = Federation::new();
    let a = fed.node("a", Decision::Abstain);
    let b = fed.node("b", Decision::Approve);

    let peer = a.connect(&PeerEndpoint::local(b.local_id())).await.unwrap();
    assert_eq!(peer.display_label, "b");
    assert!(b.registry().get(&a.local_id()).is_some());

    let proposal = a
        .consensus()
        .propose_within("PATTERN", b"{}".to_vec(), Duration::from_secs(60))
        .await
        .unwrap();
    eventually(|| has_vote(&a, proposal.proposal_id, &b)).await;
    assert_eq!(
        a.consensus().finalize(proposal.proposal_id).await.unwrap(),
        ProposalStatus::Approved
    );

    let unknown = InstanceId([7; 32]);
    assert!(a.connect(&PeerEndpoint::local(unknown)).await.is_err());
}

#[tokio::test]
async fn slow_evaluator_does_not_hold_up_relaying() {
    let fed = Federation::new();
    let a = fed.node("a", Decision::Abstain);
    let b = fed.node_with(
        "b",
        Arc::new(SlowEvaluator(Duration::from_secs(3))),
        ConsensusConfig::default(),
    );
    let c = fed.node("c", Decision::Abstain);
    link(&a, &b);
    link(&b, &c);

    let started = Instant::now();
    let proposal = a
        .consensus()
        .propose_within("PATTERN", b"{}".to_vec(), Duration::from_secs(60))
        .await
        .unwrap();
    let id = proposal.proposal_id;

    // b relayed to c before its evaluator answered
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(c.consensus().get_proposal(&id).is_some());
    assert_eq!(a.gossip().stats().send_failures, 0);
    assert!(!has_vote(&a, id, &b));

    eventually(|| has_vote(&a, id, &b)).await;
    assert_eq!(a.consensus().finalize(id).await.unwrap(), ProposalStatus::Approved);
    assert_eq!(b.consensus().stats().evaluations, 1);
}

#[tokio::test]
async fn redelivered_proposal_is_not_reevaluated() {
    let fed = Federation::new();
    let a = fed.node("a", Decision::Abstain);
    // A one-entry seen set forgets the proposal as soon as b votes
    let b = fed.node_from(
        FederationNode::builder()
            .label("b")
            .evaluator(Arc::new(StaticEvaluator::new(Decision::Approve)))
            .gossip_config(GossipConfig {
                seen_capacity: 1,
                ..Default::default()
            }),
    );

    let proposal = a
        .consensus()
        .propose_within("PATTERN", b"{}".to_vec(), Duration::from_secs(60))
        .await
        .unwrap();
    let id = proposal.proposal_id;
    let envelope = proposal_envelope(&a, id);

    assert!(b.gossip().receive(None, envelope.clone()).await.is_accepted());
    eventually(|| has_vote(&b, id, &b)).await;
    let first_vote = b.consensus().get_proposal(&id).unwrap().votes[&b.local_id()].clone();
    assert!(!b.gossip().has_seen(&envelope.message_hash));

    assert!(b.gossip().receive(None, envelope).await.is_accepted());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(b.consensus().proposals().len(), 1);
    assert_eq!(b.consensus().stats().evaluations, 1);
    let record = b.consensus().get_proposal(&id).unwrap();
    assert_eq!(record.votes[&b.local_id()], first_vote);
    assert_eq!(b.consensus().vote_history(&id).unwrap().len(), 1);
}

#[tokio::test]
async fn votes_from_other_rulesets_are_not_counted() {
    let fed = Federation::new();
    let a = fed.node("a", Decision::Abstain);
    let outsider = fed.node_from(
        FederationNode::builder()
            .label("outsider")
            .ruleset(b"different rules"),
    );
    let insider = fed.node("insider", Decision::Abstain);
    link(&a, &outsider);

    let proposal = a
        .consensus()
        .propose_within("PATTERN", b"{}".to_vec(), Duration::from_secs(60))
        .await
        .unwrap();
    let id = proposal.proposal_id;

    let foreign = signed_vote(&outsider, id, Decision::Reject, 1_000);
    assert!(a.gossip().receive(None, foreign).await.is_accepted());
    assert!(!has_vote(&a, id, &outsider));
    assert_eq!(a.consensus().stats().incompatible_votes, 1);

    let local = signed_vote(&insider, id, Decision::Approve, 1_000);
    assert!(a.gossip().receive(None, local).await.is_accepted());
    assert!(has_vote(&a, id, &insider));
    assert_eq!(a.consensus().finalize(id).await.unwrap(), ProposalStatus::Approved);
}
