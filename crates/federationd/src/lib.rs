//! federationd - federation of independent instances
//!
//! This crate provides:
//! - Durable instance identity and a registry of known peers
//! - Epidemic gossip of signed envelopes with bounded hop budgets
//! - Anti-entropy repair of missed messages
//! - Proposal consensus that records disagreement instead of hiding it
//! - Node assembly and a TCP server loop

pub mod config;
pub mod consensus;
pub mod evaluator;
pub mod gossip;
pub mod node;
pub mod registry;
pub mod seen;
pub mod server;
pub mod storage;
pub mod sync;

pub use config::Config;
pub use consensus::{CompletionPolicy, Consensus, ConsensusConfig, ProposalRecord, Threshold};
pub use evaluator::{EvaluationError, Evaluator, FnEvaluator, StaticEvaluator, Verdict};
pub use gossip::{BroadcastOutcome, GossipConfig, GossipEngine, MessageHandler, ReceiveOutcome};
pub use node::{FederationNode, FederationNodeBuilder, NodeError, NodeStatus};
pub use registry::{IdentityError, IdentityRegistry, InstanceIdentity, RegistryConfig};
pub use server::Server;
pub use storage::Storage;
pub use sync::AntiEntropy;
