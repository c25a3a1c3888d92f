//! Configuration for federationd

use crate::consensus::{CompletionPolicy, ConsensusConfig, Threshold};
use crate::gossip::GossipConfig;
use crate::registry::{ruleset_fingerprint, RegistryConfig};
use anyhow::Context;
use clap::{Parser, ValueEnum};
use federation_core::{Decision, RulesetHash};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Decision the built-in evaluator gives every proposal
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DecisionArg {
    Approve,
    Reject,
    Abstain,
}

impl From<DecisionArg> for Decision {
    fn from(arg: DecisionArg) -> Self {
        match arg {
            DecisionArg::Approve => Decision::Approve,
            DecisionArg::Reject => Decision::Reject,
            DecisionArg::Abstain => Decision::Abstain,
        }
    }
}

/// federationd - federation identity, gossip and consensus daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "federationd")]
#[command(about = "Federation daemon: peer registry, gossip dissemination and proposal consensus")]
pub struct Config {
    /// Listen address for peer connections
    #[arg(short, long, default_value = "0.0.0.0:9300", env = "FEDERATION_LISTEN")]
    pub listen: SocketAddr,

    /// Address advertised to peers (defaults to the listen address)
    #[arg(long, env = "FEDERATION_ADVERTISE")]
    pub advertise: Option<String>,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/federationd", env = "FEDERATION_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Human-readable label announced to peers
    #[arg(long, default_value = "federation-node", env = "FEDERATION_LABEL")]
    pub label: String,

    /// Rule-set document this instance governs itself by
    #[arg(long, env = "FEDERATION_RULESET")]
    pub ruleset: Option<PathBuf>,

    /// Bootstrap peers (comma-separated host:port)
    #[arg(long, value_delimiter = ',', env = "FEDERATION_BOOTSTRAP")]
    pub bootstrap: Vec<String>,

    /// Peers contacted per broadcast or relay
    #[arg(long, default_value = "3")]
    pub fanout: usize,

    /// Hop budget for locally originated messages
    #[arg(long, default_value = "6")]
    pub ttl: u8,

    /// Per-peer send timeout in milliseconds
    #[arg(long, default_value = "2000")]
    pub send_timeout_ms: u64,

    /// Heartbeat interval in seconds
    #[arg(long, default_value = "30")]
    pub heartbeat_interval_secs: u64,

    /// Anti-entropy interval in seconds
    #[arg(long, default_value = "20")]
    pub anti_entropy_interval_secs: u64,

    /// Maintenance interval in seconds
    #[arg(long, default_value = "60")]
    pub maintenance_interval_secs: u64,

    /// Seen-set capacity
    #[arg(long, default_value = "10000")]
    pub seen_capacity: usize,

    /// Seen-set retention in seconds
    #[arg(long, default_value = "600")]
    pub seen_retention_secs: u64,

    /// Silence after which a peer is marked stale, in seconds
    #[arg(long, default_value = "300")]
    pub stale_after_secs: u64,

    /// Silence after which a peer is evicted, in seconds
    #[arg(long, default_value = "3600")]
    pub evict_after_secs: u64,

    /// Non-abstaining votes needed before a proposal settles early
    #[arg(long, default_value = "1")]
    pub quorum: u32,

    /// Share of non-abstaining votes a side must reach (N/D)
    #[arg(long, default_value = "1/2")]
    pub threshold: Threshold,

    /// Evaluate our own proposals too
    #[arg(long)]
    pub self_vote: bool,

    /// Decision of the built-in evaluator
    #[arg(long, value_enum, default_value = "abstain")]
    pub decision: DecisionArg,

    /// Evaluation timeout in seconds
    #[arg(long, default_value = "30")]
    pub evaluation_timeout_secs: u64,

    /// Votes held for proposals not yet seen
    #[arg(long, default_value = "4096")]
    pub max_pending_votes: usize,

    /// How long an early vote is held, in seconds
    #[arg(long, default_value = "600")]
    pub pending_vote_ttl_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.label.trim().is_empty() {
            anyhow::bail!("Label cannot be empty");
        }
        if self.fanout == 0 {
            anyhow::bail!("Fanout must be at least 1");
        }
        if self.ttl == 0 {
            anyhow::bail!("TTL must be at least 1");
        }
        if self.quorum == 0 {
            anyhow::bail!("Quorum must be at least 1");
        }
        if self.seen_capacity == 0 {
            anyhow::bail!("Seen-set capacity must be at least 1");
        }
        if self.evict_after_secs <= self.stale_after_secs {
            anyhow::bail!("Peers must go stale before they are evicted");
        }
        if self.heartbeat_interval_secs == 0
            || self.anti_entropy_interval_secs == 0
            || self.maintenance_interval_secs == 0
        {
            anyhow::bail!("Intervals must be at least one second");
        }
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            anyhow::bail!("Unknown log format: {}", self.log_format);
        }
        for warning in self.warnings() {
            warn!("{}", warning);
        }
        Ok(())
    }

    /// Settings that are accepted but probably wrong
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.advertise.is_none() && self.listen.ip().is_unspecified() {
            warnings.push(format!(
                "Listening on {} without --advertise; peers will be told an address they cannot dial",
                self.listen
            ));
        }
        warnings
    }

    /// Fingerprint of the configured rule-set (empty document if none)
    pub fn ruleset_hash(&self) -> anyhow::Result<RulesetHash> {
        match &self.ruleset {
            Some(path) => {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("reading rule-set {}", path.display()))?;
                Ok(ruleset_fingerprint(&bytes))
            }
            None => Ok(ruleset_fingerprint(&[])),
        }
    }

    /// Address announced to peers
    pub fn advertised_address(&self) -> String {
        self.advertise
            .clone()
            .unwrap_or_else(|| self.listen.to_string())
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            stale_after: Duration::from_secs(self.stale_after_secs),
            evict_after: Duration::from_secs(self.evict_after_secs),
            ..Default::default()
        }
    }

    pub fn gossip_config(&self) -> GossipConfig {
        GossipConfig {
            fanout: self.fanout,
            default_ttl: self.ttl,
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            seen_capacity: self.seen_capacity,
            seen_retention: Duration::from_secs(self.seen_retention_secs),
            ..Default::default()
        }
    }

    pub fn consensus_config(&self) -> ConsensusConfig {
        ConsensusConfig {
            policy: CompletionPolicy {
                quorum: self.quorum,
                threshold: self.threshold,
            },
            self_vote: self.self_vote,
            evaluation_timeout: Duration::from_secs(self.evaluation_timeout_secs),
            max_pending_votes: self.max_pending_votes,
            pending_vote_ttl: Duration::from_secs(self.pending_vote_ttl_secs),
        }
    }
}
