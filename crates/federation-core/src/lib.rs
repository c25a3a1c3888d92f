//! Federation Core Library
//!
//! This crate provides the core types, canonical encoding, and hash
//! derivations shared by every federation instance.
//!
//! # Modules
//!
//! - [`types`]: Protocol types (InstanceId, GossipMessage, Proposal, Vote, etc.)
//! - [`canonical`]: Deterministic serialization for hashing/signing
//! - [`crypto`]: Domain-separated hash derivations and signing payloads
//! - [`error`]: Error types

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
