//! Error types for the federation core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Federation core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Hash mismatch (computed != transmitted ID)
    #[error("hash mismatch: computed {computed} != transmitted {transmitted}")]
    HashMismatch { computed: String, transmitted: String },

    /// Claimed origin is not derived from the carried public key
    #[error("origin {claimed} is not derived from its public key (expected {derived})")]
    OriginMismatch { claimed: String, derived: String },

    /// Payload did not decode as the type its envelope announced
    #[error("malformed {0} payload")]
    MalformedPayload(&'static str),
}
