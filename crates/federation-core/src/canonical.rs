//! Canonical encoding for hashed and signed objects
//!
//! All hashed/signed objects use postcard serialization:
//! - No maps/hashmaps
//! - Field order is Rust struct field order

use crate::error::{Error, Result};
use crate::types::*;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialize a value to canonical bytes using postcard.
///
/// This is the normative encoding for all hashing and signing operations.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Decode a gossip payload, naming the expected message type on failure.
pub fn decode_payload<T: DeserializeOwned>(message: &GossipMessage) -> Result<T> {
    postcard::from_bytes(&message.payload)
        .map_err(|_| Error::MalformedPayload(message.message_type.as_str()))
}

/// Normalize a display label: trim, collapse whitespace, cap length.
pub fn normalize_label(label: &str) -> String {
    const MAX_LABEL_CHARS: usize = 64;
    label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(MAX_LABEL_CHARS)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_bytes_deterministic() {
        let announcement = PeerAnnouncement {
            display_label: "node-a".into(),
            ruleset_hash: RulesetHash([7; 32]),
            address: Some("127.0.0.1:9100".into()),
            genesis_timestamp: 1,
            sent_at: 2,
        };

        let bytes1 = canonical_bytes(&announcement).unwrap();
        let bytes2 = canonical_bytes(&announcement).unwrap();
        assert_eq!(bytes1, bytes2);
    }

    #[test]
    fn test_decode_payload_reports_type() {
        let message = GossipMessage {
            message_hash: MessageHash([0; 32]),
            origin: InstanceId([0; 32]),
            origin_public_key: [0; 32],
            message_type: MessageType::Vote,
            payload: vec![0xff],
            signature: vec![],
            ttl_hops: 1,
            created_at: 0,
        };

        let err = decode_payload::<Vote>(&message).unwrap_err();
        assert!(err.to_string().contains("vote"));
    }

    #[test]
    fn test_label_normalization() {
        assert_eq!(normalize_label("  node   alpha "), "node alpha");
        assert_eq!(normalize_label(&"x".repeat(100)).len(), 64);
    }
}
