//! Signing keys for instance identity
//!
//! Provides key generation, signing and verification.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Entropy source unavailable: {0}")]
    Entropy(String),
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature encoding")]
    InvalidSignature,
    #[error("Signature verification failed")]
    SignatureVerificationFailed,
}

/// Ed25519 keypair for signing and identity
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair from the OS entropy source.
    ///
    /// Fails instead of falling back to a weaker scheme.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| CryptoError::Entropy(e.to_string()))?;
        Ok(Self::from_seed(&seed))
    }

    /// Create from seed bytes (persisted identity, deterministic testing)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Seed bytes for local persistence. Never put these on the wire.
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Get the verifying key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign a message (Ed25519 signatures are deterministic)
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a signature
    pub fn verify(
        public_key: &[u8; 32],
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        let verifying_key = VerifyingKey::from_bytes(public_key)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        let sig = Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &hex::encode(self.public_key()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_sign_verify() {
        let kp = KeyPair::generate().unwrap();
        let msg = b"hello world";
        let sig = kp.sign(msg);

        assert!(KeyPair::verify(&kp.public_key(), msg, &sig).is_ok());
        assert!(KeyPair::verify(&kp.public_key(), b"other", &sig).is_err());
    }

    #[test]
    fn test_signing_is_deterministic() {
        let kp = KeyPair::from_seed(&[7; 32]);
        assert_eq!(kp.sign(b"payload"), kp.sign(b"payload"));
    }

    #[test]
    fn test_seed_roundtrip() {
        let kp = KeyPair::generate().unwrap();
        let restored = KeyPair::from_seed(&kp.seed());
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn test_malformed_signature_is_error() {
        let kp = KeyPair::from_seed(&[1; 32]);
        assert!(matches!(
            KeyPair::verify(&kp.public_key(), b"m", &[0u8; 10]),
            Err(CryptoError::InvalidSignature)
        ));
    }

    #[test]
    fn test_debug_hides_secret() {
        let kp = KeyPair::from_seed(&[1; 32]);
        let rendered = format!("{:?}", kp);
        assert!(!rendered.contains(&hex::encode(kp.seed())));
    }
}
