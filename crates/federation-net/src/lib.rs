//! Networking primitives for the federation protocol
//!
//! This crate provides:
//! - Ed25519 instance keypairs
//! - Length-prefixed message framing
//! - The [`Transport`] seam with TCP and in-process implementations
//! - Wire messages for gossip and anti-entropy

pub mod crypto;
pub mod framing;
pub mod memory;
pub mod peer;
pub mod transport;

pub use crypto::{CryptoError, KeyPair};
pub use framing::{Frame, FrameCodec, FrameType};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use peer::PeerEndpoint;
pub use transport::{Inbound, TcpTransport, Transport, TransportError};
