//! Transport layer
//!
//! The gossip layer only needs a point-to-point request/response primitive.
//! [`Transport`] is that seam; [`TcpTransport`] implements it over plain TCP
//! with one connection per request and a single deadline covering connect,
//! write and read. Delivery is not guaranteed; gossip redundancy compensates.

use crate::framing::{read_frame, write_frame, Frame, FrameError, FrameType};
use crate::peer::PeerEndpoint;
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("No address known for peer: {0}")]
    NoAddress(PeerEndpoint),
    #[error("Peer unreachable: {0}")]
    Unreachable(PeerEndpoint),
    #[error("Peer refused request: {0}")]
    Refused(String),
    #[error("Unexpected response frame: {0:?}")]
    UnexpectedFrame(FrameType),
}

/// Outbound request/response primitive to a single peer
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request frame and wait for the peer's response frame.
    async fn request(&self, to: &PeerEndpoint, frame: Frame) -> Result<Frame, TransportError>;
}

/// Inbound side: whatever answers frames for the local node
#[async_trait]
pub trait Inbound: Send + Sync {
    /// Handle one request frame and produce the response frame.
    async fn on_frame(&self, frame: Frame) -> Frame;
}

/// TCP transport, one short-lived connection per request
#[derive(Debug, Clone)]
pub struct TcpTransport {
    /// Deadline for connect + write + read
    timeout: Duration,
}

impl TcpTransport {
    /// Create a new transport with the given per-request deadline
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Per-request deadline
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a request to a bare socket address (used before the peer's id is known)
    pub async fn request_addr(&self, addr: &str, frame: Frame) -> Result<Frame, TransportError> {
        let exchange = async {
            let mut stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            write_frame(&mut stream, frame).await?;
            let mut buf = BytesMut::new();
            let response = read_frame(&mut stream, &mut buf).await?;
            Ok::<_, TransportError>(response)
        };

        let response = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))??
            .ok_or(TransportError::ConnectionClosed)?;

        if response.frame_type == FrameType::Failure {
            return Err(TransportError::Refused(
                String::from_utf8_lossy(&response.payload).into_owned(),
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request(&self, to: &PeerEndpoint, frame: Frame) -> Result<Frame, TransportError> {
        let addr = to
            .address
            .as_deref()
            .ok_or_else(|| TransportError::NoAddress(to.clone()))?;
        self.request_addr(addr, frame).await
    }
}

/// Serve frames on an accepted connection until the peer hangs up or goes idle.
pub async fn serve_connection(
    mut stream: TcpStream,
    inbound: Arc<dyn Inbound>,
    idle_timeout: Duration,
) -> Result<(), TransportError> {
    let mut buf = BytesMut::new();
    loop {
        let frame = match tokio::time::timeout(idle_timeout, read_frame(&mut stream, &mut buf)).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                debug!("Closing idle connection");
                return Ok(());
            }
        };

        let response = inbound.on_frame(frame).await;
        if let Err(e) = write_frame(&mut stream, response).await {
            warn!("Failed to write response: {}", e);
            return Err(e.into());
        }
    }
}

/// Message serialization helpers
pub mod messages {
    use super::*;
    use federation_core::types::*;
    use serde::de::DeserializeOwned;
    use serde::{Deserialize, Serialize};

    /// A payload that travels in exactly one frame type
    pub trait WireMessage: Serialize + DeserializeOwned {
        const FRAME_TYPE: FrameType;

        fn to_frame(&self) -> Result<Frame, postcard::Error> {
            let payload = postcard::to_allocvec(self)?;
            Ok(Frame::new(Self::FRAME_TYPE, payload))
        }

        fn from_frame(frame: &Frame) -> Result<Self, TransportError> {
            if frame.frame_type == FrameType::Failure {
                return Err(TransportError::Refused(
                    String::from_utf8_lossy(&frame.payload).into_owned(),
                ));
            }
            if frame.frame_type != Self::FRAME_TYPE {
                return Err(TransportError::UnexpectedFrame(frame.frame_type));
            }
            postcard::from_bytes(&frame.payload)
                .map_err(|e| TransportError::Frame(FrameError::Serialization(e.to_string())))
        }
    }

    /// Introduction: a signed heartbeat envelope
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct Hello {
        pub heartbeat: GossipMessage,
    }

    /// Gossip envelope push; `sender` is the relaying hop, not the origin
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct GossipPush {
        pub sender: InstanceId,
        pub message: GossipMessage,
    }

    /// Anti-entropy digest request
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct DigestRequest {
        pub sender: InstanceId,
        pub max_hashes: u32,
    }

    /// Anti-entropy digest: most recent hashes first
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct DigestResponse {
        pub hashes: Vec<MessageHash>,
    }

    /// Anti-entropy fetch request
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct FetchRequest {
        pub sender: InstanceId,
        pub hashes: Vec<MessageHash>,
    }

    /// Anti-entropy fetch response; unknown hashes are simply absent
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct FetchResponse {
        pub messages: Vec<GossipMessage>,
    }

    impl WireMessage for Hello {
        const FRAME_TYPE: FrameType = FrameType::Hello;
    }

    impl WireMessage for GossipPush {
        const FRAME_TYPE: FrameType = FrameType::GossipPush;
    }

    impl WireMessage for DigestRequest {
        const FRAME_TYPE: FrameType = FrameType::DigestRequest;
    }

    impl WireMessage for DigestResponse {
        const FRAME_TYPE: FrameType = FrameType::DigestResponse;
    }

    impl WireMessage for FetchRequest {
        const FRAME_TYPE: FrameType = FrameType::FetchRequest;
    }

    impl WireMessage for FetchResponse {
        const FRAME_TYPE: FrameType = FrameType::FetchResponse;
    }
}
