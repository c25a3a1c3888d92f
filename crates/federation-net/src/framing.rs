//! Message framing for network transport
//!
//! Provides length-prefixed framing over any byte stream.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (16 MB)
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Stream closed before a full frame arrived")]
    UnexpectedEof,
}

/// A framed message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Payload bytes
    pub payload: Vec<u8>,
}

/// Frame types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Ping for keepalive
    Ping = 0,
    /// Pong response
    Pong = 1,
    /// Introduction carrying a signed heartbeat envelope
    Hello = 2,
    /// Gossip envelope push
    GossipPush = 10,
    /// Acknowledgement of a push
    Ack = 11,
    /// Anti-entropy: ask for recent message hashes
    DigestRequest = 12,
    /// Anti-entropy: recent message hashes
    DigestResponse = 13,
    /// Anti-entropy: ask for specific envelopes
    FetchRequest = 14,
    /// Anti-entropy: requested envelopes
    FetchResponse = 15,
    /// Observability snapshot request
    StatusRequest = 20,
    /// Observability snapshot (JSON)
    StatusResponse = 21,
    /// Request could not be served
    Failure = 255,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0 => Ok(Self::Ping),
            1 => Ok(Self::Pong),
            2 => Ok(Self::Hello),
            10 => Ok(Self::GossipPush),
            11 => Ok(Self::Ack),
            12 => Ok(Self::DigestRequest),
            13 => Ok(Self::DigestResponse),
            14 => Ok(Self::FetchRequest),
            15 => Ok(Self::FetchResponse),
            20 => Ok(Self::StatusRequest),
            21 => Ok(Self::StatusResponse),
            255 => Ok(Self::Failure),
            _ => Err(FrameError::Serialization(format!("Unknown frame type: {}", value))),
        }
    }
}

/// Codec for length-prefixed frames
///
/// Wire format:
/// - 4 bytes: length (big-endian, includes type byte)
/// - 1 byte: frame type
/// - N bytes: payload
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 5 bytes (4 length + 1 type)
        if src.len() < 5 {
            return Ok(None);
        }

        // Peek at length
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        if length == 0 {
            return Err(FrameError::Serialization("zero-length frame".into()));
        }

        // Need full frame
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        // Consume length prefix
        src.advance(4);

        // Read frame type
        let frame_type = FrameType::try_from(src[0])?;
        src.advance(1);

        // Read payload
        let payload_len = length - 1;
        let payload = src.split_to(payload_len).to_vec();

        Ok(Some(Frame { frame_type, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = 1 + item.payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }

        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(item.frame_type as u8);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

/// Write one frame to a stream.
pub async fn write_frame<W>(stream: &mut W, frame: Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    FrameCodec.encode(frame, &mut buf)?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one frame from a stream.
///
/// Returns `Ok(None)` if the stream closed cleanly between frames.
pub async fn read_frame<R>(stream: &mut R, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = FrameCodec.decode(buf)? {
            return Ok(Some(frame));
        }
        if stream.read_buf(buf).await? == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(FrameError::UnexpectedEof)
            };
        }
    }
}

impl Frame {
    /// Create a new frame
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self { frame_type, payload }
    }

    /// Create a ping frame
    pub fn ping() -> Self {
        Self::new(FrameType::Ping, vec![])
    }

    /// Create a pong frame
    pub fn pong() -> Self {
        Self::new(FrameType::Pong, vec![])
    }

    /// Create an acknowledgement frame
    pub fn ack() -> Self {
        Self::new(FrameType::Ack, vec![])
    }

    /// Create an error frame with a human-readable reason
    pub fn error(reason: impl Into<String>) -> Self {
        Self::new(FrameType::Failure, reason.into().into_bytes())
    }
}
