//! Chunked message transport
//!
//! The envelope format, backpressure-aware send loop and receive-side
//! reassembly used identically by both endpoints on top of an ordered,
//! reliable data channel. There is no retransmission or reordering here;
//! a channel that closes mid-transfer simply loses the partial message.

pub mod chunked;
pub mod envelope;
pub mod events;

pub use chunked::{ChunkAssembler, ChunkSettings, ChunkedSender};
pub use envelope::{ChunkData, Envelope};
pub use events::{Command, RecognitionStatus, Role, TextEvent};

use async_trait::async_trait;
use std::error::Error;
use std::fmt;

/// Transport-layer errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Channel is not open (or closed while waiting)
    ChannelClosed(String),
    /// The underlying channel rejected the frame
    SendFailed(String),
    /// Encoded frame larger than the channel accepts
    FrameTooLarge { size: usize, limit: usize },
    /// Frame could not be decoded
    InvalidFrame(String),
    /// Chunk metadata inconsistent with its assembly
    InvalidChunk(String),
    /// Envelope type not known on this channel
    UnknownType(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::ChannelClosed(label) => write!(f, "Channel closed: {}", label),
            TransportError::SendFailed(msg) => write!(f, "Send failed: {}", msg),
            TransportError::FrameTooLarge { size, limit } => {
                write!(f, "Frame of {} bytes exceeds channel limit of {}", size, limit)
            }
            TransportError::InvalidFrame(msg) => write!(f, "Invalid frame: {}", msg),
            TransportError::InvalidChunk(msg) => write!(f, "Invalid chunk: {}", msg),
            TransportError::UnknownType(kind) => write!(f, "Unknown message type: {}", kind),
        }
    }
}

impl Error for TransportError {}

/// Outbound side of a data channel as seen by the send loop
#[async_trait]
pub trait ChannelSink: Send + Sync {
    /// Channel label, for logs
    fn channel_label(&self) -> String;

    /// Whether frames can still be sent
    fn is_open(&self) -> bool;

    /// Still opening; senders wait rather than fail
    fn is_connecting(&self) -> bool {
        false
    }

    /// Bytes queued but not yet handed to the network
    async fn buffered_bytes(&self) -> usize;

    /// Send one text frame
    async fn send_frame(&self, frame: String) -> Result<(), TransportError>;
}
