//! WebRTC peer link
//!
//! This module provides the peer side of a pairing:
//! - Peer connection creation and SDP handling
//! - Negotiation session with ICE candidate buffering
//! - Data channel wiring for the chunked transport

pub mod data_channel;
pub mod negotiation;
pub mod peer_connection;

pub use data_channel::{ChannelKind, InboundEvent};
pub use negotiation::{IceBuffer, NegotiationSession};
pub use peer_connection::PeerConnectionManager;

use std::error::Error;
use std::fmt;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// WebRTC-related errors
#[derive(Debug)]
pub enum WebRTCError {
    /// Peer connection creation failed
    ConnectionFailed(String),
    /// SDP processing failed
    SdpError(String),
    /// ICE candidate processing failed
    IceError(String),
    /// Data channel error
    DataChannelError(String),
    /// Invalid state transition
    InvalidState(String),
}

impl fmt::Display for WebRTCError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebRTCError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            WebRTCError::SdpError(msg) => write!(f, "SDP error: {}", msg),
            WebRTCError::IceError(msg) => write!(f, "ICE error: {}", msg),
            WebRTCError::DataChannelError(msg) => write!(f, "DataChannel error: {}", msg),
            WebRTCError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl Error for WebRTCError {}

/// Peer link state, independent of the control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    /// ICE lost the path; may recover on its own
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }
}

impl From<RTCPeerConnectionState> for LinkState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New => LinkState::New,
            RTCPeerConnectionState::Connecting => LinkState::Connecting,
            RTCPeerConnectionState::Connected => LinkState::Connected,
            RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
            RTCPeerConnectionState::Failed => LinkState::Failed,
            RTCPeerConnectionState::Closed => LinkState::Closed,
            _ => LinkState::New,
        }
    }
}
