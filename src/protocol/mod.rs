//! Control-connection protocol
//!
//! Closed message sets exchanged between endpoints and the rendezvous server
//! over the control WebSocket. Every frame is validated at the boundary;
//! nothing downstream ever sees an unchecked payload.

pub mod message;

pub use message::{
    generate_code, is_valid_code, Ack, ClientId, ClientMessage, IceCandidate, SdpKind,
    ServerMessage, SessionDescription, SignalError, PAIRING_CODE_LEN,
};

use std::error::Error;
use std::fmt;

/// Errors raised while decoding or validating a control frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not JSON, unknown `type`, or missing/mistyped fields
    Malformed {
        reason: String,
        request_id: Option<u64>,
    },
    /// A pairing code that is not exactly six ASCII digits
    InvalidCode {
        code: String,
        request_id: Option<u64>,
    },
    /// A session description of the wrong kind for the message carrying it
    UnexpectedDescription {
        expected: SdpKind,
        request_id: Option<u64>,
    },
}

impl ProtocolError {
    /// Request id recovered from the raw frame, if it carried one
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ProtocolError::Malformed { request_id, .. }
            | ProtocolError::InvalidCode { request_id, .. }
            | ProtocolError::UnexpectedDescription { request_id, .. } => *request_id,
        }
    }

    /// Wire-level reason reported back to the peer
    pub fn signal_error(&self) -> SignalError {
        match self {
            ProtocolError::InvalidCode { .. } => SignalError::InvalidCode,
            _ => SignalError::Malformed,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Malformed { reason, .. } => write!(f, "Malformed message: {}", reason),
            ProtocolError::InvalidCode { code, .. } => {
                write!(f, "Invalid pairing code: {:?}", code)
            }
            ProtocolError::UnexpectedDescription { expected, .. } => {
                write!(f, "Expected a session description of type {}", expected.as_str())
            }
        }
    }
}

impl Error for ProtocolError {}
