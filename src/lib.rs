//! pairlink - code-based peer pairing
//!
//! A rendezvous server hands out short-lived numeric pairing codes and relays
//! the WebRTC offer/answer/ICE exchange; after that, commands and telemetry
//! flow peer-to-peer over data channels with a chunked message protocol.

pub mod config;
pub mod endpoint;
pub mod protocol;
pub mod rendezvous;
pub mod transport;
pub mod webrtc;

// Re-exports
pub use config::Config;
pub use endpoint::{EndpointError, ReceiverEndpoint, ReceiverState, SenderEndpoint, SenderState};
pub use protocol::{ClientMessage, ServerMessage, SignalError};
pub use rendezvous::run_rendezvous_server;
pub use transport::{Command, Role, TextEvent};
pub use webrtc::InboundEvent;
