//! Pairing endpoints
//!
//! The sender (capture side) claims a code and initiates negotiation; the
//! receiver (display side) registers the code and answers. Both keep their
//! control connection separate from the peer link so a dropped control
//! socket does not take down a working link.

pub mod control;
pub mod receiver;
pub mod sender;
pub mod supervisor;

pub use control::{ControlConnection, ControlEvent};
pub use receiver::{ReceiverEndpoint, ReceiverState};
pub use sender::{SenderEndpoint, SenderState};
pub use supervisor::{LinkStatus, LossDecision, ReconnectionSupervisor, ResumeAction};

use crate::protocol::{IceCandidate, ProtocolError, SignalError};
use crate::transport::TransportError;
use crate::webrtc::{LinkState, PeerConnectionManager, WebRTCError};
use log::info;
use parking_lot::{Mutex, MutexGuard};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use webrtc::peer_connection::RTCPeerConnection;

/// Endpoint errors
#[derive(Debug)]
pub enum EndpointError {
    /// Could not open the control connection
    ControlConnect(String),
    /// Control connection is not open
    ControlUnavailable,
    /// Control connection dropped while a request was outstanding
    ControlLost,
    /// A request or wait ran out of time
    Timeout(String),
    /// The rendezvous server refused a request
    Rejected(SignalError),
    Protocol(ProtocolError),
    WebRTC(WebRTCError),
    Transport(TransportError),
    /// Operation not valid in the current state
    InvalidState(String),
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointError::ControlConnect(msg) => write!(f, "Control connection failed: {}", msg),
            EndpointError::ControlUnavailable => write!(f, "Control connection unavailable"),
            EndpointError::ControlLost => write!(f, "Control connection lost"),
            EndpointError::Timeout(what) => write!(f, "Timed out waiting for {}", what),
            EndpointError::Rejected(reason) => write!(f, "Rejected by server: {}", reason),
            EndpointError::Protocol(e) => write!(f, "{}", e),
            EndpointError::WebRTC(e) => write!(f, "{}", e),
            EndpointError::Transport(e) => write!(f, "{}", e),
            EndpointError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl Error for EndpointError {}

impl From<SignalError> for EndpointError {
    fn from(e: SignalError) -> Self {
        EndpointError::Rejected(e)
    }
}

impl From<ProtocolError> for EndpointError {
    fn from(e: ProtocolError) -> Self {
        EndpointError::Protocol(e)
    }
}

impl From<WebRTCError> for EndpointError {
    fn from(e: WebRTCError) -> Self {
        EndpointError::WebRTC(e)
    }
}

impl From<TransportError> for EndpointError {
    fn from(e: TransportError) -> Self {
        EndpointError::Transport(e)
    }
}

/// State shared between an endpoint handle and its driver task
pub(crate) struct EndpointShared<S> {
    role: &'static str,
    state: watch::Sender<S>,
    supervisor: Mutex<ReconnectionSupervisor>,
    link: Mutex<LinkState>,
    signaling: AtomicBool,
}

impl<S> EndpointShared<S>
where
    S: Copy + PartialEq + fmt::Debug,
{
    pub(crate) fn new(role: &'static str, initial: S) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            role,
            state,
            supervisor: Mutex::new(ReconnectionSupervisor::new()),
            link: Mutex::new(LinkState::New),
            signaling: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> S {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, next: S) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!("{}: {:?} -> {:?}", self.role, previous, next);
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<S> {
        self.state.subscribe()
    }

    pub(crate) fn link_state(&self) -> LinkState {
        *self.link.lock()
    }

    pub(crate) fn set_link_state(&self, state: LinkState) {
        *self.link.lock() = state;
    }

    pub(crate) fn peer_connected(&self) -> bool {
        self.link_state() == LinkState::Connected
    }

    pub(crate) fn signaling_up(&self) -> bool {
        self.signaling.load(Ordering::SeqCst)
    }

    pub(crate) fn set_signaling(&self, up: bool) {
        self.signaling.store(up, Ordering::SeqCst);
    }

    pub(crate) fn supervisor(&self) -> MutexGuard<'_, ReconnectionSupervisor> {
        self.supervisor.lock()
    }

    pub(crate) fn on_resume(&self) -> ResumeAction {
        let peer_connected = self.peer_connected();
        let signaling_up = self.signaling_up();
        self.supervisor().on_resume(peer_connected, signaling_up)
    }

    /// Wait until `done` holds for the current state
    pub(crate) async fn wait_for<F>(&self, timeout: Duration, done: F) -> Result<S, EndpointError>
    where
        F: Fn(S) -> bool,
    {
        let mut rx = self.subscribe();
        tokio::time::timeout(timeout, async {
            loop {
                let current = *rx.borrow_and_update();
                if done(current) {
                    return Ok(current);
                }
                if rx.changed().await.is_err() {
                    return Err(EndpointError::InvalidState("endpoint dropped".to_string()));
                }
            }
        })
        .await
        .map_err(|_| EndpointError::Timeout(format!("{} state", self.role)))?
    }
}

/// Forward peer-connection state changes and local candidates to a driver
pub(crate) fn wire_peer_connection(
    peer_connection: &Arc<RTCPeerConnection>,
    link_tx: mpsc::UnboundedSender<LinkState>,
    ice_tx: mpsc::UnboundedSender<IceCandidate>,
) {
    PeerConnectionManager::setup_state_callback(peer_connection, move |state| {
        let _ = link_tx.send(LinkState::from(state));
    });
    PeerConnectionManager::setup_ice_callback(peer_connection, move |candidate| {
        let _ = ice_tx.send(candidate);
    });
}

/// Next control event, or never once the control connection is gone
pub(crate) async fn next_control_event(
    events: &mut Option<mpsc::UnboundedReceiver<ControlEvent>>,
) -> ControlEvent {
    match events {
        Some(rx) => rx.recv().await.unwrap_or(ControlEvent::Lost),
        None => std::future::pending().await,
    }
}
