//! Negotiation session shared by both endpoints
//!
//! Remote ICE candidates can arrive before the remote description is set
//! (and on the receiving side, before any peer connection exists at all).
//! They are queued in receipt order and flushed right after the remote
//! description is applied; later candidates are applied immediately.

use super::data_channel::ChannelKind;
use super::peer_connection::PeerConnectionManager;
use super::WebRTCError;
use crate::protocol::{IceCandidate, SessionDescription};
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;

/// Ordered holding area for early ICE candidates
#[derive(Debug, Default)]
pub struct IceBuffer {
    remote_ready: bool,
    queued: VecDeque<IceCandidate>,
}

impl IceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a candidate. Returns it back when it can be applied right away,
    /// otherwise keeps it until [`IceBuffer::mark_remote_ready`].
    pub fn push(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_ready {
            Some(candidate)
        } else {
            self.queued.push_back(candidate);
            None
        }
    }

    /// Remote description is now set; drain the queue in receipt order
    pub fn mark_remote_ready(&mut self) -> Vec<IceCandidate> {
        self.remote_ready = true;
        self.queued.drain(..).collect()
    }

    pub fn is_remote_ready(&self) -> bool {
        self.remote_ready
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn reset(&mut self) {
        self.remote_ready = false;
        self.queued.clear();
    }
}

/// Per-attempt negotiation state, owned by a single endpoint task
#[derive(Default)]
pub struct NegotiationSession {
    peer_connection: Option<Arc<RTCPeerConnection>>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    ice: IceBuffer,
    channels: HashMap<ChannelKind, Arc<RTCDataChannel>>,
}

impl NegotiationSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_peer_connection(&self) -> bool {
        self.peer_connection.is_some()
    }

    pub fn peer_connection(&self) -> Option<&Arc<RTCPeerConnection>> {
        self.peer_connection.as_ref()
    }

    /// Attach the peer connection this session negotiates
    pub fn attach(&mut self, peer_connection: Arc<RTCPeerConnection>) {
        self.peer_connection = Some(peer_connection);
    }

    pub fn set_local_description(&mut self, description: SessionDescription) {
        self.local_description = Some(description);
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn queued_candidates(&self) -> usize {
        self.ice.queued_len()
    }

    /// Apply the remote description, then flush queued candidates.
    /// Returns how many queued candidates were applied.
    pub async fn apply_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<usize, WebRTCError> {
        let pc = self
            .peer_connection
            .clone()
            .ok_or_else(|| WebRTCError::InvalidState("no peer connection for remote description".to_string()))?;

        PeerConnectionManager::set_remote_description(&pc, &description).await?;
        self.remote_description = Some(description);

        let queued = self.ice.mark_remote_ready();
        let mut applied = 0;
        for candidate in queued {
            match PeerConnectionManager::add_ice_candidate(&pc, &candidate).await {
                Ok(()) => applied += 1,
                Err(e) => warn!("Dropping queued ICE candidate: {}", e),
            }
        }
        if applied > 0 {
            debug!("Flushed {} queued ICE candidate(s)", applied);
        }
        Ok(applied)
    }

    /// Apply a remote candidate now, or queue it. Returns true if applied.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<bool, WebRTCError> {
        let Some(pc) = self.peer_connection.clone() else {
            self.ice.queued.push_back(candidate);
            return Ok(false);
        };

        match self.ice.push(candidate) {
            Some(candidate) => {
                PeerConnectionManager::add_ice_candidate(&pc, &candidate).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn add_channel(&mut self, kind: ChannelKind, channel: Arc<RTCDataChannel>) {
        self.channels.insert(kind, channel);
    }

    pub fn channel(&self, kind: ChannelKind) -> Option<&Arc<RTCDataChannel>> {
        self.channels.get(&kind)
    }

    /// Close channels, then the peer connection, and forget all state
    pub async fn close(&mut self) {
        for (kind, channel) in self.channels.drain() {
            if let Err(e) = channel.close().await {
                debug!("Closing {} channel: {}", kind.label(), e);
            }
        }
        if let Some(pc) = self.peer_connection.take() {
            if let Err(e) = PeerConnectionManager::close(&pc).await {
                debug!("{}", e);
            }
        }
        self.local_description = None;
        self.remote_description = None;
        self.ice.reset();
    }
}
