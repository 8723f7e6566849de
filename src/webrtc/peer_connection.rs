//! WebRTC PeerConnection management
//!
//! Handles the creation and lifecycle of RTCPeerConnection instances.

use super::WebRTCError;
use crate::config::WebRTCConfig;
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Delivery guarantees for a data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    /// Ordered, fully reliable
    Reliable,
    /// Ordered, gives up after this many retransmits
    LimitedRetransmits(u16),
}

/// PeerConnection manager shared by both endpoints
pub struct PeerConnectionManager {
    config: WebRTCConfig,
}

impl PeerConnectionManager {
    /// Create a new PeerConnection manager
    pub fn new(config: WebRTCConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WebRTCConfig {
        &self.config
    }

    /// Create a new PeerConnection with the configured settings
    pub async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, WebRTCError> {
        let mut setting_engine = SettingEngine::default();

        if !self.config.nat1to1_ips.is_empty() {
            setting_engine.set_nat_1to1_ips(self.config.nat1to1_ips.clone(), RTCIceCandidateType::Host);
        }

        if let Some([low, high]) = self.config.ephemeral_udp_port_range {
            let ephemeral = EphemeralUDP::new(low, high)
                .map_err(|e| WebRTCError::ConnectionFailed(format!("Invalid ICE UDP port range: {}", e)))?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        }

        // Data channels only; the media engine is still required by the interceptors
        let mut media_engine = MediaEngine::default();

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let ice_servers = self
            .config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to create peer connection: {}", e)))?;

        Ok(Arc::new(peer_connection))
    }

    /// Set up connection state change callback
    pub fn setup_state_callback(
        peer_connection: &Arc<RTCPeerConnection>,
        callback: impl Fn(RTCPeerConnectionState) + Send + Sync + 'static,
    ) {
        let callback = Arc::new(callback);
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            let callback = callback.clone();
            Box::pin(async move {
                callback(state);
            })
        }));
    }

    /// Set up local ICE candidate callback; end-of-candidates is not forwarded
    pub fn setup_ice_callback(
        peer_connection: &Arc<RTCPeerConnection>,
        callback: impl Fn(IceCandidate) + Send + Sync + 'static,
    ) {
        let callback = Arc::new(callback);
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let callback = callback.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => callback(from_candidate_init(init)),
                    Err(e) => log::warn!("Failed to serialize local ICE candidate: {}", e),
                }
            })
        }));
    }

    /// Create an SDP offer and install it as the local description
    pub async fn create_offer(
        peer_connection: &Arc<RTCPeerConnection>,
    ) -> Result<SessionDescription, WebRTCError> {
        let offer = peer_connection
            .create_offer(None)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to create offer: {}", e)))?;

        peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set local description: {}", e)))?;

        Ok(SessionDescription::offer(offer.sdp))
    }

    /// Create an SDP answer and install it as the local description
    pub async fn create_answer(
        peer_connection: &Arc<RTCPeerConnection>,
    ) -> Result<SessionDescription, WebRTCError> {
        let answer = peer_connection
            .create_answer(None)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to create answer: {}", e)))?;

        peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set local description: {}", e)))?;

        Ok(SessionDescription::answer(answer.sdp))
    }

    /// Install the remote description
    pub async fn set_remote_description(
        peer_connection: &Arc<RTCPeerConnection>,
        description: &SessionDescription,
    ) -> Result<(), WebRTCError> {
        let sdp = description.sdp.clone();
        let remote = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp),
            SdpKind::Answer => RTCSessionDescription::answer(sdp),
        }
        .map_err(|e| WebRTCError::SdpError(format!("Invalid SDP {}: {}", description.kind.as_str(), e)))?;

        peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set remote description: {}", e)))?;

        Ok(())
    }

    /// Add an ICE candidate
    pub async fn add_ice_candidate(
        peer_connection: &Arc<RTCPeerConnection>,
        candidate: &IceCandidate,
    ) -> Result<(), WebRTCError> {
        let candidate_init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };

        peer_connection
            .add_ice_candidate(candidate_init)
            .await
            .map_err(|e| WebRTCError::IceError(format!("Failed to add ICE candidate: {}", e)))?;

        Ok(())
    }

    /// Create a data channel with the given delivery guarantees
    pub async fn create_data_channel(
        peer_connection: &Arc<RTCPeerConnection>,
        label: &str,
        reliability: Reliability,
    ) -> Result<Arc<RTCDataChannel>, WebRTCError> {
        let init = match reliability {
            Reliability::Reliable => RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            },
            Reliability::LimitedRetransmits(max) => RTCDataChannelInit {
                ordered: Some(true),
                max_retransmits: Some(max),
                ..Default::default()
            },
        };

        let channel = peer_connection
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| WebRTCError::DataChannelError(format!("Failed to create data channel {}: {}", label, e)))?;

        Ok(channel)
    }

    /// Close a peer connection
    pub async fn close(peer_connection: &Arc<RTCPeerConnection>) -> Result<(), WebRTCError> {
        peer_connection
            .close()
            .await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to close connection: {}", e)))?;
        Ok(())
    }
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_init_conversion_keeps_fields() {
        let candidate = from_candidate_init(RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: Some("abcd".to_string()),
        });
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.username_fragment.as_deref(), Some("abcd"));
    }

    #[tokio::test]
    async fn test_offer_carries_data_channels() {
        let manager = PeerConnectionManager::new(WebRTCConfig {
            ice_servers: Vec::new(),
            ..WebRTCConfig::default()
        });
        let pc = manager.create_peer_connection().await.unwrap();
        PeerConnectionManager::create_data_channel(&pc, "exam-commands", Reliability::Reliable)
            .await
            .unwrap();
        let offer = PeerConnectionManager::create_offer(&pc).await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("webrtc-datachannel"));
        PeerConnectionManager::close(&pc).await.unwrap();
    }
}
