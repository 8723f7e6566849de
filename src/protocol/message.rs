//! Control message types
//!
//! Client and server frames are JSON objects tagged by `type`. Requests that
//! expect a reply carry a `requestId`; the server answers each one with
//! exactly one `ack` bearing the same id.

use super::ProtocolError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Number of digits in a pairing code
pub const PAIRING_CODE_LEN: usize = 6;

/// Server-assigned identity of one control connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn generate() -> Self {
        ClientId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        ClientId(value.to_string())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

/// Session description as exchanged through the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }
}

/// ICE candidate as exchanged through the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

/// Wire-level failure reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalError {
    /// Code is live under another owner
    CodeExists,
    /// Code was never registered, or already removed
    NotFound,
    /// Code was found past its expiry and has now been removed
    Expired,
    /// Code is not six digits
    InvalidCode,
    /// One side of the claim already has a peer
    AlreadyPaired,
    /// The owner tried to claim its own code
    SelfPairing,
    /// Relay destination is not connected
    PeerUnavailable,
    /// Caller has no peer to relay to
    NotPaired,
    /// Frame failed validation
    Malformed,
}

impl SignalError {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalError::CodeExists => "code exists",
            SignalError::NotFound => "not found",
            SignalError::Expired => "expired",
            SignalError::InvalidCode => "invalid code",
            SignalError::AlreadyPaired => "already paired",
            SignalError::SelfPairing => "cannot pair with own code",
            SignalError::PeerUnavailable => "peer unavailable",
            SignalError::NotPaired => "not paired",
            SignalError::Malformed => "malformed message",
        }
    }
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages sent by endpoints to the rendezvous server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Receiver claims ownership of a code
    RegisterPairingCode {
        request_id: u64,
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume_from: Option<ClientId>,
    },

    /// Sender claims a code registered by a receiver, or with `resume_from`
    /// re-attaches its side of an existing pair after reconnecting
    ConnectWithCode {
        request_id: u64,
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume_from: Option<ClientId>,
    },

    /// SDP offer, addressed by pairing code
    Offer {
        request_id: u64,
        offer: SessionDescription,
        code: String,
    },

    /// SDP answer, addressed through the pair map
    Answer {
        request_id: u64,
        answer: SessionDescription,
    },

    /// Trickled ICE candidate, addressed through the pair map
    IceCandidate {
        candidate: IceCandidate,
    },

    /// Explicit teardown; the peer is told and recovery is suppressed
    ManualDisconnect,
}

impl ClientMessage {
    /// Parse and validate a client frame
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text.trim()).map_err(|e| ProtocolError::Malformed {
            reason: e.to_string(),
            request_id: None,
        })?;
        let request_id = value.get("requestId").and_then(Value::as_u64);

        let message: ClientMessage =
            serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
                reason: e.to_string(),
                request_id,
            })?;
        message.validate()?;
        Ok(message)
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        let request_id = self.request_id();
        let check_code = |code: &str| {
            if is_valid_code(code) {
                Ok(())
            } else {
                Err(ProtocolError::InvalidCode { code: code.to_string(), request_id })
            }
        };

        match self {
            ClientMessage::RegisterPairingCode { code, .. }
            | ClientMessage::ConnectWithCode { code, .. } => check_code(code),
            ClientMessage::Offer { offer, code, .. } => {
                check_code(code)?;
                if offer.kind != SdpKind::Offer {
                    return Err(ProtocolError::UnexpectedDescription {
                        expected: SdpKind::Offer,
                        request_id,
                    });
                }
                Ok(())
            }
            ClientMessage::Answer { answer, .. } => {
                if answer.kind != SdpKind::Answer {
                    return Err(ProtocolError::UnexpectedDescription {
                        expected: SdpKind::Answer,
                        request_id,
                    });
                }
                Ok(())
            }
            ClientMessage::IceCandidate { .. } | ClientMessage::ManualDisconnect => Ok(()),
        }
    }

    /// Id of the acknowledgement this frame expects, if any
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ClientMessage::RegisterPairingCode { request_id, .. }
            | ClientMessage::ConnectWithCode { request_id, .. }
            | ClientMessage::Offer { request_id, .. }
            | ClientMessage::Answer { request_id, .. } => Some(*request_id),
            ClientMessage::IceCandidate { .. } | ClientMessage::ManualDisconnect => None,
        }
    }

    /// Short name used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::RegisterPairingCode { .. } => "register-pairing-code",
            ClientMessage::ConnectWithCode { .. } => "connect-with-code",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "ice-candidate",
            ClientMessage::ManualDisconnect => "manual-disconnect",
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed {
            reason: e.to_string(),
            request_id: self.request_id(),
        })
    }
}

/// Acknowledgement for a request-bearing client message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub request_id: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SignalError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<ClientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<ClientId>,
}

impl Ack {
    pub fn ok(request_id: u64) -> Self {
        Self {
            request_id,
            success: true,
            error: None,
            code: None,
            receiver_id: None,
            sender_id: None,
        }
    }

    pub fn failed(request_id: u64, error: SignalError) -> Self {
        Self {
            error: Some(error),
            success: false,
            ..Self::ok(request_id)
        }
    }

    /// Successful registration of `code`
    pub fn registered(request_id: u64, code: &str) -> Self {
        Self {
            code: Some(code.to_string()),
            ..Self::ok(request_id)
        }
    }

    /// Successful claim linking `receiver_id` and `sender_id`
    pub fn paired(request_id: u64, receiver_id: ClientId, sender_id: ClientId) -> Self {
        Self {
            receiver_id: Some(receiver_id),
            sender_id: Some(sender_id),
            ..Self::ok(request_id)
        }
    }

    /// Turn the ack into a result, keeping the failure reason
    pub fn into_result(self) -> Result<Ack, SignalError> {
        if self.success {
            Ok(self)
        } else {
            Err(self.error.unwrap_or(SignalError::Malformed))
        }
    }
}

/// Messages sent by the rendezvous server to endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// First frame on every control connection
    Welcome {
        client_id: ClientId,
    },

    /// Reply to a request-bearing client message
    Ack(Ack),

    /// A sender claimed this receiver's code
    PeerConnected {
        peer_id: ClientId,
    },

    /// The peer tore the pairing down on purpose
    PeerDisconnected,

    /// Relayed offer
    Offer {
        offer: SessionDescription,
        sender_id: ClientId,
    },

    /// Relayed answer
    Answer {
        answer: SessionDescription,
    },

    /// Relayed ICE candidate
    IceCandidate {
        candidate: IceCandidate,
    },

    /// Failure that has no request to acknowledge
    Error {
        error: SignalError,
        message: String,
    },
}

impl ServerMessage {
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::Malformed {
            reason: e.to_string(),
            request_id: None,
        })
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed {
            reason: e.to_string(),
            request_id: None,
        })
    }

    pub fn error(error: SignalError, message: impl Into<String>) -> Self {
        ServerMessage::Error { error, message: message.into() }
    }
}

/// Whether `code` has the shape of a pairing code
pub fn is_valid_code(code: &str) -> bool {
    code.len() == PAIRING_CODE_LEN && code.bytes().all(|b| b.is_ascii_digit())
}

/// Fresh random six-digit code; leading zeros are kept
pub fn generate_code() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{:06}", n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_register() {
        let msg = ClientMessage::parse(
            r#"{"type":"register-pairing-code","requestId":7,"code":"482913"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::RegisterPairingCode {
                request_id: 7,
                code: "482913".to_string(),
                resume_from: None,
            }
        );
        assert_eq!(msg.request_id(), Some(7));
    }

    #[test]
    fn test_parse_claim_with_resume_from() {
        let msg = ClientMessage::parse(
            r#"{"type":"connect-with-code","requestId":3,"code":"482913","resumeFrom":"old-sender"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::ConnectWithCode {
                request_id: 3,
                code: "482913".to_string(),
                resume_from: Some(ClientId::from("old-sender")),
            }
        );
        let plain = ClientMessage::ConnectWithCode {
            request_id: 1,
            code: "482913".to_string(),
            resume_from: None,
        };
        assert!(!plain.to_json().unwrap().contains("resumeFrom"));
    }

    #[test]
    fn test_parse_offer_with_code() {
        let msg = ClientMessage::parse(
            r#"{"type":"offer","requestId":2,"code":"000123","offer":{"type":"offer","sdp":"v=0"}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Offer { offer, code, .. } => {
                assert_eq!(code, "000123");
                assert_eq!(offer.kind, SdpKind::Offer);
            }
            _ => panic!("Expected Offer"),
        }
    }

    #[test]
    fn test_parse_ice_candidate_camel_case_fields() {
        let msg = ClientMessage::parse(
            r#"{"type":"ice-candidate","candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::IceCandidate { candidate } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            _ => panic!("Expected IceCandidate"),
        }
    }

    #[test]
    fn test_rejects_unknown_type() {
        let err = ClientMessage::parse(r#"{"type":"teleport","requestId":3}"#).unwrap_err();
        assert_eq!(err.signal_error(), SignalError::Malformed);
        assert_eq!(err.request_id(), Some(3));
    }

    #[test]
    fn test_rejects_non_json() {
        let err = ClientMessage::parse("webrtc,offer,v=0").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { request_id: None, .. }));
    }

    #[test]
    fn test_rejects_bad_code_shape() {
        for code in ["12345", "1234567", "12a456", "", "１２３４５６"] {
            let frame = serde_json::json!({
                "type": "connect-with-code",
                "requestId": 1,
                "code": code,
            })
            .to_string();
            let err = ClientMessage::parse(&frame).unwrap_err();
            assert_eq!(err.signal_error(), SignalError::InvalidCode, "code {:?}", code);
        }
    }

    #[test]
    fn test_rejects_answer_carrying_offer() {
        let err = ClientMessage::parse(
            r#"{"type":"answer","requestId":4,"answer":{"type":"offer","sdp":"v=0"}}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnexpectedDescription { expected: SdpKind::Answer, request_id: Some(4) }
        ));
    }

    #[test]
    fn test_manual_disconnect_has_no_request_id() {
        let msg = ClientMessage::parse(r#"{"type":"manual-disconnect"}"#).unwrap();
        assert_eq!(msg, ClientMessage::ManualDisconnect);
        assert_eq!(msg.request_id(), None);
    }

    #[test]
    fn test_ack_serialization_omits_empty_fields() {
        let json = ServerMessage::Ack(Ack::registered(9, "482913")).to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "ack");
        assert_eq!(value["requestId"], 9);
        assert_eq!(value["success"], true);
        assert_eq!(value["code"], "482913");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_failed_ack_reports_kebab_case_reason() {
        let json = ServerMessage::Ack(Ack::failed(1, SignalError::CodeExists)).to_json().unwrap();
        assert!(json.contains(r#""error":"code-exists""#));
        let parsed = ServerMessage::from_json(&json).unwrap();
        match parsed {
            ServerMessage::Ack(ack) => {
                assert_eq!(ack.into_result().unwrap_err(), SignalError::CodeExists);
            }
            _ => panic!("Expected Ack"),
        }
    }

    #[test]
    fn test_relayed_offer_shape() {
        let msg = ServerMessage::Offer {
            offer: SessionDescription::offer("v=0"),
            sender_id: ClientId::from("sender-1"),
        };
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["senderId"], "sender-1");
        assert_eq!(value["offer"]["type"], "offer");
    }

    #[test]
    fn test_generated_codes_are_valid() {
        for _ in 0..200 {
            assert!(is_valid_code(&generate_code()));
        }
    }
}
