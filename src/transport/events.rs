//! Application payloads carried over the data channels
//!
//! The commands channel carries discrete [`Command`]s inside envelopes. The
//! text channel carries bare [`TextEvent`] frames.

use super::envelope::{unix_millis, Envelope};
use super::TransportError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discrete actions sent from the capture side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Captured image, base64 encoded
    Screenshot(String),
    /// Ask the display side to answer now
    QuickAnswer,
    ScrollUp,
    ScrollDown,
    /// Arbitrary clipboard text
    Clipboard(String),
}

impl Command {
    pub const SCREENSHOT: &'static str = "screenshot";
    pub const QUICK_ANSWER: &'static str = "quick-answer";
    pub const SCROLL_UP: &'static str = "scroll-up";
    pub const SCROLL_DOWN: &'static str = "scroll-down";
    pub const CLIPBOARD: &'static str = "clipboard";

    pub fn kind(&self) -> &'static str {
        match self {
            Command::Screenshot(_) => Self::SCREENSHOT,
            Command::QuickAnswer => Self::QUICK_ANSWER,
            Command::ScrollUp => Self::SCROLL_UP,
            Command::ScrollDown => Self::SCROLL_DOWN,
            Command::Clipboard(_) => Self::CLIPBOARD,
        }
    }

    /// Envelope type and data for sending
    pub fn into_parts(self) -> (&'static str, Value) {
        let kind = self.kind();
        let data = match self {
            Command::Screenshot(image) => Value::String(image),
            Command::Clipboard(text) => Value::String(text),
            Command::QuickAnswer | Command::ScrollUp | Command::ScrollDown => Value::Null,
        };
        (kind, data)
    }

    /// Decode a complete (already reassembled) envelope
    pub fn from_envelope(envelope: Envelope) -> Result<Self, TransportError> {
        let text = |data: Value| match data {
            Value::String(s) => Ok(s),
            other => Err(TransportError::InvalidFrame(format!(
                "{} expects string data, got {}",
                envelope.kind, other
            ))),
        };

        match envelope.kind.as_str() {
            Self::SCREENSHOT => Ok(Command::Screenshot(text(envelope.data.clone())?)),
            Self::CLIPBOARD => Ok(Command::Clipboard(text(envelope.data.clone())?)),
            Self::QUICK_ANSWER => Ok(Command::QuickAnswer),
            Self::SCROLL_UP => Ok(Command::ScrollUp),
            Self::SCROLL_DOWN => Ok(Command::ScrollDown),
            other => Err(TransportError::UnknownType(other.to_string())),
        }
    }
}

/// Speaker a text or volume event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Interviewee,
    Interviewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecognitionStatus {
    Pending,
    Received,
}

/// Continuous telemetry on the text channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TextEvent {
    /// Interim hypothesis, may still change
    Recognizing {
        role: Role,
        text: String,
        status: RecognitionStatus,
        timestamp: u64,
    },
    /// Final text for an utterance
    Recognized {
        role: Role,
        text: String,
        status: RecognitionStatus,
        timestamp: u64,
    },
    /// Input level, 0-100
    Volume {
        role: Role,
        volume: u8,
        timestamp: u64,
    },
}

impl TextEvent {
    pub fn recognizing(role: Role, text: impl Into<String>) -> Self {
        TextEvent::Recognizing {
            role,
            text: text.into(),
            status: RecognitionStatus::Pending,
            timestamp: unix_millis(),
        }
    }

    pub fn recognized(role: Role, text: impl Into<String>) -> Self {
        TextEvent::Recognized {
            role,
            text: text.into(),
            status: RecognitionStatus::Received,
            timestamp: unix_millis(),
        }
    }

    pub fn volume(role: Role, volume: u8) -> Self {
        TextEvent::Volume {
            role,
            volume: volume.min(100),
            timestamp: unix_millis(),
        }
    }

    /// Volume event from an RMS level in `[0.0, 1.0]`
    pub fn volume_from_rms(role: Role, rms: f32) -> Self {
        let level = if rms.is_finite() { rms.clamp(0.0, 1.0) } else { 0.0 };
        Self::volume(role, (level * 100.0).round() as u8)
    }

    pub fn role(&self) -> Role {
        match self {
            TextEvent::Recognizing { role, .. }
            | TextEvent::Recognized { role, .. }
            | TextEvent::Volume { role, .. } => *role,
        }
    }

    pub fn from_json(text: &str) -> Result<Self, TransportError> {
        let event: TextEvent =
            serde_json::from_str(text).map_err(|e| TransportError::InvalidFrame(e.to_string()))?;
        if let TextEvent::Volume { volume, .. } = event {
            if volume > 100 {
                return Err(TransportError::InvalidFrame(format!("volume {} out of range", volume)));
            }
        }
        Ok(event)
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::InvalidFrame(e.to_string()))
    }
}
