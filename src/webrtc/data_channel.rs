//! Data channel wiring
//!
//! Two channels are opened by the sender on every pairing:
//! `exam-commands` (ordered, reliable) carries [`Command`] envelopes, possibly
//! chunked; `recognition-text` (ordered, limited retransmits) carries bare
//! [`TextEvent`] frames.

use crate::transport::{ChannelSink, ChunkAssembler, Command, TextEvent, TransportError};
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

pub const COMMANDS_LABEL: &str = "exam-commands";
pub const TEXT_LABEL: &str = "recognition-text";

/// Which of the two application channels a data channel is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Commands,
    Text,
}

impl ChannelKind {
    pub fn label(&self) -> &'static str {
        match self {
            ChannelKind::Commands => COMMANDS_LABEL,
            ChannelKind::Text => TEXT_LABEL,
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            COMMANDS_LABEL => Some(ChannelKind::Commands),
            TEXT_LABEL => Some(ChannelKind::Text),
            _ => None,
        }
    }
}

/// Decoded application message, handed to the layer above the receiver
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Command(Command),
    Text(TextEvent),
}

pub type InboundHandler = Arc<dyn Fn(InboundEvent) + Send + Sync>;

#[async_trait]
impl ChannelSink for RTCDataChannel {
    fn channel_label(&self) -> String {
        self.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.ready_state() == RTCDataChannelState::Open
    }

    fn is_connecting(&self) -> bool {
        self.ready_state() == RTCDataChannelState::Connecting
    }

    async fn buffered_bytes(&self) -> usize {
        self.buffered_amount().await
    }

    async fn send_frame(&self, frame: String) -> Result<(), TransportError> {
        self.send_text(frame)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(format!("{}: {}", self.label(), e)))
    }
}

/// Per-channel frame decoder
#[derive(Debug)]
pub struct InboundDecoder {
    kind: ChannelKind,
    assembler: ChunkAssembler,
}

impl InboundDecoder {
    pub fn new(kind: ChannelKind, max_chunks: usize) -> Self {
        Self {
            kind,
            assembler: ChunkAssembler::new(max_chunks),
        }
    }

    /// Decode one text frame; `None` while a chunked message is incomplete
    pub fn decode(&mut self, frame: &str) -> Result<Option<InboundEvent>, TransportError> {
        match self.kind {
            ChannelKind::Commands => match self.assembler.accept_frame(frame)? {
                Some(envelope) => Ok(Some(InboundEvent::Command(Command::from_envelope(envelope)?))),
                None => Ok(None),
            },
            ChannelKind::Text => Ok(Some(InboundEvent::Text(TextEvent::from_json(frame)?))),
        }
    }

    /// Channel closed: partial messages are lost
    pub fn reset(&mut self) -> usize {
        self.assembler.clear()
    }
}

/// Route decoded frames from `channel` to `handler`
pub fn attach_inbound(
    channel: &Arc<RTCDataChannel>,
    kind: ChannelKind,
    max_chunks: usize,
    handler: InboundHandler,
) {
    let decoder = Arc::new(Mutex::new(InboundDecoder::new(kind, max_chunks)));

    let message_decoder = decoder.clone();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let decoder = message_decoder.clone();
        let handler = handler.clone();
        Box::pin(async move {
            if !msg.is_string {
                warn!("Ignoring binary frame on {} ({} bytes)", kind.label(), msg.data.len());
                return;
            }
            let text = match std::str::from_utf8(&msg.data) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Ignoring non UTF-8 frame on {}: {}", kind.label(), e);
                    return;
                }
            };

            let decoded = decoder.lock().decode(text);
            match decoded {
                Ok(Some(event)) => handler(event),
                Ok(None) => {}
                Err(e) => warn!("Dropping frame on {}: {}", kind.label(), e),
            }
        })
    }));

    channel.on_close(Box::new(move || {
        let decoder = decoder.clone();
        Box::pin(async move {
            decoder.lock().reset();
            debug!("{} channel closed", kind.label());
        })
    }));
}
