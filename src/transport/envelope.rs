//! Data-channel envelopes
//!
//! Small messages travel as `{type, data, timestamp}`. A large string payload
//! is split into `{type: "<type>-chunk", data: {id, index, total, chunk}}`
//! envelopes sharing one id.

use super::TransportError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Suffix marking a chunk envelope type
pub const CHUNK_SUFFIX: &str = "-chunk";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: u64,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: unix_millis(),
        }
    }

    pub fn is_chunk(&self) -> bool {
        self.kind.ends_with(CHUNK_SUFFIX)
    }

    /// Logical type of a chunk envelope (`screenshot-chunk` -> `screenshot`)
    pub fn base_kind(&self) -> &str {
        self.kind.strip_suffix(CHUNK_SUFFIX).unwrap_or(&self.kind)
    }

    pub fn from_json(text: &str) -> Result<Self, TransportError> {
        serde_json::from_str(text).map_err(|e| TransportError::InvalidFrame(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::InvalidFrame(e.to_string()))
    }
}

/// Payload of a chunk envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkData {
    pub id: String,
    pub index: usize,
    pub total: usize,
    pub chunk: String,
}

/// Collision-resistant message id: millisecond clock plus 32 random bits
pub fn new_message_id() -> String {
    format!("{:x}-{:08x}", unix_millis(), rand::random::<u32>())
}

/// Bytes a chunk frame adds around its `chunk` text, excluding the type
/// name: field names, id, index, total and timestamp at their widest.
pub const CHUNK_FRAME_OVERHEAD: usize = 192;

/// Length of `ch` once escaped inside a JSON string
fn json_width(ch: char) -> usize {
    match ch {
        '"' | '\\' | '\u{08}' | '\u{0c}' | '\n' | '\r' | '\t' => 2,
        c if (c as u32) < 0x20 => 6,
        c => c.len_utf8(),
    }
}

/// Largest `chunk` text (JSON-escaped bytes) that keeps a `kind` chunk
/// frame within `max_message_size`, capped at `chunk_size`
pub fn chunk_budget(kind: &str, chunk_size: usize, max_message_size: usize) -> usize {
    let kind_width: usize = kind.chars().map(json_width).sum::<usize>() + CHUNK_SUFFIX.len();
    max_message_size
        .saturating_sub(CHUNK_FRAME_OVERHEAD + kind_width)
        .min(chunk_size)
        .max(1)
}

/// Split `text` into pieces whose JSON-escaped length is at most
/// `max_bytes`, never inside a UTF-8 character. A single character wider
/// than `max_bytes` gets its own piece.
pub fn split_utf8(text: &str, max_bytes: usize) -> Vec<&str> {
    let max_bytes = max_bytes.max(1);
    let mut pieces = Vec::with_capacity(text.len() / max_bytes + 1);
    let mut start = 0;
    let mut width = 0;

    for (offset, ch) in text.char_indices() {
        let w = json_width(ch);
        if width + w > max_bytes && offset > start {
            pieces.push(&text[start..offset]);
            start = offset;
            width = 0;
        }
        width += w;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }

    pieces
}

/// Chunk envelopes for one logical `kind` message
pub fn chunk_envelopes(kind: &str, text: &str, chunk_size: usize) -> Vec<Envelope> {
    let id = new_message_id();
    let pieces = split_utf8(text, chunk_size);
    let total = pieces.len();
    let chunk_kind = format!("{}{}", kind, CHUNK_SUFFIX);
    let timestamp = unix_millis();

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, piece)| Envelope {
            kind: chunk_kind.clone(),
            data: serde_json::json!({
                "id": id,
                "index": index,
                "total": total,
                "chunk": piece,
            }),
            timestamp,
        })
        .collect()
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_megabyte_splits_into_ten_chunks() {
        let payload = "a".repeat(1_000_000);
        let envelopes = chunk_envelopes("screenshot", &payload, 100_000);
        assert_eq!(envelopes.len(), 10);

        let chunks: Vec<ChunkData> = envelopes
            .iter()
            .map(|e| serde_json::from_value(e.data.clone()).unwrap())
            .collect();
        let id = &chunks[0].id;
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(&chunk.id, id);
            assert_eq!(chunk.index, i);
            assert_eq!(chunk.total, 10);
            assert_eq!(chunk.chunk.len(), 100_000);
        }
        assert!(envelopes.iter().all(|e| e.kind == "screenshot-chunk"));
    }

    #[test]
    fn test_split_respects_char_boundaries() {
        let text = "héllo wörld ✓✓✓";
        for max in 1..8 {
            let pieces = split_utf8(text, max);
            assert_eq!(pieces.concat(), text);
            for piece in &pieces {
                assert!(piece.len() <= max.max(3), "piece {:?} too long for {}", piece, max);
            }
        }
    }

    #[test]
    fn test_split_counts_json_escapes() {
        let text = "\"\"\"\"";
        let pieces = split_utf8(text, 4);
        assert_eq!(pieces, vec!["\"\"", "\"\""]);

        let text = "a\u{01}b";
        assert_eq!(split_utf8(text, 6), vec!["a", "\u{01}", "b"]);
    }

    #[test]
    fn test_chunk_frames_fit_the_message_limit() {
        let limit = 2048;
        let text = "q\"\n✓".repeat(2000);
        let budget = chunk_budget("screenshot", 100_000, limit);
        let envelopes = chunk_envelopes("screenshot", &text, budget);
        assert!(envelopes.len() > 1);
        let mut joined = String::new();
        for envelope in &envelopes {
            let frame = envelope.to_json().unwrap();
            assert!(frame.len() <= limit, "frame of {} bytes over {}", frame.len(), limit);
            let chunk: ChunkData = serde_json::from_value(envelope.data.clone()).unwrap();
            joined.push_str(&chunk.chunk);
        }
        assert_eq!(joined, text);
    }

    #[test]
    fn test_chunk_budget_is_capped_by_chunk_size() {
        assert_eq!(chunk_budget("screenshot", 100_000, 1 << 20), 100_000);
        assert!(chunk_budget("screenshot", 100_000, 65_536) < 65_536 - CHUNK_FRAME_OVERHEAD);
    }

    #[test]
    fn test_split_of_empty_text_is_empty() {
        assert!(split_utf8("", 10).is_empty());
    }

    #[test]
    fn test_base_kind_strips_suffix() {
        let env = Envelope::new("clipboard-chunk", Value::Null);
        assert!(env.is_chunk());
        assert_eq!(env.base_kind(), "clipboard");
        let env = Envelope::new("scroll-up", Value::Null);
        assert!(!env.is_chunk());
        assert_eq!(env.base_kind(), "scroll-up");
    }

    #[test]
    fn test_message_ids_differ() {
        let a = new_message_id();
        let b = new_message_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_envelope_tolerates_missing_data() {
        let env = Envelope::from_json(r#"{"type":"quick-answer","timestamp":5}"#).unwrap();
        assert_eq!(env.kind, "quick-answer");
        assert_eq!(env.data, Value::Null);
    }
}
