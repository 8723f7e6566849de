//! Chunked send loop and reassembly

use super::envelope::{chunk_budget, chunk_envelopes, ChunkData, Envelope};
use super::{ChannelSink, TransportError};
use crate::config::TransportConfig;
use log::{debug, trace, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Chunking and pacing parameters
#[derive(Debug, Clone)]
pub struct ChunkSettings {
    pub threshold: usize,
    pub chunk_size: usize,
    /// Largest frame the channel accepts
    pub max_message_size: usize,
    pub high_watermark: usize,
    pub poll_interval: Duration,
    pub max_chunks: usize,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        ChunkSettings::from(&TransportConfig::default())
    }
}

impl From<&TransportConfig> for ChunkSettings {
    fn from(config: &TransportConfig) -> Self {
        Self {
            threshold: config.chunk_threshold,
            chunk_size: config.chunk_size,
            max_message_size: config.max_message_size,
            high_watermark: config.buffered_high_watermark,
            poll_interval: Duration::from_millis(config.backpressure_poll_ms),
            max_chunks: config.max_chunks,
        }
    }
}

/// Sends envelopes over a channel, chunking large string payloads and
/// pausing while the channel's send buffer is above the watermark.
///
/// Chunks of one message must not interleave with another send of the
/// same message on the same channel; distinct messages may.
#[derive(Debug, Clone, Default)]
pub struct ChunkedSender {
    settings: ChunkSettings,
}

impl ChunkedSender {
    pub fn new(settings: ChunkSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ChunkSettings {
        &self.settings
    }

    /// Send one logical message; returns the number of frames written
    pub async fn send_message<S>(
        &self,
        sink: &S,
        kind: &str,
        data: Value,
    ) -> Result<usize, TransportError>
    where
        S: ChannelSink + ?Sized,
    {
        if let Value::String(ref text) = data {
            if text.len() > self.settings.threshold {
                return self.send_chunked(sink, kind, text).await;
            }
        }

        let envelope = Envelope::new(kind, data);
        let frame = envelope.to_json()?;
        if frame.len() > self.settings.max_message_size {
            if let Value::String(ref text) = envelope.data {
                debug!("{} frame of {} bytes exceeds the channel limit; chunking", kind, frame.len());
                return self.send_chunked(sink, kind, text).await;
            }
        }
        self.send_frame(sink, frame).await?;
        Ok(1)
    }

    /// Send a pre-encoded frame, honouring the watermark
    pub async fn send_frame<S>(&self, sink: &S, frame: String) -> Result<(), TransportError>
    where
        S: ChannelSink + ?Sized,
    {
        if frame.len() > self.settings.max_message_size {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                limit: self.settings.max_message_size,
            });
        }
        self.wait_for_buffer(sink).await?;
        sink.send_frame(frame).await
    }

    async fn send_chunked<S>(&self, sink: &S, kind: &str, text: &str) -> Result<usize, TransportError>
    where
        S: ChannelSink + ?Sized,
    {
        let budget = chunk_budget(kind, self.settings.chunk_size, self.settings.max_message_size);
        let envelopes = chunk_envelopes(kind, text, budget);
        let total = envelopes.len();
        debug!(
            "Sending {} ({} bytes) as {} chunks on {}",
            kind,
            text.len(),
            total,
            sink.channel_label()
        );

        for envelope in envelopes {
            let frame = envelope.to_json()?;
            self.send_frame(sink, frame).await?;
        }
        Ok(total)
    }

    /// Poll the buffered byte count until it drops to the watermark
    async fn wait_for_buffer<S>(&self, sink: &S) -> Result<(), TransportError>
    where
        S: ChannelSink + ?Sized,
    {
        let mut waited = false;
        loop {
            if sink.is_connecting() {
                tokio::time::sleep(self.settings.poll_interval).await;
                continue;
            }
            if !sink.is_open() {
                return Err(TransportError::ChannelClosed(sink.channel_label()));
            }
            let buffered = sink.buffered_bytes().await;
            if buffered <= self.settings.high_watermark {
                return Ok(());
            }
            if !waited {
                debug!(
                    "Backpressure on {}: {} bytes buffered (watermark {})",
                    sink.channel_label(),
                    buffered,
                    self.settings.high_watermark
                );
                waited = true;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
}

#[derive(Debug)]
struct Assembly {
    kind: String,
    slots: Vec<Option<String>>,
    filled: usize,
    timestamp: u64,
}

/// Receive-side reassembly of chunked messages, keyed by message id
#[derive(Debug)]
pub struct ChunkAssembler {
    pending: HashMap<String, Assembly>,
    max_chunks: usize,
}

impl Default for ChunkAssembler {
    fn default() -> Self {
        Self::new(ChunkSettings::default().max_chunks)
    }
}

impl ChunkAssembler {
    pub fn new(max_chunks: usize) -> Self {
        Self {
            pending: HashMap::new(),
            max_chunks,
        }
    }

    /// Number of incomplete messages
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Decode and feed one frame
    pub fn accept_frame(&mut self, frame: &str) -> Result<Option<Envelope>, TransportError> {
        self.accept(Envelope::from_json(frame)?)
    }

    /// Feed one envelope. Plain envelopes pass straight through; a chunk
    /// yields the reassembled logical message once its last slot fills.
    pub fn accept(&mut self, envelope: Envelope) -> Result<Option<Envelope>, TransportError> {
        if !envelope.is_chunk() {
            return Ok(Some(envelope));
        }

        let kind = envelope.base_kind().to_string();
        let chunk: ChunkData = serde_json::from_value(envelope.data)
            .map_err(|e| TransportError::InvalidChunk(e.to_string()))?;

        if chunk.total == 0 || chunk.total > self.max_chunks {
            return Err(TransportError::InvalidChunk(format!(
                "message {} declares {} chunks (max {})",
                chunk.id, chunk.total, self.max_chunks
            )));
        }
        if chunk.index >= chunk.total {
            return Err(TransportError::InvalidChunk(format!(
                "message {} chunk index {} out of range {}",
                chunk.id, chunk.index, chunk.total
            )));
        }

        let assembly = self.pending.entry(chunk.id.clone()).or_insert_with(|| Assembly {
            kind: kind.clone(),
            slots: vec![None; chunk.total],
            filled: 0,
            timestamp: envelope.timestamp,
        });

        if assembly.slots.len() != chunk.total || assembly.kind != kind {
            return Err(TransportError::InvalidChunk(format!(
                "message {} chunk {} disagrees with its first chunk",
                chunk.id, chunk.index
            )));
        }

        let slot = &mut assembly.slots[chunk.index];
        if slot.is_some() {
            warn!("Duplicate chunk {} of message {} ignored", chunk.index, chunk.id);
            return Ok(None);
        }
        *slot = Some(chunk.chunk);
        assembly.filled += 1;

        if assembly.filled < assembly.slots.len() {
            return Ok(None);
        }

        let Some(assembly) = self.pending.remove(&chunk.id) else {
            return Ok(None);
        };
        let text: String = assembly.slots.into_iter().flatten().collect();
        debug!("Reassembled {} ({} bytes) from {} chunks", assembly.kind, text.len(), chunk.total);

        Ok(Some(Envelope {
            kind: assembly.kind,
            data: Value::String(text),
            timestamp: assembly.timestamp,
        }))
    }

    /// Drop every partial message (channel closed); returns how many
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        if dropped > 0 {
            trace!("Discarding {} incomplete chunked message(s)", dropped);
        }
        self.pending.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Sink that records frames and drains a fake buffer on every poll.
    /// Like an SCTP stream it refuses frames over its message limit.
    struct RecordingSink {
        frames: Mutex<Vec<String>>,
        buffered: AtomicUsize,
        drain_per_poll: usize,
        polls: AtomicUsize,
        open: AtomicBool,
        connecting_polls: AtomicUsize,
        limit: usize,
    }

    impl RecordingSink {
        fn new(initial_buffered: usize, drain_per_poll: usize) -> Self {
            Self::with_limit(initial_buffered, drain_per_poll, 65_536)
        }

        fn with_limit(initial_buffered: usize, drain_per_poll: usize, limit: usize) -> Self {
            Self {
                frames: Mutex::new(Vec::new()),
                buffered: AtomicUsize::new(initial_buffered),
                drain_per_poll,
                polls: AtomicUsize::new(0),
                open: AtomicBool::new(true),
                connecting_polls: AtomicUsize::new(0),
                limit,
            }
        }

        fn frames(&self) -> Vec<String> {
            self.frames.lock().clone()
        }
    }

    #[async_trait]
    impl ChannelSink for RecordingSink {
        fn channel_label(&self) -> String {
            "test".to_string()
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn is_connecting(&self) -> bool {
            self.connecting_polls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }

        async fn buffered_bytes(&self) -> usize {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let current = self.buffered.load(Ordering::SeqCst);
            self.buffered
                .store(current.saturating_sub(self.drain_per_poll), Ordering::SeqCst);
            current
        }

        async fn send_frame(&self, frame: String) -> Result<(), TransportError> {
            if frame.len() > self.limit {
                return Err(TransportError::SendFailed("outbound packet larger than maximum message size".into()));
            }
            self.frames.lock().push(frame);
            Ok(())
        }
    }

    fn fast_settings() -> ChunkSettings {
        ChunkSettings {
            poll_interval: Duration::from_millis(1),
            ..ChunkSettings::default()
        }
    }

    /// A link that accepts frames far larger than any chunk
    fn wide_settings() -> ChunkSettings {
        ChunkSettings {
            max_message_size: 1 << 20,
            ..fast_settings()
        }
    }

    fn reassemble(frames: &[String]) -> Vec<Envelope> {
        let mut assembler = ChunkAssembler::default();
        frames
            .iter()
            .filter_map(|f| assembler.accept_frame(f).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_small_payload_is_sent_whole() {
        let sink = RecordingSink::new(0, 0);
        let sender = ChunkedSender::new(fast_settings());
        let frames = sender
            .send_message(&sink, "clipboard", Value::String("hello".to_string()))
            .await
            .unwrap();
        assert_eq!(frames, 1);

        let sent = Envelope::from_json(&sink.frames()[0]).unwrap();
        assert_eq!(sent.kind, "clipboard");
        assert_eq!(sent.data, Value::String("hello".to_string()));
        assert!(sent.timestamp > 0);
    }

    #[tokio::test]
    async fn test_payload_at_threshold_is_not_chunked() {
        let sink = RecordingSink::with_limit(0, 0, 1 << 20);
        let sender = ChunkedSender::new(wide_settings());
        let payload = "x".repeat(200_000);
        assert_eq!(
            sender.send_message(&sink, "screenshot", Value::String(payload)).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_one_megabyte_round_trips_through_ten_chunks() {
        let sink = RecordingSink::with_limit(0, 0, 1 << 20);
        let sender = ChunkedSender::new(wide_settings());
        let payload: String = (0..1_000_000u32)
            .map(|i| char::from(b'a' + (i % 26) as u8))
            .collect();

        let frames = sender
            .send_message(&sink, "screenshot", Value::String(payload.clone()))
            .await
            .unwrap();
        assert_eq!(frames, 10);

        let sent = sink.frames();
        let ids: Vec<String> = sent
            .iter()
            .map(|f| {
                let env = Envelope::from_json(f).unwrap();
                assert_eq!(env.kind, "screenshot-chunk");
                let chunk: ChunkData = serde_json::from_value(env.data).unwrap();
                assert_eq!(chunk.total, 10);
                chunk.id
            })
            .collect();
        assert!(ids.iter().all(|id| id == &ids[0]));

        let out = reassemble(&sent);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, "screenshot");
        assert_eq!(out[0].data, Value::String(payload));
    }

    #[tokio::test]
    async fn test_chunks_fit_the_default_sctp_limit() {
        let sink = RecordingSink::new(0, 0);
        let sender = ChunkedSender::new(fast_settings());
        let payload = "q".repeat(1_000_000);

        let frames = sender
            .send_message(&sink, "screenshot", Value::String(payload.clone()))
            .await
            .unwrap();
        assert_eq!(frames, 16);
        assert!(sink.frames().iter().all(|f| f.len() <= 65_536));

        let out = reassemble(&sink.frames());
        assert_eq!(out[0].data, Value::String(payload));
    }

    #[tokio::test]
    async fn test_payload_under_threshold_but_over_limit_is_chunked() {
        let sink = RecordingSink::new(0, 0);
        let sender = ChunkedSender::new(fast_settings());
        let payload = "\"".repeat(40_000);

        let frames = sender
            .send_message(&sink, "clipboard", Value::String(payload.clone()))
            .await
            .unwrap();
        assert_eq!(frames, 2);
        let out = reassemble(&sink.frames());
        assert_eq!(out[0].kind, "clipboard");
        assert_eq!(out[0].data, Value::String(payload));
    }

    #[tokio::test]
    async fn test_oversized_raw_frame_is_refused_before_sending() {
        let sink = RecordingSink::new(0, 0);
        let sender = ChunkedSender::new(fast_settings());
        let err = sender.send_frame(&sink, "x".repeat(70_000)).await.unwrap_err();
        assert_eq!(err, TransportError::FrameTooLarge { size: 70_000, limit: 65_536 });
        assert!(sink.frames().is_empty());
    }

    #[tokio::test]
    async fn test_sender_waits_for_channel_to_open() {
        let sink = RecordingSink::new(0, 0);
        sink.connecting_polls.store(3, Ordering::SeqCst);
        let sender = ChunkedSender::new(fast_settings());
        sender.send_message(&sink, "scroll-down", Value::Null).await.unwrap();
        assert_eq!(sink.frames().len(), 1);
        assert_eq!(sink.connecting_polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_multibyte_payload_round_trips() {
        let sink = RecordingSink::new(0, 0);
        let sender = ChunkedSender::new(fast_settings());
        let payload = "剪贴板✓é".repeat(30_000);
        let frames = sender
            .send_message(&sink, "clipboard", Value::String(payload.clone()))
            .await
            .unwrap();
        assert!(frames > 1);
        let out = reassemble(&sink.frames());
        assert_eq!(out[0].data, Value::String(payload));
    }

    #[tokio::test]
    async fn test_sender_waits_for_buffer_to_drain() {
        let sink = RecordingSink::new(200_000, 40_000);
        let sender = ChunkedSender::new(fast_settings());
        sender
            .send_message(&sink, "scroll-up", Value::Null)
            .await
            .unwrap();
        // 200k -> 160k -> 120k -> 80k -> 40k: the fifth poll is under the watermark
        assert_eq!(sink.polls.load(Ordering::SeqCst), 5);
        assert_eq!(sink.frames().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_channel_aborts_send() {
        let sink = RecordingSink::new(0, 0);
        sink.open.store(false, Ordering::SeqCst);
        let sender = ChunkedSender::new(fast_settings());
        let err = sender
            .send_message(&sink, "quick-answer", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::ChannelClosed("test".to_string()));
        assert!(sink.frames().is_empty());
    }

    #[test]
    fn test_interleaved_messages_reassemble_independently() {
        let a = chunk_envelopes("screenshot", &"a".repeat(250), 100);
        let b = chunk_envelopes("clipboard", &"b".repeat(150), 100);
        let mut assembler = ChunkAssembler::default();
        let mut out = Vec::new();
        for env in [&a[0], &b[0], &a[1], &b[1], &a[2]] {
            if let Some(done) = assembler.accept(env.clone()).unwrap() {
                out.push(done);
            }
        }
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].kind, "clipboard");
        assert_eq!(out[0].data, Value::String("b".repeat(150)));
        assert_eq!(out[1].kind, "screenshot");
        assert_eq!(out[1].data, Value::String("a".repeat(250)));
        assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn test_chunks_out_of_order_fill_their_slots() {
        let envs = chunk_envelopes("clipboard", "abcdefghij", 3);
        let mut assembler = ChunkAssembler::default();
        let mut result = None;
        for env in envs.iter().rev() {
            result = assembler.accept(env.clone()).unwrap();
        }
        assert_eq!(result.unwrap().data, Value::String("abcdefghij".to_string()));
    }

    #[test]
    fn test_duplicate_chunk_is_ignored() {
        let envs = chunk_envelopes("clipboard", "abcdef", 2);
        let mut assembler = ChunkAssembler::default();
        assert!(assembler.accept(envs[0].clone()).unwrap().is_none());
        assert!(assembler.accept(envs[0].clone()).unwrap().is_none());
        assert!(assembler.accept(envs[1].clone()).unwrap().is_none());
        let done = assembler.accept(envs[2].clone()).unwrap().unwrap();
        assert_eq!(done.data, Value::String("abcdef".to_string()));
    }

    #[test]
    fn test_inconsistent_chunks_are_rejected() {
        let mut assembler = ChunkAssembler::new(8);
        let chunk = |index: usize, total: usize| {
            Envelope::new(
                "screenshot-chunk",
                serde_json::json!({"id": "m1", "index": index, "total": total, "chunk": "x"}),
            )
        };

        assert!(matches!(assembler.accept(chunk(3, 3)), Err(TransportError::InvalidChunk(_))));
        assert!(matches!(assembler.accept(chunk(0, 0)), Err(TransportError::InvalidChunk(_))));
        assert!(matches!(assembler.accept(chunk(0, 9)), Err(TransportError::InvalidChunk(_))));
        assert!(assembler.accept(chunk(0, 3)).unwrap().is_none());
        assert!(matches!(assembler.accept(chunk(1, 4)), Err(TransportError::InvalidChunk(_))));
    }

    #[test]
    fn test_clear_discards_partial_messages() {
        let envs = chunk_envelopes("screenshot", &"z".repeat(300), 100);
        let mut assembler = ChunkAssembler::default();
        assembler.accept(envs[0].clone()).unwrap();
        assembler.accept(envs[1].clone()).unwrap();
        assert_eq!(assembler.clear(), 1);
        assert_eq!(assembler.pending_count(), 0);
        // The tail alone never completes the message
        assert!(assembler.accept(envs[2].clone()).unwrap().is_none());
    }
}
