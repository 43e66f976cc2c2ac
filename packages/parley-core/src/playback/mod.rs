//! Streaming playback: bursty provider audio in, paced 20ms frames out.
//!
//! The manager owns one stream per call at a time. Provider chunks are
//! codec-aligned once per chunk (decode at the provider rate, resample,
//! encode to egress) and pre-sliced into exact 20ms frames; a per-stream
//! pacer task ([`pacer`]) drains them against a monotonic 20ms clock into
//! the call's outbound sink.
//!
//! Stream state machine: `Priming` → `Playing` ↔ `Stalled` → `Ended`.
//! Priming holds emission until `min_start_ms` of audio is buffered (or
//! the provider finishes early, or chunk arrival pauses longer than the
//! jitter window with something buffered). A playing stream that drops
//! under the low watermark is stalled: it keeps draining real audio while
//! any remains, then substitutes silence to hold downstream timing, and
//! past the fallback timeout asks the orchestrator for the filler file.

pub(crate) mod pacer;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::{decode_to_pcm16, encode_from_pcm16, resample_pcm16, AudioFrame, Codec};
use crate::protocol_constants::FRAME_DURATION_MS;
use crate::state::StreamingConfig;
use crate::utils::now_millis;

/// Errors from the playback manager.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlaybackError {
    /// The call already has a live stream.
    #[error("playback stream already exists for call {0}")]
    StreamAlreadyExists(String),

    /// The stream has ended (or was told to finish); late chunks land here.
    #[error("playback stream closed")]
    StreamClosed,

    /// A chunk arrived in a codec other than the negotiated provider codec.
    #[error("codec mismatch: expected {expected}, got {got}")]
    CodecMismatch { expected: Codec, got: Codec },

    /// No outbound sink is attached for the call.
    #[error("no outbound sink attached for call {0}")]
    NoSink(String),
}

/// Why a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The provider finished and the buffer drained.
    Completed,
    /// Cancelled with a reason tag (barge-in, teardown, sink loss).
    Cancelled(&'static str),
}

/// Notifications from playback toward the orchestrator.
#[derive(Debug, Clone)]
pub enum PlaybackSignal {
    /// The stream left priming and emitted its first frame.
    Started { call_id: String, stream_id: String },
    /// The stream fell under the low watermark with more chunks expected.
    Stalled { call_id: String, stream_id: String },
    /// The stall outlived the fallback timeout; play the filler file.
    FallbackWanted { call_id: String, stream_id: String },
    /// The stream is gone; stats are final.
    Ended {
        call_id: String,
        stream_id: String,
        reason: EndReason,
        frames_emitted: u64,
        underflows: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamPhase {
    Priming,
    Playing,
    Stalled,
    Ended,
}

#[derive(Debug)]
pub(crate) struct StreamInner {
    pub(crate) phase: StreamPhase,
    /// Ready-to-send frames in the egress codec, exactly 20ms each.
    pub(crate) queue: VecDeque<Bytes>,
    /// Partial frame awaiting the next chunk, egress-rate PCM16.
    pub(crate) leftover: Vec<i16>,
    /// `mark_done` has been received; no further chunks are expected.
    pub(crate) done: bool,
    pub(crate) end_reason: Option<EndReason>,
    pub(crate) last_chunk_at: Instant,
    pub(crate) fallback_requested: bool,
    pub(crate) frames_emitted: u64,
    pub(crate) underflows: u64,
    pub(crate) short_reads: u64,
}

impl StreamInner {
    /// Buffered audio depth in milliseconds.
    pub(crate) fn depth_ms(&self, egress: Codec) -> u64 {
        let frame_ms = u64::from(FRAME_DURATION_MS);
        let queued = self.queue.len() as u64 * frame_ms;
        let leftover = self.leftover.len() as u64 * 1000 / u64::from(egress.sample_rate);
        queued + leftover
    }
}

#[derive(Debug)]
pub(crate) struct StreamShared {
    pub(crate) call_id: String,
    pub(crate) stream_id: String,
    /// Realtime providers emit one long logical response; gating is armed
    /// once per turn, never per chunk. The flag travels with the stream so
    /// consumers can tell which discipline applies.
    pub(crate) continuous: bool,
    pub(crate) provider_codec: Codec,
    pub(crate) egress: Codec,
    pub(crate) inner: parking_lot::Mutex<StreamInner>,
    pub(crate) cancel: CancellationToken,
}

/// Handle to one live stream.
#[derive(Debug, Clone)]
pub struct PlaybackHandle {
    shared: Arc<StreamShared>,
}

impl PlaybackHandle {
    /// The stream's id (embeds the call id and start timestamp).
    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.shared.stream_id
    }

    /// Whether this stream uses the continuous (realtime) discipline.
    #[must_use]
    pub fn continuous(&self) -> bool {
        self.shared.continuous
    }

    /// Buffered depth in milliseconds.
    #[must_use]
    pub fn depth_ms(&self) -> u64 {
        self.shared.inner.lock().depth_ms(self.shared.egress)
    }

    /// Feeds one provider chunk.
    ///
    /// Codec alignment happens here, once per chunk: decode at the provider
    /// rate, resample to the egress rate, encode, slice into 20ms frames.
    pub fn push_chunk(&self, pcm: Bytes, codec: Codec) -> Result<(), PlaybackError> {
        if codec != self.shared.provider_codec {
            return Err(PlaybackError::CodecMismatch {
                expected: self.shared.provider_codec,
                got: codec,
            });
        }

        let (samples, truncated) = decode_to_pcm16(&pcm, codec);
        let samples = resample_pcm16(&samples, codec.sample_rate, self.shared.egress.sample_rate)
            .map_err(|_| PlaybackError::CodecMismatch {
                expected: self.shared.provider_codec,
                got: codec,
            })?;

        let mut inner = self.shared.inner.lock();
        if inner.phase == StreamPhase::Ended || inner.done {
            return Err(PlaybackError::StreamClosed);
        }
        if truncated {
            inner.short_reads += 1;
        }

        inner.leftover.extend_from_slice(&samples);
        let frame_samples = self.shared.egress.frame_samples(FRAME_DURATION_MS);
        while inner.leftover.len() >= frame_samples {
            let frame: Vec<i16> = inner.leftover.drain(..frame_samples).collect();
            inner
                .queue
                .push_back(encode_from_pcm16(&frame, self.shared.egress));
        }
        inner.last_chunk_at = Instant::now();
        Ok(())
    }

    /// Marks the provider's response finished: whatever is buffered drains
    /// and the stream ends. A partial trailing frame is padded with silence.
    pub fn mark_done(&self) {
        let mut inner = self.shared.inner.lock();
        if inner.phase == StreamPhase::Ended || inner.done {
            return;
        }
        inner.done = true;
        if !inner.leftover.is_empty() {
            let frame_samples = self.shared.egress.frame_samples(FRAME_DURATION_MS);
            let mut frame = std::mem::take(&mut inner.leftover);
            frame.resize(frame_samples, 0);
            inner
                .queue
                .push_back(encode_from_pcm16(&frame, self.shared.egress));
        }
    }

    /// Cancels the stream: freezes the emitter, flushes the buffer and
    /// ends with `reason`. Late chunks get [`PlaybackError::StreamClosed`].
    pub fn cancel(&self, reason: &'static str) {
        {
            let mut inner = self.shared.inner.lock();
            if inner.phase == StreamPhase::Ended {
                return;
            }
            inner.queue.clear();
            inner.leftover.clear();
            inner.phase = StreamPhase::Ended;
            inner.end_reason = Some(EndReason::Cancelled(reason));
        }
        // Wake the pacer immediately instead of at its next tick.
        self.shared.cancel.cancel();
        log::info!(
            "[Playback] {} cancelled ({})",
            self.shared.stream_id,
            reason
        );
    }
}

pub(crate) struct ManagerInner {
    pub(crate) streams: DashMap<String, Arc<StreamShared>>,
    pub(crate) sinks: DashMap<String, mpsc::Sender<AudioFrame>>,
    pub(crate) config: StreamingConfig,
    pub(crate) signals: mpsc::UnboundedSender<PlaybackSignal>,
}

/// Process-wide playback manager: one live stream per call.
#[derive(Clone)]
pub struct PlaybackManager {
    inner: Arc<ManagerInner>,
}

impl PlaybackManager {
    /// Creates the manager. Signals land on `signals` for the orchestrator.
    #[must_use]
    pub fn new(config: StreamingConfig, signals: mpsc::UnboundedSender<PlaybackSignal>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                streams: DashMap::new(),
                sinks: DashMap::new(),
                config,
                signals,
            }),
        }
    }

    /// Attaches the per-call outbound sink (the transport writer feed).
    pub fn attach_sink(&self, call_id: &str, sink: mpsc::Sender<AudioFrame>) {
        self.inner.sinks.insert(call_id.to_string(), sink);
    }

    /// Detaches the sink at teardown.
    pub fn detach_sink(&self, call_id: &str) {
        self.inner.sinks.remove(call_id);
    }

    /// Starts a stream for a call.
    ///
    /// # Errors
    ///
    /// - [`PlaybackError::StreamAlreadyExists`] while a live stream exists.
    /// - [`PlaybackError::NoSink`] before a sink is attached.
    pub fn start_stream(
        &self,
        call_id: &str,
        continuous: bool,
        provider_codec: Codec,
        egress: Codec,
    ) -> Result<PlaybackHandle, PlaybackError> {
        let sink = self
            .inner
            .sinks
            .get(call_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| PlaybackError::NoSink(call_id.to_string()))?;

        if let Some(existing) = self.inner.streams.get(call_id) {
            if existing.inner.lock().phase != StreamPhase::Ended {
                return Err(PlaybackError::StreamAlreadyExists(call_id.to_string()));
            }
        }

        let stream_id = format!("{call_id}:{}", now_millis());
        let shared = Arc::new(StreamShared {
            call_id: call_id.to_string(),
            stream_id: stream_id.clone(),
            continuous,
            provider_codec,
            egress,
            inner: parking_lot::Mutex::new(StreamInner {
                phase: StreamPhase::Priming,
                queue: VecDeque::new(),
                leftover: Vec::new(),
                done: false,
                end_reason: None,
                last_chunk_at: Instant::now(),
                fallback_requested: false,
                frames_emitted: 0,
                underflows: 0,
                short_reads: 0,
            }),
            cancel: CancellationToken::new(),
        });

        self.inner
            .streams
            .insert(call_id.to_string(), Arc::clone(&shared));
        log::info!(
            "[Playback] {} started (continuous={}, {} -> {})",
            stream_id,
            continuous,
            provider_codec,
            egress
        );

        tokio::spawn(pacer::run(
            Arc::clone(&self.inner),
            Arc::clone(&shared),
            sink,
        ));

        Ok(PlaybackHandle { shared })
    }

    /// Cancels the call's live stream, if any. Idempotent.
    pub fn cancel(&self, call_id: &str, reason: &'static str) {
        if let Some(stream) = self.inner.streams.get(call_id).map(|s| Arc::clone(s.value())) {
            PlaybackHandle { shared: stream }.cancel(reason);
        }
    }

    /// True while the call has a stream that has not ended.
    #[must_use]
    pub fn has_active(&self, call_id: &str) -> bool {
        self.inner
            .streams
            .get(call_id)
            .is_some_and(|s| s.inner.lock().phase != StreamPhase::Ended)
    }

    /// Buffered depth of the call's stream (ms), if one exists.
    #[must_use]
    pub fn depth_ms(&self, call_id: &str) -> Option<u64> {
        self.inner
            .streams
            .get(call_id)
            .map(|s| s.inner.lock().depth_ms(s.egress))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm16_to_bytes;

    fn manager() -> (PlaybackManager, mpsc::UnboundedReceiver<PlaybackSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PlaybackManager::new(StreamingConfig::default(), tx), rx)
    }

    fn chunk_ms(ms: u64, rate: u32) -> Bytes {
        pcm16_to_bytes(&vec![1000i16; (u64::from(rate) * ms / 1000) as usize])
    }

    #[tokio::test]
    async fn start_requires_a_sink() {
        let (manager, _rx) = manager();
        let err = manager
            .start_stream("c1", false, Codec::pcm16(24000), Codec::mulaw_8k())
            .unwrap_err();
        assert_eq!(err, PlaybackError::NoSink("c1".to_string()));
    }

    #[tokio::test]
    async fn second_live_stream_is_rejected() {
        let (manager, _rx) = manager();
        let (sink, _keep) = mpsc::channel(64);
        manager.attach_sink("c1", sink);

        let _first = manager
            .start_stream("c1", false, Codec::pcm16(24000), Codec::mulaw_8k())
            .unwrap();
        let err = manager
            .start_stream("c1", false, Codec::pcm16(24000), Codec::mulaw_8k())
            .unwrap_err();
        assert_eq!(err, PlaybackError::StreamAlreadyExists("c1".to_string()));
    }

    #[tokio::test]
    async fn chunk_in_wrong_codec_is_rejected() {
        let (manager, _rx) = manager();
        let (sink, _keep) = mpsc::channel(64);
        manager.attach_sink("c1", sink);
        let handle = manager
            .start_stream("c1", false, Codec::pcm16(24000), Codec::mulaw_8k())
            .unwrap();

        let err = handle
            .push_chunk(chunk_ms(20, 16000), Codec::pcm16(16000))
            .unwrap_err();
        assert!(matches!(err, PlaybackError::CodecMismatch { .. }));
    }

    #[tokio::test]
    async fn chunks_are_resliced_into_egress_frames() {
        let (manager, _rx) = manager();
        let (sink, _keep) = mpsc::channel(64);
        manager.attach_sink("c1", sink);
        let handle = manager
            .start_stream("c1", false, Codec::pcm16(24000), Codec::mulaw_8k())
            .unwrap();

        // 80ms at 24kHz resamples to 80ms at 8kHz = 4 frames of 20ms.
        handle
            .push_chunk(chunk_ms(80, 24000), Codec::pcm16(24000))
            .unwrap();
        assert_eq!(handle.depth_ms(), 80);

        // 30ms more: 1 full frame plus 10ms leftover.
        handle
            .push_chunk(chunk_ms(30, 24000), Codec::pcm16(24000))
            .unwrap();
        assert_eq!(handle.depth_ms(), 110);
    }

    #[tokio::test]
    async fn mark_done_pads_the_trailing_partial_frame() {
        let (manager, _rx) = manager();
        let (sink, _keep) = mpsc::channel(64);
        manager.attach_sink("c1", sink);
        let handle = manager
            .start_stream("c1", false, Codec::pcm16(24000), Codec::mulaw_8k())
            .unwrap();

        handle
            .push_chunk(chunk_ms(30, 24000), Codec::pcm16(24000))
            .unwrap();
        handle.mark_done();
        // 30ms becomes 40ms: one full frame plus one padded frame.
        assert_eq!(handle.depth_ms(), 40);

        assert_eq!(
            handle
                .push_chunk(chunk_ms(20, 24000), Codec::pcm16(24000))
                .unwrap_err(),
            PlaybackError::StreamClosed
        );
    }

    #[tokio::test]
    async fn cancel_flushes_and_rejects_late_chunks() {
        let (manager, _rx) = manager();
        let (sink, _keep) = mpsc::channel(64);
        manager.attach_sink("c1", sink);
        let handle = manager
            .start_stream("c1", true, Codec::pcm16(24000), Codec::mulaw_8k())
            .unwrap();

        handle
            .push_chunk(chunk_ms(200, 24000), Codec::pcm16(24000))
            .unwrap();
        handle.cancel("barge-in");
        assert_eq!(handle.depth_ms(), 0);
        assert_eq!(
            handle
                .push_chunk(chunk_ms(20, 24000), Codec::pcm16(24000))
                .unwrap_err(),
            PlaybackError::StreamClosed
        );

        // A new stream may start once the old one ended.
        tokio::task::yield_now().await;
        assert!(!manager.has_active("c1"));
    }
}
