//! Media transport adapters.
//!
//! Two interchangeable backends deliver and accept 20ms PCM frames per
//! call: [`rtp`] (UDP ExternalMedia) and [`audiosocket`] (framed TCP).
//! Both present the same [`TransportConnection`] contract to the
//! orchestrator:
//!
//! - exactly 20ms of audio per successful read, regardless of how the
//!   remote packetized it;
//! - a silence frame when the inbound path goes quiet for longer than
//!   [`INBOUND_GAP_SILENCE_MS`](crate::protocol_constants::INBOUND_GAP_SILENCE_MS),
//!   so downstream timing logic never stalls on a dead socket;
//! - [`TransportError::Closed`] as the authoritative teardown signal.

pub mod audiosocket;
pub mod rtp;

pub use audiosocket::AudioSocketTransport;
pub use rtp::RtpTransport;

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audio::{AudioFrame, Codec};
use crate::error::Severity;
use crate::protocol_constants::FRAME_DURATION_MS;

/// Errors from the media transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Listener or per-call socket could not bind.
    #[error("bind failed: {0}")]
    Bind(std::io::Error),

    /// The remote closed the media path. Authoritative teardown signal.
    #[error("transport closed")]
    Closed,

    /// Socket-level failure mid-stream.
    #[error("transport io error: {0}")]
    Io(std::io::Error),

    /// The remote sent bytes that do not parse as the wire protocol.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The RTP port range has no free port for a new call.
    #[error("no free media ports in the configured range")]
    EndpointExhausted,

    /// A connection arrived that no pending call claims.
    #[error("connection not correlated to a call")]
    NotCorrelated,
}

impl TransportError {
    /// Classification per the error policy table: socket resets and
    /// malformed framing end the call; an uncorrelated connection only
    /// discards that connection.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::NotCorrelated => Severity::Transient,
            _ => Severity::Fatal,
        }
    }
}

/// Which media transport a call uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// RTP over UDP (the PBX's ExternalMedia channel).
    Rtp,
    /// Framed TCP per the AudioSocket spec.
    AudioSocket,
}

impl TransportKind {
    /// Returns the kind as a short string identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Rtp => "rtp",
            Self::AudioSocket => "audiosocket",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One 20ms read result.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    /// Real audio from the caller.
    Live(AudioFrame),
    /// Substituted silence covering an inbound gap. Not counted as caller
    /// activity by the silent-inbound watchdog.
    Gap(AudioFrame),
}

impl InboundFrame {
    /// The frame either way.
    #[must_use]
    pub fn frame(&self) -> &AudioFrame {
        match self {
            Self::Live(f) | Self::Gap(f) => f,
        }
    }

    /// True for substituted silence.
    #[must_use]
    pub const fn is_gap(&self) -> bool {
        matches!(self, Self::Gap(_))
    }
}

/// A correlated per-call media connection.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// The call this connection carries media for.
    fn call_id(&self) -> &str;

    /// Sets the ingress codec once the call's profile is resolved.
    ///
    /// Until configured, payloads are interpreted as PCM16 at telephony
    /// rate. Must be called before the first `read_frame`.
    fn configure(&self, ingress: Codec);

    /// Reads the next 20ms frame.
    ///
    /// Blocks at most `gap_deadline`; on expiry a silence frame is
    /// substituted. `Err(Closed)` means the media path is gone.
    async fn read_frame(&self, gap_deadline: Duration) -> Result<InboundFrame, TransportError>;

    /// Writes one frame toward the caller.
    ///
    /// Bounded: implementations buffer at most one frame and drop (with a
    /// metric) rather than block the pacer.
    async fn write_frame(&self, frame: &AudioFrame) -> Result<(), TransportError>;

    /// Frames dropped on the outbound path due to backpressure.
    fn outbound_dropped(&self) -> u64;

    /// Closes the media path, signalling the remote where the protocol has
    /// a way to. Idempotent.
    async fn close(&self);
}

/// A media transport backend.
///
/// Connections are delivered on the channel handed to the concrete type at
/// construction; this trait covers what the orchestrator needs per call.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> TransportKind;

    /// Reserves the media endpoint for a call and returns the `host:port`
    /// the PBX should send media to.
    ///
    /// For AudioSocket this is the shared listener (correlation happens via
    /// the UUID frame); for RTP a dedicated per-call socket is bound.
    async fn allocate_endpoint(&self, call_id: &str) -> Result<String, TransportError>;

    /// Releases an allocation for a call that never connected.
    fn release_endpoint(&self, call_id: &str);
}

// ─────────────────────────────────────────────────────────────────────────────
// Ingress rebuffering
// ─────────────────────────────────────────────────────────────────────────────

/// Accumulates arbitrarily-packetized inbound payload bytes and re-slices
/// them into exact 20ms frames.
///
/// The PBX normally sends 20ms packets so this is pass-through, but the
/// read contract must hold for any framing the remote chooses.
#[derive(Debug)]
pub(crate) struct IngressBuffer {
    chunks: VecDeque<Bytes>,
    buffered: usize,
}

impl IngressBuffer {
    pub(crate) fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            buffered: 0,
        }
    }

    /// Appends an inbound payload.
    pub(crate) fn push(&mut self, payload: Bytes) {
        self.buffered += payload.len();
        self.chunks.push_back(payload);
    }

    /// Pops exactly one frame of `codec`'s 20ms byte length, if available.
    pub(crate) fn pop_frame(&mut self, codec: Codec) -> Option<Bytes> {
        let want = codec.frame_bytes(FRAME_DURATION_MS);
        if self.buffered < want || want == 0 {
            return None;
        }

        // Fast path: the head chunk is exactly one frame.
        if self.chunks.front().is_some_and(|c| c.len() == want) {
            self.buffered -= want;
            return self.chunks.pop_front();
        }

        let mut out = Vec::with_capacity(want);
        while out.len() < want {
            let mut head = self.chunks.pop_front()?;
            let take = (want - out.len()).min(head.len());
            out.extend_from_slice(&head.split_to(take));
            if !head.is_empty() {
                self.chunks.push_front(head);
            }
        }
        self.buffered -= want;
        Some(Bytes::from(out))
    }

    /// Bytes currently buffered.
    pub(crate) fn len(&self) -> usize {
        self.buffered
    }
}
