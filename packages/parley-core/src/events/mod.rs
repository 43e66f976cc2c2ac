//! Event system for observers of call activity.
//!
//! This module provides:
//! - [`EventEmitter`] trait for core components to emit events
//! - Event types per domain (call lifecycle, turns, media health)
//!
//! Delivery (log sink, broadcast fan-out to an embedding application) is
//! decided at bootstrap; components never know the transport.

mod emitter;

pub use emitter::{BroadcastEventBridge, EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use serde::Serialize;

/// Events broadcast to observers.
///
/// This enum categorizes all real-time events the core can report. Each
/// category has its own inner event type with specific variants.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "category", rename_all = "camelCase")]
pub enum BroadcastEvent {
    /// Call lifecycle events.
    Call(CallEvent),

    /// Conversational turn events.
    Turn(TurnEvent),

    /// Media-path health events.
    Media(MediaEvent),
}

/// Call lifecycle events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CallEvent {
    /// A call was answered and a session created.
    Started {
        #[serde(rename = "callId")]
        call_id: String,
        provider: String,
        transport: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// The provider handshake failed; the call is being rejected.
    HandshakeFailed {
        #[serde(rename = "callId")]
        call_id: String,
        provider: String,
        error: String,
        timestamp: u64,
    },
    /// The call reached `Closed` and all resources were released.
    Ended {
        #[serde(rename = "callId")]
        call_id: String,
        reason: &'static str,
        #[serde(rename = "durationMs")]
        duration_ms: u64,
        timestamp: u64,
    },
}

/// Conversational turn events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TurnEvent {
    /// Caller speech opened a new turn.
    Started {
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(rename = "turnId")]
        turn_id: u64,
        timestamp: u64,
    },
    /// The agent finished responding; the turn is complete.
    Completed {
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(rename = "turnId")]
        turn_id: u64,
        timestamp: u64,
    },
    /// The caller spoke over the agent and the response was cancelled.
    BargeIn {
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(rename = "turnId")]
        turn_id: u64,
        timestamp: u64,
    },
}

/// Media-path health events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MediaEvent {
    /// A playback stream stalled past the fallback timeout; the filler file
    /// is being played.
    PlaybackStalled {
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(rename = "streamId")]
        stream_id: String,
        timestamp: u64,
    },
    /// The upstream audio queue overflowed and dropped its oldest frames.
    UpstreamOverflow {
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(rename = "droppedFrames")]
        dropped_frames: u64,
        timestamp: u64,
    },
}
