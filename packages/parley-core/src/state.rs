//! Core configuration types.
//!
//! Every knob is optional with a documented default; [`Config::validate`]
//! rejects combinations that would misbehave at runtime instead of letting
//! them surface mid-call.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::audio::AudioProfile;
use crate::transport::TransportKind;

/// Configuration for the streaming playback pacer.
///
/// Groups the jitter-buffer thresholds that control when a stream starts,
/// stalls and falls back to file playback.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StreamingConfig {
    /// Buffered audio required before the first frame is emitted (ms).
    pub min_start_ms: u64,

    /// Buffer depth below which a playing stream is considered stalled (ms).
    pub low_watermark_ms: u64,

    /// Silence from the provider after which the fallback file is requested (ms).
    pub fallback_timeout_ms: u64,

    /// Chunk-arrival gap after which priming gives up waiting for
    /// `min_start_ms` and starts draining what it has (ms).
    pub jitter_buffer_ms: u64,
}

impl StreamingConfig {
    /// Creates a new `StreamingConfig` with validated values.
    ///
    /// # Errors
    ///
    /// Returns an error if any value would cause runtime issues.
    pub fn new(
        min_start_ms: u64,
        low_watermark_ms: u64,
        fallback_timeout_ms: u64,
        jitter_buffer_ms: u64,
    ) -> Result<Self, String> {
        let config = Self {
            min_start_ms,
            low_watermark_ms,
            fallback_timeout_ms,
            jitter_buffer_ms,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_start_ms == 0 {
            return Err("streaming.min_start_ms must be >= 1".to_string());
        }
        if self.low_watermark_ms > self.min_start_ms {
            return Err(
                "streaming.low_watermark_ms must not exceed min_start_ms".to_string(),
            );
        }
        if self.fallback_timeout_ms <= self.min_start_ms {
            return Err(
                "streaming.fallback_timeout_ms must exceed min_start_ms".to_string(),
            );
        }
        if self.jitter_buffer_ms == 0 {
            return Err("streaming.jitter_buffer_ms must be >= 1".to_string());
        }
        Ok(())
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            min_start_ms: 300,
            low_watermark_ms: 200,
            fallback_timeout_ms: 3000,
            jitter_buffer_ms: 150,
        }
    }
}

/// Configuration for the inbound audio gate.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GatingConfig {
    /// Window after agent playback ends during which inbound audio is still
    /// discarded, so the tail of our own audio echoed through the bridge is
    /// not captured as caller speech (ms).
    pub post_tts_guard_ms: u64,
}

impl Default for GatingConfig {
    fn default() -> Self {
        Self {
            post_tts_guard_ms: 300,
        }
    }
}

/// Configuration for energy-based barge-in detection.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BargeInConfig {
    /// Master switch for barge-in (both provider-evented and energy-based).
    pub enabled: bool,

    /// Normalized RMS (0.0–1.0 full scale) the caller must exceed.
    pub energy_threshold: f32,

    /// How long the energy must stay above threshold to trigger (ms).
    pub min_ms: u64,

    /// When true, the energy tap is suppressed while the post-TTS guard is
    /// active, so playback tail echo cannot register as a barge-in.
    pub respect_post_tts_guard: bool,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            energy_threshold: 0.08,
            min_ms: 200,
            respect_post_tts_guard: true,
        }
    }
}

/// Transport selection and bind points.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TransportConfig {
    /// Transport used when the dialplan does not choose one.
    pub default: TransportKind,

    /// AudioSocket TCP listener bind address.
    pub audiosocket_bind: String,

    /// Address advertised to the PBX for AudioSocket media legs. Usually the
    /// bind address with a routable host.
    pub audiosocket_advertise: String,

    /// Local IP RTP sockets bind to.
    pub rtp_bind_ip: String,

    /// First UDP port of the per-call RTP allocation range.
    pub rtp_port_min: u16,

    /// Last UDP port of the per-call RTP allocation range.
    pub rtp_port_max: u16,

    /// Accept media connections that were not announced by the control
    /// plane, treating them as new calls (dialplan-only deployments where
    /// the PBX dials AudioSocket directly).
    pub direct_media: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default: TransportKind::AudioSocket,
            audiosocket_bind: "0.0.0.0:9092".to_string(),
            audiosocket_advertise: "127.0.0.1:9092".to_string(),
            rtp_bind_ip: "0.0.0.0".to_string(),
            rtp_port_min: 10_000,
            rtp_port_max: 10_500,
            direct_media: true,
        }
    }
}

/// Audio profile configuration.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AudioConfig {
    /// Additional named profiles; may shadow the built-ins.
    pub profiles: Vec<AudioProfile>,

    /// Profile used when neither the dialplan nor the transport default
    /// chooses one.
    pub default_profile: Option<String>,

    /// Per-transport default profile names.
    pub transport_profiles: HashMap<TransportKind, String>,
}

/// Per-call limits and queue sizing.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    /// Provider handshake deadline (seconds).
    pub provider_handshake_timeout_secs: u64,

    /// Teardown after this long without a live inbound frame (seconds).
    pub silent_inbound_timeout_secs: u64,

    /// Hard ceiling on call duration (seconds; 0 disables).
    pub max_call_duration_secs: u64,

    /// Bound of the outbound-to-provider queue, expressed as audio (ms).
    /// Overflow drops oldest.
    pub upstream_queue_ms: u64,

    /// Bound of the provider-chunk intake queue (ms). Overflow is treated
    /// as provider malfunction and cancels the response.
    pub provider_chunk_queue_ms: u64,

    /// Minimum audio accumulated between protocol commit boundaries (ms).
    pub min_commit_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            provider_handshake_timeout_secs: 10,
            silent_inbound_timeout_secs: 60,
            max_call_duration_secs: 0,
            upstream_queue_ms: 400,
            provider_chunk_queue_ms: 2000,
            min_commit_ms: 100,
        }
    }
}

/// Media file URIs played through the PBX on the caller channel.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MediaConfig {
    /// Greeting played after the provider handshake (None = provider opens).
    pub greeting_uri: Option<String>,

    /// Filler played when streaming playback stalls past the fallback timeout.
    pub stall_filler_uri: String,

    /// Prompt played best-effort when call setup fails.
    pub setup_error_uri: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            greeting_uri: None,
            stall_filler_uri: "sound:one-moment-please".to_string(),
            setup_error_uri: "sound:agent-unavailable".to_string(),
        }
    }
}

/// Configuration for the Parley media core.
///
/// All fields have sensible defaults.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Transport selection and bind points.
    pub transport: TransportConfig,

    /// Audio profiles.
    pub audio: AudioConfig,

    /// Playback pacer thresholds.
    pub streaming: StreamingConfig,

    /// Inbound gate behavior.
    pub gating: GatingConfig,

    /// Barge-in detection.
    pub barge_in: BargeInConfig,

    /// Per-call limits and queues.
    pub session: SessionConfig,

    /// Media file URIs.
    pub media: MediaConfig,

    /// Provider chosen when the dialplan and context mapping are silent.
    pub default_provider: String,

    /// Dialplan context -> provider name mapping (middle precedence).
    pub context_providers: HashMap<String, String>,

    /// Per-provider settings blocks, opaque to the core; handed verbatim to
    /// the adapter factory.
    pub providers: HashMap<String, serde_json::Value>,
}

impl Config {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        self.streaming.validate()?;
        if self.barge_in.energy_threshold <= 0.0 || self.barge_in.energy_threshold >= 1.0 {
            return Err("barge_in.energy_threshold must be in (0, 1)".to_string());
        }
        if self.barge_in.min_ms == 0 {
            return Err("barge_in.min_ms must be >= 1".to_string());
        }
        if self.transport.rtp_port_min > self.transport.rtp_port_max {
            return Err("transport.rtp_port_min must be <= rtp_port_max".to_string());
        }
        if self.session.min_commit_ms < 100 {
            return Err(
                "session.min_commit_ms below 100 risks empty upstream commits".to_string(),
            );
        }
        if self.default_provider.is_empty() {
            return Err("default_provider must be set".to_string());
        }
        Ok(())
    }
}
