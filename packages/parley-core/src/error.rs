//! Centralized error types for the Parley core library.
//!
//! Each subsystem defines its own `thiserror` enum next to its code; this
//! module provides the crate-wide [`AgentError`] wrapper, machine-readable
//! error codes, and the severity classification the orchestrator uses to
//! decide between retry, degrade and teardown.

use thiserror::Error;

use crate::audio::CodecError;
use crate::pbx::PbxError;
use crate::playback::PlaybackError;
use crate::provider::ProviderError;
use crate::session::SessionError;
use crate::transport::TransportError;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for logs and events.
    fn code(&self) -> &'static str;
}

/// How the orchestrator should react to an error.
///
/// This is the §"error taxonomy" policy axis: transient errors are logged
/// and survived in place, fatal errors end the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Log, substitute or skip, keep the call alive.
    Transient,
    /// Authoritative signal to tear the call down.
    Fatal,
}

impl ErrorCode for TransportError {
    fn code(&self) -> &'static str {
        match self {
            Self::Bind(_) => "transport_bind_failed",
            Self::Closed => "transport_closed",
            Self::Io(_) => "transport_io",
            Self::MalformedFrame(_) => "transport_malformed_frame",
            Self::EndpointExhausted => "transport_endpoint_exhausted",
            Self::NotCorrelated => "transport_not_correlated",
        }
    }
}

impl ErrorCode for CodecError {
    fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedRate { .. } => "codec_unsupported_rate",
            Self::ProfileNotFound(_) => "audio_profile_not_found",
            Self::InvalidProfile { .. } => "audio_profile_invalid",
        }
    }
}

impl ErrorCode for PlaybackError {
    fn code(&self) -> &'static str {
        match self {
            Self::StreamAlreadyExists(_) => "playback_stream_exists",
            Self::StreamClosed => "playback_stream_closed",
            Self::CodecMismatch { .. } => "playback_codec_mismatch",
            Self::NoSink(_) => "playback_no_sink",
        }
    }
}

impl ErrorCode for ProviderError {
    fn code(&self) -> &'static str {
        match self {
            Self::UnknownProvider(_) => "provider_unknown",
            Self::Handshake(_) => "provider_handshake_failed",
            Self::HandshakeTimeout => "provider_handshake_timeout",
            Self::Transient(_) => "provider_transient",
            Self::Fatal(_) => "provider_fatal",
            Self::SessionClosed => "provider_session_closed",
            Self::BadSettings(_) => "provider_bad_settings",
        }
    }
}

impl ErrorCode for PbxError {
    fn code(&self) -> &'static str {
        match self {
            Self::Bridge(_) => "pbx_bridge_failed",
            Self::Channel(_) => "pbx_channel_failed",
            Self::MediaPlayback(_) => "pbx_media_playback_failed",
            Self::Closed => "pbx_closed",
        }
    }
}

impl ErrorCode for SessionError {
    fn code(&self) -> &'static str {
        match self {
            Self::DuplicateCall(_) => "session_duplicate_call",
            Self::NotFound(_) => "session_not_found",
        }
    }
}

/// Application-wide error type for the Parley media core.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Media transport failure (RTP or AudioSocket).
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Codec kit or audio profile failure.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Provider adapter failure.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Streaming playback failure.
    #[error("Playback error: {0}")]
    Playback(#[from] PlaybackError),

    /// PBX control-plane failure (bridge/channel operations).
    #[error("PBX error: {0}")]
    Pbx(#[from] PbxError),

    /// Session store failure.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Invariant violation. Always fatal for the call, always loud.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Returns a machine-readable error code for logs and events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport(e) => e.code(),
            Self::Codec(e) => e.code(),
            Self::Provider(e) => e.code(),
            Self::Playback(e) => e.code(),
            Self::Pbx(e) => e.code(),
            Self::Session(e) => e.code(),
            Self::Internal(_) => "internal_error",
        }
    }

    /// Classifies the error per the teardown policy table.
    pub fn severity(&self) -> Severity {
        match self {
            Self::Transport(e) => e.severity(),
            Self::Provider(e) => e.severity(),
            // Codec errors only surface at profile resolution, which rejects
            // the call at setup; mid-call they would be an invariant breach.
            Self::Codec(_) => Severity::Fatal,
            Self::Playback(_) => Severity::Transient,
            Self::Pbx(_) => Severity::Fatal,
            Self::Session(_) => Severity::Fatal,
            Self::Internal(_) => Severity::Fatal,
        }
    }

    /// True when the orchestrator must begin teardown for the call.
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

/// Convenient Result alias for application-wide operations.
pub type AgentResult<T> = Result<T, AgentError>;
