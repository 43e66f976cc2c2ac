//! The provider adapter seam.
//!
//! Concrete conversational engines (full-duplex realtime agents, or
//! STT→LLM→TTS pipelines) live behind [`ProviderAdapter`]. The core only
//! assumes the contract spelled out on the trait: events per call arrive
//! in-order, audio chunks are independently decodable, the adapter owns
//! its own reconnect/backoff, and a fatal failure ends with
//! [`ProviderEvent::Error`] then [`ProviderEvent::Closed`].

pub mod echo;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::audio::AudioProfile;
use crate::error::Severity;

/// Errors from provider adapters and the registry.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// No factory registered under this name.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// The provider settings block did not parse.
    #[error("bad provider settings: {0}")]
    BadSettings(String),

    /// Session establishment failed (auth, protocol, upstream refusal).
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Session establishment exceeded its deadline.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Recoverable hiccup (single event parse error and the like).
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Unrecoverable failure; the adapter is done with this call.
    #[error("fatal provider error: {0}")]
    Fatal(String),

    /// Operation on a call the adapter no longer has a session for.
    #[error("provider session closed")]
    SessionClosed,
}

impl ProviderError {
    /// Classification per the error policy table.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::Transient(_) => Severity::Transient,
            _ => Severity::Fatal,
        }
    }
}

/// What an adapter can do, declared at registration.
#[derive(Debug, Clone)]
pub struct ProviderCapabilities {
    /// The provider detects caller speech itself and emits
    /// `CallerSpeechStarted`/`Stopped`; energy detection is only a fallback.
    pub barge_in_events: bool,

    /// Sample rate the provider consumes and produces (Hz).
    pub native_input_rate_hz: u32,

    /// The provider emits one effectively continuous audio stream per turn
    /// (realtime agents) rather than discrete TTS segments (pipelines).
    pub continuous_output: bool,

    /// The provider's protocol requires explicit audio commit boundaries
    /// and rejects commits below this much buffered audio (ms; 0 = no
    /// commit protocol).
    pub min_commit_ms: u64,
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            barge_in_events: false,
            native_input_rate_hz: 16_000,
            continuous_output: false,
            min_commit_ms: 0,
        }
    }
}

/// Events pushed by an adapter toward the core.
///
/// Per-call ordering is part of the adapter contract.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// A chunk of agent audio in the profile's provider codec.
    AudioChunk { call_id: String, pcm: Bytes },
    /// The agent finished its response.
    AudioDone { call_id: String },
    /// The provider's own endpointing heard the caller start speaking.
    CallerSpeechStarted { call_id: String },
    /// The provider's own endpointing heard the caller stop.
    CallerSpeechStopped { call_id: String },
    /// Partial transcript of caller speech.
    TranscriptDelta { call_id: String, text: String },
    /// Final transcript of one caller utterance.
    TranscriptFinal { call_id: String, text: String },
    /// The agent asked for a tool invocation.
    ToolCall {
        call_id: String,
        tool: String,
        arguments: serde_json::Value,
    },
    /// Something went wrong upstream.
    Error {
        call_id: String,
        message: String,
        fatal: bool,
    },
    /// The adapter is done with this call; nothing further will arrive.
    Closed { call_id: String },
}

impl ProviderEvent {
    /// The call this event belongs to.
    #[must_use]
    pub fn call_id(&self) -> &str {
        match self {
            Self::AudioChunk { call_id, .. }
            | Self::AudioDone { call_id }
            | Self::CallerSpeechStarted { call_id }
            | Self::CallerSpeechStopped { call_id }
            | Self::TranscriptDelta { call_id, .. }
            | Self::TranscriptFinal { call_id, .. }
            | Self::ToolCall { call_id, .. }
            | Self::Error { call_id, .. }
            | Self::Closed { call_id } => call_id,
        }
    }
}

/// An upstream conversational engine.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Registered adapter name.
    fn name(&self) -> &str;

    /// Declared capabilities; constant for the adapter's lifetime.
    fn capabilities(&self) -> ProviderCapabilities;

    /// Opens a logical session for a call.
    ///
    /// Events for the call flow through `events` until `Closed`. The
    /// adapter manages its own network lifecycle behind this one session.
    async fn start_session(
        &self,
        call_id: &str,
        profile: &AudioProfile,
        initial_context: Option<&str>,
        events: mpsc::UnboundedSender<ProviderEvent>,
    ) -> Result<(), ProviderError>;

    /// Sends one frame of caller audio at the profile's provider codec.
    async fn send_audio(&self, call_id: &str, pcm: Bytes) -> Result<(), ProviderError>;

    /// Marks a protocol commit boundary. No-op for providers without a
    /// commit protocol.
    async fn commit_audio(&self, _call_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Cancels the in-flight response, if any. Idempotent from the core's
    /// side; cancelling when nothing is in flight must succeed.
    async fn cancel_response(&self, call_id: &str) -> Result<(), ProviderError>;

    /// Reports a tool invocation result back to the agent.
    async fn send_tool_result(
        &self,
        _call_id: &str,
        _tool: &str,
        _result: serde_json::Value,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Ends the session. The adapter stops emitting events for the call.
    async fn end_session(&self, call_id: &str) -> Result<(), ProviderError>;
}

/// Factory producing an adapter from its opaque settings block.
pub type ProviderFactory =
    Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn ProviderAdapter>, ProviderError> + Send + Sync>;

/// Registry of provider factories, keyed by unique name.
pub struct ProviderRegistry {
    factories: DashMap<String, ProviderFactory>,
    settings: HashMap<String, serde_json::Value>,
}

impl ProviderRegistry {
    /// Creates a registry that hands each factory its settings block from
    /// the configuration.
    #[must_use]
    pub fn new(settings: HashMap<String, serde_json::Value>) -> Self {
        Self {
            factories: DashMap::new(),
            settings,
        }
    }

    /// Registers a factory. Re-registering a name replaces the factory,
    /// which is what embedders want at reload.
    pub fn register(&self, name: &str, factory: ProviderFactory) {
        log::info!("[Providers] Registered adapter '{}'", name);
        self.factories.insert(name.to_string(), factory);
    }

    /// Instantiates an adapter by name.
    pub fn create(&self, name: &str) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ProviderError::UnknownProvider(name.to_string()))?;
        let settings = self
            .settings
            .get(name)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        factory(&settings)
    }

    /// True when a factory is registered under this name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered adapter names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.factories.iter().map(|e| e.key().clone()).collect()
    }
}

/// Resolves the provider for a new call.
///
/// Precedence: explicit channel variable > dialplan context mapping >
/// configured default. Resolved once at call setup.
#[must_use]
pub fn resolve_provider_name(
    explicit: Option<&str>,
    dialplan_context: Option<&str>,
    context_map: &HashMap<String, String>,
    default: &str,
) -> String {
    if let Some(name) = explicit.filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    if let Some(context) = dialplan_context {
        if let Some(name) = context_map.get(context) {
            return name.clone();
        }
    }
    default.to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Uplink commit guard
// ─────────────────────────────────────────────────────────────────────────────

/// Tracks audio accumulated since the last commit boundary.
///
/// Some provider protocols reject a commit over an (almost) empty input
/// buffer; the core therefore never commits until at least the configured
/// floor of audio has been sent. Shared between the inbound loop (which
/// adds) and the provider-event loop (which commits), hence atomics.
#[derive(Debug)]
pub struct UplinkCommitGuard {
    accumulated_ms: AtomicU64,
    min_ms: u64,
}

impl UplinkCommitGuard {
    /// Creates a guard with the effective floor for this call: the larger
    /// of the configured floor and the provider's declared minimum.
    #[must_use]
    pub fn new(configured_min_ms: u64, provider_min_ms: u64) -> Self {
        Self {
            accumulated_ms: AtomicU64::new(0),
            min_ms: configured_min_ms.max(provider_min_ms),
        }
    }

    /// Records `ms` of audio sent upstream.
    pub fn add(&self, ms: u64) {
        self.accumulated_ms.fetch_add(ms, Ordering::Relaxed);
    }

    /// Consumes the accumulator if the floor is met.
    ///
    /// Returns true when a commit should be sent now; false leaves the
    /// accumulated audio counting toward the next boundary.
    pub fn take_if_ready(&self) -> bool {
        let current = self.accumulated_ms.load(Ordering::Relaxed);
        if current < self.min_ms {
            return false;
        }
        self.accumulated_ms
            .compare_exchange(current, 0, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// Audio currently accumulated (ms).
    #[must_use]
    pub fn accumulated_ms(&self) -> u64 {
        self.accumulated_ms.load(Ordering::Relaxed)
    }
}
