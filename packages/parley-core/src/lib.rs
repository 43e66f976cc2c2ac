//! Parley Core - real-time call mediation between a PBX and AI
//! conversation providers.
//!
//! For each caller the core bridges a live telephony channel to a
//! conversational AI provider, shuttles audio both ways under hard
//! real-time constraints, and coordinates turn-taking: who may speak,
//! when to cut the agent off, when to end the call.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`audio`]: codec kit (G.711 μ-law, resampling) and audio profiles
//! - [`transport`]: RTP and AudioSocket media adapters
//! - [`session`]: per-call state and the process-wide store
//! - [`gating`]: token-counted inbound mute with post-TTS guard
//! - [`playback`]: jitter-buffered, paced downstream playback
//! - [`coordinator`]: turn ownership and barge-in arbitration
//! - [`provider`]: the adapter seam to conversational engines
//! - [`pbx`]: the control-plane seam to the PBX
//! - [`orchestrator`]: the per-call supervisor tying it all together
//! - [`events`], [`metrics`]: observability
//! - [`state`]: configuration
//! - [`error`]: centralized error types
//!
//! # Abstraction seams
//!
//! Three traits decouple the core from its collaborators, each with a
//! default implementation suitable for development:
//!
//! - [`ProviderAdapter`](provider::ProviderAdapter): a conversational
//!   engine (the in-tree [`echo`](provider::echo) adapter loops caller
//!   audio back for media-path smoke tests)
//! - [`PbxClient`](pbx::PbxClient): PBX control
//!   ([`DirectMediaPbx`](pbx::DirectMediaPbx) for dialplan-only setups)
//! - [`EventEmitter`](events::EventEmitter): event delivery

#![warn(clippy::all)]

pub mod audio;
pub mod bootstrap;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod gating;
pub mod metrics;
pub mod orchestrator;
pub mod pbx;
pub mod playback;
pub mod protocol_constants;
pub mod provider;
pub mod session;
pub mod state;
pub mod transport;
pub mod utils;

// Re-export commonly used types at the crate root
pub use audio::{AudioFrame, AudioProfile, Codec, CodecError, Encoding, ProfileRegistry};
pub use bootstrap::{bootstrap_services, BootstrappedServices};
pub use coordinator::{ConversationCoordinator, CoordinatorVerdict, TurnPhase};
pub use error::{AgentError, AgentResult, ErrorCode, Severity};
pub use events::{
    BroadcastEvent, BroadcastEventBridge, CallEvent, EventEmitter, LoggingEventEmitter,
    MediaEvent, NoopEventEmitter, TurnEvent,
};
pub use gating::{GateHandle, GatingManager};
pub use metrics::{CallCounters, MetricsRegistry, MetricsSnapshot};
pub use orchestrator::CallOrchestrator;
pub use pbx::{CallerArrival, DirectMediaPbx, PbxCallEvent, PbxClient, PbxError};
pub use playback::{PlaybackError, PlaybackHandle, PlaybackManager, PlaybackSignal};
pub use provider::{
    ProviderAdapter, ProviderCapabilities, ProviderError, ProviderEvent, ProviderRegistry,
};
pub use session::{CallSession, SessionError, SessionState, SessionStore};
pub use state::Config;
pub use transport::{Transport, TransportConnection, TransportError, TransportKind};
pub use utils::now_millis;
