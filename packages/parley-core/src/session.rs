//! Per-call session state and the process-wide session store.
//!
//! A [`CallSession`] is mutated only through its per-session lock, handed
//! out by the [`SessionStore`]; every writer serializes on it so the session
//! invariants hold atomically across each mutating operation. Iteration for
//! housekeeping copies lightweight snapshots and may observe a slightly
//! stale view.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::audio::AudioProfile;
use crate::transport::TransportKind;

/// Errors from the session store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// `create` was called for a call-id that is already present.
    #[error("call already exists: {0}")]
    DuplicateCall(String),

    /// The call-id is not (or no longer) in the store.
    #[error("call not found: {0}")]
    NotFound(String),
}

/// Lifecycle state of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Session created, media leg not yet placed.
    Placing,
    /// Mixing bridge allocated, channels being attached.
    Bridging,
    /// Waiting on the provider handshake.
    HandshakingProvider,
    /// Initial greeting is playing; capture gated.
    Greeting,
    /// Steady state: caller audio flows to the provider.
    Listening,
    /// Agent audio is playing; capture gated.
    AgentSpeaking,
    /// Caller spoke over the agent; response cancellation in flight.
    BargingIn,
    /// Closing words before a tool-invoked hangup; capture gated.
    Farewell,
    /// Teardown has begun; tasks are draining.
    TearingDown,
    /// All resources released. Terminal.
    Closed,
}

impl SessionState {
    /// Returns the state as a short string identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Placing => "placing",
            Self::Bridging => "bridging",
            Self::HandshakingProvider => "handshaking_provider",
            Self::Greeting => "greeting",
            Self::Listening => "listening",
            Self::AgentSpeaking => "agent_speaking",
            Self::BargingIn => "barging_in",
            Self::Farewell => "farewell",
            Self::TearingDown => "tearing_down",
            Self::Closed => "closed",
        }
    }

    /// States in which the agent holds the floor and capture must be gated.
    #[must_use]
    pub const fn agent_has_floor(&self) -> bool {
        matches!(self, Self::Greeting | Self::AgentSpeaking | Self::Farewell)
    }

    /// True once the session can never carry media again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::TearingDown | Self::Closed)
    }
}

/// State for a single active call.
#[derive(Debug)]
pub struct CallSession {
    pub call_id: String,
    /// Channel id of the caller leg, issued by the PBX.
    pub caller_channel_id: String,
    /// Channel id of the synthetic media leg, once originated.
    pub media_channel_id: Option<String>,
    /// Mixing bridge joining the two channels.
    pub bridge_id: Option<String>,
    /// Audio profile resolved at setup; never changes mid-call.
    pub profile: AudioProfile,
    pub transport_kind: TransportKind,
    /// Provider resolved from precedence rules at setup.
    pub provider_name: String,
    pub state: SessionState,
    /// Monotonically increasing per-turn counter.
    pub turn_id: u64,
    pub created_at: Instant,
    /// Last *live* (non-substituted) inbound frame.
    pub last_inbound_frame_at: Option<Instant>,
    /// Last agent audio frame emitted toward the caller.
    pub last_agent_audio_at: Option<Instant>,
}

impl CallSession {
    /// Creates a session in `Placing`.
    #[must_use]
    pub fn new(
        call_id: String,
        caller_channel_id: String,
        profile: AudioProfile,
        transport_kind: TransportKind,
        provider_name: String,
    ) -> Self {
        Self {
            call_id,
            caller_channel_id,
            media_channel_id: None,
            bridge_id: None,
            profile,
            transport_kind,
            provider_name,
            state: SessionState::Placing,
            turn_id: 0,
            created_at: Instant::now(),
            last_inbound_frame_at: None,
            last_agent_audio_at: None,
        }
    }

    /// Transitions to a new state.
    ///
    /// Transitions out of `Closed` are refused; everything else is the
    /// caller's responsibility (the orchestrator and coordinator drive a
    /// known graph).
    pub fn transition(&mut self, next: SessionState) {
        if self.state == SessionState::Closed && next != SessionState::Closed {
            log::warn!(
                "[Session] {} refused transition out of closed to {}",
                self.call_id,
                next.as_str()
            );
            return;
        }
        if self.state != next {
            log::debug!(
                "[Session] {}: {} -> {}",
                self.call_id,
                self.state.as_str(),
                next.as_str()
            );
            self.state = next;
        }
    }

    /// Starts a new conversational turn, returning its id.
    pub fn next_turn(&mut self) -> u64 {
        self.turn_id += 1;
        self.turn_id
    }

    /// Age of the call.
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

/// Lightweight copy of a session for housekeeping and telemetry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub call_id: String,
    pub state: SessionState,
    pub provider: String,
    pub turn_id: u64,
    pub age_ms: u64,
    /// Milliseconds since the last live inbound frame, if any arrived.
    pub inbound_idle_ms: Option<u64>,
}

/// Process-wide map of call-id to session.
///
/// The store hands out `Arc<Mutex<CallSession>>`; the per-session mutex is
/// the single-writer discipline; all mutating access goes through it.
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<String, Arc<Mutex<CallSession>>>,
}

impl SessionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new session.
    ///
    /// # Errors
    ///
    /// [`SessionError::DuplicateCall`] if the call-id is already present.
    pub fn create(&self, session: CallSession) -> Result<Arc<Mutex<CallSession>>, SessionError> {
        let call_id = session.call_id.clone();
        let entry = Arc::new(Mutex::new(session));
        match self.sessions.entry(call_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(SessionError::DuplicateCall(call_id))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&entry));
                Ok(entry)
            }
        }
    }

    /// Returns the shared handle for a call.
    #[must_use]
    pub fn get(&self, call_id: &str) -> Option<Arc<Mutex<CallSession>>> {
        self.sessions.get(call_id).map(|r| Arc::clone(r.value()))
    }

    /// Runs a mutating closure under the per-session lock.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotFound`] if the call is not in the store.
    pub fn update<R>(
        &self,
        call_id: &str,
        f: impl FnOnce(&mut CallSession) -> R,
    ) -> Result<R, SessionError> {
        let handle = self
            .get(call_id)
            .ok_or_else(|| SessionError::NotFound(call_id.to_string()))?;
        let mut session = handle.lock();
        Ok(f(&mut session))
    }

    /// Removes a session, returning its handle if it existed.
    pub fn remove(&self, call_id: &str) -> Option<Arc<Mutex<CallSession>>> {
        self.sessions.remove(call_id).map(|(_, v)| v)
    }

    /// Returns the number of active sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true when no calls are active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Copies lightweight snapshots of every session.
    ///
    /// Each session lock is held only long enough to copy scalars; the
    /// resulting view is internally consistent per call, not across calls.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .iter()
            .map(|entry| {
                let session = entry.value().lock();
                SessionSnapshot {
                    call_id: session.call_id.clone(),
                    state: session.state,
                    provider: session.provider_name.clone(),
                    turn_id: session.turn_id,
                    age_ms: session.age().as_millis() as u64,
                    inbound_idle_ms: session
                        .last_inbound_frame_at
                        .map(|t| t.elapsed().as_millis() as u64),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioProfile;

    fn make_session(call_id: &str) -> CallSession {
        CallSession::new(
            call_id.to_string(),
            format!("chan-{call_id}"),
            AudioProfile::slin_narrowband(),
            TransportKind::AudioSocket,
            "echo".to_string(),
        )
    }

    #[test]
    fn create_rejects_duplicate_call_id() {
        let store = SessionStore::new();
        store.create(make_session("c1")).unwrap();
        assert_eq!(
            store.create(make_session("c1")).unwrap_err(),
            SessionError::DuplicateCall("c1".to_string())
        );
    }

    #[test]
    fn update_runs_under_the_session_lock() {
        let store = SessionStore::new();
        store.create(make_session("c1")).unwrap();

        let turn = store.update("c1", |s| s.next_turn()).unwrap();
        assert_eq!(turn, 1);
        let turn = store.update("c1", |s| s.next_turn()).unwrap();
        assert_eq!(turn, 2);
    }

    #[test]
    fn update_unknown_call_errors() {
        let store = SessionStore::new();
        assert_eq!(
            store.update("ghost", |_| ()).unwrap_err(),
            SessionError::NotFound("ghost".to_string())
        );
    }

    #[test]
    fn closed_is_terminal() {
        let mut session = make_session("c1");
        session.transition(SessionState::Closed);
        session.transition(SessionState::Listening);
        assert_eq!(session.state, SessionState::Closed);
    }

    #[test]
    fn agent_floor_states_match_gating_invariant() {
        assert!(SessionState::Greeting.agent_has_floor());
        assert!(SessionState::AgentSpeaking.agent_has_floor());
        assert!(SessionState::Farewell.agent_has_floor());
        assert!(!SessionState::Listening.agent_has_floor());
        assert!(!SessionState::BargingIn.agent_has_floor());
    }

    #[test]
    fn snapshot_reflects_live_sessions() {
        let store = SessionStore::new();
        store.create(make_session("c1")).unwrap();
        store.create(make_session("c2")).unwrap();
        store
            .update("c2", |s| s.transition(SessionState::Listening))
            .unwrap();

        let mut snapshot = store.snapshot();
        snapshot.sort_by(|a, b| a.call_id.cmp(&b.call_id));
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[1].state, SessionState::Listening);

        store.remove("c1");
        assert_eq!(store.len(), 1);
    }
}
