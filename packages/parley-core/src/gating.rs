//! Token-counted inbound audio gating.
//!
//! The gate decides whether caller audio is forwarded upstream. It closes
//! while any token is held (greeting, TTS segment, tool execution,
//! farewell) and stays closed through a post-TTS guard window after the
//! last token is gone, so the tail of our own audio echoed back through
//! the mixing bridge is not captured as caller speech.
//!
//! The token is inserted before `acquire` returns: the next inbound frame
//! observed for that call is already gated: there is no window in which a
//! frame between "agent began speaking" and gating taking effect can leak
//! upstream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Mute reasons used by the core. Release is per-token, so any mix of
/// reasons can be held at once.
pub mod reason {
    pub const GREETING: &str = "greeting";
    pub const TTS_SEGMENT: &str = "tts-segment";
    pub const TOOL_RUNNING: &str = "tool-running";
    pub const FAREWELL: &str = "farewell";
}

/// Opaque release handle for one acquired token.
///
/// Dropping the handle without releasing leaks the token until the stale
/// sweep reclaims it; release explicitly.
#[derive(Debug)]
pub struct GateHandle {
    call_id: String,
    token_id: u64,
    reason: &'static str,
}

impl GateHandle {
    /// The reason this token was acquired with.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        self.reason
    }

    /// The call this token belongs to.
    #[must_use]
    pub fn call_id(&self) -> &str {
        &self.call_id
    }
}

#[derive(Debug)]
struct GateToken {
    id: u64,
    reason: &'static str,
    issued_at: Instant,
}

#[derive(Debug, Default)]
struct GateState {
    tokens: Vec<GateToken>,
    guard_until: Option<Instant>,
}

/// Per-call mute controller.
///
/// All operations are keyed by call-id; per-call state lives in one DashMap
/// entry and each operation holds that entry's shard lock for its duration,
/// so acquire/release/is_gated serialize per call.
pub struct GatingManager {
    gates: DashMap<String, GateState>,
    next_token: AtomicU64,
    guard_duration: Duration,
}

impl GatingManager {
    /// Creates a manager with the configured post-TTS guard duration.
    #[must_use]
    pub fn new(post_tts_guard: Duration) -> Self {
        Self {
            gates: DashMap::new(),
            next_token: AtomicU64::new(1),
            guard_duration: post_tts_guard,
        }
    }

    /// The configured guard window.
    #[must_use]
    pub fn guard_duration(&self) -> Duration {
        self.guard_duration
    }

    /// Acquires a mute token. The gate is closed before this returns.
    #[must_use]
    pub fn acquire(&self, call_id: &str, reason: &'static str) -> GateHandle {
        let id = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut state = self.gates.entry(call_id.to_string()).or_default();
        state.tokens.push(GateToken {
            id,
            reason,
            issued_at: Instant::now(),
        });
        log::debug!(
            "[Gating] {} acquired '{}' ({} token(s) held)",
            call_id,
            reason,
            state.tokens.len()
        );
        GateHandle {
            call_id: call_id.to_string(),
            token_id: id,
            reason,
        }
    }

    /// Releases exactly the token behind `handle`.
    ///
    /// Releasing twice (or after `clear`) is a no-op.
    pub fn release(&self, handle: GateHandle) {
        if let Some(mut state) = self.gates.get_mut(&handle.call_id) {
            let before = state.tokens.len();
            state.tokens.retain(|t| t.id != handle.token_id);
            if state.tokens.len() < before {
                log::debug!(
                    "[Gating] {} released '{}' ({} token(s) held)",
                    handle.call_id,
                    handle.reason,
                    state.tokens.len()
                );
            }
        }
    }

    /// Extends the post-TTS guard to at least `duration` from now.
    ///
    /// Guards only ever extend (max-merge); arming a shorter guard under a
    /// longer active one changes nothing.
    pub fn arm_post_tts_guard(&self, call_id: &str, duration: Duration) {
        let until = Instant::now() + duration;
        let mut state = self.gates.entry(call_id.to_string()).or_default();
        match state.guard_until {
            Some(existing) if existing >= until => {}
            _ => {
                state.guard_until = Some(until);
                log::debug!(
                    "[Gating] {} post-TTS guard armed for {}ms",
                    call_id,
                    duration.as_millis()
                );
            }
        }
    }

    /// Arms the guard with the configured default duration.
    pub fn arm_default_guard(&self, call_id: &str) {
        self.arm_post_tts_guard(call_id, self.guard_duration);
    }

    /// True when inbound audio for this call must be discarded.
    #[must_use]
    pub fn is_gated(&self, call_id: &str) -> bool {
        self.gates.get(call_id).is_some_and(|state| {
            !state.tokens.is_empty()
                || state.guard_until.is_some_and(|until| Instant::now() < until)
        })
    }

    /// True when only the guard window is holding the gate closed.
    #[must_use]
    pub fn guard_active(&self, call_id: &str) -> bool {
        self.gates.get(call_id).is_some_and(|state| {
            state.guard_until.is_some_and(|until| Instant::now() < until)
        })
    }

    /// Number of tokens currently held for a call.
    #[must_use]
    pub fn token_count(&self, call_id: &str) -> usize {
        self.gates.get(call_id).map_or(0, |s| s.tokens.len())
    }

    /// Drops all state for a call at teardown, returning how many tokens
    /// were still held.
    pub fn clear(&self, call_id: &str) -> usize {
        self.gates
            .remove(call_id)
            .map_or(0, |(_, state)| state.tokens.len())
    }

    /// Reclaims tokens older than `max_age` across all calls.
    ///
    /// A leaked token (tool task that died without releasing) would mute
    /// the caller forever; housekeeping sweeps with a generous age bound.
    pub fn release_stale(&self, max_age: Duration) -> usize {
        let mut reclaimed = 0;
        for mut entry in self.gates.iter_mut() {
            let before = entry.tokens.len();
            entry.tokens.retain(|t| t.issued_at.elapsed() <= max_age);
            let dropped = before - entry.tokens.len();
            if dropped > 0 {
                log::warn!(
                    "[Gating] {} reclaimed {} stale token(s)",
                    entry.key(),
                    dropped
                );
                reclaimed += dropped;
            }
        }
        reclaimed
    }
}
