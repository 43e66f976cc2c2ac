//! Per-call conversation coordinator: turn ownership and barge-in.
//!
//! One coordinator per call, driven exclusively from the call's
//! provider-event loop: events are handled one at a time in provider
//! order and the state machine never re-enters itself.
//!
//! Turn machine: `Idle` → `CallerSpeaking` → `Thinking` → `AgentSpeaking`
//! → `Idle`, with a `BargingIn` overlay reachable from `AgentSpeaking`.
//! Provider-reported speech events are the authoritative barge-in source;
//! the RMS energy tap over gated inbound frames is the fallback for
//! providers without their own endpointing.

use std::sync::Arc;

use crate::audio::AudioProfile;
use crate::events::{EventEmitter, TurnEvent};
use crate::gating::{reason, GateHandle, GatingManager};
use crate::metrics::CallCounters;
use crate::playback::{EndReason, PlaybackError, PlaybackHandle, PlaybackManager};
use crate::protocol_constants::FRAME_DURATION_MS;
use crate::provider::{ProviderAdapter, ProviderCapabilities, ProviderEvent};
use crate::session::{SessionState, SessionStore};
use crate::state::BargeInConfig;
use crate::utils::now_millis;

/// Who currently owns the conversational floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    CallerSpeaking,
    Thinking,
    AgentSpeaking,
    BargingIn,
}

/// What the orchestrator should do after the coordinator processed input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorVerdict {
    /// Nothing lifecycle-relevant happened.
    Continue,
    /// The call should tear down with this reason.
    Teardown(&'static str),
}

/// Energy-based barge-in fallback: sustained RMS above threshold.
///
/// Deliberately simpler than a VAD: it taps frames the gate already
/// discarded, so false positives only cost a cancelled response, never a
/// lost caller utterance.
#[derive(Debug)]
pub struct EnergyBargeInDetector {
    threshold: f32,
    required_ms: u64,
    accumulated_ms: u64,
}

impl EnergyBargeInDetector {
    #[must_use]
    pub fn new(threshold: f32, required_ms: u64) -> Self {
        Self {
            threshold,
            required_ms,
            accumulated_ms: 0,
        }
    }

    /// Feeds one 20ms frame's samples; true when the threshold has been
    /// sustained long enough.
    pub fn observe(&mut self, samples: &[i16]) -> bool {
        if crate::audio::rms_energy(samples) >= self.threshold {
            self.accumulated_ms += u64::from(FRAME_DURATION_MS);
        } else {
            self.accumulated_ms = 0;
        }
        self.accumulated_ms >= self.required_ms
    }

    /// Clears accumulated energy (new turn, barge-in fired).
    pub fn reset(&mut self) {
        self.accumulated_ms = 0;
    }
}

/// Per-call turn-ownership state machine.
pub struct ConversationCoordinator {
    call_id: String,
    phase: TurnPhase,
    turn_id: u64,
    store: Arc<SessionStore>,
    gating: Arc<GatingManager>,
    playback: PlaybackManager,
    provider: Arc<dyn ProviderAdapter>,
    capabilities: ProviderCapabilities,
    profile: AudioProfile,
    barge_in: BargeInConfig,
    detector: EnergyBargeInDetector,
    gate: Option<GateHandle>,
    active_stream: Option<PlaybackHandle>,
    /// Set after a cancel: chunks still in flight for the cancelled
    /// response are dropped until its `AudioDone` arrives.
    drop_audio_until_done: bool,
    metrics: Arc<CallCounters>,
    events: Arc<dyn EventEmitter>,
}

impl ConversationCoordinator {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        call_id: String,
        store: Arc<SessionStore>,
        gating: Arc<GatingManager>,
        playback: PlaybackManager,
        provider: Arc<dyn ProviderAdapter>,
        profile: AudioProfile,
        barge_in: BargeInConfig,
        metrics: Arc<CallCounters>,
        events: Arc<dyn EventEmitter>,
    ) -> Self {
        let capabilities = provider.capabilities();
        let detector =
            EnergyBargeInDetector::new(barge_in.energy_threshold, barge_in.min_ms);
        Self {
            call_id,
            phase: TurnPhase::Idle,
            turn_id: 0,
            store,
            gating,
            playback,
            provider,
            capabilities,
            profile,
            barge_in,
            detector,
            gate: None,
            active_stream: None,
            drop_audio_until_done: false,
            metrics,
            events,
        }
    }

    /// Current turn phase.
    #[must_use]
    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    /// Current turn id.
    #[must_use]
    pub fn turn_id(&self) -> u64 {
        self.turn_id
    }

    fn set_session_state(&self, state: SessionState) {
        let _ = self.store.update(&self.call_id, |s| s.transition(state));
    }

    fn start_turn(&mut self) {
        self.turn_id = self
            .store
            .update(&self.call_id, |s| s.next_turn())
            .unwrap_or(self.turn_id + 1);
        self.events.emit_turn(TurnEvent::Started {
            call_id: self.call_id.clone(),
            turn_id: self.turn_id,
            timestamp: now_millis(),
        });
        log::debug!("[Coordinator] {} turn {} started", self.call_id, self.turn_id);
    }

    /// Handles one provider event, in provider order.
    pub async fn handle_provider_event(&mut self, event: ProviderEvent) -> CoordinatorVerdict {
        match event {
            ProviderEvent::CallerSpeechStarted { .. } => self.on_caller_speech_started().await,
            ProviderEvent::CallerSpeechStopped { .. } => {
                if self.phase == TurnPhase::CallerSpeaking {
                    self.phase = TurnPhase::Thinking;
                }
                CoordinatorVerdict::Continue
            }
            ProviderEvent::TranscriptDelta { text, .. } => {
                log::trace!("[Coordinator] {} partial: {}", self.call_id, text);
                CoordinatorVerdict::Continue
            }
            ProviderEvent::TranscriptFinal { text, .. } => {
                log::debug!("[Coordinator] {} caller said: {}", self.call_id, text);
                if self.phase == TurnPhase::CallerSpeaking {
                    self.phase = TurnPhase::Thinking;
                }
                CoordinatorVerdict::Continue
            }
            ProviderEvent::AudioChunk { pcm, .. } => self.on_audio_chunk(pcm).await,
            ProviderEvent::AudioDone { .. } => self.on_audio_done(),
            // Lifecycle events are the orchestrator's concern; seeing one
            // here means it chose to forward it, which is harmless.
            ProviderEvent::ToolCall { .. }
            | ProviderEvent::Error { .. }
            | ProviderEvent::Closed { .. } => CoordinatorVerdict::Continue,
        }
    }

    async fn on_caller_speech_started(&mut self) -> CoordinatorVerdict {
        match self.phase {
            TurnPhase::Idle => {
                self.phase = TurnPhase::CallerSpeaking;
                self.start_turn();
                CoordinatorVerdict::Continue
            }
            TurnPhase::AgentSpeaking
                if self.capabilities.barge_in_events && self.barge_in.enabled =>
            {
                // Provider-reported speech is authoritative.
                self.trigger_barge_in().await
            }
            _ => CoordinatorVerdict::Continue,
        }
    }

    async fn on_audio_chunk(&mut self, pcm: bytes::Bytes) -> CoordinatorVerdict {
        if self.drop_audio_until_done {
            self.metrics
                .stale_chunks_dropped
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return CoordinatorVerdict::Continue;
        }

        if self.active_stream.is_none() {
            // First chunk of this response: arm gating once, open the
            // stream. For continuous providers this is the only arming
            // for the whole turn; later chunks never re-arm.
            let session_state = self
                .store
                .get(&self.call_id)
                .map(|s| s.lock().state)
                .unwrap_or(SessionState::Listening);
            let gate_reason = match session_state {
                SessionState::Greeting => reason::GREETING,
                SessionState::Farewell => reason::FAREWELL,
                _ => reason::TTS_SEGMENT,
            };
            self.gate = Some(self.gating.acquire(&self.call_id, gate_reason));
            if !session_state.agent_has_floor() {
                self.set_session_state(SessionState::AgentSpeaking);
            }
            self.phase = TurnPhase::AgentSpeaking;
            self.detector.reset();

            match self.playback.start_stream(
                &self.call_id,
                self.capabilities.continuous_output,
                self.profile.provider,
                self.profile.egress,
            ) {
                Ok(handle) => self.active_stream = Some(handle),
                Err(e) => {
                    log::error!(
                        "[Coordinator] {} failed to open playback stream: {}",
                        self.call_id,
                        e
                    );
                    if let Some(gate) = self.gate.take() {
                        self.gating.release(gate);
                    }
                    return CoordinatorVerdict::Continue;
                }
            }
        }

        if let Some(stream) = &self.active_stream {
            match stream.push_chunk(pcm, self.profile.provider) {
                Ok(()) => {}
                Err(PlaybackError::StreamClosed) => {
                    // Lost the race with a cancel.
                    self.metrics
                        .stale_chunks_dropped
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                Err(e) => {
                    log::warn!("[Coordinator] {} chunk rejected: {}", self.call_id, e);
                }
            }
        }
        CoordinatorVerdict::Continue
    }

    fn on_audio_done(&mut self) -> CoordinatorVerdict {
        self.drop_audio_until_done = false;
        if let Some(stream) = &self.active_stream {
            stream.mark_done();
        } else if self.phase == TurnPhase::AgentSpeaking || self.phase == TurnPhase::Thinking {
            // Response carried no audio at all; close the turn directly.
            self.finish_turn();
        }
        CoordinatorVerdict::Continue
    }

    /// Feeds one gated inbound frame to the energy fallback.
    ///
    /// Only consulted while the agent is speaking, for providers without
    /// their own barge-in events, and (when configured) outside the
    /// post-TTS guard window so playback tail echo cannot trigger it.
    pub async fn note_gated_frame(&mut self, samples: &[i16]) -> CoordinatorVerdict {
        if self.phase != TurnPhase::AgentSpeaking
            || !self.barge_in.enabled
            || self.capabilities.barge_in_events
        {
            return CoordinatorVerdict::Continue;
        }
        if self.barge_in.respect_post_tts_guard && self.gating.guard_active(&self.call_id) {
            return CoordinatorVerdict::Continue;
        }
        if self.detector.observe(samples) {
            return self.trigger_barge_in().await;
        }
        CoordinatorVerdict::Continue
    }

    async fn trigger_barge_in(&mut self) -> CoordinatorVerdict {
        log::info!(
            "[Coordinator] {} barge-in on turn {}",
            self.call_id,
            self.turn_id
        );
        self.phase = TurnPhase::BargingIn;
        self.set_session_state(SessionState::BargingIn);
        self.drop_audio_until_done = true;
        self.detector.reset();
        self.metrics
            .barge_ins
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.events.emit_turn(TurnEvent::BargeIn {
            call_id: self.call_id.clone(),
            turn_id: self.turn_id,
            timestamp: now_millis(),
        });

        // The caller has the floor: open the gate immediately, cancel the
        // emitter, tell the provider to abandon the response.
        if let Some(gate) = self.gate.take() {
            self.gating.release(gate);
        }
        if let Some(stream) = &self.active_stream {
            stream.cancel("barge-in");
        }
        if let Err(e) = self.provider.cancel_response(&self.call_id).await {
            log::warn!(
                "[Coordinator] {} cancel_response failed: {}",
                self.call_id,
                e
            );
            if e.severity() == crate::error::Severity::Fatal {
                return CoordinatorVerdict::Teardown("provider_failure");
            }
        }
        CoordinatorVerdict::Continue
    }

    /// Reacts to the pacer finishing the call's stream.
    pub fn handle_playback_ended(&mut self, reason: EndReason) -> CoordinatorVerdict {
        self.active_stream = None;
        match reason {
            EndReason::Completed => {
                let farewell = self
                    .store
                    .get(&self.call_id)
                    .is_some_and(|s| s.lock().state == SessionState::Farewell);
                self.finish_turn();
                if farewell {
                    return CoordinatorVerdict::Teardown("farewell_complete");
                }
                CoordinatorVerdict::Continue
            }
            EndReason::Cancelled("barge-in") => {
                // Gate already opened in trigger_barge_in; the caller owns
                // a fresh turn.
                self.phase = TurnPhase::CallerSpeaking;
                self.start_turn();
                CoordinatorVerdict::Continue
            }
            EndReason::Cancelled(_) => {
                if let Some(gate) = self.gate.take() {
                    self.gating.release(gate);
                }
                self.phase = TurnPhase::Idle;
                CoordinatorVerdict::Continue
            }
        }
    }

    /// Completes the agent's side of a turn: gate released, guard armed,
    /// floor back to the caller.
    fn finish_turn(&mut self) {
        if let Some(gate) = self.gate.take() {
            self.gating.release(gate);
        }
        self.gating.arm_default_guard(&self.call_id);
        self.metrics
            .turns
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.events.emit_turn(TurnEvent::Completed {
            call_id: self.call_id.clone(),
            turn_id: self.turn_id,
            timestamp: now_millis(),
        });
        self.phase = TurnPhase::Idle;

        let in_farewell = self
            .store
            .get(&self.call_id)
            .is_some_and(|s| s.lock().state == SessionState::Farewell);
        if !in_farewell {
            self.set_session_state(SessionState::Listening);
        }
        log::debug!(
            "[Coordinator] {} turn {} complete",
            self.call_id,
            self.turn_id
        );
    }

    /// Releases everything the coordinator holds, for teardown.
    pub fn clear(&mut self) {
        if let Some(gate) = self.gate.take() {
            self.gating.release(gate);
        }
        if let Some(stream) = self.active_stream.take() {
            stream.cancel("teardown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm16_to_bytes;
    use crate::events::NoopEventEmitter;
    use crate::playback::PlaybackSignal;
    use crate::provider::ProviderError;
    use crate::session::CallSession;
    use crate::state::StreamingConfig;
    use crate::transport::TransportKind;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct RecordingProvider {
        capabilities: ProviderCapabilities,
        cancels: AtomicUsize,
    }

    impl RecordingProvider {
        fn new(barge_in_events: bool) -> Arc<Self> {
            Arc::new(Self {
                capabilities: ProviderCapabilities {
                    barge_in_events,
                    native_input_rate_hz: 24_000,
                    continuous_output: true,
                    min_commit_ms: 0,
                },
                cancels: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ProviderAdapter for RecordingProvider {
        fn name(&self) -> &str {
            "recording"
        }

        fn capabilities(&self) -> ProviderCapabilities {
            self.capabilities.clone()
        }

        async fn start_session(
            &self,
            _call_id: &str,
            _profile: &AudioProfile,
            _initial_context: Option<&str>,
            _events: mpsc::UnboundedSender<ProviderEvent>,
        ) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn send_audio(&self, _call_id: &str, _pcm: Bytes) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn cancel_response(&self, _call_id: &str) -> Result<(), ProviderError> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn end_session(&self, _call_id: &str) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    struct Fixture {
        coordinator: ConversationCoordinator,
        provider: Arc<RecordingProvider>,
        gating: Arc<GatingManager>,
        store: Arc<SessionStore>,
        playback: PlaybackManager,
        signals: mpsc::UnboundedReceiver<PlaybackSignal>,
        _sink_rx: mpsc::Receiver<crate::audio::AudioFrame>,
    }

    fn fixture(barge_in_events: bool) -> Fixture {
        let store = Arc::new(SessionStore::new());
        let profile = AudioProfile::ulaw_realtime();
        store
            .create(CallSession::new(
                "c1".to_string(),
                "chan-1".to_string(),
                profile.clone(),
                TransportKind::Rtp,
                "recording".to_string(),
            ))
            .unwrap();
        store
            .update("c1", |s| s.transition(SessionState::Listening))
            .unwrap();

        let gating = Arc::new(GatingManager::new(Duration::from_millis(300)));
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let playback = PlaybackManager::new(StreamingConfig::default(), signal_tx);
        let (sink_tx, sink_rx) = mpsc::channel(512);
        playback.attach_sink("c1", sink_tx);

        let provider = RecordingProvider::new(barge_in_events);
        let metrics = Arc::new(CallCounters::default());
        let coordinator = ConversationCoordinator::new(
            "c1".to_string(),
            Arc::clone(&store),
            Arc::clone(&gating),
            playback.clone(),
            provider.clone() as Arc<dyn ProviderAdapter>,
            profile,
            BargeInConfig::default(),
            metrics,
            Arc::new(NoopEventEmitter),
        );

        Fixture {
            coordinator,
            provider,
            gating,
            store,
            playback,
            signals,
            _sink_rx: sink_rx,
        }
    }

    fn chunk() -> ProviderEvent {
        ProviderEvent::AudioChunk {
            call_id: "c1".to_string(),
            pcm: pcm16_to_bytes(&vec![3000i16; 480]),
        }
    }

    fn loud_frame() -> Vec<i16> {
        (0..160).map(|i| if i % 2 == 0 { 8000 } else { -8000 }).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn caller_speech_opens_a_turn() {
        let mut f = fixture(true);
        f.coordinator
            .handle_provider_event(ProviderEvent::CallerSpeechStarted {
                call_id: "c1".to_string(),
            })
            .await;
        assert_eq!(f.coordinator.phase(), TurnPhase::CallerSpeaking);
        assert_eq!(f.coordinator.turn_id(), 1);

        f.coordinator
            .handle_provider_event(ProviderEvent::CallerSpeechStopped {
                call_id: "c1".to_string(),
            })
            .await;
        assert_eq!(f.coordinator.phase(), TurnPhase::Thinking);
    }

    #[tokio::test(start_paused = true)]
    async fn first_chunk_arms_gating_exactly_once() {
        let mut f = fixture(true);
        f.coordinator
            .handle_provider_event(ProviderEvent::CallerSpeechStarted {
                call_id: "c1".to_string(),
            })
            .await;
        f.coordinator
            .handle_provider_event(ProviderEvent::CallerSpeechStopped {
                call_id: "c1".to_string(),
            })
            .await;

        for _ in 0..5 {
            f.coordinator.handle_provider_event(chunk()).await;
        }
        assert_eq!(f.coordinator.phase(), TurnPhase::AgentSpeaking);
        // Continuous stream: one token, no matter how many chunks.
        assert_eq!(f.gating.token_count("c1"), 1);
        assert!(f.gating.is_gated("c1"));
        assert_eq!(
            f.store.get("c1").unwrap().lock().state,
            SessionState::AgentSpeaking
        );

        f.coordinator
            .handle_provider_event(ProviderEvent::AudioDone {
                call_id: "c1".to_string(),
            })
            .await;

        // Drain the stream; the pacer reports Ended(Completed).
        let ended = loop {
            match f.signals.recv().await.unwrap() {
                PlaybackSignal::Ended { reason, .. } => break reason,
                _ => {}
            }
        };
        let verdict = f.coordinator.handle_playback_ended(ended);
        assert_eq!(verdict, CoordinatorVerdict::Continue);
        assert_eq!(f.coordinator.phase(), TurnPhase::Idle);
        assert_eq!(f.gating.token_count("c1"), 0);
        // Post-TTS guard holds the gate past the release.
        assert!(f.gating.is_gated("c1"));
        assert_eq!(
            f.store.get("c1").unwrap().lock().state,
            SessionState::Listening
        );
    }

    #[tokio::test(start_paused = true)]
    async fn energy_fallback_triggers_barge_in() {
        let mut f = fixture(false);
        f.coordinator
            .handle_provider_event(ProviderEvent::CallerSpeechStarted {
                call_id: "c1".to_string(),
            })
            .await;
        for _ in 0..3 {
            f.coordinator.handle_provider_event(chunk()).await;
        }
        assert_eq!(f.coordinator.phase(), TurnPhase::AgentSpeaking);

        // 200ms of sustained energy = 10 frames at the default config.
        let loud = loud_frame();
        for _ in 0..9 {
            let verdict = f.coordinator.note_gated_frame(&loud).await;
            assert_eq!(verdict, CoordinatorVerdict::Continue);
            assert_eq!(f.coordinator.phase(), TurnPhase::AgentSpeaking);
        }
        let verdict = f.coordinator.note_gated_frame(&loud).await;
        assert_eq!(verdict, CoordinatorVerdict::Continue);
        assert_eq!(f.coordinator.phase(), TurnPhase::BargingIn);
        assert_eq!(f.provider.cancels.load(Ordering::SeqCst), 1);
        assert!(!f.gating.is_gated("c1"), "gate opens for the caller");

        // Late chunks for the cancelled response are dropped.
        f.coordinator.handle_provider_event(chunk()).await;
        assert!(!f.playback.has_active("c1"));

        // The pacer's cancellation report moves us to CallerSpeaking with
        // a fresh turn.
        let ended = loop {
            match f.signals.recv().await.unwrap() {
                PlaybackSignal::Ended { reason, .. } => break reason,
                _ => {}
            }
        };
        let before = f.coordinator.turn_id();
        f.coordinator.handle_playback_ended(ended);
        assert_eq!(f.coordinator.phase(), TurnPhase::CallerSpeaking);
        assert_eq!(f.coordinator.turn_id(), before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn provider_speech_event_is_authoritative_barge_in() {
        let mut f = fixture(true);
        f.coordinator
            .handle_provider_event(ProviderEvent::CallerSpeechStarted {
                call_id: "c1".to_string(),
            })
            .await;
        for _ in 0..3 {
            f.coordinator.handle_provider_event(chunk()).await;
        }
        assert_eq!(f.coordinator.phase(), TurnPhase::AgentSpeaking);

        // Energy tap is ignored when the provider reports speech itself.
        let loud = loud_frame();
        for _ in 0..30 {
            f.coordinator.note_gated_frame(&loud).await;
        }
        assert_eq!(f.coordinator.phase(), TurnPhase::AgentSpeaking);

        f.coordinator
            .handle_provider_event(ProviderEvent::CallerSpeechStarted {
                call_id: "c1".to_string(),
            })
            .await;
        assert_eq!(f.coordinator.phase(), TurnPhase::BargingIn);
        assert_eq!(f.provider.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_energy_does_not_trigger() {
        let mut f = fixture(false);
        for _ in 0..2 {
            f.coordinator.handle_provider_event(chunk()).await;
        }
        let loud = loud_frame();
        let quiet = vec![0i16; 160];
        // Loud bursts shorter than min_ms, separated by silence.
        for _ in 0..4 {
            for _ in 0..8 {
                f.coordinator.note_gated_frame(&loud).await;
            }
            f.coordinator.note_gated_frame(&quiet).await;
        }
        assert_eq!(f.coordinator.phase(), TurnPhase::AgentSpeaking);
        assert_eq!(f.provider.cancels.load(Ordering::SeqCst), 0);
    }
}
