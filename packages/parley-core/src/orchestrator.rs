//! The per-call supervisor.
//!
//! Wires a caller to a provider: answers the channel, allocates the mixing
//! bridge and media leg, correlates the transport connection, performs the
//! provider handshake, then runs the steady-state loops:
//!
//! - **inbound loop**: transport frames → codec kit → gate → uplink queue
//! - **uplink task**: bounded queue → provider (drop-oldest on overflow)
//! - **call event loop**: provider events + playback signals + energy
//!   taps, serialized through the [`ConversationCoordinator`]
//! - **housekeeping**: silent-inbound watchdog, call duration ceiling
//!
//! Teardown is idempotent and ordered: playback, provider session, gating
//! tokens, session store, transport, then bridge and channels.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::audio::{decode_to_pcm16, pcm16_to_bytes, resample_pcm16, AudioProfile, ProfileRegistry};
use crate::coordinator::{ConversationCoordinator, CoordinatorVerdict};
use crate::error::{AgentError, AgentResult};
use crate::events::{CallEvent, EventEmitter, MediaEvent};
use crate::gating::{reason, GateHandle, GatingManager};
use crate::metrics::{CallCounters, MetricsRegistry};
use crate::pbx::{CallerArrival, PbxCallEvent, PbxClient, VAR_AUDIO_PROFILE, VAR_CONTEXT, VAR_PROVIDER};
use crate::playback::{EndReason, PlaybackManager, PlaybackSignal};
use crate::protocol_constants::{FRAME_DURATION_MS, INBOUND_GAP_SILENCE_MS};
use crate::provider::{
    resolve_provider_name, ProviderAdapter, ProviderError, ProviderEvent, ProviderRegistry,
    UplinkCommitGuard,
};
use crate::session::{CallSession, SessionState, SessionStore};
use crate::state::Config;
use crate::transport::{Transport, TransportConnection, TransportError, TransportKind};
use crate::utils::now_millis;

/// Grace before a tool-invoked hangup forces teardown, covering a spoken
/// farewell that never materializes.
const FAREWELL_GRACE: Duration = Duration::from_secs(10);

/// Sweep age for leaked gating tokens.
const STALE_TOKEN_AGE: Duration = Duration::from_secs(120);

/// Messages serialized into a call's event loop.
enum CallControl {
    PlaybackEnded(EndReason),
    /// A gated inbound frame's samples, for the barge-in energy tap.
    GatedFrame(Vec<i16>),
}

/// Bounded drop-oldest queue feeding the provider uplink.
struct UplinkQueue {
    frames: parking_lot::Mutex<VecDeque<Bytes>>,
    capacity: usize,
    notify: Notify,
}

impl UplinkQueue {
    fn new(capacity: usize) -> Self {
        Self {
            frames: parking_lot::Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Pushes a frame, dropping the oldest on overflow. Returns the number
    /// of frames dropped (0 or 1).
    fn push(&self, frame: Bytes) -> u64 {
        let dropped = {
            let mut frames = self.frames.lock();
            let dropped = if frames.len() >= self.capacity {
                frames.pop_front();
                1
            } else {
                0
            };
            frames.push_back(frame);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    async fn pop(&self) -> Bytes {
        loop {
            if let Some(frame) = self.frames.lock().pop_front() {
                return frame;
            }
            self.notify.notified().await;
        }
    }
}

/// Everything the orchestrator holds for one live call.
struct CallRuntime {
    call_id: String,
    caller_channel_id: String,
    media_channel_id: Option<String>,
    bridge_id: Option<String>,
    transport_kind: TransportKind,
    provider: Arc<dyn ProviderAdapter>,
    conn: Arc<dyn TransportConnection>,
    cancel: CancellationToken,
    teardown_started: AtomicBool,
    control_tx: mpsc::UnboundedSender<CallControl>,
    uplink: Arc<UplinkQueue>,
    commit_guard: Arc<UplinkCommitGuard>,
    counters: Arc<CallCounters>,
    greeting_gate: parking_lot::Mutex<Option<GateHandle>>,
    started_at: Instant,
}

/// Top-level per-call supervisor, one instance per process.
pub struct CallOrchestrator {
    config: Config,
    store: Arc<SessionStore>,
    gating: Arc<GatingManager>,
    playback: PlaybackManager,
    providers: Arc<ProviderRegistry>,
    profiles: Arc<ProfileRegistry>,
    pbx: Arc<dyn PbxClient>,
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
    events: Arc<dyn EventEmitter>,
    metrics: Arc<MetricsRegistry>,
    cancel: CancellationToken,
    calls: DashMap<String, Arc<CallRuntime>>,
    pending_conns: DashMap<String, oneshot::Sender<Box<dyn TransportConnection>>>,
    /// channel_id -> call_id, for hangup correlation.
    channel_index: DashMap<String, String>,
}

impl CallOrchestrator {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: Config,
        store: Arc<SessionStore>,
        gating: Arc<GatingManager>,
        playback: PlaybackManager,
        providers: Arc<ProviderRegistry>,
        profiles: Arc<ProfileRegistry>,
        pbx: Arc<dyn PbxClient>,
        transports: HashMap<TransportKind, Arc<dyn Transport>>,
        events: Arc<dyn EventEmitter>,
        metrics: Arc<MetricsRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            store,
            gating,
            playback,
            providers,
            profiles,
            pbx,
            transports,
            events,
            metrics,
            cancel,
            calls: DashMap::new(),
            pending_conns: DashMap::new(),
            channel_index: DashMap::new(),
        }
    }

    /// Number of live calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.len()
    }

    /// Main dispatch loop. Runs until the process-level token cancels.
    pub async fn run(
        self: Arc<Self>,
        mut pbx_events: mpsc::Receiver<PbxCallEvent>,
        mut new_conns: mpsc::Receiver<Box<dyn TransportConnection>>,
        mut playback_signals: mpsc::UnboundedReceiver<PlaybackSignal>,
    ) {
        let mut sweep = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(event) = pbx_events.recv() => self.handle_pbx_event(event),
                Some(conn) = new_conns.recv() => {
                    // Correlation may need to wait out a setup race; never
                    // stall the dispatch loop for it.
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.handle_connection(conn).await });
                }
                Some(signal) = playback_signals.recv() => self.handle_playback_signal(signal).await,
                _ = sweep.tick() => self.housekeeping_sweep(),
                else => break,
            }
        }
        log::info!("[Orchestrator] Dispatch loop stopped");
    }

    fn handle_pbx_event(self: &Arc<Self>, event: PbxCallEvent) {
        match event {
            PbxCallEvent::CallerEntered(arrival) => {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    this.setup_call(arrival, None).await;
                });
            }
            PbxCallEvent::ChannelDestroyed { channel_id } => {
                if let Some(call_id) = self
                    .channel_index
                    .get(&channel_id)
                    .map(|e| e.value().clone())
                {
                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        this.teardown(&call_id, "caller_hangup").await;
                    });
                }
            }
            PbxCallEvent::PlaybackFinished { channel_id, .. } => {
                if let Some(call_id) = self
                    .channel_index
                    .get(&channel_id)
                    .map(|e| e.value().clone())
                {
                    self.finish_greeting(&call_id);
                }
            }
        }
    }

    /// Routes a freshly correlated media connection.
    async fn handle_connection(self: &Arc<Self>, mut conn: Box<dyn TransportConnection>) {
        let call_id = conn.call_id().to_string();

        // Media regularly beats the setup task to its waiter registration;
        // as long as the session exists, hold the connection briefly.
        for _ in 0..40 {
            match self.pending_conns.remove(&call_id) {
                Some((_, waiter)) => match waiter.send(conn) {
                    Ok(()) => return,
                    Err(returned) => {
                        log::warn!(
                            "[Orchestrator] {} setup gone before media arrived",
                            call_id
                        );
                        conn = returned;
                        break;
                    }
                },
                None if self.store.get(&call_id).is_some() => {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
                None => break,
            }
        }

        if self.config.transport.direct_media && self.store.get(&call_id).is_none() {
            // Dialplan-driven deployment: the media connection IS the call
            // arrival.
            log::info!("[Orchestrator] {} arrived via direct media", call_id);
            let arrival = CallerArrival {
                call_id: call_id.clone(),
                caller_channel_id: format!("direct-{call_id}"),
                dialplan_context: None,
                variables: HashMap::new(),
            };
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.setup_call(arrival, Some(conn)).await;
            });
            return;
        }

        log::warn!("[Orchestrator] Dropping uncorrelated connection for {}", call_id);
        conn.close().await;
    }

    async fn handle_playback_signal(self: &Arc<Self>, signal: PlaybackSignal) {
        match signal {
            PlaybackSignal::Started { stream_id, .. } => {
                log::debug!("[Orchestrator] Playback started: {}", stream_id);
            }
            PlaybackSignal::Stalled { stream_id, .. } => {
                log::debug!("[Orchestrator] Playback stalled: {}", stream_id);
            }
            PlaybackSignal::FallbackWanted { call_id, stream_id } => {
                self.play_stall_filler(&call_id, &stream_id).await;
            }
            PlaybackSignal::Ended {
                call_id,
                reason,
                underflows,
                ..
            } => {
                if let Some(runtime) = self.calls.get(&call_id) {
                    runtime
                        .counters
                        .underflows
                        .fetch_add(underflows, Ordering::Relaxed);
                    let _ = runtime.control_tx.send(CallControl::PlaybackEnded(reason));
                }
            }
        }
    }

    async fn play_stall_filler(&self, call_id: &str, stream_id: &str) {
        let Some(runtime) = self.calls.get(call_id).map(|r| Arc::clone(r.value())) else {
            return;
        };
        runtime
            .counters
            .fallback_activations
            .fetch_add(1, Ordering::Relaxed);
        self.events.emit_media(MediaEvent::PlaybackStalled {
            call_id: call_id.to_string(),
            stream_id: stream_id.to_string(),
            timestamp: now_millis(),
        });
        let uri = self.config.media.stall_filler_uri.clone();
        if let Err(e) = self
            .pbx
            .play_media(&runtime.caller_channel_id, &uri)
            .await
        {
            log::warn!("[Orchestrator] {} filler playback failed: {}", call_id, e);
        }
    }

    /// Releases the greeting gate once the PBX reports the file finished.
    fn finish_greeting(&self, call_id: &str) {
        let Some(runtime) = self.calls.get(call_id) else {
            return;
        };
        let gate = runtime.greeting_gate.lock().take();
        if let Some(gate) = gate {
            self.gating.release(gate);
            self.gating.arm_default_guard(call_id);
            let _ = self
                .store
                .update(call_id, |s| s.transition(SessionState::Listening));
            log::info!("[Orchestrator] {} greeting finished", call_id);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Call setup
    // ─────────────────────────────────────────────────────────────────────

    async fn setup_call(
        self: &Arc<Self>,
        arrival: CallerArrival,
        pre_conn: Option<Box<dyn TransportConnection>>,
    ) {
        let call_id = arrival.call_id.clone();
        match self.try_setup(&arrival, pre_conn).await {
            Ok(()) => {}
            Err(e) => {
                log::error!("[Orchestrator] {} setup failed: {} ({})", call_id, e, e.code());
                self.fail_setup(&arrival).await;
            }
        }
    }

    async fn try_setup(
        self: &Arc<Self>,
        arrival: &CallerArrival,
        pre_conn: Option<Box<dyn TransportConnection>>,
    ) -> AgentResult<()> {
        let call_id = &arrival.call_id;
        let transport_kind = self.config.transport.default;
        let provider_name = resolve_provider_name(
            arrival.variable(VAR_PROVIDER),
            arrival.dialplan_context.as_deref(),
            &self.config.context_providers,
            &self.config.default_provider,
        );
        let profile = self
            .profiles
            .resolve_for_call(arrival.variable(VAR_AUDIO_PROFILE), transport_kind)?
            .clone();

        self.store.create(CallSession::new(
            call_id.clone(),
            arrival.caller_channel_id.clone(),
            profile.clone(),
            transport_kind,
            provider_name.clone(),
        ))?;
        let counters = self.metrics.for_call(call_id);
        self.events.emit_call(CallEvent::Started {
            call_id: call_id.clone(),
            provider: provider_name.clone(),
            transport: transport_kind.as_str().to_string(),
            timestamp: now_millis(),
        });
        log::info!(
            "[Orchestrator] {} arrived: provider={}, profile={}, transport={}",
            call_id,
            provider_name,
            profile.name,
            transport_kind
        );

        self.pbx.answer(&arrival.caller_channel_id).await?;

        // Bridge the caller with a media leg pointed at our transport.
        let transport = self
            .transports
            .get(&transport_kind)
            .ok_or(AgentError::Transport(TransportError::NotCorrelated))?;

        let conn: Box<dyn TransportConnection> = match pre_conn {
            Some(conn) => conn,
            None => {
                self.store
                    .update(call_id, |s| s.transition(SessionState::Bridging))?;
                let endpoint = transport.allocate_endpoint(call_id).await?;
                let bridge_id = self.pbx.create_bridge(call_id).await?;
                let media_channel = self
                    .pbx
                    .originate_media_channel(call_id, transport_kind, &endpoint)
                    .await?;
                self.pbx
                    .add_to_bridge(&bridge_id, &arrival.caller_channel_id)
                    .await?;
                self.pbx.add_to_bridge(&bridge_id, &media_channel).await?;
                self.store.update(call_id, |s| {
                    s.bridge_id = Some(bridge_id);
                    s.media_channel_id = Some(media_channel);
                })?;

                let (conn_tx, conn_rx) = oneshot::channel();
                self.pending_conns.insert(call_id.clone(), conn_tx);
                let wait = Duration::from_secs(
                    self.config.session.provider_handshake_timeout_secs,
                );
                match tokio::time::timeout(wait, conn_rx).await {
                    Ok(Ok(conn)) => conn,
                    _ => {
                        self.pending_conns.remove(call_id);
                        transport.release_endpoint(call_id);
                        return Err(AgentError::Transport(TransportError::NotCorrelated));
                    }
                }
            }
        };
        conn.configure(profile.ingress);
        let conn: Arc<dyn TransportConnection> = Arc::from(conn);

        // Provider handshake, bounded.
        self.store
            .update(call_id, |s| s.transition(SessionState::HandshakingProvider))?;
        let provider = self.providers.create(&provider_name)?;
        let (provider_tx, provider_rx) = mpsc::unbounded_channel();
        let handshake = tokio::time::timeout(
            Duration::from_secs(self.config.session.provider_handshake_timeout_secs),
            provider.start_session(
                call_id,
                &profile,
                arrival.variable(VAR_CONTEXT),
                provider_tx,
            ),
        )
        .await;
        let handshake_result = match handshake {
            Ok(result) => result,
            Err(_) => Err(ProviderError::HandshakeTimeout),
        };
        self.metrics.record_handshake(handshake_result.is_ok());
        if let Err(e) = handshake_result {
            self.events.emit_call(CallEvent::HandshakeFailed {
                call_id: call_id.clone(),
                provider: provider_name.clone(),
                error: e.to_string(),
                timestamp: now_millis(),
            });
            conn.close().await;
            return Err(e.into());
        }

        // Assemble the runtime and spawn the per-call tasks.
        let capabilities = provider.capabilities();
        let (bridge_id, media_channel_id) = self
            .store
            .update(call_id, |s| (s.bridge_id.clone(), s.media_channel_id.clone()))?;
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let uplink_capacity =
            (self.config.session.upstream_queue_ms / u64::from(FRAME_DURATION_MS)).max(1) as usize;
        let runtime = Arc::new(CallRuntime {
            call_id: call_id.clone(),
            caller_channel_id: arrival.caller_channel_id.clone(),
            media_channel_id,
            bridge_id,
            transport_kind,
            provider: Arc::clone(&provider),
            conn: Arc::clone(&conn),
            cancel: self.cancel.child_token(),
            teardown_started: AtomicBool::new(false),
            control_tx,
            uplink: Arc::new(UplinkQueue::new(uplink_capacity)),
            commit_guard: Arc::new(UplinkCommitGuard::new(
                self.config.session.min_commit_ms,
                capabilities.min_commit_ms,
            )),
            counters: Arc::clone(&counters),
            greeting_gate: parking_lot::Mutex::new(None),
            started_at: Instant::now(),
        });
        self.calls.insert(call_id.clone(), Arc::clone(&runtime));
        self.channel_index
            .insert(arrival.caller_channel_id.clone(), call_id.clone());
        if let Some(media) = &runtime.media_channel_id {
            self.channel_index.insert(media.clone(), call_id.clone());
        }

        let (sink_tx, sink_rx) = mpsc::channel(8);
        self.playback.attach_sink(call_id, sink_tx);

        let coordinator = ConversationCoordinator::new(
            call_id.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.gating),
            self.playback.clone(),
            Arc::clone(&provider),
            profile.clone(),
            self.config.barge_in.clone(),
            Arc::clone(&counters),
            Arc::clone(&self.events),
        );

        tokio::spawn(Arc::clone(self).inbound_loop(Arc::clone(&runtime), profile.clone()));
        tokio::spawn(Arc::clone(self).outbound_loop(Arc::clone(&runtime), sink_rx));
        tokio::spawn(Arc::clone(self).uplink_loop(Arc::clone(&runtime)));
        tokio::spawn(Arc::clone(self).call_event_loop(
            Arc::clone(&runtime),
            coordinator,
            provider_rx,
            control_rx,
        ));
        tokio::spawn(Arc::clone(self).call_watchdog(Arc::clone(&runtime)));

        // Greeting, if configured; gated for its whole duration.
        if let Some(greeting) = self.config.media.greeting_uri.clone() {
            self.store
                .update(call_id, |s| s.transition(SessionState::Greeting))?;
            let gate = self.gating.acquire(call_id, reason::GREETING);
            match self
                .pbx
                .play_media(&arrival.caller_channel_id, &greeting)
                .await
            {
                Ok(()) => {
                    *runtime.greeting_gate.lock() = Some(gate);
                }
                Err(e) => {
                    log::warn!("[Orchestrator] {} greeting failed: {}", call_id, e);
                    self.gating.release(gate);
                    self.store
                        .update(call_id, |s| s.transition(SessionState::Listening))?;
                }
            }
        } else {
            self.store
                .update(call_id, |s| s.transition(SessionState::Listening))?;
        }

        log::info!("[Orchestrator] {} is live", call_id);
        Ok(())
    }

    /// Best-effort error prompt, then full cleanup of whatever setup built.
    async fn fail_setup(&self, arrival: &CallerArrival) {
        let _ = self
            .pbx
            .play_media(
                &arrival.caller_channel_id,
                &self.config.media.setup_error_uri,
            )
            .await;

        if self.calls.contains_key(&arrival.call_id) {
            self.teardown(&arrival.call_id, "setup_failure").await;
            return;
        }
        // Session may exist without a runtime (early failure).
        if let Some(session) = self.store.remove(&arrival.call_id) {
            let (bridge, media) = {
                let mut session = session.lock();
                session.transition(SessionState::Closed);
                (session.bridge_id.clone(), session.media_channel_id.clone())
            };
            if let Some(bridge) = bridge {
                let _ = self.pbx.destroy_bridge(&bridge).await;
            }
            if let Some(media) = media {
                let _ = self.pbx.hangup(&media).await;
            }
        }
        if let Some(transport) = self.transports.get(&self.config.transport.default) {
            transport.release_endpoint(&arrival.call_id);
        }
        self.pending_conns.remove(&arrival.call_id);
        let _ = self.pbx.hangup(&arrival.caller_channel_id).await;
        self.metrics
            .close_call(&arrival.call_id, "setup_failure", 0);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Per-call loops
    // ─────────────────────────────────────────────────────────────────────

    /// Transport → codec kit → gate → uplink queue.
    async fn inbound_loop(self: Arc<Self>, runtime: Arc<CallRuntime>, profile: AudioProfile) {
        let gap = Duration::from_millis(INBOUND_GAP_SILENCE_MS);
        let call_id = runtime.call_id.clone();

        loop {
            let inbound = tokio::select! {
                _ = runtime.cancel.cancelled() => break,
                result = runtime.conn.read_frame(gap) => result,
            };

            let inbound = match inbound {
                Ok(inbound) => inbound,
                Err(TransportError::Closed) => {
                    log::info!("[Orchestrator] {} transport closed", call_id);
                    self.teardown(&call_id, "transport_closed").await;
                    break;
                }
                Err(e) => {
                    log::error!("[Orchestrator] {} transport failed: {}", call_id, e);
                    self.teardown(&call_id, "transport_failure").await;
                    break;
                }
            };

            if !inbound.is_gap() {
                runtime.counters.frames_in.fetch_add(1, Ordering::Relaxed);
                let _ = self.store.update(&call_id, |s| {
                    s.last_inbound_frame_at = Some(Instant::now());
                });
            }

            let frame = inbound.frame();
            let (samples, truncated) = decode_to_pcm16(&frame.payload, frame.codec);
            if truncated {
                runtime.counters.short_reads.fetch_add(1, Ordering::Relaxed);
            }

            if self.gating.is_gated(&call_id) {
                runtime
                    .counters
                    .gating_discarded
                    .fetch_add(1, Ordering::Relaxed);
                // The frame never reaches the provider, but the energy tap
                // still sees it for barge-in detection.
                let _ = runtime.control_tx.send(CallControl::GatedFrame(samples));
                continue;
            }

            let upstream = match resample_pcm16(
                &samples,
                profile.ingress.sample_rate,
                profile.provider.sample_rate,
            ) {
                Ok(samples) => samples,
                Err(e) => {
                    // Profiles are validated at setup; this is an invariant
                    // breach, not a codec hiccup.
                    log::error!("[Orchestrator] {} uplink resample failed: {}", call_id, e);
                    self.teardown(&call_id, "internal_error").await;
                    break;
                }
            };
            let dropped = runtime.uplink.push(pcm16_to_bytes(&upstream));
            if dropped > 0 {
                runtime
                    .counters
                    .upstream_overflow
                    .fetch_add(dropped, Ordering::Relaxed);
                self.events.emit_media(MediaEvent::UpstreamOverflow {
                    call_id: call_id.clone(),
                    dropped_frames: dropped,
                    timestamp: now_millis(),
                });
            }
        }
    }

    /// Uplink queue → provider, in capture order.
    async fn uplink_loop(self: Arc<Self>, runtime: Arc<CallRuntime>) {
        let call_id = runtime.call_id.clone();
        loop {
            let frame = tokio::select! {
                _ = runtime.cancel.cancelled() => break,
                frame = runtime.uplink.pop() => frame,
            };
            match runtime.provider.send_audio(&call_id, frame).await {
                Ok(()) => {
                    runtime.commit_guard.add(u64::from(FRAME_DURATION_MS));
                }
                Err(e) if e.severity() == crate::error::Severity::Transient => {
                    log::warn!("[Orchestrator] {} uplink hiccup: {}", call_id, e);
                }
                Err(e) => {
                    log::error!("[Orchestrator] {} uplink failed: {}", call_id, e);
                    self.teardown(&call_id, "provider_failure").await;
                    break;
                }
            }
        }
    }

    /// Playback sink → transport, in synthesis order.
    async fn outbound_loop(
        self: Arc<Self>,
        runtime: Arc<CallRuntime>,
        mut sink_rx: mpsc::Receiver<crate::audio::AudioFrame>,
    ) {
        let call_id = runtime.call_id.clone();
        loop {
            let frame = tokio::select! {
                _ = runtime.cancel.cancelled() => break,
                frame = sink_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            match runtime.conn.write_frame(&frame).await {
                Ok(()) => {
                    runtime.counters.frames_out.fetch_add(1, Ordering::Relaxed);
                    let _ = self.store.update(&call_id, |s| {
                        s.last_agent_audio_at = Some(Instant::now());
                    });
                }
                Err(TransportError::Closed) => {
                    self.teardown(&call_id, "transport_closed").await;
                    break;
                }
                Err(e) => {
                    log::error!("[Orchestrator] {} outbound write failed: {}", call_id, e);
                    self.teardown(&call_id, "transport_failure").await;
                    break;
                }
            }
        }
    }

    /// Provider events, playback signals and energy taps, serialized
    /// through the coordinator in arrival order.
    async fn call_event_loop(
        self: Arc<Self>,
        runtime: Arc<CallRuntime>,
        mut coordinator: ConversationCoordinator,
        mut provider_rx: mpsc::UnboundedReceiver<ProviderEvent>,
        mut control_rx: mpsc::UnboundedReceiver<CallControl>,
    ) {
        let call_id = runtime.call_id.clone();
        let chunk_limit_ms = self.config.session.provider_chunk_queue_ms;

        loop {
            let verdict = tokio::select! {
                _ = runtime.cancel.cancelled() => break,
                Some(event) = provider_rx.recv() => {
                    self.dispatch_provider_event(&runtime, &mut coordinator, event, chunk_limit_ms)
                        .await
                }
                Some(control) = control_rx.recv() => match control {
                    CallControl::PlaybackEnded(reason) => {
                        coordinator.handle_playback_ended(reason)
                    }
                    CallControl::GatedFrame(samples) => {
                        coordinator.note_gated_frame(&samples).await
                    }
                },
                else => break,
            };

            if let CoordinatorVerdict::Teardown(teardown_reason) = verdict {
                self.teardown(&call_id, teardown_reason).await;
                break;
            }
        }
        coordinator.clear();
    }

    async fn dispatch_provider_event(
        self: &Arc<Self>,
        runtime: &Arc<CallRuntime>,
        coordinator: &mut ConversationCoordinator,
        event: ProviderEvent,
        chunk_limit_ms: u64,
    ) -> CoordinatorVerdict {
        let call_id = &runtime.call_id;
        match event {
            ProviderEvent::ToolCall {
                tool, arguments, ..
            } => self.handle_tool_call(runtime, &tool, arguments).await,
            ProviderEvent::Error { message, fatal, .. } => {
                if fatal {
                    log::error!("[Orchestrator] {} provider error: {}", call_id, message);
                    CoordinatorVerdict::Teardown("provider_failure")
                } else {
                    log::warn!("[Orchestrator] {} provider hiccup: {}", call_id, message);
                    CoordinatorVerdict::Continue
                }
            }
            ProviderEvent::Closed { .. } => {
                log::info!("[Orchestrator] {} provider closed the session", call_id);
                CoordinatorVerdict::Teardown("provider_closed")
            }
            ProviderEvent::CallerSpeechStopped { .. } => {
                // Commit boundary on end of caller speech, but never over
                // an (almost) empty upstream buffer.
                if runtime.commit_guard.take_if_ready() {
                    if let Err(e) = runtime.provider.commit_audio(call_id).await {
                        log::warn!("[Orchestrator] {} commit failed: {}", call_id, e);
                    } else {
                        runtime.counters.commits.fetch_add(1, Ordering::Relaxed);
                    }
                }
                coordinator
                    .handle_provider_event(ProviderEvent::CallerSpeechStopped {
                        call_id: call_id.clone(),
                    })
                    .await
            }
            other => {
                let is_chunk = matches!(other, ProviderEvent::AudioChunk { .. });
                let verdict = coordinator.handle_provider_event(other).await;
                if is_chunk {
                    // A provider flooding us past the intake bound is
                    // malfunctioning; drop the response rather than buffer
                    // minutes of audio.
                    if let Some(depth) = self.playback.depth_ms(call_id) {
                        if depth > chunk_limit_ms {
                            log::warn!(
                                "[Orchestrator] {} provider overran intake ({}ms buffered)",
                                call_id,
                                depth
                            );
                            self.playback.cancel(call_id, "provider-overrun");
                            let _ = runtime.provider.cancel_response(call_id).await;
                        }
                    }
                }
                verdict
            }
        }
    }

    async fn handle_tool_call(
        self: &Arc<Self>,
        runtime: &Arc<CallRuntime>,
        tool: &str,
        _arguments: serde_json::Value,
    ) -> CoordinatorVerdict {
        let call_id = &runtime.call_id;
        match tool {
            "hangup" => {
                log::info!("[Orchestrator] {} agent requested hangup", call_id);
                let _ = runtime
                    .provider
                    .send_tool_result(call_id, "hangup", serde_json::json!({"status": "ok"}))
                    .await;
                let _ = self
                    .store
                    .update(call_id, |s| s.transition(SessionState::Farewell));

                // If no spoken farewell concludes, force the teardown.
                let this = Arc::clone(self);
                let call_id = call_id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(FAREWELL_GRACE).await;
                    this.teardown(&call_id, "tool_hangup").await;
                });
                CoordinatorVerdict::Continue
            }
            other => {
                // Tool execution is the embedder's concern; a tool nobody
                // registered gets an error result so the agent can recover.
                log::warn!("[Orchestrator] {} unsupported tool '{}'", call_id, other);
                let _ = runtime
                    .provider
                    .send_tool_result(
                        call_id,
                        other,
                        serde_json::json!({"error": "tool not available"}),
                    )
                    .await;
                CoordinatorVerdict::Continue
            }
        }
    }

    /// Per-call watchdog: silent-inbound timeout and duration ceiling.
    async fn call_watchdog(self: Arc<Self>, runtime: Arc<CallRuntime>) {
        let call_id = runtime.call_id.clone();
        let silent_limit = Duration::from_secs(self.config.session.silent_inbound_timeout_secs);
        let max_duration = self.config.session.max_call_duration_secs;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = runtime.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let last_inbound = self
                        .store
                        .get(&call_id)
                        .and_then(|s| s.lock().last_inbound_frame_at)
                        .unwrap_or(runtime.started_at);
                    if silent_limit > Duration::ZERO && last_inbound.elapsed() > silent_limit {
                        log::warn!(
                            "[Orchestrator] {} silent for {}s, tearing down",
                            call_id,
                            last_inbound.elapsed().as_secs()
                        );
                        self.teardown(&call_id, "silent_inbound").await;
                        break;
                    }
                    if max_duration > 0
                        && runtime.started_at.elapsed() > Duration::from_secs(max_duration)
                    {
                        log::warn!("[Orchestrator] {} hit max duration, tearing down", call_id);
                        self.teardown(&call_id, "max_duration").await;
                        break;
                    }
                }
            }
        }
    }

    /// Global sweep: leaked gating tokens, session snapshot logging.
    fn housekeeping_sweep(&self) {
        let reclaimed = self.gating.release_stale(STALE_TOKEN_AGE);
        if reclaimed > 0 {
            log::warn!("[Orchestrator] Reclaimed {} stale gate token(s)", reclaimed);
        }
        let snapshot = self.store.snapshot();
        if !snapshot.is_empty() {
            log::debug!(
                "[Orchestrator] {} live call(s): {}",
                snapshot.len(),
                serde_json::to_string(&snapshot).unwrap_or_default()
            );
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Teardown
    // ─────────────────────────────────────────────────────────────────────

    /// Tears a call down. Idempotent and safe to invoke from any task;
    /// the first caller wins and the order is fixed: playback, provider,
    /// gating, session store, transport, bridge/channels.
    pub async fn teardown(&self, call_id: &str, teardown_reason: &'static str) {
        let Some(runtime) = self.calls.get(call_id).map(|r| Arc::clone(r.value())) else {
            return;
        };
        if runtime.teardown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("[Orchestrator] {} tearing down ({})", call_id, teardown_reason);
        let _ = self
            .store
            .update(call_id, |s| s.transition(SessionState::TearingDown));

        // 1. Playback stops emitting.
        self.playback.cancel(call_id, "teardown");
        self.playback.detach_sink(call_id);

        // 2. Provider session ends.
        if let Err(e) = runtime.provider.end_session(call_id).await {
            log::warn!("[Orchestrator] {} provider end_session failed: {}", call_id, e);
        }

        // 3. Gating tokens released.
        let leaked = self.gating.clear(call_id);
        if leaked > 0 {
            log::debug!("[Orchestrator] {} released {} gate token(s)", call_id, leaked);
        }

        // 4. Session leaves the store.
        let duration_ms = runtime.started_at.elapsed().as_millis() as u64;
        if let Some(session) = self.store.remove(call_id) {
            session.lock().transition(SessionState::Closed);
        }

        // 5. Per-call tasks stop; transport closes.
        runtime.cancel.cancel();
        runtime.conn.close().await;
        if let Some(transport) = self.transports.get(&runtime.transport_kind) {
            transport.release_endpoint(call_id);
        }
        self.pending_conns.remove(call_id);

        // 6. PBX resources.
        if let Some(media) = &runtime.media_channel_id {
            let _ = self.pbx.hangup(media).await;
            self.channel_index.remove(media);
        }
        let _ = self.pbx.hangup(&runtime.caller_channel_id).await;
        self.channel_index.remove(&runtime.caller_channel_id);
        if let Some(bridge) = &runtime.bridge_id {
            let _ = self.pbx.destroy_bridge(bridge).await;
        }

        self.calls.remove(call_id);
        self.metrics.close_call(call_id, teardown_reason, duration_ms);
        self.events.emit_call(CallEvent::Ended {
            call_id: call_id.to_string(),
            reason: teardown_reason,
            duration_ms,
            timestamp: now_millis(),
        });
        log::info!(
            "[Orchestrator] {} closed after {}ms ({})",
            call_id,
            duration_ms,
            teardown_reason
        );
    }

    /// Tears down every live call, for process shutdown.
    pub async fn shutdown(&self) {
        let call_ids: Vec<String> = self.calls.iter().map(|e| e.key().clone()).collect();
        log::info!("[Orchestrator] Shutting down {} call(s)", call_ids.len());
        for call_id in call_ids {
            self.teardown(&call_id, "shutdown").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uplink_queue_drops_oldest_on_overflow() {
        let queue = UplinkQueue::new(3);
        assert_eq!(queue.push(Bytes::from_static(b"a")), 0);
        assert_eq!(queue.push(Bytes::from_static(b"b")), 0);
        assert_eq!(queue.push(Bytes::from_static(b"c")), 0);
        assert_eq!(queue.push(Bytes::from_static(b"d")), 1);

        // Oldest ("a") was dropped; order of the rest is preserved.
        let drained: Vec<Bytes> = {
            let mut frames = queue.frames.lock();
            frames.drain(..).collect()
        };
        assert_eq!(drained, vec![
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c"),
            Bytes::from_static(b"d"),
        ]);
    }

    #[tokio::test]
    async fn uplink_queue_pop_waits_for_push() {
        let queue = Arc::new(UplinkQueue::new(4));
        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.push(Bytes::from_static(b"x"));
        assert_eq!(popper.await.unwrap(), Bytes::from_static(b"x"));
    }
}
