//! Full-call scenarios against mock collaborators.
//!
//! A scripted provider, a recording PBX client and a channel-backed
//! transport connection drive the orchestrator through whole
//! conversations under paused tokio time: clean turns, barge-in,
//! post-playback echo suppression, commit floors, and teardown races.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parley_core::audio::pcm16_to_bytes;
use parley_core::pbx::{CallerArrival, PbxCallEvent, PbxClient, PbxError};
use parley_core::playback::PlaybackManager;
use parley_core::protocol_constants::FRAME_DURATION_MS;
use parley_core::provider::{
    ProviderAdapter, ProviderCapabilities, ProviderError, ProviderEvent, ProviderRegistry,
};
use parley_core::session::SessionState;
use parley_core::transport::{
    InboundFrame, Transport, TransportConnection, TransportError, TransportKind,
};
use parley_core::{
    AudioFrame, AudioProfile, CallOrchestrator, Codec, Config, GatingManager, MetricsRegistry,
    NoopEventEmitter, ProfileRegistry, SessionStore,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ─────────────────────────────────────────────────────────────────────────
// Mock collaborators
// ─────────────────────────────────────────────────────────────────────────

/// Provider whose events are emitted by the test script.
struct ScriptedProvider {
    capabilities: ProviderCapabilities,
    events: parking_lot::Mutex<Option<mpsc::UnboundedSender<ProviderEvent>>>,
    frames_received: AtomicU64,
    commits: AtomicU64,
    cancels: AtomicU64,
    sessions_ended: AtomicU64,
}

impl ScriptedProvider {
    fn new(barge_in_events: bool) -> Arc<Self> {
        Arc::new(Self {
            capabilities: ProviderCapabilities {
                barge_in_events,
                native_input_rate_hz: 16_000,
                continuous_output: true,
                min_commit_ms: 100,
            },
            events: parking_lot::Mutex::new(None),
            frames_received: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            cancels: AtomicU64::new(0),
            sessions_ended: AtomicU64::new(0),
        })
    }

    fn emit(&self, event: ProviderEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities.clone()
    }

    async fn start_session(
        &self,
        _call_id: &str,
        _profile: &AudioProfile,
        _initial_context: Option<&str>,
        events: mpsc::UnboundedSender<ProviderEvent>,
    ) -> Result<(), ProviderError> {
        *self.events.lock() = Some(events);
        Ok(())
    }

    async fn send_audio(&self, _call_id: &str, _pcm: Bytes) -> Result<(), ProviderError> {
        self.frames_received.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit_audio(&self, _call_id: &str) -> Result<(), ProviderError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cancel_response(&self, _call_id: &str) -> Result<(), ProviderError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn end_session(&self, _call_id: &str) -> Result<(), ProviderError> {
        self.sessions_ended.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// PBX client that records every control operation.
#[derive(Default)]
struct RecordingPbx {
    operations: parking_lot::Mutex<Vec<String>>,
}

impl RecordingPbx {
    fn record(&self, op: String) {
        self.operations.lock().push(op);
    }

    fn count_of(&self, prefix: &str) -> usize {
        self.operations
            .lock()
            .iter()
            .filter(|op| op.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl PbxClient for RecordingPbx {
    async fn answer(&self, channel_id: &str) -> Result<(), PbxError> {
        self.record(format!("answer {channel_id}"));
        Ok(())
    }

    async fn create_bridge(&self, call_id: &str) -> Result<String, PbxError> {
        self.record(format!("bridge {call_id}"));
        Ok(format!("bridge-{call_id}"))
    }

    async fn originate_media_channel(
        &self,
        call_id: &str,
        _kind: TransportKind,
        endpoint: &str,
    ) -> Result<String, PbxError> {
        self.record(format!("originate {call_id} {endpoint}"));
        Ok(format!("media-{call_id}"))
    }

    async fn add_to_bridge(&self, bridge_id: &str, channel_id: &str) -> Result<(), PbxError> {
        self.record(format!("add {bridge_id} {channel_id}"));
        Ok(())
    }

    async fn play_media(&self, channel_id: &str, media_uri: &str) -> Result<(), PbxError> {
        self.record(format!("play {channel_id} {media_uri}"));
        Ok(())
    }

    async fn hangup(&self, channel_id: &str) -> Result<(), PbxError> {
        self.record(format!("hangup {channel_id}"));
        Ok(())
    }

    async fn destroy_bridge(&self, bridge_id: &str) -> Result<(), PbxError> {
        self.record(format!("destroy {bridge_id}"));
        Ok(())
    }
}

/// Transport whose endpoint allocation is a fixed address; connections are
/// injected by the test.
struct StaticTransport;

#[async_trait]
impl Transport for StaticTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::AudioSocket
    }

    async fn allocate_endpoint(&self, _call_id: &str) -> Result<String, TransportError> {
        Ok("127.0.0.1:9092".to_string())
    }

    fn release_endpoint(&self, _call_id: &str) {}
}

/// Media connection backed by in-process channels.
struct ChannelConnection {
    call_id: String,
    ingress: parking_lot::RwLock<Codec>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    outbound: mpsc::UnboundedSender<AudioFrame>,
    closed: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl TransportConnection for ChannelConnection {
    fn call_id(&self) -> &str {
        &self.call_id
    }

    fn configure(&self, ingress: Codec) {
        *self.ingress.write() = ingress;
    }

    async fn read_frame(&self, gap_deadline: Duration) -> Result<InboundFrame, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let ingress = *self.ingress.read();
        let mut inbound = self.inbound.lock().await;
        match tokio::time::timeout(gap_deadline, inbound.recv()).await {
            Ok(Some(payload)) => Ok(InboundFrame::Live(AudioFrame::new(payload, ingress))),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Ok(InboundFrame::Gap(AudioFrame::silence(ingress))),
        }
    }

    async fn write_frame(&self, frame: &AudioFrame) -> Result<(), TransportError> {
        self.outbound
            .send(frame.clone())
            .map_err(|_| TransportError::Closed)
    }

    fn outbound_dropped(&self) -> u64 {
        0
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Fixture
// ─────────────────────────────────────────────────────────────────────────

struct Call {
    orchestrator: Arc<CallOrchestrator>,
    provider: Arc<ScriptedProvider>,
    pbx: Arc<RecordingPbx>,
    store: Arc<SessionStore>,
    gating: Arc<GatingManager>,
    metrics: Arc<MetricsRegistry>,
    caller_tx: mpsc::UnboundedSender<Bytes>,
    agent_rx: mpsc::UnboundedReceiver<AudioFrame>,
    _conns_tx: mpsc::Sender<Box<dyn TransportConnection>>,
    pbx_events_tx: mpsc::Sender<PbxCallEvent>,
}

async fn start_call(barge_in_events: bool) -> Call {
    let mut config = Config::default();
    config.default_provider = "scripted".to_string();
    // The mock clocks below assume the documented defaults.
    assert_eq!(config.streaming.min_start_ms, 300);
    assert_eq!(config.gating.post_tts_guard_ms, 300);

    let store = Arc::new(SessionStore::new());
    let gating = Arc::new(GatingManager::new(Duration::from_millis(
        config.gating.post_tts_guard_ms,
    )));
    let metrics = Arc::new(MetricsRegistry::new());
    let profiles = Arc::new(ProfileRegistry::with_defaults());
    let (signals_tx, signals_rx) = mpsc::unbounded_channel();
    let playback = PlaybackManager::new(config.streaming.clone(), signals_tx);

    let provider = ScriptedProvider::new(barge_in_events);
    let providers = Arc::new(ProviderRegistry::new(HashMap::new()));
    {
        let provider = Arc::clone(&provider);
        providers.register(
            "scripted",
            Arc::new(move |_| Ok(Arc::clone(&provider) as Arc<dyn ProviderAdapter>)),
        );
    }

    let pbx = Arc::new(RecordingPbx::default());
    let mut transports: HashMap<TransportKind, Arc<dyn Transport>> = HashMap::new();
    transports.insert(TransportKind::AudioSocket, Arc::new(StaticTransport));

    let orchestrator = Arc::new(CallOrchestrator::new(
        config,
        Arc::clone(&store),
        Arc::clone(&gating),
        playback,
        providers,
        profiles,
        Arc::clone(&pbx) as Arc<dyn PbxClient>,
        transports,
        Arc::new(NoopEventEmitter),
        Arc::clone(&metrics),
        CancellationToken::new(),
    ));

    let (pbx_events_tx, pbx_events_rx) = mpsc::channel(16);
    let (conns_tx, conns_rx) = mpsc::channel(16);
    tokio::spawn(Arc::clone(&orchestrator).run(pbx_events_rx, conns_rx, signals_rx));

    // Inject the arrival, then the correlated media connection.
    let (caller_tx, caller_rx) = mpsc::unbounded_channel();
    let (agent_tx, agent_rx) = mpsc::unbounded_channel();
    let conn = ChannelConnection {
        call_id: "call-1".to_string(),
        ingress: parking_lot::RwLock::new(Codec::pcm16(8000)),
        inbound: tokio::sync::Mutex::new(caller_rx),
        outbound: agent_tx,
        closed: std::sync::atomic::AtomicBool::new(false),
    };
    pbx_events_tx
        .send(PbxCallEvent::CallerEntered(CallerArrival {
            call_id: "call-1".to_string(),
            caller_channel_id: "chan-caller".to_string(),
            dialplan_context: None,
            variables: HashMap::new(),
        }))
        .await
        .unwrap();
    // The session must exist before the media leg connects, as it would
    // with a real PBX (origination precedes the connection).
    assert!(
        wait_until(|| store.get("call-1").is_some()).await,
        "arrival never created a session"
    );
    conns_tx.send(Box::new(conn)).await.unwrap();

    let call = Call {
        orchestrator,
        provider,
        pbx,
        store,
        gating,
        metrics,
        caller_tx,
        agent_rx,
        _conns_tx: conns_tx,
        pbx_events_tx,
    };
    assert!(
        wait_until(|| call.store.get("call-1").is_some_and(
            |s| s.lock().state == SessionState::Listening
        ))
        .await,
        "call never reached listening"
    );
    call
}

/// Polls a condition under paused time, advancing up to ~10 virtual seconds.
async fn wait_until(cond: impl Fn() -> bool) -> bool {
    for _ in 0..1000 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

fn loud_frame() -> Bytes {
    let samples: Vec<i16> = (0..160)
        .map(|i| if i % 2 == 0 { 9000 } else { -9000 })
        .collect();
    pcm16_to_bytes(&samples)
}

async fn feed_caller_audio(call: &Call, frames: usize) {
    for _ in 0..frames {
        call.caller_tx.send(loud_frame()).unwrap();
        tokio::time::sleep(Duration::from_millis(u64::from(FRAME_DURATION_MS))).await;
    }
}

/// One 80ms chunk of agent audio at the provider rate (16kHz).
fn agent_chunk() -> ProviderEvent {
    ProviderEvent::AudioChunk {
        call_id: "call-1".to_string(),
        pcm: pcm16_to_bytes(&vec![4000i16; 16_000 * 80 / 1000]),
    }
}

fn drain_agent_frames(call: &mut Call) -> usize {
    let mut count = 0;
    while call.agent_rx.try_recv().is_ok() {
        count += 1;
    }
    count
}

// ─────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn clean_turn_runs_end_to_end() {
    let mut call = start_call(true).await;

    // Caller speaks for 1.5s; the uplink reaches the provider.
    call.provider.emit(ProviderEvent::CallerSpeechStarted {
        call_id: "call-1".to_string(),
    });
    feed_caller_audio(&call, 75).await;
    assert!(
        wait_until(|| call.provider.frames_received.load(Ordering::SeqCst) >= 50).await,
        "caller audio never reached the provider"
    );

    call.provider.emit(ProviderEvent::CallerSpeechStopped {
        call_id: "call-1".to_string(),
    });
    call.provider.emit(ProviderEvent::TranscriptFinal {
        call_id: "call-1".to_string(),
        text: "hello there".to_string(),
    });
    // Well past the 100ms floor: exactly one commit, no empty ones.
    assert!(wait_until(|| call.provider.commits.load(Ordering::SeqCst) == 1).await);

    // Agent responds: 12 x 80ms chunks, then done.
    for _ in 0..12 {
        call.provider.emit(agent_chunk());
    }
    // Gating must be armed from the first chunk onward.
    assert!(wait_until(|| call.gating.is_gated("call-1")).await);
    assert_eq!(call.gating.token_count("call-1"), 1);
    call.provider.emit(ProviderEvent::AudioDone {
        call_id: "call-1".to_string(),
    });

    // 960ms of audio = 48 outbound frames (give the pacer a tick of slack).
    assert!(
        wait_until(|| call.gating.token_count("call-1") == 0
            && call.gating.guard_active("call-1"))
        .await,
        "turn never completed"
    );
    assert_eq!(
        call.store.get("call-1").unwrap().lock().state,
        SessionState::Listening
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    let frames = drain_agent_frames(&mut call);
    assert!(
        (47..=49).contains(&frames),
        "expected ~48 outbound frames, got {frames}"
    );

    // Token released, post-TTS guard armed.
    assert_eq!(call.gating.token_count("call-1"), 0);
    assert!(call.gating.guard_active("call-1"));

    let snapshot = call.metrics.snapshot();
    let counters = snapshot.calls.get("call-1").unwrap();
    assert_eq!(counters.turns, 1);
    assert_eq!(counters.barge_ins, 0);
}

#[tokio::test(start_paused = true)]
async fn post_tts_guard_suppresses_echo_tail() {
    let mut call = start_call(true).await;

    // Short agent response.
    for _ in 0..4 {
        call.provider.emit(agent_chunk());
    }
    call.provider.emit(ProviderEvent::AudioDone {
        call_id: "call-1".to_string(),
    });
    assert!(
        wait_until(|| call.gating.token_count("call-1") == 0
            && call.gating.guard_active("call-1"))
        .await
    );
    drain_agent_frames(&mut call);

    // Bridge echo arrives right after playback ends; the guard eats it.
    let upstream_before = call.provider.frames_received.load(Ordering::SeqCst);
    let discarded_before = call
        .metrics
        .snapshot()
        .calls
        .get("call-1")
        .unwrap()
        .gating_discarded;
    for _ in 0..10 {
        call.caller_tx.send(loud_frame()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        if !call.gating.guard_active("call-1") {
            break;
        }
        assert_eq!(
            call.provider.frames_received.load(Ordering::SeqCst),
            upstream_before,
            "echo tail leaked upstream during the guard window"
        );
    }
    let discarded_after = call
        .metrics
        .snapshot()
        .calls
        .get("call-1")
        .unwrap()
        .gating_discarded;
    assert!(discarded_after > discarded_before);
}

#[tokio::test(start_paused = true)]
async fn barge_in_cancels_the_response() {
    let mut call = start_call(false).await;

    // Agent is mid-response with plenty buffered.
    call.provider.emit(ProviderEvent::CallerSpeechStarted {
        call_id: "call-1".to_string(),
    });
    call.provider.emit(ProviderEvent::CallerSpeechStopped {
        call_id: "call-1".to_string(),
    });
    for _ in 0..24 {
        call.provider.emit(agent_chunk());
    }
    assert!(wait_until(|| call.gating.is_gated("call-1")).await);
    // Let ~800ms of the response play out.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(drain_agent_frames(&mut call) > 20);

    // Caller talks over the agent above the energy threshold for 250ms.
    let turn_before = call.store.get("call-1").unwrap().lock().turn_id;
    feed_caller_audio(&call, 13).await;

    assert!(
        wait_until(|| call.provider.cancels.load(Ordering::SeqCst) == 1).await,
        "provider never saw the cancel"
    );
    // No further agent audio after the cancel settles.
    tokio::time::sleep(Duration::from_millis(60)).await;
    drain_agent_frames(&mut call);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(drain_agent_frames(&mut call), 0, "cancelled turn kept playing");

    // Late chunks of the cancelled response are dropped, and the turn
    // counter advanced for the caller's new turn.
    call.provider.emit(agent_chunk());
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(drain_agent_frames(&mut call), 0);
    let turn_after = call.store.get("call-1").unwrap().lock().turn_id;
    assert!(turn_after > turn_before);

    let snapshot = call.metrics.snapshot();
    assert_eq!(snapshot.calls.get("call-1").unwrap().barge_ins, 1);
}

#[tokio::test(start_paused = true)]
async fn caller_hangup_tears_down_once() {
    let call = start_call(true).await;

    // Hangup lands at the same moment as the provider finishing a turn.
    call.provider.emit(agent_chunk());
    call.provider.emit(ProviderEvent::AudioDone {
        call_id: "call-1".to_string(),
    });
    call.pbx_events_tx
        .send(PbxCallEvent::ChannelDestroyed {
            channel_id: "chan-caller".to_string(),
        })
        .await
        .unwrap();
    // A concurrent teardown from another path must coalesce.
    call.orchestrator.teardown("call-1", "caller_hangup").await;

    assert!(
        wait_until(|| call.store.get("call-1").is_none()).await,
        "session never left the store"
    );
    assert!(wait_until(|| call.orchestrator.call_count() == 0).await);
    assert_eq!(call.provider.sessions_ended.load(Ordering::SeqCst), 1);
    assert!(!call.gating.is_gated("call-1"));
    // Caller leg hung up exactly once despite the race.
    assert_eq!(call.pbx.count_of("hangup chan-caller"), 1);

    let snapshot = call.metrics.snapshot();
    assert_eq!(snapshot.calls_closed, 1);
    assert_eq!(snapshot.teardown_reasons.get("caller_hangup"), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn provider_close_ends_the_call() {
    let call = start_call(true).await;

    call.provider.emit(ProviderEvent::Error {
        call_id: "call-1".to_string(),
        message: "upstream went away".to_string(),
        fatal: true,
    });

    assert!(wait_until(|| call.store.get("call-1").is_none()).await);
    let snapshot = call.metrics.snapshot();
    assert_eq!(snapshot.teardown_reasons.get("provider_failure"), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn tool_hangup_plays_farewell_then_ends() {
    let call = start_call(true).await;

    call.provider.emit(ProviderEvent::ToolCall {
        call_id: "call-1".to_string(),
        tool: "hangup".to_string(),
        arguments: serde_json::json!({}),
    });
    assert!(
        wait_until(|| call.store.get("call-1").is_some_and(
            |s| s.lock().state == SessionState::Farewell
        ))
        .await
    );

    // Spoken farewell, then done; its completion drives the teardown.
    for _ in 0..4 {
        call.provider.emit(agent_chunk());
    }
    call.provider.emit(ProviderEvent::AudioDone {
        call_id: "call-1".to_string(),
    });

    assert!(wait_until(|| call.store.get("call-1").is_none()).await);
    let snapshot = call.metrics.snapshot();
    assert_eq!(
        snapshot.teardown_reasons.get("farewell_complete"),
        Some(&1)
    );
}
