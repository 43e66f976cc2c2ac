//! Application bootstrap and dependency wiring.
//!
//! This module contains the composition root - the single place where all
//! services are instantiated and wired together. Wiring order matters:
//! profiles and gating first (pure state), then playback, then transports,
//! then the orchestrator that consumes them all.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::audio::ProfileRegistry;
use crate::error::{AgentError, AgentResult};
use crate::events::{BroadcastEvent, BroadcastEventBridge, EventEmitter};
use crate::gating::GatingManager;
use crate::metrics::MetricsRegistry;
use crate::orchestrator::CallOrchestrator;
use crate::pbx::{PbxCallEvent, PbxClient};
use crate::playback::{PlaybackManager, PlaybackSignal};
use crate::provider::{echo::EchoAdapter, ProviderRegistry};
use crate::session::SessionStore;
use crate::state::Config;
use crate::transport::{
    AudioSocketTransport, RtpTransport, Transport, TransportConnection, TransportKind,
};

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Receivers and runnables consumed when the background tasks start.
struct PendingRuntime {
    pbx_events_rx: mpsc::Receiver<PbxCallEvent>,
    conns_rx: mpsc::Receiver<Box<dyn TransportConnection>>,
    playback_signals_rx: mpsc::UnboundedReceiver<PlaybackSignal>,
    audiosocket: Arc<AudioSocketTransport>,
}

/// Container for all bootstrapped services.
pub struct BootstrappedServices {
    /// The per-call supervisor.
    pub orchestrator: Arc<CallOrchestrator>,
    /// Process-wide call sessions.
    pub session_store: Arc<SessionStore>,
    /// Inbound audio gate.
    pub gating: Arc<GatingManager>,
    /// Streaming playback manager.
    pub playback: PlaybackManager,
    /// Provider adapter registry; embedders register adapters here before
    /// starting the background tasks.
    pub providers: Arc<ProviderRegistry>,
    /// Audio profile registry.
    pub profiles: Arc<ProfileRegistry>,
    /// Counters, per call and aggregate.
    pub metrics: Arc<MetricsRegistry>,
    /// Broadcast sender for real-time events.
    pub broadcast_tx: broadcast::Sender<BroadcastEvent>,
    /// Sender the PBX client implementation feeds call events into.
    pub pbx_events_tx: mpsc::Sender<PbxCallEvent>,
    /// Cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
    pending: parking_lot::Mutex<Option<PendingRuntime>>,
}

impl BootstrappedServices {
    /// Starts the dispatch loop and transport listeners.
    ///
    /// Call once, after registering provider adapters. Calling again is a
    /// logged no-op.
    pub fn start_background_tasks(&self) {
        let Some(pending) = self.pending.lock().take() else {
            log::warn!("[Bootstrap] Background tasks already started");
            return;
        };

        let audiosocket = pending.audiosocket;
        tokio::spawn(async move {
            if let Err(e) = audiosocket.run().await {
                log::error!("[Bootstrap] AudioSocket listener failed: {}", e);
            }
        });

        let orchestrator = Arc::clone(&self.orchestrator);
        tokio::spawn(orchestrator.run(
            pending.pbx_events_rx,
            pending.conns_rx,
            pending.playback_signals_rx,
        ));
        log::info!("[Bootstrap] Background tasks started");
    }

    /// Initiates graceful shutdown of all services.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");
        self.orchestrator.shutdown().await;
        self.cancel_token.cancel();
        log::info!("[Bootstrap] Shutdown complete");
    }
}

/// Bootstraps all services with their dependencies.
///
/// The PBX client is injected: an ARI-style control client in bridged
/// deployments, [`DirectMediaPbx`](crate::pbx::DirectMediaPbx) in
/// dialplan-only ones.
///
/// # Errors
///
/// Configuration validation failures and unparseable bind addresses are
/// fatal at startup.
pub fn bootstrap_services(
    config: &Config,
    pbx: Arc<dyn PbxClient>,
) -> AgentResult<BootstrappedServices> {
    config
        .validate()
        .map_err(AgentError::Internal)?;

    let cancel_token = CancellationToken::new();

    // Pure state first.
    let mut transport_profiles = HashMap::new();
    transport_profiles.insert(TransportKind::AudioSocket, "slin-narrowband".to_string());
    transport_profiles.insert(TransportKind::Rtp, "ulaw-realtime".to_string());
    for (kind, name) in &config.audio.transport_profiles {
        transport_profiles.insert(*kind, name.clone());
    }
    let default_profile = config
        .audio
        .default_profile
        .clone()
        .unwrap_or_else(|| "slin-narrowband".to_string());
    let profiles = Arc::new(ProfileRegistry::new(
        &config.audio.profiles,
        transport_profiles,
        &default_profile,
    )?);

    let gating = Arc::new(GatingManager::new(std::time::Duration::from_millis(
        config.gating.post_tts_guard_ms,
    )));
    let metrics = Arc::new(MetricsRegistry::new());
    let session_store = Arc::new(SessionStore::new());

    // Events.
    let (broadcast_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let event_bridge: Arc<dyn EventEmitter> =
        Arc::new(BroadcastEventBridge::new(broadcast_tx.clone()));

    // Playback.
    let (playback_signals_tx, playback_signals_rx) = mpsc::unbounded_channel();
    let playback = PlaybackManager::new(config.streaming.clone(), playback_signals_tx);

    // Transports share one correlated-connection channel.
    let (conns_tx, conns_rx) = mpsc::channel(16);
    let audiosocket_bind = config
        .transport
        .audiosocket_bind
        .parse()
        .map_err(|e| AgentError::Internal(format!("bad audiosocket_bind: {e}")))?;
    let audiosocket = Arc::new(AudioSocketTransport::new(
        audiosocket_bind,
        config.transport.audiosocket_advertise.clone(),
        conns_tx.clone(),
        cancel_token.clone(),
    ));
    let rtp_bind_ip = config
        .transport
        .rtp_bind_ip
        .parse()
        .map_err(|e| AgentError::Internal(format!("bad rtp_bind_ip: {e}")))?;
    let rtp = Arc::new(RtpTransport::new(
        rtp_bind_ip,
        config.transport.rtp_port_min,
        config.transport.rtp_port_max,
        conns_tx,
        cancel_token.clone(),
    ));
    let mut transports: HashMap<TransportKind, Arc<dyn Transport>> = HashMap::new();
    transports.insert(TransportKind::AudioSocket, audiosocket.clone());
    transports.insert(TransportKind::Rtp, rtp);

    // Providers. The loopback diagnostic adapter is always available;
    // real adapters are registered by the embedder before start.
    let providers = Arc::new(ProviderRegistry::new(config.providers.clone()));
    providers.register(
        "echo",
        Arc::new(|settings| EchoAdapter::from_settings(settings)),
    );

    let (pbx_events_tx, pbx_events_rx) = mpsc::channel(64);

    let orchestrator = Arc::new(CallOrchestrator::new(
        config.clone(),
        Arc::clone(&session_store),
        Arc::clone(&gating),
        playback.clone(),
        Arc::clone(&providers),
        Arc::clone(&profiles),
        pbx,
        transports,
        Arc::clone(&event_bridge),
        Arc::clone(&metrics),
        cancel_token.clone(),
    ));

    Ok(BootstrappedServices {
        orchestrator,
        session_store,
        gating,
        playback,
        providers,
        profiles,
        metrics,
        broadcast_tx,
        pbx_events_tx,
        cancel_token,
        pending: parking_lot::Mutex::new(Some(PendingRuntime {
            pbx_events_rx,
            conns_rx,
            playback_signals_rx,
            audiosocket,
        })),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pbx::DirectMediaPbx;

    #[tokio::test]
    async fn bootstrap_wires_all_services() {
        let mut config = Config::default();
        config.default_provider = "echo".to_string();
        config.transport.audiosocket_bind = "127.0.0.1:0".to_string();

        let services = bootstrap_services(&config, Arc::new(DirectMediaPbx)).unwrap();
        assert!(services.providers.contains("echo"));
        assert!(services.profiles.resolve("ulaw-realtime").is_ok());
        assert_eq!(services.orchestrator.call_count(), 0);
    }

    #[tokio::test]
    async fn bootstrap_rejects_invalid_config() {
        let config = Config::default(); // no default_provider
        assert!(bootstrap_services(&config, Arc::new(DirectMediaPbx)).is_err());
    }

    #[tokio::test]
    async fn start_twice_is_a_noop() {
        let mut config = Config::default();
        config.default_provider = "echo".to_string();
        config.transport.audiosocket_bind = "127.0.0.1:0".to_string();

        let services = bootstrap_services(&config, Arc::new(DirectMediaPbx)).unwrap();
        services.start_background_tasks();
        services.start_background_tasks(); // logged no-op
        services.shutdown().await;
    }
}
