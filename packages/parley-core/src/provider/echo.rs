//! Loopback diagnostic adapter.
//!
//! Plays the caller's own utterance back at them: crude energy endpointing
//! on the uplink, then the buffered audio returned as agent chunks. No
//! network, no model. It exists to smoke-test a deployment's media path
//! end to end (transports, codec alignment, gating, pacing, barge-in) with
//! the real adapter machinery.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::audio::{bytes_to_pcm16, pcm16_to_bytes, rms_energy, AudioProfile};
use crate::protocol_constants::FRAME_DURATION_MS;

use super::{ProviderAdapter, ProviderCapabilities, ProviderError, ProviderEvent};

/// Tunables for the echo endpointing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EchoSettings {
    /// Normalized RMS above which a frame counts as speech.
    pub threshold: f32,
    /// Trailing silence that ends an utterance (ms).
    pub silence_ms: u64,
    /// Chunk size used when replaying the utterance (ms).
    pub chunk_ms: u64,
}

impl Default for EchoSettings {
    fn default() -> Self {
        Self {
            threshold: 0.03,
            silence_ms: 600,
            chunk_ms: 200,
        }
    }
}

#[derive(Debug)]
struct EchoSession {
    events: mpsc::UnboundedSender<ProviderEvent>,
    rate: u32,
    utterance: Vec<i16>,
    speaking: bool,
    trailing_silence_ms: u64,
}

/// The loopback adapter.
pub struct EchoAdapter {
    settings: EchoSettings,
    sessions: DashMap<String, EchoSession>,
}

impl EchoAdapter {
    /// Builds the adapter from its opaque settings block.
    pub fn from_settings(
        settings: &serde_json::Value,
    ) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        let settings: EchoSettings = if settings.is_null() {
            EchoSettings::default()
        } else {
            serde_json::from_value(settings.clone())
                .map_err(|e| ProviderError::BadSettings(e.to_string()))?
        };
        Ok(Arc::new(Self {
            settings,
            sessions: DashMap::new(),
        }))
    }

    fn replay(&self, call_id: &str, session: &mut EchoSession) {
        let total_ms =
            session.utterance.len() as u64 * 1000 / u64::from(session.rate);
        let _ = session.events.send(ProviderEvent::CallerSpeechStopped {
            call_id: call_id.to_string(),
        });
        let _ = session.events.send(ProviderEvent::TranscriptFinal {
            call_id: call_id.to_string(),
            text: format!("[echo of {total_ms}ms caller audio]"),
        });

        let chunk_samples =
            (u64::from(session.rate) * self.settings.chunk_ms / 1000) as usize;
        for chunk in session.utterance.chunks(chunk_samples.max(1)) {
            let _ = session.events.send(ProviderEvent::AudioChunk {
                call_id: call_id.to_string(),
                pcm: pcm16_to_bytes(chunk),
            });
        }
        let _ = session.events.send(ProviderEvent::AudioDone {
            call_id: call_id.to_string(),
        });

        session.utterance.clear();
        session.speaking = false;
        session.trailing_silence_ms = 0;
    }
}

#[async_trait]
impl ProviderAdapter for EchoAdapter {
    fn name(&self) -> &str {
        "echo"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            // Gated frames never reach send_audio, so this adapter cannot
            // hear the caller over its own replay; the core's energy
            // fallback does barge-in.
            barge_in_events: false,
            native_input_rate_hz: 16_000,
            continuous_output: false,
            min_commit_ms: 0,
        }
    }

    async fn start_session(
        &self,
        call_id: &str,
        profile: &AudioProfile,
        _initial_context: Option<&str>,
        events: mpsc::UnboundedSender<ProviderEvent>,
    ) -> Result<(), ProviderError> {
        log::info!("[Echo] Session started for {}", call_id);
        self.sessions.insert(
            call_id.to_string(),
            EchoSession {
                events,
                rate: profile.provider.sample_rate,
                utterance: Vec::new(),
                speaking: false,
                trailing_silence_ms: 0,
            },
        );
        Ok(())
    }

    async fn send_audio(&self, call_id: &str, pcm: Bytes) -> Result<(), ProviderError> {
        let mut entry = self
            .sessions
            .get_mut(call_id)
            .ok_or(ProviderError::SessionClosed)?;
        let (samples, _) = bytes_to_pcm16(&pcm);
        let rms = rms_energy(&samples);
        let loud = rms >= self.settings.threshold;

        if !entry.speaking {
            if loud {
                entry.speaking = true;
                entry.trailing_silence_ms = 0;
                entry.utterance.extend_from_slice(&samples);
                let _ = entry.events.send(ProviderEvent::CallerSpeechStarted {
                    call_id: call_id.to_string(),
                });
            }
            return Ok(());
        }

        entry.utterance.extend_from_slice(&samples);
        if loud {
            entry.trailing_silence_ms = 0;
        } else {
            entry.trailing_silence_ms += u64::from(FRAME_DURATION_MS);
            if entry.trailing_silence_ms >= self.settings.silence_ms {
                self.replay(call_id, &mut entry);
            }
        }
        Ok(())
    }

    async fn cancel_response(&self, call_id: &str) -> Result<(), ProviderError> {
        // Replay is synchronous; by the time a cancel arrives there is
        // nothing in flight. Idempotent success.
        log::debug!("[Echo] cancel_response for {}", call_id);
        Ok(())
    }

    async fn end_session(&self, call_id: &str) -> Result<(), ProviderError> {
        if let Some((_, session)) = self.sessions.remove(call_id) {
            let _ = session.events.send(ProviderEvent::Closed {
                call_id: call_id.to_string(),
            });
            log::info!("[Echo] Session ended for {}", call_id);
        }
        Ok(())
    }
}
