//! The PBX control-plane seam.
//!
//! The PBX itself (and its REST/event interface) is an external
//! collaborator: the core consumes [`PbxClient`] to bridge channels, play
//! files and hang up, and receives [`PbxCallEvent`]s for arrivals and
//! hangups. Deployments that drive media purely from the dialplan (the PBX
//! dials our AudioSocket listener directly) use [`DirectMediaPbx`], where
//! every control operation is a structural no-op.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::transport::TransportKind;

/// Channel variable naming the provider for this call.
pub const VAR_PROVIDER: &str = "AI_PROVIDER";
/// Channel variable naming the audio profile for this call.
pub const VAR_AUDIO_PROFILE: &str = "AI_AUDIO_PROFILE";
/// Channel variable carrying opaque conversation context for the provider.
pub const VAR_CONTEXT: &str = "AI_CONTEXT";

/// Errors from PBX control operations.
#[derive(Debug, Error)]
pub enum PbxError {
    /// Bridge allocation or membership change failed.
    #[error("bridge operation failed: {0}")]
    Bridge(String),

    /// Channel origination, answer or hangup failed.
    #[error("channel operation failed: {0}")]
    Channel(String),

    /// Starting file playback on a channel failed.
    #[error("media playback failed: {0}")]
    MediaPlayback(String),

    /// The control connection to the PBX is gone.
    #[error("PBX connection closed")]
    Closed,
}

/// A caller that entered the agent application.
#[derive(Debug, Clone)]
pub struct CallerArrival {
    /// Stable call identifier for the call's lifetime.
    pub call_id: String,
    /// PBX channel id of the caller leg.
    pub caller_channel_id: String,
    /// Dialplan context the caller arrived from, if known.
    pub dialplan_context: Option<String>,
    /// Channel variables set by the dialplan (see the `VAR_*` constants).
    pub variables: HashMap<String, String>,
}

impl CallerArrival {
    /// Convenience accessor for a channel variable.
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }
}

/// Events pushed from the PBX control plane.
#[derive(Debug, Clone)]
pub enum PbxCallEvent {
    /// A caller answered into the agent application.
    CallerEntered(CallerArrival),
    /// A channel we care about went away (caller hangup, media leg died).
    ChannelDestroyed { channel_id: String },
    /// A file playback we started finished.
    PlaybackFinished {
        channel_id: String,
        media_uri: String,
    },
}

/// Control operations the core needs from the PBX.
#[async_trait]
pub trait PbxClient: Send + Sync {
    /// Answers the caller channel.
    async fn answer(&self, channel_id: &str) -> Result<(), PbxError>;

    /// Allocates a mixing bridge, returning its id.
    async fn create_bridge(&self, call_id: &str) -> Result<String, PbxError>;

    /// Originates the synthetic media leg pointed at our transport
    /// endpoint, returning its channel id.
    async fn originate_media_channel(
        &self,
        call_id: &str,
        kind: TransportKind,
        endpoint: &str,
    ) -> Result<String, PbxError>;

    /// Adds a channel to a bridge.
    async fn add_to_bridge(&self, bridge_id: &str, channel_id: &str) -> Result<(), PbxError>;

    /// Starts playback of a media file URI on a channel. Completion is
    /// reported via [`PbxCallEvent::PlaybackFinished`].
    async fn play_media(&self, channel_id: &str, media_uri: &str) -> Result<(), PbxError>;

    /// Hangs up a channel. Must be idempotent.
    async fn hangup(&self, channel_id: &str) -> Result<(), PbxError>;

    /// Destroys a bridge. Must be idempotent.
    async fn destroy_bridge(&self, bridge_id: &str) -> Result<(), PbxError>;
}

/// PBX client for dialplan-driven deployments with no control connection.
///
/// The PBX dials our media listener directly (`Dial(AudioSocket/...)`), so
/// there is nothing to answer, bridge or originate; the dialplan already
/// did. Control operations return synthetic ids; hangup is expressed by
/// closing the media transport, which the dialplan observes.
pub struct DirectMediaPbx;

#[async_trait]
impl PbxClient for DirectMediaPbx {
    async fn answer(&self, _channel_id: &str) -> Result<(), PbxError> {
        Ok(())
    }

    async fn create_bridge(&self, call_id: &str) -> Result<String, PbxError> {
        Ok(format!("direct-bridge-{call_id}"))
    }

    async fn originate_media_channel(
        &self,
        call_id: &str,
        _kind: TransportKind,
        _endpoint: &str,
    ) -> Result<String, PbxError> {
        Ok(format!("direct-media-{call_id}"))
    }

    async fn add_to_bridge(&self, _bridge_id: &str, _channel_id: &str) -> Result<(), PbxError> {
        Ok(())
    }

    async fn play_media(&self, channel_id: &str, media_uri: &str) -> Result<(), PbxError> {
        // No control plane to play files through, and no PlaybackFinished
        // will ever arrive. Failing here lets callers fall back instead of
        // waiting on a completion that cannot come.
        log::debug!(
            "[Pbx] direct media: no file playback for {} ({})",
            channel_id,
            media_uri
        );
        Err(PbxError::MediaPlayback(
            "direct media deployment has no file playback".to_string(),
        ))
    }

    async fn hangup(&self, _channel_id: &str) -> Result<(), PbxError> {
        Ok(())
    }

    async fn destroy_bridge(&self, _bridge_id: &str) -> Result<(), PbxError> {
        Ok(())
    }
}
