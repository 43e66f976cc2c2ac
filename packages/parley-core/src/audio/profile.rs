//! Named audio profiles and their resolution at call setup.
//!
//! A profile is a value, not a service: three codecs naming what the caller
//! leg carries (ingress), what the provider adapter consumes/produces
//! (provider), and what we emit back to the caller (egress). Profiles are
//! resolved exactly once per call and never change mid-call; a resolution
//! failure rejects the call at setup.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::transport::TransportKind;

use super::{Codec, CodecError, Encoding};

/// A named (ingress, provider, egress) codec triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioProfile {
    pub name: String,
    /// Format of frames arriving from the caller.
    pub ingress: Codec,
    /// Format exchanged with the provider adapter, both directions.
    pub provider: Codec,
    /// Format of frames emitted back to the caller.
    pub egress: Codec,
}

impl AudioProfile {
    /// Validates every leg against the codec kit.
    pub fn validate(&self) -> Result<(), CodecError> {
        for codec in [&self.ingress, &self.provider, &self.egress] {
            codec.validate().map_err(|e| CodecError::InvalidProfile {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// AudioSocket default: linear PCM at telephony rate on the PBX legs,
    /// 16kHz linear toward the provider.
    #[must_use]
    pub fn slin_narrowband() -> Self {
        Self {
            name: "slin-narrowband".to_string(),
            ingress: Codec::pcm16(8000),
            provider: Codec::pcm16(16000),
            egress: Codec::pcm16(8000),
        }
    }

    /// RTP default: μ-law on the PBX legs, 24kHz linear toward the provider
    /// (the common realtime-agent native rate).
    #[must_use]
    pub fn ulaw_realtime() -> Self {
        Self {
            name: "ulaw-realtime".to_string(),
            ingress: Codec::mulaw_8k(),
            provider: Codec::pcm16(24000),
            egress: Codec::mulaw_8k(),
        }
    }
}

/// Immutable registry of audio profiles, built once at bootstrap.
///
/// Resolution precedence mirrors provider selection: an explicit
/// channel-variable name wins, then the per-transport default, then the
/// global default profile.
pub struct ProfileRegistry {
    profiles: HashMap<String, AudioProfile>,
    transport_defaults: HashMap<TransportKind, String>,
    default_profile: String,
}

impl ProfileRegistry {
    /// Builds a registry from configured profiles plus the built-in defaults.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure; a registry with an invalid
    /// profile must not come up at all.
    pub fn new(
        configured: &[AudioProfile],
        transport_defaults: HashMap<TransportKind, String>,
        default_profile: &str,
    ) -> Result<Self, CodecError> {
        let mut profiles = HashMap::new();
        for builtin in [AudioProfile::slin_narrowband(), AudioProfile::ulaw_realtime()] {
            profiles.insert(builtin.name.clone(), builtin);
        }
        // Configured profiles may shadow built-ins of the same name.
        for profile in configured {
            profile.validate()?;
            profiles.insert(profile.name.clone(), profile.clone());
        }

        let registry = Self {
            profiles,
            transport_defaults,
            default_profile: default_profile.to_string(),
        };
        // The fallback chain must terminate in a real profile.
        registry.resolve(&registry.default_profile)?;
        for name in registry.transport_defaults.values() {
            registry.resolve(name)?;
        }
        Ok(registry)
    }

    /// Builds a registry with only the built-in profiles.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut transport_defaults = HashMap::new();
        transport_defaults.insert(TransportKind::AudioSocket, "slin-narrowband".to_string());
        transport_defaults.insert(TransportKind::Rtp, "ulaw-realtime".to_string());
        Self::new(&[], transport_defaults, "slin-narrowband")
            .expect("built-in profiles are valid")
    }

    /// Looks up a profile by name.
    pub fn resolve(&self, name: &str) -> Result<&AudioProfile, CodecError> {
        self.profiles
            .get(name)
            .ok_or_else(|| CodecError::ProfileNotFound(name.to_string()))
    }

    /// Resolves the profile for a new call.
    ///
    /// `explicit` is the dialplan channel variable, if set. An explicit name
    /// that does not resolve is a setup failure, not a silent fallback.
    pub fn resolve_for_call(
        &self,
        explicit: Option<&str>,
        transport: TransportKind,
    ) -> Result<&AudioProfile, CodecError> {
        if let Some(name) = explicit {
            return self.resolve(name);
        }
        if let Some(name) = self.transport_defaults.get(&transport) {
            return self.resolve(name);
        }
        self.resolve(&self.default_profile)
    }
}

impl std::fmt::Debug for ProfileRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileRegistry")
            .field("profiles", &self.profiles.keys().collect::<Vec<_>>())
            .field("default", &self.default_profile)
            .finish()
    }
}
