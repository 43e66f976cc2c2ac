//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.
//! The YAML body is the core [`parley_core::Config`] plus server-level
//! knobs, so one file configures the whole process.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// The media core configuration (profiles, streaming, gating, barge-in,
    /// transports, providers).
    #[serde(flatten)]
    pub core: parley_core::Config,
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("PARLEY_AUDIOSOCKET_BIND") {
            self.core.transport.audiosocket_bind = val;
        }
        if let Ok(val) = std::env::var("PARLEY_AUDIOSOCKET_ADVERTISE") {
            self.core.transport.audiosocket_advertise = val;
        }
        if let Ok(val) = std::env::var("PARLEY_DEFAULT_PROVIDER") {
            self.core.default_provider = val;
        }
        if let Ok(val) = std::env::var("PARLEY_POST_TTS_GUARD_MS") {
            if let Ok(ms) = val.parse() {
                self.core.gating.post_tts_guard_ms = ms;
            }
        }
    }
}
