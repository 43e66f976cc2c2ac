//! Audio formats, frames and the codec kit.
//!
//! Everything in here is pure and thread-safe: G.711 μ-law conversion
//! ([`mulaw`]), linear PCM16 resampling ([`resample`]), profile resolution
//! ([`profile`]), and the [`AudioFrame`] value that every transport and the
//! playback pacer trade in.
//!
//! PCM16 is signed 16-bit **little-endian** mono everywhere on the wire.

pub mod mulaw;
pub mod profile;
pub mod resample;

pub use mulaw::{decode_mulaw, encode_mulaw};
pub use profile::{AudioProfile, ProfileRegistry};
pub use resample::resample_pcm16;

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol_constants::{FRAME_DURATION_MS, SUPPORTED_SAMPLE_RATES};

/// Errors from the codec kit and profile resolution.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Conversion between this rate pair is not supported.
    #[error("unsupported sample rate pair {in_hz} -> {out_hz}")]
    UnsupportedRate { in_hz: u32, out_hz: u32 },

    /// No audio profile with this name is registered.
    #[error("audio profile not found: {0}")]
    ProfileNotFound(String),

    /// A profile was configured with codecs the kit cannot honor.
    #[error("audio profile '{name}' invalid: {reason}")]
    InvalidProfile { name: String, reason: String },
}

/// Sample encodings carried on a call leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Signed 16-bit little-endian linear PCM.
    Pcm16,
    /// G.711 μ-law, 8 bits per sample. Only valid at 8kHz.
    Mulaw,
}

impl Encoding {
    /// Returns bytes per sample for this encoding.
    #[must_use]
    pub const fn bytes_per_sample(&self) -> usize {
        match self {
            Self::Pcm16 => 2,
            Self::Mulaw => 1,
        }
    }

    /// Returns the encoding as a short string identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pcm16 => "pcm16",
            Self::Mulaw => "mulaw",
        }
    }
}

/// One leg's concrete audio format: encoding plus sample rate, always mono.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Codec {
    pub encoding: Encoding,
    pub sample_rate: u32,
}

impl Codec {
    /// Creates a codec description.
    #[must_use]
    pub const fn new(encoding: Encoding, sample_rate: u32) -> Self {
        Self {
            encoding,
            sample_rate,
        }
    }

    /// μ-law at telephony rate, the PSTN-facing default.
    #[must_use]
    pub const fn mulaw_8k() -> Self {
        Self::new(Encoding::Mulaw, 8000)
    }

    /// Linear PCM16 at the given rate.
    #[must_use]
    pub const fn pcm16(sample_rate: u32) -> Self {
        Self::new(Encoding::Pcm16, sample_rate)
    }

    /// Returns the number of samples in `duration_ms` of audio.
    #[inline]
    #[must_use]
    pub const fn frame_samples(&self, duration_ms: u32) -> usize {
        ((self.sample_rate as u64 * duration_ms as u64) / 1000) as usize
    }

    /// Returns the byte length of `duration_ms` of audio in this codec.
    #[inline]
    #[must_use]
    pub const fn frame_bytes(&self, duration_ms: u32) -> usize {
        self.frame_samples(duration_ms) * self.encoding.bytes_per_sample()
    }

    /// Converts a payload byte length to whole milliseconds of audio.
    #[inline]
    #[must_use]
    pub fn bytes_to_ms(&self, byte_len: usize) -> u64 {
        let samples = byte_len / self.encoding.bytes_per_sample();
        (samples as u64 * 1000) / u64::from(self.sample_rate)
    }

    /// Returns a cached silence payload of the given duration.
    #[must_use]
    pub fn silence(&self, duration_ms: u32) -> Bytes {
        match self.encoding {
            // Digital silence for linear PCM is all zero bits.
            Encoding::Pcm16 => get_or_create_silence(self.frame_bytes(duration_ms), 0x00),
            // μ-law encodes sample 0 as 0xFF.
            Encoding::Mulaw => get_or_create_silence(self.frame_bytes(duration_ms), 0xFF),
        }
    }

    /// Validates the codec against the kit's capabilities.
    pub fn validate(&self) -> Result<(), CodecError> {
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(CodecError::UnsupportedRate {
                in_hz: self.sample_rate,
                out_hz: self.sample_rate,
            });
        }
        if self.encoding == Encoding::Mulaw && self.sample_rate != 8000 {
            return Err(CodecError::UnsupportedRate {
                in_hz: self.sample_rate,
                out_hz: 8000,
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.encoding.as_str(), self.sample_rate)
    }
}

/// Immutable audio frame value: payload bytes, format, and a monotonic
/// capture (or synthesis) timestamp.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub payload: Bytes,
    pub codec: Codec,
    pub captured_at: Instant,
}

impl AudioFrame {
    /// Wraps a payload captured now.
    #[must_use]
    pub fn new(payload: Bytes, codec: Codec) -> Self {
        Self {
            payload,
            codec,
            captured_at: Instant::now(),
        }
    }

    /// Produces a standard 20ms silence frame in the given codec.
    #[must_use]
    pub fn silence(codec: Codec) -> Self {
        Self::new(codec.silence(FRAME_DURATION_MS), codec)
    }

    /// Duration of this frame's payload in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        self.codec.bytes_to_ms(self.payload.len())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Silence Frame Cache
// ─────────────────────────────────────────────────────────────────────────────

/// Global cache for silence payloads, keyed by (byte length, fill byte).
///
/// Silence frames are emitted continuously during inbound gaps and playback
/// stalls; caching avoids re-allocating them every 20ms. `Bytes::clone()` is
/// an Arc bump. The cache is never cleared; the key space is tiny.
static SILENCE_CACHE: OnceLock<RwLock<HashMap<(usize, u8), Bytes>>> = OnceLock::new();

fn get_or_create_silence(byte_len: usize, fill: u8) -> Bytes {
    let cache = SILENCE_CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    if let Some(silence) = cache.read().get(&(byte_len, fill)) {
        return silence.clone();
    }

    let mut cache_write = cache.write();
    // Double-check after acquiring write lock (another thread may have inserted)
    if let Some(silence) = cache_write.get(&(byte_len, fill)) {
        return silence.clone();
    }

    let silence = Bytes::from(vec![fill; byte_len]);
    cache_write.insert((byte_len, fill), silence.clone());
    silence
}

// ─────────────────────────────────────────────────────────────────────────────
// PCM16 wire helpers (explicit little-endian)
// ─────────────────────────────────────────────────────────────────────────────

/// Serializes PCM16 samples to little-endian wire bytes.
#[must_use]
pub fn pcm16_to_bytes(samples: &[i16]) -> Bytes {
    if cfg!(target_endian = "little") {
        Bytes::copy_from_slice(bytemuck::cast_slice(samples))
    } else {
        let mut out = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        Bytes::from(out)
    }
}

/// Parses little-endian wire bytes to PCM16 samples.
///
/// A truncated (odd-length) payload never panics: the dangling byte is
/// dropped, the sample padded with silence, and the second tuple element is
/// `true` so the caller can count the short read.
#[must_use]
pub fn bytes_to_pcm16(data: &[u8]) -> (Vec<i16>, bool) {
    let truncated = data.len() % 2 != 0;
    let mut samples = Vec::with_capacity(data.len() / 2 + usize::from(truncated));
    for pair in data.chunks_exact(2) {
        samples.push(i16::from_le_bytes([pair[0], pair[1]]));
    }
    if truncated {
        samples.push(0);
    }
    (samples, truncated)
}

/// Decodes a payload in the given codec to linear PCM16 at the codec's rate.
///
/// Returns the samples plus a truncation flag for metrics.
#[must_use]
pub fn decode_to_pcm16(payload: &[u8], codec: Codec) -> (Vec<i16>, bool) {
    match codec.encoding {
        Encoding::Pcm16 => bytes_to_pcm16(payload),
        Encoding::Mulaw => (decode_mulaw(payload), false),
    }
}

/// Encodes linear PCM16 samples into the given codec's wire format.
///
/// The samples must already be at the codec's sample rate.
#[must_use]
pub fn encode_from_pcm16(samples: &[i16], codec: Codec) -> Bytes {
    match codec.encoding {
        Encoding::Pcm16 => pcm16_to_bytes(samples),
        Encoding::Mulaw => Bytes::from(encode_mulaw(samples)),
    }
}

/// Computes normalized RMS energy (0.0–1.0 full scale) of a PCM16 frame.
///
/// Used by the barge-in energy detector.
#[must_use]
pub fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    ((sum_sq / samples.len() as f64).sqrt() / f64::from(i16::MAX)) as f32
}
