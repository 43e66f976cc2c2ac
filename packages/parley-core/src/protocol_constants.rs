//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by external specifications (G.711, RTP, the
//! AudioSocket framing spec) and changing them would break interoperability
//! with the PBX or with provider adapters.

// ─────────────────────────────────────────────────────────────────────────────
// Telephony Audio
// ─────────────────────────────────────────────────────────────────────────────

/// Duration of one media frame in milliseconds.
///
/// 20ms is the packetization interval used by the PBX on both transports.
/// Every pacing loop, jitter window and silence substitution in this crate
/// is expressed in multiples of this value.
pub const FRAME_DURATION_MS: u32 = 20;

/// Narrowband telephony sample rate (Hz), G.711 territory.
pub const TELEPHONY_SAMPLE_RATE: u32 = 8000;

/// All call media is mono; the PBX mixes before it reaches us.
pub const CHANNELS: u16 = 1;

/// Sample rates the codec kit can convert between (Hz).
pub const SUPPORTED_SAMPLE_RATES: [u32; 4] = [8000, 16000, 24000, 48000];

/// Inbound gap after which a transport substitutes a silence frame (ms).
///
/// Two missed frame slots. Downstream timing logic (pacing, silent-inbound
/// detection) must never block on a stalled socket.
pub const INBOUND_GAP_SILENCE_MS: u64 = 40;

// ─────────────────────────────────────────────────────────────────────────────
// AudioSocket framing (TCP)
// ─────────────────────────────────────────────────────────────────────────────

/// Frame type: 16-byte UUID identifying the call. First frame on every
/// connection, never repeated.
pub const AUDIOSOCKET_KIND_UUID: u8 = 0x01;

/// Frame type: signed 16-bit little-endian mono PCM payload.
pub const AUDIOSOCKET_KIND_AUDIO: u8 = 0x10;

/// Frame type: terminate the stream. Zero-length payload.
pub const AUDIOSOCKET_KIND_TERMINATE: u8 = 0xFF;

/// Byte length of the UUID payload in the correlation frame.
pub const AUDIOSOCKET_UUID_LEN: usize = 16;

/// Upper bound on a single AudioSocket frame payload (bytes).
///
/// 20ms of PCM16 at 48kHz is 1920 bytes; anything past 4x that is a framing
/// error, not audio.
pub const AUDIOSOCKET_MAX_PAYLOAD: usize = 8192;

// ─────────────────────────────────────────────────────────────────────────────
// RTP (ExternalMedia, UDP)
// ─────────────────────────────────────────────────────────────────────────────

/// Dynamic payload type used for linear PCM frames we originate.
pub const RTP_PAYLOAD_TYPE: u8 = 96;

/// Depth of the inbound reorder window, in frames.
///
/// Out-of-order arrival beyond 3 frames (60ms) is treated as loss.
pub const RTP_REORDER_DEPTH: usize = 3;

/// UDP receive buffer requested for per-call RTP sockets (bytes).
pub const RTP_RECV_BUFFER_BYTES: usize = 256 * 1024;
