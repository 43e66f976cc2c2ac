//! Bit-exact G.711 μ-law companding.
//!
//! Implements the CCITT G.711 reference algorithm (Sun-lineage tables):
//! 16-bit linear in, 8-bit μ-law out and back. The PSTN leg of every call
//! runs through these two functions, so they stay allocation-free per
//! sample and panic-free on any input.

/// μ-law companding bias.
const BIAS: i32 = 0x84;

/// Clip level for 16-bit input before companding.
const CLIP: i32 = 32_635;

/// Compresses one linear PCM16 sample to μ-law.
#[inline]
#[must_use]
pub fn linear_to_mulaw(sample: i16) -> u8 {
    let mut pcm = i32::from(sample);
    let sign: u8 = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    if pcm > CLIP {
        pcm = CLIP;
    }
    pcm += BIAS;

    // Segment number = position of the highest set bit of pcm >> 7 (0..=7).
    let seg = (pcm >> 7) & 0xFF;
    let exponent = if seg == 0 {
        0
    } else {
        31 - (seg as u32).leading_zeros()
    };
    let mantissa = ((pcm >> (exponent + 3)) & 0x0F) as u8;

    !(sign | ((exponent as u8) << 4) | mantissa)
}

/// Expands one μ-law byte to linear PCM16.
#[inline]
#[must_use]
pub fn mulaw_to_linear(byte: u8) -> i16 {
    let u = !byte;
    let exponent = i32::from((u >> 4) & 0x07);
    let mantissa = i32::from(u & 0x0F);
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if u & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Encodes a PCM16 buffer to μ-law bytes.
#[must_use]
pub fn encode_mulaw(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| linear_to_mulaw(s)).collect()
}

/// Decodes μ-law bytes to a PCM16 buffer.
#[must_use]
pub fn decode_mulaw(data: &[u8]) -> Vec<i16> {
    data.iter().map(|&b| mulaw_to_linear(b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_encodes_to_ff() {
        assert_eq!(linear_to_mulaw(0), 0xFF);
        assert_eq!(mulaw_to_linear(0xFF), 0);
    }

    #[test]
    fn negative_zero_region_decodes_to_zero() {
        // 0x7F is "negative zero" in μ-law.
        assert_eq!(mulaw_to_linear(0x7F), 0);
    }

    #[test]
    fn extremes_clip_without_panic() {
        let max = linear_to_mulaw(i16::MAX);
        let min = linear_to_mulaw(i16::MIN);
        assert_eq!(max, 0x80);
        assert_eq!(min, 0x00);
        assert_eq!(mulaw_to_linear(0x80), 32_124);
        assert_eq!(mulaw_to_linear(0x00), -32_124);
    }

    #[test]
    fn decode_is_monotonic_over_positive_codes() {
        // Codes 0xFF down to 0x80 cover positive magnitudes small to large.
        let mut prev = mulaw_to_linear(0xFF);
        for code in (0x80..=0xFE).rev() {
            let cur = mulaw_to_linear(code);
            assert!(cur > prev, "code {code:#x}: {cur} <= {prev}");
            prev = cur;
        }
    }

    #[test]
    fn encode_decode_encode_is_idempotent() {
        for &s in &[0i16, 1, -1, 100, -100, 5000, -5000, 30000, -30000] {
            let decoded = mulaw_to_linear(linear_to_mulaw(s));
            // A decoded value is a quantization level: re-encoding and
            // decoding again must reproduce it exactly.
            assert_eq!(
                mulaw_to_linear(linear_to_mulaw(decoded)),
                decoded,
                "sample {s} drifted across quantization levels"
            );
        }
    }

    #[test]
    fn sine_round_trip_psnr_exceeds_35db() {
        // 1kHz sine at 8kHz, half scale.
        let samples: Vec<i16> = (0..8000)
            .map(|i| {
                let t = f64::from(i) / 8000.0;
                ((t * 1000.0 * std::f64::consts::TAU).sin() * 16000.0) as i16
            })
            .collect();

        let decoded = decode_mulaw(&encode_mulaw(&samples));

        let signal: f64 = samples.iter().map(|&s| f64::from(s).powi(2)).sum();
        let noise: f64 = samples
            .iter()
            .zip(&decoded)
            .map(|(&a, &b)| (f64::from(a) - f64::from(b)).powi(2))
            .sum();
        let psnr = 10.0 * (signal / noise.max(1e-9)).log10();
        assert!(psnr >= 35.0, "PSNR {psnr:.1} dB below bound");
    }
}
