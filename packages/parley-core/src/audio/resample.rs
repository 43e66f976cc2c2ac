//! Linear PCM16 resampling between the supported telephony/provider rates.
//!
//! A plain linear interpolator is deliberate: the rate pairs we convert
//! between ({8, 16, 24, 48}kHz) are small integer ratios, conversions run
//! once per provider chunk or per 20ms frame, and band-limiting beyond what
//! narrowband telephony already imposes buys nothing here.

use crate::protocol_constants::SUPPORTED_SAMPLE_RATES;

use super::CodecError;

/// Resamples PCM16 between two supported rates.
///
/// Output length is exactly `round(input.len() * out_hz / in_hz)`. One output
/// buffer is allocated; no per-sample allocation.
///
/// # Errors
///
/// [`CodecError::UnsupportedRate`] when either rate is outside the supported
/// set. Equal rates return a copy.
pub fn resample_pcm16(input: &[i16], in_hz: u32, out_hz: u32) -> Result<Vec<i16>, CodecError> {
    if !SUPPORTED_SAMPLE_RATES.contains(&in_hz) || !SUPPORTED_SAMPLE_RATES.contains(&out_hz) {
        return Err(CodecError::UnsupportedRate { in_hz, out_hz });
    }
    if in_hz == out_hz {
        return Ok(input.to_vec());
    }
    if input.is_empty() {
        return Ok(Vec::new());
    }

    let out_len = ((input.len() as u64 * u64::from(out_hz) + u64::from(in_hz) / 2)
        / u64::from(in_hz)) as usize;
    let step = f64::from(in_hz) / f64::from(out_hz);
    let last = input.len() - 1;

    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * step;
        let idx = (pos as usize).min(last);
        let frac = pos - idx as f64;
        let a = f64::from(input[idx]);
        let b = f64::from(input[(idx + 1).min(last)]);
        out.push((a + (b - a) * frac).round() as i16);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_1khz(rate: u32, duration_ms: u32, amplitude: f64) -> Vec<i16> {
        let n = (rate as u64 * u64::from(duration_ms) / 1000) as usize;
        (0..n)
            .map(|i| {
                let t = i as f64 / f64::from(rate);
                ((t * 1000.0 * std::f64::consts::TAU).sin() * amplitude) as i16
            })
            .collect()
    }

    fn snr_db(reference: &[i16], candidate: &[i16]) -> f64 {
        let n = reference.len().min(candidate.len());
        let signal: f64 = reference[..n].iter().map(|&s| f64::from(s).powi(2)).sum();
        let noise: f64 = reference[..n]
            .iter()
            .zip(&candidate[..n])
            .map(|(&a, &b)| (f64::from(a) - f64::from(b)).powi(2))
            .sum();
        10.0 * (signal / noise.max(1e-9)).log10()
    }

    #[test]
    fn output_length_is_rounded_ratio() {
        let input = vec![0i16; 160]; // 20ms @ 8k
        assert_eq!(resample_pcm16(&input, 8000, 24000).unwrap().len(), 480);
        assert_eq!(resample_pcm16(&input, 8000, 16000).unwrap().len(), 320);
        let input = vec![0i16; 480]; // 20ms @ 24k
        assert_eq!(resample_pcm16(&input, 24000, 8000).unwrap().len(), 160);
        // Non-multiple length still rounds.
        let input = vec![0i16; 3];
        assert_eq!(resample_pcm16(&input, 8000, 24000).unwrap().len(), 9);
    }

    #[test]
    fn equal_rates_copy_through() {
        let input = vec![1i16, -2, 3];
        assert_eq!(resample_pcm16(&input, 16000, 16000).unwrap(), input);
    }

    #[test]
    fn unsupported_rates_are_rejected() {
        assert!(matches!(
            resample_pcm16(&[0], 44100, 8000),
            Err(CodecError::UnsupportedRate { .. })
        ));
        assert!(matches!(
            resample_pcm16(&[0], 8000, 11025),
            Err(CodecError::UnsupportedRate { .. })
        ));
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(resample_pcm16(&[], 8000, 48000).unwrap().is_empty());
    }

    #[test]
    fn upsample_preserves_original_samples_at_grid_points() {
        let input: Vec<i16> = (0..160).map(|i| (i * 100) as i16).collect();
        let up = resample_pcm16(&input, 8000, 24000).unwrap();
        for (i, &s) in input.iter().enumerate() {
            assert_eq!(up[i * 3], s, "grid point {i} not preserved");
        }
    }

    #[test]
    fn round_trip_snr_exceeds_30db() {
        let original = sine_1khz(8000, 100, 16000.0);
        let up = resample_pcm16(&original, 8000, 24000).unwrap();
        let back = resample_pcm16(&up, 24000, 8000).unwrap();
        assert_eq!(back.len(), original.len());
        let snr = snr_db(&original, &back);
        assert!(snr >= 30.0, "round-trip SNR {snr:.1} dB below bound");
    }

    #[test]
    fn downsample_tone_keeps_shape() {
        let original = sine_1khz(24000, 100, 12000.0);
        let down = resample_pcm16(&original, 24000, 8000).unwrap();
        let reference = sine_1khz(8000, 100, 12000.0);
        let snr = snr_db(&reference, &down);
        assert!(snr >= 30.0, "decimated tone SNR {snr:.1} dB below bound");
    }
}
