//! Sample-level helpers shared by the stages, the enhancer and the converter.
//!
//! Channel remixing and resampling generalize the mono / 16 kHz helpers to
//! arbitrary channel counts and rates.  Resampling is linear interpolation:
//! fast, dependency-free and good enough for monitoring and export.

/// Level reported for digital silence.
pub const SILENCE_DB: f32 = -120.0;

// ---------------------------------------------------------------------------
// Measurements
// ---------------------------------------------------------------------------

/// Root-mean-square amplitude across all samples.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let mean_sq = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    mean_sq.sqrt()
}

/// Largest absolute sample value.
pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().map(|s| s.abs()).fold(0.0_f32, f32::max)
}

/// Linear amplitude to dBFS, clamped below at [`SILENCE_DB`].
pub fn linear_to_db(value: f32) -> f32 {
    if value <= 0.0 {
        return SILENCE_DB;
    }
    (20.0 * value.log10()).max(SILENCE_DB)
}

pub fn db_to_linear(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// One-pole smoothing coefficient for a time constant at a given update rate.
///
/// `update_ms` is how much time elapses between successive updates.
pub fn smoothing_coefficient(time_constant_ms: f32, update_ms: f32) -> f32 {
    if time_constant_ms <= 0.0 {
        return 1.0;
    }
    1.0 - (-update_ms / time_constant_ms).exp()
}

// ---------------------------------------------------------------------------
// remix
// ---------------------------------------------------------------------------

/// Convert interleaved audio from `from` channels to `to` channels.
///
/// * Many → mono averages each frame.
/// * Mono → many duplicates the single channel.
/// * Other combinations mix to mono first, then duplicate.
/// * A zero channel count yields an empty vector.
///
/// ```rust
/// use huntmaster_pipeline::audio::dsp::remix;
///
/// let stereo = vec![0.5_f32, -0.5, 0.2, 0.4];
/// let mono = remix(&stereo, 2, 1);
/// assert_eq!(mono.len(), 2);
/// assert!((mono[1] - 0.3).abs() < 1e-6);
/// assert_eq!(remix(&mono, 1, 2).len(), 4);
/// ```
pub fn remix(samples: &[f32], from: u16, to: u16) -> Vec<f32> {
    if from == 0 || to == 0 {
        return Vec::new();
    }
    if from == to {
        return samples.to_vec();
    }
    let mono: Vec<f32> = if from == 1 {
        samples.to_vec()
    } else {
        let n = from as usize;
        samples
            .chunks_exact(n)
            .map(|frame| frame.iter().sum::<f32>() / n as f32)
            .collect()
    };
    if to == 1 {
        return mono;
    }
    let mut out = Vec::with_capacity(mono.len() * to as usize);
    for s in mono {
        out.extend(std::iter::repeat(s).take(to as usize));
    }
    out
}

// ---------------------------------------------------------------------------
// resample_linear
// ---------------------------------------------------------------------------

/// Resample interleaved audio from `from_rate` to `to_rate` Hz.
///
/// * Equal rates return the input unchanged.
/// * Output length per channel is `ceil(frames * to_rate / from_rate)`.
///
/// ```rust
/// use huntmaster_pipeline::audio::dsp::resample_linear;
///
/// let hi = vec![0.5_f32; 480];
/// let lo = resample_linear(&hi, 1, 48_000, 16_000);
/// assert_eq!(lo.len(), 160);
/// ```
pub fn resample_linear(samples: &[f32], channels: u16, from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || channels == 0 || from_rate == 0 {
        return samples.to_vec();
    }

    let ch = channels as usize;
    let frames = samples.len() / ch;
    let ratio = to_rate as f64 / from_rate as f64;
    let out_frames = (frames as f64 * ratio).ceil() as usize;
    let mut out = Vec::with_capacity(out_frames * ch);

    for i in 0..out_frames {
        let src = i as f64 / ratio;
        let idx = src as usize;
        let frac = (src - idx as f64) as f32;
        for c in 0..ch {
            let at = |f: usize| samples[f * ch + c];
            let sample = if idx + 1 < frames {
                at(idx) * (1.0 - frac) + at(idx + 1) * frac
            } else if idx < frames {
                at(idx)
            } else {
                0.0
            };
            out.push(sample);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
