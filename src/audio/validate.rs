//! Validation of finished clips (recordings, imported master calls).
//!
//! | Check | Description |
//! |-------|-------------|
//! | Duration | Clip must be within `[min_secs, max_secs]` |
//! | Silence | Peak amplitude must exceed a threshold |
//! | Clipping | At most `clipping_max_pct`% of samples may sit at full scale |
//!
//! ```rust
//! use huntmaster_pipeline::audio::{ClipError, ClipValidator};
//!
//! let validator = ClipValidator::new(0.25, 300.0);
//! let call = vec![0.2_f32; 48_000];
//! assert!(validator.validate(&call, 48_000, 1).is_ok());
//!
//! let blip = vec![0.2_f32; 100];
//! assert!(matches!(
//!     validator.validate(&blip, 48_000, 1),
//!     Err(ClipError::TooShort { .. })
//! ));
//! ```

use thiserror::Error;

use super::dsp;

// ---------------------------------------------------------------------------
// ClipError
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClipError {
    #[error("clip too short: {got_secs:.2}s (minimum {min_secs:.2}s)")]
    TooShort { min_secs: f32, got_secs: f32 },

    #[error("clip too long: {got_secs:.2}s (maximum {max_secs:.2}s)")]
    TooLong { max_secs: f32, got_secs: f32 },

    #[error("clip too quiet: peak {amplitude:.4} (threshold {threshold:.4})")]
    TooQuiet { amplitude: f32, threshold: f32 },

    #[error("clip is clipping: {clipped_pct:.1}% of samples (max {max_pct:.1}%)")]
    Clipping { clipped_pct: f32, max_pct: f32 },
}

// ---------------------------------------------------------------------------
// ClipValidator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClipValidator {
    pub min_secs: f32,
    pub max_secs: f32,
    /// Peak below this counts as silence (default `0.01`).
    pub silence_threshold: f32,
    /// Magnitude above which a sample counts as clipped (default `0.99`).
    pub clipping_threshold: f32,
    /// Largest tolerated share of clipped samples in percent (default `10`).
    pub clipping_max_pct: f32,
}

impl Default for ClipValidator {
    fn default() -> Self {
        Self {
            min_secs: 0.25,
            max_secs: 300.0,
            silence_threshold: 0.01,
            clipping_threshold: 0.99,
            clipping_max_pct: 10.0,
        }
    }
}

impl ClipValidator {
    pub fn new(min_secs: f32, max_secs: f32) -> Self {
        Self {
            min_secs,
            max_secs,
            ..Default::default()
        }
    }

    /// Check duration, then silence, then clipping; first failure wins.
    pub fn validate(&self, samples: &[f32], sample_rate: u32, channels: u16) -> Result<(), ClipError> {
        let frames = samples.len() / channels.max(1) as usize;
        let got_secs = if sample_rate == 0 {
            0.0
        } else {
            frames as f32 / sample_rate as f32
        };

        if got_secs < self.min_secs {
            return Err(ClipError::TooShort {
                min_secs: self.min_secs,
                got_secs,
            });
        }
        if got_secs > self.max_secs {
            return Err(ClipError::TooLong {
                max_secs: self.max_secs,
                got_secs,
            });
        }

        let amplitude = dsp::peak(samples);
        if amplitude < self.silence_threshold {
            return Err(ClipError::TooQuiet {
                amplitude,
                threshold: self.silence_threshold,
            });
        }

        let clipped = samples
            .iter()
            .filter(|s| s.abs() > self.clipping_threshold)
            .count();
        let clipped_pct = clipped as f32 / samples.len() as f32 * 100.0;
        if clipped_pct > self.clipping_max_pct {
            return Err(ClipError::Clipping {
                clipped_pct,
                max_pct: self.clipping_max_pct,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_reasonable_clip() {
        let v = ClipValidator::default();
        assert!(v.validate(&vec![0.3; 48_000], 48_000, 1).is_ok());
    }

    #[test]
    fn duration_accounts_for_channels() {
        let v = ClipValidator::new(1.0, 2.0);
        // 48 000 interleaved stereo samples = 0.5 s at 48 kHz.
        let err = v.validate(&vec![0.3; 48_000], 48_000, 2).unwrap_err();
        assert!(matches!(err, ClipError::TooShort { got_secs, .. } if (got_secs - 0.5).abs() < 1e-6));
    }

    #[test]
    fn too_long_is_reported() {
        let v = ClipValidator::new(0.0, 1.0);
        assert!(matches!(
            v.validate(&vec![0.3; 96_000], 48_000, 1),
            Err(ClipError::TooLong { .. })
        ));
    }

    #[test]
    fn silence_is_rejected() {
        let v = ClipValidator::new(0.0, 10.0);
        assert!(matches!(
            v.validate(&vec![0.001; 4_800], 48_000, 1),
            Err(ClipError::TooQuiet { .. })
        ));
    }

    #[test]
    fn heavy_clipping_is_rejected() {
        let v = ClipValidator::new(0.0, 10.0);
        let mut clip = vec![0.2_f32; 1_000];
        clip[..200].iter_mut().for_each(|s| *s = 1.0);
        let err = v.validate(&clip, 48_000, 1).unwrap_err();
        assert!(matches!(err, ClipError::Clipping { clipped_pct, .. } if (clipped_pct - 20.0).abs() < 1e-3));
    }

    #[test]
    fn light_clipping_is_tolerated() {
        let v = ClipValidator::new(0.0, 10.0);
        let mut clip = vec![0.2_f32; 1_000];
        clip[..50].iter_mut().for_each(|s| *s = 1.0);
        assert!(v.validate(&clip, 48_000, 1).is_ok());
    }
}
