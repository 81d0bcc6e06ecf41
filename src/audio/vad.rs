//! Energy-based silence trimming for finished recordings.
//!
//! Audio is cut into 30 ms windows (per channel, interleaved input).  A
//! window counts as active when its RMS exceeds the threshold; the clip is
//! trimmed to the first and last active window.  The live voice-activity
//! flag comes from the noise detector instead, which tracks an adaptive
//! floor rather than a fixed threshold.

use std::ops::Range;

use super::dsp;

/// Window length used for the activity decision.
const WINDOW_MS: u32 = 30;

// ---------------------------------------------------------------------------
// SilenceTrimmer
// ---------------------------------------------------------------------------

/// ```rust
/// use huntmaster_pipeline::audio::SilenceTrimmer;
///
/// // 48 kHz mono: 30 ms = 1440 samples per window.
/// let trimmer = SilenceTrimmer::new(0.01, 48_000, 1);
/// let mut clip = vec![0.0_f32; 1_440];
/// clip.extend(vec![0.5_f32; 1_440]);
/// clip.extend(vec![0.0_f32; 1_440]);
/// assert_eq!(trimmer.trim(&clip).len(), 1_440);
/// ```
#[derive(Debug, Clone)]
pub struct SilenceTrimmer {
    rms_threshold: f32,
    /// Window length in interleaved samples.
    window: usize,
}

impl SilenceTrimmer {
    pub fn new(rms_threshold: f32, sample_rate: u32, channels: u16) -> Self {
        let frames = (sample_rate as usize * WINDOW_MS as usize / 1_000).max(1);
        Self {
            rms_threshold,
            window: frames * channels.max(1) as usize,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.rms_threshold
    }

    fn is_active(&self, window: &[f32]) -> bool {
        !window.is_empty() && dsp::rms(window) > self.rms_threshold
    }

    /// Sample range (interleaved) spanning the first to last active window.
    ///
    /// An empty range at 0 means the whole clip is silent.
    pub fn active_range(&self, audio: &[f32]) -> Range<usize> {
        let windows: Vec<&[f32]> = audio.chunks(self.window).collect();
        let Some(first) = windows.iter().position(|w| self.is_active(w)) else {
            return 0..0;
        };
        let last = windows
            .iter()
            .rposition(|w| self.is_active(w))
            .unwrap_or(first);
        let start = first * self.window;
        let end = ((last + 1) * self.window).min(audio.len());
        start..end
    }

    /// Borrow the trimmed part of `audio`; no allocation.
    pub fn trim<'a>(&self, audio: &'a [f32]) -> &'a [f32] {
        &audio[self.active_range(audio)]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(pre: usize, voice: usize, post: usize) -> Vec<f32> {
        let mut v = vec![0.0_f32; pre];
        v.extend(vec![0.5_f32; voice]);
        v.extend(vec![0.0_f32; post]);
        v
    }

    #[test]
    fn trims_both_ends() {
        // 16 kHz mono: 480 samples per window.
        let trimmer = SilenceTrimmer::new(0.01, 16_000, 1);
        let audio = signal(480, 960, 480);
        assert_eq!(trimmer.active_range(&audio), 480..1_440);
    }

    #[test]
    fn stereo_windows_are_twice_as_long() {
        let trimmer = SilenceTrimmer::new(0.01, 16_000, 2);
        let audio = signal(960, 960, 960);
        assert_eq!(trimmer.trim(&audio).len(), 960);
    }

    #[test]
    fn all_silence_is_empty() {
        let trimmer = SilenceTrimmer::new(0.01, 16_000, 1);
        assert_eq!(trimmer.active_range(&vec![0.0; 1_440]), 0..0);
        assert!(trimmer.trim(&[]).is_empty());
    }

    #[test]
    fn fully_active_clip_is_untouched() {
        let trimmer = SilenceTrimmer::new(0.01, 16_000, 1);
        let audio = vec![0.5_f32; 1_000];
        assert_eq!(trimmer.trim(&audio).len(), 1_000);
        assert!((trimmer.threshold() - 0.01).abs() < 1e-7);
    }
}
