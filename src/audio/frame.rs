//! The unit of work flowing through the processing pipeline.
//!
//! A [`Frame`] owns one block of interleaved `f32` samples together with the
//! context it was captured in and the annotations stages attach to it.
//! Stages may rewrite sample values in place but can never resize the block:
//! only a mutable slice is handed out.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// FrameError
// ---------------------------------------------------------------------------

/// Reasons a sample block is refused before it enters the pipeline.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FrameError {
    #[error("frame is empty")]
    Empty,

    #[error("frame of {len} samples is not a multiple of {channels} channels")]
    ChannelMismatch { len: usize, channels: u16 },

    #[error("frame contains a non-finite sample at index {index}")]
    NonFinite { index: usize },
}

// ---------------------------------------------------------------------------
// Context & annotations
// ---------------------------------------------------------------------------

/// Where and when a frame was captured.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameContext {
    /// Position in the session, starting at 0.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Output of the level monitor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelReading {
    /// Smoothed RMS level in dBFS.
    pub rms_db: f32,
    /// Smoothed peak level in dBFS.
    pub peak_db: f32,
    /// Instantaneous peak of this frame (linear).
    pub peak: f32,
    pub clipped: bool,
}

/// Output of the noise detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoiseReading {
    pub floor_db: f32,
    pub snr_db: f32,
    pub voice_active: bool,
}

/// Output of the gain controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GainReading {
    pub gain_db: f32,
    /// Samples were clamped by the limiter.
    pub limited: bool,
    /// The gate held gain at unity because the frame was near the floor.
    pub gated: bool,
}

/// Output of the quality assessor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityReading {
    /// Overall score in `0.0..=1.0`.
    pub score: f32,
    pub level_score: f32,
    pub dynamics_score: f32,
    pub clipping_score: f32,
}

/// Everything the stages learned about a frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameAnnotations {
    pub level: Option<LevelReading>,
    pub noise: Option<NoiseReading>,
    pub gain: Option<GainReading>,
    pub quality: Option<QualityReading>,
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Frame {
    samples: Vec<f32>,
    pub context: FrameContext,
    pub annotations: FrameAnnotations,
}

impl Frame {
    /// Wrap `samples`, rejecting empty, ragged or non-finite blocks.
    pub fn new(samples: Vec<f32>, context: FrameContext) -> Result<Self, FrameError> {
        if samples.is_empty() {
            return Err(FrameError::Empty);
        }
        let channels = context.channels.max(1);
        if samples.len() % channels as usize != 0 {
            return Err(FrameError::ChannelMismatch {
                len: samples.len(),
                channels,
            });
        }
        if let Some(index) = samples.iter().position(|s| !s.is_finite()) {
            return Err(FrameError::NonFinite { index });
        }
        Ok(Self {
            samples,
            context,
            annotations: FrameAnnotations::default(),
        })
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// In-place access for transforming stages.  Length is fixed.
    pub fn samples_mut(&mut self) -> &mut [f32] {
        &mut self.samples
    }

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.samples.len() / self.context.channels.max(1) as usize
    }

    /// Real-time duration of the frame in milliseconds.
    pub fn duration_ms(&self) -> f64 {
        if self.context.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 * 1_000.0 / self.context.sample_rate as f64
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) fn test_context(channels: u16) -> FrameContext {
    FrameContext {
        sequence: 0,
        timestamp: Utc::now(),
        session_id: None,
        sample_rate: 48_000,
        channels,
    }
}
