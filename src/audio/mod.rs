//! Audio primitives shared by the modules.
//!
//! # Layout
//!
//! ```text
//! capture  device backend (cpal, optional) ──► CaptureSink
//! queue    BoundedQueue with drop-oldest / drop-newest
//! frame    Frame = samples + FrameContext + FrameAnnotations
//! dsp      levels, dB conversion, remix, linear resampling
//! buffer   RingBuffer history
//! vad      SilenceTrimmer (energy based)
//! validate ClipValidator for finished recordings
//! ```
//!
//! # Quick Start
//!
//! ```rust
//! use huntmaster_pipeline::audio::{ClipError, ClipValidator, SilenceTrimmer};
//!
//! let mut clip = vec![0.0_f32; 4_800];
//! clip.extend((0..24_000).map(|i| 0.3 * (i as f32 * 0.05).sin()));
//! clip.extend(vec![0.0_f32; 4_800]);
//!
//! let trimmed = SilenceTrimmer::new(0.01, 48_000, 1).trim(&clip);
//! assert!(trimmed.len() < clip.len());
//!
//! let validator = ClipValidator::default();
//! assert!(validator.validate(trimmed, 48_000, 1).is_ok());
//! assert!(matches!(
//!     validator.validate(&[0.0; 100], 48_000, 1),
//!     Err(ClipError::TooShort { .. })
//! ));
//! ```

pub mod buffer;
pub mod capture;
pub mod dsp;
pub mod frame;
pub mod queue;
pub mod vad;
pub mod validate;

pub use buffer::RingBuffer;
pub use capture::{CaptureError, CaptureSink, DeviceInfo, DeviceStream};
pub use frame::{
    Frame, FrameAnnotations, FrameContext, FrameError, GainReading, LevelReading, NoiseReading,
    QualityReading,
};
pub use queue::{BackpressurePolicy, BoundedQueue, PushOutcome};
pub use vad::SilenceTrimmer;
pub use validate::{ClipError, ClipValidator};
