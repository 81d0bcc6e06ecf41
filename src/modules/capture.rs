//! Capture graph: the bridge between audio I/O and the frame loop.
//!
//! ```text
//! device (cpal thread) ─┐
//!                       ├─► CaptureInput ──frames──► BoundedQueue<Vec<f32>> ──► orchestrator
//! scripted feeder ──────┘   (remix, resample,          (drop-oldest /
//!                            assemble frame_size)       drop-newest)
//!
//! master call playback ──resample to monitor rate──► playback buffer
//! ```
//!
//! Acquisition prefers the configured device.  When the device cannot be
//! opened the graph falls back to the scripted path, where callers push
//! samples through [`CaptureInput::push_samples`], and `capture-fallback`
//! is published.  Device faults are published as `capture-error`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{json, Value};

use super::{AudioModule, ModuleContext, ModuleError, ModuleName};
use crate::audio::capture::{self, CaptureError, CaptureSink, DeviceStream};
use crate::audio::dsp;
use crate::audio::queue::{BoundedQueue, PushOutcome};
use crate::config::CapturePreference;
use crate::events::topics;

const NAME: ModuleName = ModuleName::CaptureGraphManager;

// ---------------------------------------------------------------------------
// CaptureMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Bound to an input device.
    Device,
    /// Samples are pushed by the caller.
    Scripted,
    /// Nothing acquired.
    Released,
}

// ---------------------------------------------------------------------------
// CaptureInput
// ---------------------------------------------------------------------------

struct InputShared {
    ctx: ModuleContext,
    queue: BoundedQueue<Vec<f32>>,
    pending: Mutex<Vec<f32>>,
    frame_size: AtomicUsize,
}

/// Producer side of the capture queue.  Cheap to clone; usable from any
/// thread.
#[derive(Clone)]
pub struct CaptureInput {
    shared: Arc<InputShared>,
}

impl CaptureInput {
    fn new(ctx: ModuleContext) -> Self {
        let cfg = &ctx.config.capture;
        let queue = BoundedQueue::new(cfg.queue_frames, cfg.backpressure);
        // Closed until the graph is started.
        queue.close();
        let frame_size = ctx.config.frame_size;
        Self {
            shared: Arc::new(InputShared {
                ctx,
                queue,
                pending: Mutex::new(Vec::new()),
                frame_size: AtomicUsize::new(frame_size),
            }),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Vec<f32>> {
        self.shared.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn frame_len(&self) -> usize {
        let channels = self.shared.ctx.config.channels.max(1) as usize;
        self.shared.frame_size.load(Ordering::Acquire).max(1) * channels
    }

    /// Push interleaved samples already in the pipeline's format.
    ///
    /// Samples are assembled into frames of `frameSize` per channel.
    /// Returns the number of complete frames queued.  Samples pushed while
    /// the graph is stopped are discarded.
    pub fn push_samples(&self, samples: &[f32]) -> usize {
        if self.shared.queue.is_closed() {
            return 0;
        }
        let frame_len = self.frame_len();
        let mut pending = self.pending();
        pending.extend_from_slice(samples);

        let mut queued = 0;
        while pending.len() >= frame_len {
            let frame: Vec<f32> = pending.drain(..frame_len).collect();
            match self.shared.queue.push(frame) {
                PushOutcome::Queued => queued += 1,
                PushOutcome::DroppedOldest => {
                    queued += 1;
                    debug!("capture: queue full, dropped oldest frame");
                }
                PushOutcome::DroppedNewest => debug!("capture: queue full, dropped incoming frame"),
                PushOutcome::Closed => break,
            }
        }
        queued
    }

    /// Report a capture fault.  Published as `capture-error`.
    pub fn report_error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("capture: {message}");
        self.shared.ctx.publish(
            NAME,
            topics::CAPTURE_ERROR,
            json!({ "message": message, "critical": true }),
        );
    }

    fn clear_pending(&self) {
        self.pending().clear();
    }
}

impl CaptureSink for CaptureInput {
    fn on_samples(&self, samples: &[f32], sample_rate: u32, channels: u16) {
        let cfg = &self.shared.ctx.config;
        let remixed;
        let samples = if channels != cfg.channels {
            remixed = dsp::remix(samples, channels, cfg.channels);
            &remixed[..]
        } else {
            samples
        };
        if sample_rate != cfg.sample_rate {
            let resampled = dsp::resample_linear(samples, cfg.channels, sample_rate, cfg.sample_rate);
            self.push_samples(&resampled);
        } else {
            self.push_samples(samples);
        }
    }

    fn on_error(&self, message: String) {
        self.report_error(message);
    }
}

// ---------------------------------------------------------------------------
// CaptureGraphManager
// ---------------------------------------------------------------------------

pub struct CaptureGraphManager {
    ctx: ModuleContext,
    input: CaptureInput,
    mode: CaptureMode,
    device: Option<DeviceStream>,
    started: bool,
    monitor_sample_rate: AtomicU32,
    playback: VecDeque<f32>,
    initialized: bool,
}

impl CaptureGraphManager {
    pub fn new(ctx: ModuleContext) -> Self {
        let monitor = ctx.config.capture.monitor_sample_rate;
        Self {
            input: CaptureInput::new(ctx.clone()),
            ctx,
            mode: CaptureMode::Released,
            device: None,
            started: false,
            monitor_sample_rate: AtomicU32::new(monitor),
            playback: VecDeque::new(),
            initialized: false,
        }
    }

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Handle for feeding samples on the scripted path.
    pub fn input(&self) -> CaptureInput {
        self.input.clone()
    }

    /// Bind to the preferred input.  Idempotent while acquired.
    pub fn acquire(&mut self) -> CaptureMode {
        if self.mode != CaptureMode::Released {
            return self.mode;
        }
        let cfg = &self.ctx.config.capture;
        self.mode = match cfg.preference {
            CapturePreference::Scripted => CaptureMode::Scripted,
            CapturePreference::Device => {
                let sink: Arc<dyn CaptureSink> = Arc::new(self.input.clone());
                match capture::open_input(cfg.device.as_deref(), sink) {
                    Ok(stream) => {
                        self.device = Some(stream);
                        CaptureMode::Device
                    }
                    Err(e) => {
                        self.publish_fallback(&e.to_string());
                        CaptureMode::Scripted
                    }
                }
            }
        };
        info!("capture: acquired ({:?})", self.mode);
        self.mode
    }

    /// Drop the device and stop accepting samples.
    pub fn release(&mut self) {
        self.stop();
        self.device = None;
        self.input.shared.queue.drain();
        self.playback.clear();
        if self.mode != CaptureMode::Released {
            debug!("capture: released");
        }
        self.mode = CaptureMode::Released;
    }

    /// Switch a faulted device graph to the scripted path.
    ///
    /// Returns `false` when already scripted.
    pub fn fall_back_to_scripted(&mut self, reason: &str) -> bool {
        if self.mode == CaptureMode::Scripted {
            return false;
        }
        self.device = None;
        self.mode = CaptureMode::Scripted;
        self.publish_fallback(reason);
        true
    }

    fn publish_fallback(&self, reason: &str) {
        warn!("capture: falling back to scripted input ({reason})");
        self.ctx.publish(
            NAME,
            topics::CAPTURE_FALLBACK,
            json!({ "mode": CaptureMode::Scripted, "reason": reason }),
        );
    }

    /// Start accepting samples.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.mode == CaptureMode::Released {
            return Err(CaptureError::NotAcquired);
        }
        self.input.clear_pending();
        self.input.shared.queue.reopen();
        self.started = true;
        Ok(())
    }

    /// Stop accepting samples.  Frames already queued stay drainable.
    pub fn stop(&mut self) {
        self.input.shared.queue.close();
        self.input.clear_pending();
        self.started = false;
    }

    pub fn next_frame(&self) -> Option<Vec<f32>> {
        self.input.shared.queue.try_pop()
    }

    pub fn drain_frames(&self) -> Vec<Vec<f32>> {
        self.input.shared.queue.drain()
    }

    pub fn pending_frames(&self) -> usize {
        self.input.shared.queue.len()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.input.shared.queue.dropped()
    }

    pub fn frame_size(&self) -> usize {
        self.input.shared.frame_size.load(Ordering::Acquire)
    }

    /// Change the per-channel frame length for subsequently assembled frames.
    pub fn set_frame_size(&self, frame_size: usize) {
        self.input.shared.frame_size.store(frame_size.max(1), Ordering::Release);
    }

    pub fn monitor_sample_rate(&self) -> u32 {
        self.monitor_sample_rate.load(Ordering::Acquire)
    }

    pub fn set_monitor_sample_rate(&self, rate: u32) {
        self.monitor_sample_rate.store(rate.max(1), Ordering::Release);
    }

    /// Queue audio on the output path at the monitoring rate and the
    /// pipeline's channel count.  Returns the number of samples queued.
    ///
    /// The buffer holds at most `recording.maxSeconds` of monitor-rate
    /// audio; the oldest samples go first.
    pub fn queue_playback(&mut self, samples: &[f32], sample_rate: u32, channels: u16) -> usize {
        let out_channels = self.ctx.config.channels;
        let remixed = dsp::remix(samples, channels, out_channels);
        let resampled = dsp::resample_linear(&remixed, out_channels, sample_rate, self.monitor_sample_rate());
        let n = resampled.len();
        self.playback.extend(resampled);

        let capacity = self.playback_capacity();
        if self.playback.len() > capacity {
            let overflow = self.playback.len() - capacity;
            self.playback.drain(..overflow);
            debug!("capture: playback buffer full, dropped {overflow} oldest samples");
        }
        n
    }

    /// Interleaved samples the playback buffer may hold.
    pub fn playback_capacity(&self) -> usize {
        let secs = self.ctx.config.recording.max_seconds.max(0.0);
        let frames = (secs * self.monitor_sample_rate() as f32) as usize;
        (frames * self.ctx.config.channels.max(1) as usize).max(1)
    }

    /// Take up to `max` queued output samples.
    pub fn take_playback(&mut self, max: usize) -> Vec<f32> {
        let n = max.min(self.playback.len());
        self.playback.drain(..n).collect()
    }

    pub fn clear_playback(&mut self) {
        self.playback.clear();
    }

    pub fn playback_pending(&self) -> usize {
        self.playback.len()
    }
}

#[async_trait]
impl AudioModule for CaptureGraphManager {
    fn name(&self) -> ModuleName {
        NAME
    }

    async fn initialize(&mut self) -> Result<(), ModuleError> {
        self.acquire();
        self.initialized = true;
        Ok(())
    }

    fn reset(&mut self) {
        self.release();
        self.initialized = false;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn describe(&self) -> Value {
        json!({
            "mode": self.mode,
            "device": self.device.as_ref().map(DeviceStream::info),
            "started": self.started,
            "pendingFrames": self.pending_frames(),
            "droppedFrames": self.dropped_frames(),
            "frameSize": self.frame_size(),
            "monitorSampleRate": self.monitor_sample_rate(),
            "playbackPending": self.playback_pending(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::queue::BackpressurePolicy;
    use crate::config::{CaptureConfig, PipelineConfig, RecordingConfig};
    use crate::modules::test_context_with;

    fn scripted(frame_size: usize, queue_frames: usize, channels: u16) -> CaptureGraphManager {
        let ctx = test_context_with(PipelineConfig {
            frame_size,
            channels,
            capture: CaptureConfig {
                preference: CapturePreference::Scripted,
                queue_frames,
                backpressure: BackpressurePolicy::DropOldest,
                ..CaptureConfig::default()
            },
            ..PipelineConfig::default()
        });
        CaptureGraphManager::new(ctx)
    }

    #[test]
    fn start_requires_acquire() {
        let mut graph = scripted(4, 4, 1);
        assert_eq!(graph.start(), Err(CaptureError::NotAcquired));
        assert_eq!(graph.acquire(), CaptureMode::Scripted);
        assert!(graph.start().is_ok());
    }

    #[test]
    fn assembles_frames_across_pushes() {
        let mut graph = scripted(4, 8, 2);
        graph.acquire();
        graph.start().unwrap();
        let input = graph.input();
        assert_eq!(input.push_samples(&[0.1; 6]), 0);
        assert_eq!(input.push_samples(&[0.2; 12]), 2);
        assert_eq!(graph.pending_frames(), 2);
        let first = graph.next_frame().unwrap();
        assert_eq!(first.len(), 8);
        assert_eq!(&first[..6], &[0.1; 6]);
    }

    #[test]
    fn samples_are_discarded_while_stopped() {
        let mut graph = scripted(2, 4, 1);
        graph.acquire();
        assert_eq!(graph.input().push_samples(&[0.1; 8]), 0);
        graph.start().unwrap();
        graph.input().push_samples(&[0.1; 4]);
        graph.stop();
        assert_eq!(graph.input().push_samples(&[0.1; 4]), 0);
        assert_eq!(graph.drain_frames().len(), 2);
    }

    #[test]
    fn full_queue_drops_oldest() {
        let mut graph = scripted(1, 2, 1);
        graph.acquire();
        graph.start().unwrap();
        graph.input().push_samples(&[1.0, 2.0, 3.0]);
        assert_eq!(graph.dropped_frames(), 1);
        assert_eq!(graph.drain_frames(), vec![vec![2.0], vec![3.0]]);
    }

    #[test]
    fn frame_size_change_applies_to_next_frames() {
        let mut graph = scripted(4, 8, 1);
        graph.acquire();
        graph.start().unwrap();
        graph.set_frame_size(2);
        graph.input().push_samples(&[0.5; 4]);
        assert_eq!(graph.pending_frames(), 2);
        assert_eq!(graph.frame_size(), 2);
    }

    #[test]
    fn device_sink_remixes_and_resamples() {
        let mut graph = scripted(480, 8, 1);
        graph.acquire();
        graph.start().unwrap();
        // 10 ms of 24 kHz stereo → 480 mono frames at 48 kHz.
        graph.input().on_samples(&vec![0.25; 480], 24_000, 2);
        let frame = graph.next_frame().unwrap();
        assert_eq!(frame.len(), 480);
        assert!(frame.iter().all(|s| (s - 0.25).abs() < 1e-6));
    }

    #[cfg(not(feature = "device-capture"))]
    #[test]
    fn device_preference_falls_back_to_scripted() {
        let ctx = test_context_with(PipelineConfig::default());
        let fallbacks = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fallbacks);
        ctx.bus.subscribe(topics::CAPTURE_FALLBACK, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let mut graph = CaptureGraphManager::new(ctx);
        assert_eq!(graph.acquire(), CaptureMode::Scripted);
        assert_eq!(graph.acquire(), CaptureMode::Scripted);
        assert_eq!(fallbacks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn report_error_publishes_capture_error() {
        let graph = scripted(4, 4, 1);
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&errors);
        graph.ctx.bus.subscribe(topics::CAPTURE_ERROR, move |e| {
            assert_eq!(e.payload["critical"], true);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        graph.input().report_error("device unplugged");
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn playback_is_resampled_to_monitor_rate() {
        let mut graph = scripted(4, 4, 1);
        graph.set_monitor_sample_rate(24_000);
        let queued = graph.queue_playback(&vec![0.1; 4_800], 48_000, 1);
        assert_eq!(queued, 2_400);
        assert_eq!(graph.take_playback(1_000).len(), 1_000);
        assert_eq!(graph.playback_pending(), 1_400);
    }

    #[test]
    fn playback_keeps_only_the_newest_audio() {
        let ctx = test_context_with(PipelineConfig {
            channels: 1,
            recording: RecordingConfig {
                max_seconds: 0.1,
                ..RecordingConfig::default()
            },
            capture: CaptureConfig {
                preference: CapturePreference::Scripted,
                monitor_sample_rate: 16_000,
                ..CaptureConfig::default()
            },
            ..PipelineConfig::default()
        });
        let mut graph = CaptureGraphManager::new(ctx);
        assert_eq!(graph.playback_capacity(), 1_600);

        graph.queue_playback(&vec![0.1; 1_000], 16_000, 1);
        graph.queue_playback(&vec![0.9; 1_000], 16_000, 1);
        assert_eq!(graph.playback_pending(), 1_600);
        let head = graph.take_playback(600);
        assert!(head.iter().all(|&s| s == 0.1));
        assert!(graph.take_playback(usize::MAX).iter().all(|&s| s == 0.9));

        graph.queue_playback(&vec![0.5; 100], 16_000, 1);
        graph.clear_playback();
        assert_eq!(graph.playback_pending(), 0);
    }

    #[tokio::test]
    async fn reset_releases_graph() {
        let mut graph = scripted(4, 4, 1);
        graph.initialize().await.unwrap();
        graph.start().unwrap();
        graph.reset();
        assert_eq!(graph.mode(), CaptureMode::Released);
        assert!(!graph.is_started());
        assert!(!graph.is_initialized());
    }
}
