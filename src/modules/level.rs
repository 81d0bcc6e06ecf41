//! Level metering with attack/release ballistics.
//!
//! RMS and peak are smoothed with separate one-pole attack and release
//! coefficients derived from the frame duration, converted to dBFS and
//! clamped to `[db_floor, db_ceiling]`.  Readings are kept in a history ring
//! and published on `level-updated` no more often than `update_interval_ms`
//! of audio time.

use async_trait::async_trait;
use log::debug;
use serde_json::{json, Value};

use super::{AudioModule, FrameStage, ModuleContext, ModuleError, ModuleName, StageOutcome};
use crate::audio::dsp;
use crate::audio::{Frame, LevelReading, RingBuffer};
use crate::events::topics;

pub struct LevelMonitor {
    ctx: ModuleContext,
    rms: f32,
    peak: f32,
    history: RingBuffer<LevelReading>,
    /// Audio time since the last `level-updated`.
    since_update_ms: f64,
    clipped_frames: u64,
    initialized: bool,
}

impl LevelMonitor {
    pub fn new(ctx: ModuleContext) -> Self {
        let history = RingBuffer::new(ctx.config.levels.history_size);
        Self {
            ctx,
            rms: 0.0,
            peak: 0.0,
            history,
            since_update_ms: f64::INFINITY,
            clipped_frames: 0,
            initialized: false,
        }
    }

    pub fn current(&self) -> Option<LevelReading> {
        self.history.latest()
    }

    /// The last `n` readings, oldest first.
    pub fn history(&self, n: usize) -> Vec<LevelReading> {
        self.history.recent(n)
    }

    fn smooth(current: f32, target: f32, attack_ms: f32, release_ms: f32, frame_ms: f32) -> f32 {
        let tc = if target > current { attack_ms } else { release_ms };
        let coef = dsp::smoothing_coefficient(tc, frame_ms);
        current + coef * (target - current)
    }

    fn to_meter_db(&self, linear: f32) -> f32 {
        let cfg = &self.ctx.config.levels;
        dsp::linear_to_db(linear).clamp(cfg.db_floor, cfg.db_ceiling)
    }
}

#[async_trait]
impl AudioModule for LevelMonitor {
    fn name(&self) -> ModuleName {
        ModuleName::LevelMonitor
    }

    async fn initialize(&mut self) -> Result<(), ModuleError> {
        self.initialized = true;
        Ok(())
    }

    fn reset(&mut self) {
        self.rms = 0.0;
        self.peak = 0.0;
        self.history.clear();
        self.since_update_ms = f64::INFINITY;
        self.clipped_frames = 0;
        self.initialized = false;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn describe(&self) -> Value {
        json!({
            "current": self.current(),
            "historyLen": self.history.len(),
            "clippedFrames": self.clipped_frames,
        })
    }
}

impl FrameStage for LevelMonitor {
    fn process(&mut self, frame: &mut Frame) -> Result<StageOutcome, ModuleError> {
        let cfg = &self.ctx.config.levels;
        let frame_ms = frame.duration_ms() as f32;
        let samples = frame.samples();

        let rms = dsp::rms(samples);
        let peak = dsp::peak(samples);
        self.rms = Self::smooth(self.rms, rms, cfg.rms_attack_ms, cfg.rms_release_ms, frame_ms);
        self.peak = Self::smooth(self.peak, peak, cfg.peak_attack_ms, cfg.peak_release_ms, frame_ms);
        let clipped = peak >= cfg.clip_threshold;

        let reading = LevelReading {
            rms_db: self.to_meter_db(self.rms),
            peak_db: self.to_meter_db(self.peak),
            peak,
            clipped,
        };
        self.history.push(reading);
        frame.annotations.level = Some(reading);

        if clipped {
            self.clipped_frames += 1;
            debug!("level: clipping at frame {}", frame.context.sequence);
            self.ctx.publish(
                ModuleName::LevelMonitor,
                topics::CLIPPING_DETECTED,
                json!({ "peak": peak, "sequence": frame.context.sequence }),
            );
        }

        self.since_update_ms += f64::from(frame_ms);
        if self.since_update_ms >= f64::from(self.ctx.config.levels.update_interval_ms) {
            self.since_update_ms = 0.0;
            self.ctx.publish(
                ModuleName::LevelMonitor,
                topics::LEVEL_UPDATED,
                json!({ "rmsDb": reading.rms_db, "peakDb": reading.peak_db, "clipped": clipped }),
            );
        }
        Ok(StageOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::test_context as frame_context;
    use crate::modules::test_context;
    use std::sync::{Arc, Mutex};

    fn frame(value: f32, len: usize) -> Frame {
        Frame::new(vec![value; len], frame_context(1)).unwrap()
    }

    #[test]
    fn silence_reads_at_floor() {
        let mut meter = LevelMonitor::new(test_context());
        let mut f = frame(0.0, 480);
        meter.process(&mut f).unwrap();
        let reading = f.annotations.level.unwrap();
        assert_eq!(reading.rms_db, -60.0);
        assert!(!reading.clipped);
    }

    #[test]
    fn steady_tone_converges_to_its_level() {
        let mut meter = LevelMonitor::new(test_context());
        for _ in 0..50 {
            meter.process(&mut frame(0.5, 480)).unwrap();
        }
        let reading = meter.current().unwrap();
        assert!((reading.rms_db + 6.02).abs() < 0.1, "{reading:?}");
    }

    #[test]
    fn peak_attacks_faster_than_it_releases() {
        let mut meter = LevelMonitor::new(test_context());
        meter.process(&mut frame(0.8, 480)).unwrap();
        let up = meter.current().unwrap().peak_db;
        meter.process(&mut frame(0.0, 480)).unwrap();
        let down = meter.current().unwrap().peak_db;
        // 10 ms frames: attack (1 ms) nearly reaches the peak, release (300 ms) barely moves.
        assert!(up > -2.5, "{up}");
        assert!(up - down < 1.0, "{up} -> {down}");
    }

    #[test]
    fn clipping_is_flagged_and_published() {
        let ctx = test_context();
        let seen = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);
        ctx.bus.subscribe(topics::CLIPPING_DETECTED, move |_| *sink.lock().unwrap() += 1);

        let mut meter = LevelMonitor::new(ctx);
        let mut f = frame(1.0, 480);
        meter.process(&mut f).unwrap();
        assert!(f.annotations.level.unwrap().clipped);
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn level_updates_are_throttled_by_audio_time() {
        let ctx = test_context();
        let seen = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);
        ctx.bus.subscribe(topics::LEVEL_UPDATED, move |_| *sink.lock().unwrap() += 1);

        let mut meter = LevelMonitor::new(ctx);
        // 10 frames of 10 ms: first frame publishes, then every 50 ms.
        for _ in 0..10 {
            meter.process(&mut frame(0.1, 480)).unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), 2);
    }

    #[test]
    fn history_is_bounded() {
        let mut meter = LevelMonitor::new(test_context());
        for _ in 0..150 {
            meter.process(&mut frame(0.1, 48)).unwrap();
        }
        assert_eq!(meter.history(1_000).len(), 100);
        meter.reset();
        assert!(meter.current().is_none());
    }
}
