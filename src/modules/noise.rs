//! Adaptive noise floor and voice activity.
//!
//! The floor follows the frame level down immediately and creeps up slowly
//! (`rise_rate` of the gap per frame), so sustained calls do not drag it up
//! while a quieter environment is picked up at once.  A frame is voice when
//! it clears both the floor by `vad_margin_db` and the absolute
//! `min_voice_db`; activity is held for `hangover_frames` afterwards.

use async_trait::async_trait;
use log::debug;
use serde_json::{json, Value};

use super::{AudioModule, DropReason, FrameStage, ModuleContext, ModuleError, ModuleName, StageOutcome};
use crate::audio::dsp::{self, SILENCE_DB};
use crate::audio::{Frame, NoiseReading};
use crate::events::topics;

pub struct NoiseDetector {
    ctx: ModuleContext,
    floor_db: f32,
    last_published_floor_db: f32,
    voice_active: bool,
    hangover_left: u32,
    dropped: u64,
    initialized: bool,
}

impl NoiseDetector {
    pub fn new(ctx: ModuleContext) -> Self {
        let floor = ctx.config.noise.initial_floor_db;
        Self {
            ctx,
            floor_db: floor,
            last_published_floor_db: floor,
            voice_active: false,
            hangover_left: 0,
            dropped: 0,
            initialized: false,
        }
    }

    pub fn floor_db(&self) -> f32 {
        self.floor_db
    }

    pub fn voice_active(&self) -> bool {
        self.voice_active
    }

    fn track_floor(&mut self, level_db: f32) {
        if level_db < self.floor_db {
            self.floor_db = level_db;
        } else {
            self.floor_db += self.ctx.config.noise.rise_rate * (level_db - self.floor_db);
        }
        self.floor_db = self.floor_db.max(SILENCE_DB);
    }

    fn detect_voice(&mut self, level_db: f32) -> bool {
        let cfg = &self.ctx.config.noise;
        let above = level_db > self.floor_db + cfg.vad_margin_db && level_db > cfg.min_voice_db;
        if above {
            self.hangover_left = cfg.hangover_frames;
            true
        } else if self.hangover_left > 0 {
            self.hangover_left -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl AudioModule for NoiseDetector {
    fn name(&self) -> ModuleName {
        ModuleName::NoiseDetector
    }

    async fn initialize(&mut self) -> Result<(), ModuleError> {
        self.initialized = true;
        Ok(())
    }

    fn reset(&mut self) {
        let floor = self.ctx.config.noise.initial_floor_db;
        self.floor_db = floor;
        self.last_published_floor_db = floor;
        self.voice_active = false;
        self.hangover_left = 0;
        self.dropped = 0;
        self.initialized = false;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn describe(&self) -> Value {
        json!({
            "floorDb": self.floor_db,
            "voiceActive": self.voice_active,
            "droppedSilentFrames": self.dropped,
        })
    }
}

impl FrameStage for NoiseDetector {
    fn process(&mut self, frame: &mut Frame) -> Result<StageOutcome, ModuleError> {
        let level_db = dsp::linear_to_db(dsp::rms(frame.samples()));

        // Decide against the floor as it stood before this frame.
        let voice = self.detect_voice(level_db);
        self.track_floor(level_db);

        let reading = NoiseReading {
            floor_db: self.floor_db,
            snr_db: level_db - self.floor_db,
            voice_active: voice,
        };
        frame.annotations.noise = Some(reading);

        if voice != self.voice_active {
            self.voice_active = voice;
            debug!("noise: voice activity {voice} at frame {}", frame.context.sequence);
            self.ctx.publish(
                ModuleName::NoiseDetector,
                topics::VOICE_ACTIVITY_CHANGED,
                json!({ "active": voice, "sequence": frame.context.sequence }),
            );
        }

        if (self.floor_db - self.last_published_floor_db).abs()
            >= self.ctx.config.noise.floor_change_event_db
        {
            self.last_published_floor_db = self.floor_db;
            self.ctx.publish(
                ModuleName::NoiseDetector,
                topics::NOISE_FLOOR_UPDATED,
                json!({ "floorDb": self.floor_db }),
            );
        }

        if self.ctx.config.drop_silent_frames && !voice {
            self.dropped += 1;
            return Ok(StageOutcome::Drop(DropReason::Silence));
        }
        Ok(StageOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::test_context as frame_context;
    use crate::config::PipelineConfig;
    use crate::modules::{test_context, test_context_with};
    use std::sync::{Arc, Mutex};

    fn frame(value: f32) -> Frame {
        Frame::new(vec![value; 480], frame_context(1)).unwrap()
    }

    #[test]
    fn floor_falls_immediately() {
        let mut nd = NoiseDetector::new(test_context());
        nd.process(&mut frame(0.0001)).unwrap();
        assert!((nd.floor_db() + 80.0).abs() < 0.01);
    }

    #[test]
    fn floor_rises_slowly() {
        let mut nd = NoiseDetector::new(test_context());
        nd.process(&mut frame(0.5)).unwrap();
        // One frame closes 1% of a ~54 dB gap.
        assert!(nd.floor_db() < -59.0);
    }

    #[test]
    fn loud_frame_is_voice_with_hangover() {
        let mut nd = NoiseDetector::new(test_context());
        let mut f = frame(0.3);
        nd.process(&mut f).unwrap();
        assert!(f.annotations.noise.unwrap().voice_active);

        for _ in 0..3 {
            let mut quiet = frame(0.0);
            nd.process(&mut quiet).unwrap();
            assert!(quiet.annotations.noise.unwrap().voice_active);
        }
        let mut quiet = frame(0.0);
        nd.process(&mut quiet).unwrap();
        assert!(!quiet.annotations.noise.unwrap().voice_active);
    }

    #[test]
    fn quiet_hiss_is_not_voice() {
        let mut nd = NoiseDetector::new(test_context());
        let mut f = frame(0.001);
        nd.process(&mut f).unwrap();
        assert!(!f.annotations.noise.unwrap().voice_active);
    }

    #[test]
    fn floor_change_is_published() {
        let ctx = test_context();
        let floors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&floors);
        ctx.bus.subscribe(topics::NOISE_FLOOR_UPDATED, move |e| {
            sink.lock().unwrap().push(e.payload["floorDb"].as_f64().unwrap())
        });
        let mut nd = NoiseDetector::new(ctx);
        nd.process(&mut frame(0.0001)).unwrap();
        let floors = floors.lock().unwrap();
        assert_eq!(floors.len(), 1);
        assert!((floors[0] + 80.0).abs() < 0.01);
    }

    #[test]
    fn silent_frames_dropped_only_when_enabled() {
        let mut keep = NoiseDetector::new(test_context());
        assert_eq!(keep.process(&mut frame(0.0)).unwrap(), StageOutcome::Continue);

        let config = PipelineConfig {
            drop_silent_frames: true,
            ..PipelineConfig::default()
        };
        let mut drop = NoiseDetector::new(test_context_with(config));
        assert_eq!(
            drop.process(&mut frame(0.0)).unwrap(),
            StageOutcome::Drop(DropReason::Silence)
        );
        assert_eq!(drop.describe()["droppedSilentFrames"], 1);
    }
}
