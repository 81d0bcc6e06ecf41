//! Automatic gain control with a noise gate and a hard limiter.
//!
//! Each frame the controller computes the gain that would bring the frame's
//! RMS to `target_db`, clamps it to `[min_gain_db, max_gain_db]` and moves
//! towards it (fast when reducing, slow when boosting).  Frames within
//! `gate_margin_db` of the noise floor are not boosted.  The floor comes
//! from the noise detector's annotation when it ran earlier in the chain,
//! otherwise from the last `noise-floor-updated` event.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{AudioModule, FrameStage, ModuleContext, ModuleError, ModuleName, StageOutcome};
use crate::audio::dsp::{self, SILENCE_DB};
use crate::audio::{Frame, GainReading};
use crate::events::topics;

pub struct GainController {
    ctx: ModuleContext,
    gain_db: f32,
    last_published_db: f32,
    noise_floor_db: f32,
    limited_frames: u64,
    initialized: bool,
}

impl GainController {
    pub fn new(ctx: ModuleContext) -> Self {
        let floor = ctx.config.noise.initial_floor_db;
        Self {
            ctx,
            gain_db: 0.0,
            last_published_db: 0.0,
            noise_floor_db: floor,
            limited_frames: 0,
            initialized: false,
        }
    }

    pub fn gain_db(&self) -> f32 {
        self.gain_db
    }

    /// Fed from `noise-floor-updated`.
    pub fn set_noise_floor_db(&mut self, floor_db: f32) {
        self.noise_floor_db = floor_db;
    }

    pub fn noise_floor_db(&self) -> f32 {
        self.noise_floor_db
    }
}

#[async_trait]
impl AudioModule for GainController {
    fn name(&self) -> ModuleName {
        ModuleName::GainController
    }

    async fn initialize(&mut self) -> Result<(), ModuleError> {
        self.initialized = true;
        Ok(())
    }

    fn reset(&mut self) {
        self.gain_db = 0.0;
        self.last_published_db = 0.0;
        self.noise_floor_db = self.ctx.config.noise.initial_floor_db;
        self.limited_frames = 0;
        self.initialized = false;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn describe(&self) -> Value {
        json!({
            "enabled": self.ctx.config.gain.enabled,
            "gainDb": self.gain_db,
            "noiseFloorDb": self.noise_floor_db,
            "limitedFrames": self.limited_frames,
        })
    }
}

impl FrameStage for GainController {
    fn process(&mut self, frame: &mut Frame) -> Result<StageOutcome, ModuleError> {
        let cfg = self.ctx.config.gain.clone();
        if !cfg.enabled {
            return Ok(StageOutcome::Continue);
        }

        if let Some(noise) = frame.annotations.noise {
            self.noise_floor_db = noise.floor_db;
        }

        let level_db = dsp::linear_to_db(dsp::rms(frame.samples()));
        let gated = level_db <= SILENCE_DB || level_db <= self.noise_floor_db + cfg.gate_margin_db;
        let desired = if gated {
            self.gain_db.min(0.0)
        } else {
            (cfg.target_db - level_db).clamp(cfg.min_gain_db, cfg.max_gain_db)
        };
        let coef = if desired < self.gain_db {
            cfg.attack
        } else {
            cfg.release
        };
        self.gain_db += coef.clamp(0.0, 1.0) * (desired - self.gain_db);

        let linear = dsp::db_to_linear(self.gain_db);
        let ceiling = cfg.limiter_ceiling;
        let mut limited = false;
        for s in frame.samples_mut() {
            let v = *s * linear;
            if v.abs() > ceiling {
                limited = true;
                *s = v.clamp(-ceiling, ceiling);
            } else {
                *s = v;
            }
        }
        if limited {
            self.limited_frames += 1;
        }

        frame.annotations.gain = Some(GainReading {
            gain_db: self.gain_db,
            limited,
            gated,
        });

        if (self.gain_db - self.last_published_db).abs() >= cfg.change_event_db {
            self.last_published_db = self.gain_db;
            self.ctx.publish(
                ModuleName::GainController,
                topics::GAIN_CHANGED,
                json!({ "gainDb": self.gain_db, "limited": limited }),
            );
        }
        Ok(StageOutcome::Continue)
    }
}
