//! Quick per-frame quality score.
//!
//! ```text
//! score = 0.4 · min(1, rms / 0.1)          level
//!       + 0.3 · min(1, crest_db / 10)      dynamics
//!       + 0.3 · (peak < 0.95 ? 1 : 0.5)    clipping
//! ```
//!
//! `quality-degraded` is published once after `degraded_frames` consecutive
//! frames score below `degraded_threshold`; `quality-recovered` follows the
//! first good frame after that.

use async_trait::async_trait;
use log::info;
use serde_json::{json, Value};

use super::{AudioModule, FrameStage, ModuleContext, ModuleError, ModuleName, StageOutcome};
use crate::audio::dsp;
use crate::audio::{Frame, QualityReading};
use crate::events::topics;

const LEVEL_REFERENCE: f32 = 0.1;
const CREST_REFERENCE_DB: f32 = 10.0;
const CLIPPING_PEAK: f32 = 0.95;

/// Score a block of samples.
pub fn score(samples: &[f32]) -> QualityReading {
    let rms = dsp::rms(samples);
    let peak = dsp::peak(samples);

    let level_score = (rms / LEVEL_REFERENCE).min(1.0);
    let dynamics_score = if rms > 0.0 {
        (dsp::linear_to_db(peak / rms) / CREST_REFERENCE_DB).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let clipping_score = if peak < CLIPPING_PEAK { 1.0 } else { 0.5 };

    QualityReading {
        score: 0.4 * level_score + 0.3 * dynamics_score + 0.3 * clipping_score,
        level_score,
        dynamics_score,
        clipping_score,
    }
}

pub struct QualityAssessor {
    ctx: ModuleContext,
    low_streak: u32,
    degraded: bool,
    frames: u64,
    score_sum: f64,
    last: Option<QualityReading>,
    initialized: bool,
}

impl QualityAssessor {
    pub fn new(ctx: ModuleContext) -> Self {
        Self {
            ctx,
            low_streak: 0,
            degraded: false,
            frames: 0,
            score_sum: 0.0,
            last: None,
            initialized: false,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn average_score(&self) -> Option<f64> {
        (self.frames > 0).then(|| self.score_sum / self.frames as f64)
    }
}

#[async_trait]
impl AudioModule for QualityAssessor {
    fn name(&self) -> ModuleName {
        ModuleName::QualityAssessor
    }

    async fn initialize(&mut self) -> Result<(), ModuleError> {
        self.initialized = true;
        Ok(())
    }

    fn reset(&mut self) {
        self.low_streak = 0;
        self.degraded = false;
        self.frames = 0;
        self.score_sum = 0.0;
        self.last = None;
        self.initialized = false;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn describe(&self) -> Value {
        json!({
            "last": self.last,
            "averageScore": self.average_score(),
            "degraded": self.degraded,
        })
    }
}

impl FrameStage for QualityAssessor {
    fn process(&mut self, frame: &mut Frame) -> Result<StageOutcome, ModuleError> {
        let cfg = &self.ctx.config.quality;
        let reading = score(frame.samples());
        frame.annotations.quality = Some(reading);
        self.last = Some(reading);
        self.frames += 1;
        self.score_sum += f64::from(reading.score);

        if reading.score < cfg.degraded_threshold {
            self.low_streak += 1;
            if !self.degraded && self.low_streak >= cfg.degraded_frames {
                self.degraded = true;
                info!(
                    "quality: degraded after {} frames (score {:.2})",
                    self.low_streak, reading.score
                );
                self.ctx.publish(
                    ModuleName::QualityAssessor,
                    topics::QUALITY_DEGRADED,
                    json!({
                        "score": reading.score,
                        "consecutiveFrames": self.low_streak,
                        "sessionId": frame.context.session_id,
                    }),
                );
            }
        } else {
            self.low_streak = 0;
            if self.degraded {
                self.degraded = false;
                self.ctx.publish(
                    ModuleName::QualityAssessor,
                    topics::QUALITY_RECOVERED,
                    json!({ "score": reading.score }),
                );
            }
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

    fn chirp(amplitude: f32) -> Vec<f32> {
        (0..480)
            .map(|i| amplitude * (i as f32 * 0.07).sin() * (1.0 + (i as f32 * 0.003).sin()) / 2.0)
            .collect()
    }

    #[test]
    fn silence_scores_only_the_clipping_term() {
        let r = score(&[0.0; 480]);
        assert!((r.score - 0.3).abs() < 1e-6);
    }

    #[test]
    fn constant_full_scale_is_penalized() {
        let r = score(&[1.0; 480]);
        // level 1, no dynamics, clipping 0.5
        assert!((r.score - 0.55).abs() < 1e-6, "{r:?}");
    }

    #[test]
    fn healthy_call_scores_high() {
        let r = score(&chirp(0.8));
        assert!(r.score > 0.7, "{r:?}");
        assert_eq!(r.clipping_score, 1.0);
    }

    #[test]
    fn degradation_needs_consecutive_low_frames() {
        let ctx = test_context();
        let topics_seen = Arc::new(Mutex::new(Vec::new()));
        for topic in [topics::QUALITY_DEGRADED, topics::QUALITY_RECOVERED] {
            let sink = Arc::clone(&topics_seen);
            ctx.bus
                .subscribe(topic, move |e| sink.lock().unwrap().push(e.topic.clone()));
        }
        let mut qa = QualityAssessor::new(ctx);
        let mut run = |samples: Vec<f32>| {
            let mut f = Frame::new(samples, frame_context(1)).unwrap();
            qa.process(&mut f).unwrap();
        };

        run(vec![0.0; 480]);
        run(vec![0.0; 480]);
        run(chirp(0.8));
        assert!(topics_seen.lock().unwrap().is_empty());

        for _ in 0..4 {
            run(vec![0.0; 480]);
        }
        run(chirp(0.8));
        assert_eq!(
            *topics_seen.lock().unwrap(),
            vec![topics::QUALITY_DEGRADED.to_string(), topics::QUALITY_RECOVERED.to_string()]
        );
        assert!(!qa.is_degraded());
        assert!(qa.average_score().is_some());
    }
}
