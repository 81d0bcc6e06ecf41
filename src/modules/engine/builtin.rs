//! Pure-Rust analysis engine.

use super::{AnalysisEngine, EngineAnalysis, EngineError, EngineFeatures, ReferenceCall, SessionContext};
use crate::audio::dsp;

/// Lowest and highest fundamental searched by the pitch estimator.
const MIN_PITCH_HZ: f32 = 80.0;
const MAX_PITCH_HZ: f32 = 2_000.0;
/// Normalized autocorrelation needed to call a frame voiced.
const VOICING_THRESHOLD: f32 = 0.5;
/// Level difference at which the level part of similarity reaches zero.
const LEVEL_SPAN_DB: f32 = 30.0;

#[derive(Debug, Clone, Copy)]
struct ReferenceProfile {
    rms_db: f32,
    pitch_hz: Option<f32>,
}

#[derive(Debug, Default)]
pub struct BuiltinEngine {
    loaded: bool,
    reference: Option<ReferenceProfile>,
    frames_this_session: u64,
}

impl BuiltinEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn zero_crossing_rate(mono: &[f32]) -> f32 {
        if mono.len() < 2 {
            return 0.0;
        }
        let crossings = mono
            .windows(2)
            .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
            .count();
        crossings as f32 / (mono.len() - 1) as f32
    }

    /// Autocorrelation pitch estimate over `[MIN_PITCH_HZ, MAX_PITCH_HZ]`.
    pub fn estimate_pitch(mono: &[f32], sample_rate: u32) -> Option<f32> {
        let sr = sample_rate as f32;
        let min_lag = (sr / MAX_PITCH_HZ).floor().max(1.0) as usize;
        let max_lag = ((sr / MIN_PITCH_HZ).ceil() as usize).min(mono.len().saturating_sub(1));
        if min_lag >= max_lag {
            return None;
        }
        let energy: f32 = mono.iter().map(|s| s * s).sum();
        if energy <= f32::EPSILON {
            return None;
        }

        let mut best_lag = 0;
        let mut best = 0.0_f32;
        for lag in min_lag..=max_lag {
            let corr: f32 = mono[..mono.len() - lag]
                .iter()
                .zip(&mono[lag..])
                .map(|(a, b)| a * b)
                .sum();
            let norm = corr / energy;
            if norm > best {
                best = norm;
                best_lag = lag;
            }
        }
        (best >= VOICING_THRESHOLD && best_lag > 0).then(|| sr / best_lag as f32)
    }

    fn profile(samples: &[f32], sample_rate: u32, channels: u16) -> ReferenceProfile {
        let mono = dsp::remix(samples, channels, 1);
        ReferenceProfile {
            rms_db: dsp::linear_to_db(dsp::rms(&mono)),
            pitch_hz: Self::estimate_pitch(&mono, sample_rate),
        }
    }

    fn similarity(reference: ReferenceProfile, rms_db: f32, pitch_hz: Option<f32>) -> f32 {
        let level = 1.0 - ((rms_db - reference.rms_db).abs() / LEVEL_SPAN_DB).min(1.0);
        match (reference.pitch_hz, pitch_hz) {
            (Some(r), Some(p)) => {
                let pitch = 1.0 - ((p - r).abs() / r).min(1.0);
                0.5 * level + 0.5 * pitch
            }
            (Some(_), None) => 0.5 * level,
            (None, _) => level,
        }
    }
}

impl AnalysisEngine for BuiltinEngine {
    fn name(&self) -> &str {
        "builtin"
    }

    fn load(&mut self) -> Result<EngineFeatures, EngineError> {
        self.loaded = true;
        Ok(EngineFeatures {
            pitch: true,
            similarity: true,
            multichannel: true,
        })
    }

    fn analyze(
        &mut self,
        samples: &[f32],
        session: &SessionContext,
        sequence: u64,
    ) -> Result<EngineAnalysis, EngineError> {
        if !self.loaded {
            return Err(EngineError::NotLoaded);
        }
        if samples.is_empty() {
            return Err(EngineError::InvalidInput("empty frame".into()));
        }
        self.frames_this_session += 1;

        let mono = dsp::remix(samples, session.channels, 1);
        let rms_db = dsp::linear_to_db(dsp::rms(&mono));
        let pitch_hz = Self::estimate_pitch(&mono, session.sample_rate);
        Ok(EngineAnalysis {
            session_id: session.session_id.clone(),
            sequence,
            rms_db,
            zero_crossing_rate: Self::zero_crossing_rate(&mono),
            pitch_hz,
            similarity: self
                .reference
                .map(|r| Self::similarity(r, rms_db, pitch_hz)),
        })
    }

    fn load_reference(&mut self, reference: &ReferenceCall) -> Result<(), EngineError> {
        if reference.samples.is_empty() {
            return Err(EngineError::InvalidInput(format!(
                "master call `{}` has no samples",
                reference.call_id
            )));
        }
        self.reference = Some(Self::profile(
            &reference.samples,
            reference.sample_rate,
            reference.channels,
        ));
        Ok(())
    }

    fn end_session(&mut self, _session_id: &str) {
        self.frames_this_session = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sr: u32, len: usize, amp: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amp * (2.0 * std::f32::consts::PI * freq * i as f32 / sr as f32).sin())
            .collect()
    }

    fn session() -> SessionContext {
        SessionContext {
            session_id: "hm-session-test".into(),
            sample_rate: 48_000,
            channels: 1,
        }
    }

    #[test]
    fn analyze_before_load_is_not_loaded() {
        let mut engine = BuiltinEngine::new();
        let err = engine.analyze(&[0.1; 10], &session(), 0).unwrap_err();
        assert_eq!(err, EngineError::NotLoaded);
    }

    #[test]
    fn pitch_of_sine_is_found() {
        let pitch = BuiltinEngine::estimate_pitch(&sine(440.0, 48_000, 4_096, 0.5), 48_000).unwrap();
        assert!((pitch - 440.0).abs() < 5.0, "{pitch}");
    }

    #[test]
    fn silence_has_no_pitch() {
        assert_eq!(BuiltinEngine::estimate_pitch(&[0.0; 4_096], 48_000), None);
    }

    #[test]
    fn analysis_reports_level_and_zcr() {
        let mut engine = BuiltinEngine::new();
        engine.load().unwrap();
        let a = engine
            .analyze(&sine(1_000.0, 48_000, 4_800, 0.5), &session(), 7)
            .unwrap();
        assert_eq!(a.sequence, 7);
        assert!((a.rms_db + 9.03).abs() < 0.1, "{}", a.rms_db);
        // 1 kHz crosses zero 2000 times a second.
        assert!((a.zero_crossing_rate - 2_000.0 / 48_000.0).abs() < 0.005);
        assert!(a.similarity.is_none());
    }

    #[test]
    fn matching_reference_scores_higher_than_mismatch() {
        let mut engine = BuiltinEngine::new();
        engine.load().unwrap();
        engine
            .load_reference(&ReferenceCall {
                call_id: "elk-bugle".into(),
                samples: sine(600.0, 48_000, 4_096, 0.5),
                sample_rate: 48_000,
                channels: 1,
            })
            .unwrap();

        let same = engine
            .analyze(&sine(600.0, 48_000, 4_096, 0.5), &session(), 0)
            .unwrap()
            .similarity
            .unwrap();
        let other = engine
            .analyze(&sine(150.0, 48_000, 4_096, 0.05), &session(), 1)
            .unwrap()
            .similarity
            .unwrap();
        assert!(same > 0.9, "{same}");
        assert!(other < same, "{other} vs {same}");
    }

    #[test]
    fn empty_reference_is_rejected() {
        let mut engine = BuiltinEngine::new();
        let err = engine
            .load_reference(&ReferenceCall {
                call_id: "empty".into(),
                samples: vec![],
                sample_rate: 48_000,
                channels: 1,
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }
}
