//! Session recordings and post-processing.
//!
//! While a recording is active the orchestrator appends every processed
//! frame to it.  A recording stops on request, when its session stops, or
//! when it reaches `recording.maxSeconds`.  Finished recordings can be
//! enhanced:
//!
//! 1. trim leading / trailing silence
//! 2. gate 10 ms windows quieter than the gate threshold
//! 3. normalize the peak
//! 4. apply short fade-in / fade-out
//!
//! The enhanced take is kept next to the raw one and preferred for export.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use super::{AudioModule, ModuleContext, ModuleError, ModuleName};
use crate::audio::dsp;
use crate::audio::{ClipValidator, SilenceTrimmer};
use crate::events::topics;

const NAME: ModuleName = ModuleName::RecordingEnhancer;
const GATE_WINDOW_MS: u32 = 10;
const GATE_ATTENUATION: f32 = 0.1;

// ---------------------------------------------------------------------------
// RecordingError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RecordingError {
    #[error("recording {0} is already active")]
    AlreadyRecording(String),

    #[error("no recording is active")]
    NotRecording,

    #[error("recording {0} not found")]
    NotFound(String),

    #[error("recording {0} is still active")]
    StillRecording(String),

    #[error("recording {0} contains no audio")]
    Empty(String),
}

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Recording {
    pub id: String,
    pub session_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub sample_rate: u32,
    pub channels: u16,
    samples: Vec<f32>,
    enhanced: Option<Vec<f32>>,
    max_samples: usize,
    active: bool,
    limit_reached: bool,
}

impl Recording {
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Enhanced take if there is one, otherwise the raw samples.
    pub fn best_take(&self) -> &[f32] {
        self.enhanced.as_deref().unwrap_or(&self.samples)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn duration_secs(&self) -> f32 {
        let frames = self.samples.len() / self.channels.max(1) as usize;
        frames as f32 / self.sample_rate.max(1) as f32
    }

    pub fn summary(&self) -> RecordingSummary {
        RecordingSummary {
            id: self.id.clone(),
            session_id: self.session_id.clone(),
            started_at: self.started_at,
            duration_secs: self.duration_secs(),
            sample_rate: self.sample_rate,
            channels: self.channels,
            limit_reached: self.limit_reached,
            enhanced: self.enhanced.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSummary {
    pub id: String,
    pub session_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f32,
    pub sample_rate: u32,
    pub channels: u16,
    pub limit_reached: bool,
    pub enhanced: bool,
}

/// Enhancement steps; `None` skips a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnhanceOptions {
    pub trim_silence: bool,
    /// 10 ms windows below this RMS level are attenuated.
    pub noise_gate_db: Option<f32>,
    /// Peak level to normalize to.
    pub normalize_peak_db: Option<f32>,
    pub fade_ms: f32,
}

impl Default for EnhanceOptions {
    fn default() -> Self {
        Self {
            trim_silence: true,
            noise_gate_db: Some(-50.0),
            normalize_peak_db: Some(-1.0),
            fade_ms: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedRecording {
    pub id: String,
    pub duration_secs: f32,
    pub trimmed_samples: usize,
    pub gated_windows: usize,
    pub gain_db: f32,
    /// Validation problems found in the enhanced take.
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// RecordingEnhancer
// ---------------------------------------------------------------------------

pub struct RecordingEnhancer {
    ctx: ModuleContext,
    recordings: BTreeMap<String, Recording>,
    active: Option<String>,
    initialized: bool,
}

impl RecordingEnhancer {
    pub fn new(ctx: ModuleContext) -> Self {
        Self {
            ctx,
            recordings: BTreeMap::new(),
            active: None,
            initialized: false,
        }
    }

    /// Start a recording bound to `session_id`.
    pub fn start(
        &mut self,
        session_id: Option<&str>,
        sample_rate: u32,
        channels: u16,
    ) -> Result<String, RecordingError> {
        if let Some(active) = &self.active {
            return Err(RecordingError::AlreadyRecording(active.clone()));
        }
        let id = format!("rec-{}", Uuid::new_v4());
        let max_frames = (self.ctx.config.recording.max_seconds * sample_rate as f32) as usize;
        let recording = Recording {
            id: id.clone(),
            session_id: session_id.map(str::to_string),
            started_at: Utc::now(),
            sample_rate,
            channels,
            samples: Vec::new(),
            enhanced: None,
            max_samples: max_frames * channels.max(1) as usize,
            active: true,
            limit_reached: false,
        };
        info!("recording: {id} started (session {session_id:?})");
        self.ctx.publish(
            NAME,
            topics::RECORDING_STARTED,
            json!({ "id": id, "sessionId": session_id }),
        );
        self.recordings.insert(id.clone(), recording);
        self.active = Some(id.clone());
        Ok(id)
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Append processed samples to the active recording, if any.
    pub fn append(&mut self, samples: &[f32]) {
        let Some(id) = self.active.clone() else {
            return;
        };
        let Some(rec) = self.recordings.get_mut(&id) else {
            self.active = None;
            return;
        };
        let room = rec.max_samples.saturating_sub(rec.samples.len());
        let take = room.min(samples.len());
        rec.samples.extend_from_slice(&samples[..take]);
        if take < samples.len() || rec.samples.len() >= rec.max_samples {
            rec.limit_reached = true;
            let max_seconds = self.ctx.config.recording.max_seconds;
            info!("recording: {id} reached the {max_seconds}s limit");
            self.ctx.publish(
                NAME,
                topics::RECORDING_LIMIT_REACHED,
                json!({ "id": id, "maxSeconds": max_seconds }),
            );
            let _ = self.finish(&id);
        }
    }

    /// Stop the active recording.
    pub fn stop(&mut self) -> Result<RecordingSummary, RecordingError> {
        let id = self.active.clone().ok_or(RecordingError::NotRecording)?;
        self.finish(&id)
    }

    fn finish(&mut self, id: &str) -> Result<RecordingSummary, RecordingError> {
        let rec = self
            .recordings
            .get_mut(id)
            .ok_or_else(|| RecordingError::NotFound(id.to_string()))?;
        rec.active = false;
        if self.active.as_deref() == Some(id) {
            self.active = None;
        }
        let summary = rec.summary();
        debug!("recording: {id} stopped after {:.2}s", summary.duration_secs);
        self.ctx.publish(
            NAME,
            topics::RECORDING_STOPPED,
            serde_json::to_value(&summary).unwrap_or(Value::Null),
        );
        Ok(summary)
    }

    /// Stop the active recording if it belongs to `session_id`.
    pub fn flush_session(&mut self, session_id: &str) -> Option<RecordingSummary> {
        let id = self.active.clone()?;
        let bound = self
            .recordings
            .get(&id)
            .is_some_and(|r| r.session_id.as_deref() == Some(session_id));
        if !bound {
            return None;
        }
        self.finish(&id).ok()
    }

    pub fn get(&self, id: &str) -> Result<&Recording, RecordingError> {
        self.recordings
            .get(id)
            .ok_or_else(|| RecordingError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<RecordingSummary> {
        self.recordings.values().map(Recording::summary).collect()
    }

    /// Run the enhancement chain on a finished recording.
    pub fn enhance(&mut self, id: &str, options: &EnhanceOptions) -> Result<EnhancedRecording, RecordingError> {
        let rec_cfg = self.ctx.config.recording.clone();
        let rec = self
            .recordings
            .get_mut(id)
            .ok_or_else(|| RecordingError::NotFound(id.to_string()))?;
        if rec.active {
            return Err(RecordingError::StillRecording(id.to_string()));
        }
        if rec.samples.is_empty() {
            return Err(RecordingError::Empty(id.to_string()));
        }

        let channels = rec.channels.max(1) as usize;
        let mut take: Vec<f32> = if options.trim_silence {
            SilenceTrimmer::new(rec_cfg.trim_threshold, rec.sample_rate, rec.channels)
                .trim(&rec.samples)
                .to_vec()
        } else {
            rec.samples.clone()
        };
        let trimmed_samples = rec.samples.len() - take.len();

        let mut gated_windows = 0;
        if let Some(gate_db) = options.noise_gate_db {
            let threshold = dsp::db_to_linear(gate_db);
            let window = (rec.sample_rate * GATE_WINDOW_MS / 1_000).max(1) as usize * channels;
            for chunk in take.chunks_mut(window) {
                if dsp::rms(chunk) < threshold {
                    chunk.iter_mut().for_each(|s| *s *= GATE_ATTENUATION);
                    gated_windows += 1;
                }
            }
        }

        let mut gain_db = 0.0;
        if let Some(target_db) = options.normalize_peak_db {
            let peak = dsp::peak(&take);
            if peak > 0.0 {
                gain_db = target_db - dsp::linear_to_db(peak);
                let gain = dsp::db_to_linear(gain_db);
                take.iter_mut().for_each(|s| *s *= gain);
            }
        }

        let fade_frames = (options.fade_ms.max(0.0) * rec.sample_rate as f32 / 1_000.0) as usize;
        let frames = take.len() / channels;
        let fade_frames = fade_frames.min(frames / 2);
        if fade_frames > 0 {
            for f in 0..fade_frames {
                let g = f as f32 / fade_frames as f32;
                for c in 0..channels {
                    take[f * channels + c] *= g;
                    take[(frames - 1 - f) * channels + c] *= g;
                }
            }
        }

        let validator = ClipValidator::new(rec_cfg.min_seconds, rec_cfg.max_seconds);
        let warnings = match validator.validate(&take, rec.sample_rate, rec.channels) {
            Ok(()) => Vec::new(),
            Err(e) => vec![e.to_string()],
        };

        let result = EnhancedRecording {
            id: id.to_string(),
            duration_secs: frames as f32 / rec.sample_rate.max(1) as f32,
            trimmed_samples,
            gated_windows,
            gain_db,
            warnings,
        };
        rec.enhanced = Some(take);
        info!(
            "recording: {id} enhanced (trimmed {trimmed_samples} samples, gain {gain_db:+.1} dB)"
        );
        self.ctx.publish(
            NAME,
            topics::RECORDING_ENHANCED,
            serde_json::to_value(&result).unwrap_or(Value::Null),
        );
        Ok(result)
    }

    /// Default enhancement options derived from configuration.
    pub fn default_options(&self) -> EnhanceOptions {
        EnhanceOptions {
            normalize_peak_db: Some(self.ctx.config.recording.normalize_peak_db),
            ..EnhanceOptions::default()
        }
    }
}

#[async_trait]
impl AudioModule for RecordingEnhancer {
    fn name(&self) -> ModuleName {
        NAME
    }

    async fn initialize(&mut self) -> Result<(), ModuleError> {
        self.initialized = true;
        Ok(())
    }

    /// Stops the active recording; finished recordings are kept.
    fn reset(&mut self) {
        if let Some(id) = self.active.take() {
            if let Some(rec) = self.recordings.get_mut(&id) {
                rec.active = false;
            }
        }
        self.initialized = false;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn describe(&self) -> Value {
        json!({
            "active": self.active,
            "recordings": self.recordings.len(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineConfig, RecordingConfig};
    use crate::modules::{test_context, test_context_with};

    #[test]
    fn ids_are_prefixed_and_distinct() {
        let mut enh = RecordingEnhancer::new(test_context());
        let a = enh.start(None, 48_000, 1).unwrap();
        enh.stop().unwrap();
        let b = enh.start(None, 48_000, 1).unwrap();
        assert!(a.starts_with("rec-"));
        assert_ne!(a, b);
    }

    #[test]
    fn only_one_active_recording() {
        let mut enh = RecordingEnhancer::new(test_context());
        let id = enh.start(None, 48_000, 1).unwrap();
        assert_eq!(
            enh.start(None, 48_000, 1).unwrap_err(),
            RecordingError::AlreadyRecording(id)
        );
    }

    #[test]
    fn stop_without_recording_fails() {
        let mut enh = RecordingEnhancer::new(test_context());
        assert_eq!(enh.stop().unwrap_err(), RecordingError::NotRecording);
    }

    #[test]
    fn limit_stops_the_recording() {
        let ctx = test_context_with(PipelineConfig {
            recording: RecordingConfig {
                max_seconds: 0.01,
                ..RecordingConfig::default()
            },
            ..PipelineConfig::default()
        });
        let mut enh = RecordingEnhancer::new(ctx);
        let id = enh.start(None, 48_000, 1).unwrap();
        enh.append(&[0.1; 300]);
        assert!(enh.is_recording());
        enh.append(&[0.1; 300]);
        assert!(!enh.is_recording());
        let rec = enh.get(&id).unwrap();
        assert_eq!(rec.samples().len(), 480);
        assert!(rec.summary().limit_reached);
    }

    #[test]
    fn flush_session_only_stops_matching_session() {
        let mut enh = RecordingEnhancer::new(test_context());
        enh.start(Some("hm-session-a"), 48_000, 1).unwrap();
        assert!(enh.flush_session("hm-session-b").is_none());
        assert!(enh.is_recording());
        assert!(enh.flush_session("hm-session-a").is_some());
        assert!(!enh.is_recording());
    }

    #[test]
    fn enhance_trims_normalizes_and_fades() {
        let mut enh = RecordingEnhancer::new(test_context());
        let id = enh.start(None, 48_000, 1).unwrap();
        enh.append(&vec![0.0; 4_800]);
        let call: Vec<f32> = (0..24_000).map(|i| 0.25 * (i as f32 * 0.05).sin()).collect();
        enh.append(&call);
        enh.append(&vec![0.0; 4_800]);

        assert!(matches!(
            enh.enhance(&id, &EnhanceOptions::default()),
            Err(RecordingError::StillRecording(_))
        ));
        enh.stop().unwrap();

        let result = enh.enhance(&id, &enh.default_options()).unwrap();
        assert!(result.trimmed_samples >= 8_000, "{result:?}");
        assert!((result.gain_db - (-1.0 - dsp::linear_to_db(0.25))).abs() < 0.1);

        let take = enh.get(&id).unwrap().best_take().to_vec();
        assert!((dsp::peak(&take) - dsp::db_to_linear(-1.0)).abs() < 0.01);
        assert_eq!(take[0], 0.0);
        assert!(enh.get(&id).unwrap().summary().enhanced);
    }

    #[test]
    fn enhancing_empty_recording_fails() {
        let mut enh = RecordingEnhancer::new(test_context());
        let id = enh.start(None, 48_000, 1).unwrap();
        enh.stop().unwrap();
        assert_eq!(
            enh.enhance(&id, &EnhanceOptions::default()).unwrap_err(),
            RecordingError::Empty(id)
        );
    }
}
