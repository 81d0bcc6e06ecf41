//! Pipeline settings structs, defaults, override merging and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files, merged from JSON
//! overrides, and shared across threads behind an `Arc`.
//!
//! Keys use camelCase on the wire (`sampleRate`, `frameSize`, …).  Keys the
//! crate does not know about are kept verbatim in [`PipelineConfig::extra`]
//! so newer callers can pass options through older builds.  Unknown keys
//! inside a known section land there under a dotted name, so
//! `{"gain": {"foo": 1}}` is kept as `extra["gain.foo"]`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::AppPaths;
use crate::audio::queue::BackpressurePolicy;
use crate::pipeline::stages::StageKind;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Reasons a merged configuration is rejected.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    /// Overrides must be a JSON object.
    #[error("configuration overrides must be an object, got {0}")]
    NotAnObject(String),

    /// A value could not be deserialized into its field type.
    #[error("malformed configuration: {0}")]
    Malformed(String),

    /// A value deserialized but is outside its allowed range.
    #[error("invalid configuration value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// EventConfig
// ---------------------------------------------------------------------------

/// Event bus rate limiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventConfig {
    /// Sustained events per second allowed on each topic.
    pub rate_per_sec: f64,
    /// Token-bucket burst size per topic.
    pub burst: u32,
    /// Topics that bypass rate limiting (fault and session signalling).
    pub unlimited_topics: Vec<String>,
}

impl Default for EventConfig {
    fn default() -> Self {
        use crate::events::topics;
        Self {
            rate_per_sec: 100.0,
            burst: 50,
            unlimited_topics: [
                topics::ENGINE_ERROR,
                topics::CAPTURE_ERROR,
                topics::MODULE_FAILED,
                topics::MODULE_RECOVERED,
                topics::SESSION_STARTED,
                topics::SESSION_STOPPED,
                topics::SESSION_ERROR,
            ]
            .iter()
            .map(|t| t.to_string())
            .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Signal-processing engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Offer every processed frame to the engine for analysis.
    pub analysis_enabled: bool,
    /// Capacity of the queue between the frame loop and the engine worker.
    pub queue_capacity: usize,
    /// What to discard when the engine queue is full.
    pub backpressure: BackpressurePolicy,
    /// Switch to the built-in engine when the primary engine fails to load.
    pub allow_fallback: bool,
    /// Upper bound for a single engine call; longer calls are reported.
    pub call_budget_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            analysis_enabled: true,
            queue_capacity: 8,
            backpressure: BackpressurePolicy::DropOldest,
            allow_fallback: true,
            call_budget_ms: 20,
        }
    }
}

// ---------------------------------------------------------------------------
// CaptureConfig
// ---------------------------------------------------------------------------

/// Which capture backend the capture graph tries first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapturePreference {
    /// Default input device via cpal; falls back to scripted when missing.
    Device,
    /// Frames are pushed by the caller through `CaptureInput`.
    Scripted,
}

impl Default for CapturePreference {
    fn default() -> Self {
        Self::Device
    }
}

/// Capture graph settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureConfig {
    /// Preferred backend.
    pub preference: CapturePreference,
    /// Input device name; `None` picks the system default.
    pub device: Option<String>,
    /// Number of assembled frames buffered between capture and pipeline.
    pub queue_frames: usize,
    /// Policy applied when the frame queue is full.
    pub backpressure: BackpressurePolicy,
    /// Sample rate of the monitoring / playback output path.
    pub monitor_sample_rate: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            preference: CapturePreference::default(),
            device: None,
            queue_frames: 16,
            backpressure: BackpressurePolicy::DropOldest,
            monitor_sample_rate: 48_000,
        }
    }
}

// ---------------------------------------------------------------------------
// PerformanceConfig
// ---------------------------------------------------------------------------

/// Timing budget and mitigation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceConfig {
    /// Fraction of a frame's real-time duration the pipeline may spend on it.
    pub budget_ratio: f64,
    /// Number of frames averaged per evaluation.
    pub window_frames: usize,
    /// Evaluate (and publish) once every N frames.
    pub evaluate_every: usize,
    /// Stages that may be bypassed, in bypass order.
    pub bypass_priority: Vec<StageKind>,
    /// Frame size is never reduced below this.
    pub min_frame_size: usize,
    /// Monitoring sample rate is never reduced below this.
    pub min_monitor_sample_rate: u32,
    /// A sample counts as calm when `value <= threshold * hysteresis_ratio`.
    pub hysteresis_ratio: f64,
    /// Consecutive calm samples needed before one mitigation is reverted.
    pub recovery_samples: u32,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            budget_ratio: 0.5,
            window_frames: 8,
            evaluate_every: 4,
            bypass_priority: vec![StageKind::Quality, StageKind::Noise],
            min_frame_size: 1_024,
            min_monitor_sample_rate: 16_000,
            hysteresis_ratio: 0.7,
            recovery_samples: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// RecoveryConfig
// ---------------------------------------------------------------------------

/// Critical-fault recovery policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecoveryConfig {
    /// Reinitialization attempts before a module is declared failed.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles on every further attempt.
    pub backoff_ms: u64,
    /// Upper bound on how long `stop_processing` waits for queued work.
    pub flush_timeout_ms: u64,
    /// Bypass a stage while it is reported degraded.
    pub bypass_degraded_stages: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 100,
            flush_timeout_ms: 500,
            bypass_degraded_stages: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Stage configs
// ---------------------------------------------------------------------------

/// Level meter ballistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LevelConfig {
    pub rms_attack_ms: f32,
    pub rms_release_ms: f32,
    pub peak_attack_ms: f32,
    pub peak_release_ms: f32,
    /// Lowest reported level (silence).
    pub db_floor: f32,
    /// Highest reported level.
    pub db_ceiling: f32,
    /// Minimum interval between `level-updated` events.
    pub update_interval_ms: f32,
    /// Number of readings kept for history queries.
    pub history_size: usize,
    /// Linear peak at or above which a frame is flagged as clipped.
    pub clip_threshold: f32,
}

impl Default for LevelConfig {
    fn default() -> Self {
        Self {
            rms_attack_ms: 10.0,
            rms_release_ms: 100.0,
            peak_attack_ms: 1.0,
            peak_release_ms: 300.0,
            db_floor: -60.0,
            db_ceiling: 6.0,
            update_interval_ms: 50.0,
            history_size: 100,
            clip_threshold: 0.99,
        }
    }
}

/// Noise floor tracking and voice activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NoiseConfig {
    pub initial_floor_db: f32,
    /// Fraction of the gap closed per frame when the level is above the floor.
    pub rise_rate: f32,
    /// Frame must exceed the floor by this much to count as voice.
    pub vad_margin_db: f32,
    /// Absolute level below which a frame is never voice.
    pub min_voice_db: f32,
    /// Frames voice activity is held after the signal drops.
    pub hangover_frames: u32,
    /// Floor movement that triggers a `noise-floor-updated` event.
    pub floor_change_event_db: f32,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            initial_floor_db: -60.0,
            rise_rate: 0.01,
            vad_margin_db: 6.0,
            min_voice_db: -50.0,
            hangover_frames: 3,
            floor_change_event_db: 3.0,
        }
    }
}

/// Automatic gain control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GainConfig {
    pub enabled: bool,
    pub target_db: f32,
    pub max_gain_db: f32,
    pub min_gain_db: f32,
    /// Smoothing coefficient when gain goes down (0–1, higher is faster).
    pub attack: f32,
    /// Smoothing coefficient when gain goes up.
    pub release: f32,
    /// Frames within this distance of the noise floor are not boosted.
    pub gate_margin_db: f32,
    /// Output samples are limited to this magnitude.
    pub limiter_ceiling: f32,
    /// Gain movement that triggers a `gain-changed` event.
    pub change_event_db: f32,
}

impl Default for GainConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_db: -18.0,
            max_gain_db: 20.0,
            min_gain_db: -20.0,
            attack: 0.5,
            release: 0.1,
            gate_margin_db: 3.0,
            limiter_ceiling: 0.99,
            change_event_db: 1.0,
        }
    }
}

/// Per-frame quality scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QualityConfig {
    /// Scores below this count towards degradation.
    pub degraded_threshold: f32,
    /// Consecutive low frames before `quality-degraded` is published.
    pub degraded_frames: u32,
    /// Linear magnitude above which a sample counts as clipped.
    pub clipping_threshold: f32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            degraded_threshold: 0.5,
            degraded_frames: 3,
            clipping_threshold: 0.99,
        }
    }
}

/// Session recording limits and enhancement defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordingConfig {
    pub max_seconds: f32,
    pub min_seconds: f32,
    /// RMS threshold used for silence trimming.
    pub trim_threshold: f32,
    /// Peak level enhancement normalizes to.
    pub normalize_peak_db: f32,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            max_seconds: 300.0,
            min_seconds: 0.25,
            trim_threshold: 0.01,
            normalize_peak_db: -1.0,
        }
    }
}

/// Master call library.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LibraryConfig {
    /// Directory of `.wav` master calls; `None` uses an in-memory catalog.
    pub directory: Option<std::path::PathBuf>,
}

// ---------------------------------------------------------------------------
// PipelineConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level orchestrator configuration.
///
/// Build it from defaults plus caller overrides with
/// [`PipelineConfig::merged`]:
///
/// ```rust
/// use huntmaster_pipeline::config::PipelineConfig;
///
/// let cfg = PipelineConfig::merged(Some(serde_json::json!({
///     "sampleRate": 44100,
///     "customOption": true
/// })))
/// .unwrap();
/// assert_eq!(cfg.sample_rate, 44_100);
/// assert_eq!(cfg.frame_size, 4_096);
/// assert_eq!(cfg.extra["customOption"], serde_json::json!(true));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    /// Capture sample rate in Hz.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
    /// Samples per channel in one frame.  `bufferSize` is accepted as alias.
    pub frame_size: usize,
    /// Stage order of the processing pipeline.
    pub stage_order: Vec<StageKind>,
    /// Let the noise detector drop frames without voice activity.
    pub drop_silent_frames: bool,
    pub events: EventConfig,
    pub engine: EngineConfig,
    pub capture: CaptureConfig,
    pub performance: PerformanceConfig,
    pub recovery: RecoveryConfig,
    pub levels: LevelConfig,
    pub noise: NoiseConfig,
    pub gain: GainConfig,
    pub quality: QualityConfig,
    pub recording: RecordingConfig,
    pub library: LibraryConfig,
    /// Unrecognized keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 1,
            frame_size: 4_096,
            stage_order: StageKind::DEFAULT_ORDER.to_vec(),
            drop_silent_frames: false,
            events: EventConfig::default(),
            engine: EngineConfig::default(),
            capture: CaptureConfig::default(),
            performance: PerformanceConfig::default(),
            recovery: RecoveryConfig::default(),
            levels: LevelConfig::default(),
            noise: NoiseConfig::default(),
            gain: GainConfig::default(),
            quality: QualityConfig::default(),
            recording: RecordingConfig::default(),
            library: LibraryConfig::default(),
            extra: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    /// Merge `overrides` (a JSON object) on top of the defaults and validate.
    ///
    /// Nested objects merge key by key, so `{"gain": {"targetDb": -20}}`
    /// keeps every other gain default.
    pub fn merged(overrides: Option<Value>) -> Result<Self, ConfigError> {
        let mut base =
            serde_json::to_value(Self::default()).map_err(|e| ConfigError::Malformed(e.to_string()))?;

        if let Some(overrides) = overrides {
            let Value::Object(mut map) = overrides else {
                return Err(ConfigError::NotAnObject(json_kind(&overrides).into()));
            };
            if !map.contains_key("frameSize") {
                if let Some(size) = map.remove("bufferSize") {
                    map.insert("frameSize".into(), size);
                }
            }
            if let Value::Object(target) = &mut base {
                hoist_unknown_section_keys(target, &mut map);
                deep_merge(target, map);
            }
        }

        let config: Self =
            serde_json::from_value(base).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no module can work with.  Nothing is clamped here.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(8_000..=192_000).contains(&self.sample_rate) {
            return Err(invalid(
                "sampleRate",
                format!("{} Hz is outside 8000..=192000", self.sample_rate),
            ));
        }
        if self.channels == 0 || self.channels > 8 {
            return Err(invalid("channels", format!("{} is outside 1..=8", self.channels)));
        }
        if self.frame_size == 0 {
            return Err(invalid("frameSize", "must be positive"));
        }
        if self.frame_size > 65_536 {
            return Err(invalid("frameSize", format!("{} exceeds 65536", self.frame_size)));
        }
        if self.stage_order.is_empty() {
            return Err(invalid("stageOrder", "pipeline needs at least one stage"));
        }
        for (i, stage) in self.stage_order.iter().enumerate() {
            if self.stage_order[..i].contains(stage) {
                return Err(invalid("stageOrder", format!("stage `{stage}` listed twice")));
            }
        }
        if self.engine.queue_capacity == 0 {
            return Err(invalid("engine.queueCapacity", "must be positive"));
        }
        if self.capture.queue_frames == 0 {
            return Err(invalid("capture.queueFrames", "must be positive"));
        }
        if self.capture.monitor_sample_rate == 0 {
            return Err(invalid("capture.monitorSampleRate", "must be positive"));
        }
        if self.events.rate_per_sec <= 0.0 || self.events.burst == 0 {
            return Err(invalid("events", "rate and burst must be positive"));
        }
        if self.performance.budget_ratio <= 0.0 {
            return Err(invalid("performance.budgetRatio", "must be positive"));
        }
        if self.performance.window_frames == 0 || self.performance.evaluate_every == 0 {
            return Err(invalid("performance", "window and evaluation interval must be positive"));
        }
        if !(0.0..=1.0).contains(&self.performance.hysteresis_ratio) {
            return Err(invalid("performance.hysteresisRatio", "must be within 0..=1"));
        }
        if self.performance.min_frame_size == 0 {
            return Err(invalid("performance.minFrameSize", "must be positive"));
        }
        if self.recovery.max_attempts == 0 {
            return Err(invalid("recovery.maxAttempts", "must be at least 1"));
        }
        if self.levels.history_size == 0 {
            return Err(invalid("levels.historySize", "must be positive"));
        }
        if self.levels.db_floor >= self.levels.db_ceiling {
            return Err(invalid("levels", "dbFloor must be below dbCeiling"));
        }
        if self.gain.min_gain_db > self.gain.max_gain_db {
            return Err(invalid("gain", "minGainDb must not exceed maxGainDb"));
        }
        if self.recording.max_seconds <= 0.0 {
            return Err(invalid("recording.maxSeconds", "must be positive"));
        }
        Ok(())
    }

    /// Real-time duration of one frame in milliseconds.
    pub fn frame_duration_ms(&self) -> f64 {
        self.frame_size as f64 * 1_000.0 / self.sample_rate as f64
    }

    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(PipelineConfig::default())` when the file does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to an explicit path, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

fn deep_merge(target: &mut Map<String, Value>, overrides: Map<String, Value>) {
    for (key, value) in overrides {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(nested)) => deep_merge(existing, nested),
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

/// Move keys a known section does not define up to the top level as
/// `section.key`, where they deserialize into `extra`.
fn hoist_unknown_section_keys(defaults: &Map<String, Value>, overrides: &mut Map<String, Value>) {
    let mut hoisted = Vec::new();
    for (section, value) in overrides.iter_mut() {
        let (Some(Value::Object(known)), Value::Object(nested)) = (defaults.get(section), value) else {
            continue;
        };
        let unknown: Vec<String> = nested.keys().filter(|k| !known.contains_key(*k)).cloned().collect();
        for key in unknown {
            if let Some(v) = nested.remove(&key) {
                hoisted.push((format!("{section}.{key}"), v));
            }
        }
    }
    overrides.extend(hoisted);
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.sample_rate, 48_000);
        assert_eq!(cfg.channels, 1);
        assert_eq!(cfg.frame_size, 4_096);
        assert_eq!(cfg.stage_order, StageKind::DEFAULT_ORDER.to_vec());
        assert_eq!(cfg.recovery.max_attempts, 3);
        assert_eq!(cfg.engine.backpressure, BackpressurePolicy::DropOldest);
        assert!(cfg.extra.is_empty());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn merge_is_non_destructive_and_keeps_unknown_keys() {
        let cfg = PipelineConfig::merged(Some(json!({
            "sampleRate": 44100,
            "customOption": true
        })))
        .unwrap();

        assert_eq!(cfg.sample_rate, 44_100);
        assert_eq!(cfg.extra.get("customOption"), Some(&json!(true)));
        assert_eq!(cfg.channels, 1);
        assert_eq!(cfg.frame_size, 4_096);
        assert_eq!(cfg.gain, GainConfig::default());
    }

    #[test]
    fn nested_overrides_merge_key_by_key() {
        let cfg = PipelineConfig::merged(Some(json!({
            "gain": { "targetDb": -20.0 },
            "recovery": { "maxAttempts": 5 }
        })))
        .unwrap();
        assert_eq!(cfg.gain.target_db, -20.0);
        assert_eq!(cfg.gain.max_gain_db, GainConfig::default().max_gain_db);
        assert_eq!(cfg.recovery.max_attempts, 5);
        assert_eq!(cfg.recovery.backoff_ms, RecoveryConfig::default().backoff_ms);
    }

    #[test]
    fn unknown_keys_inside_sections_are_kept_with_dotted_names() {
        let cfg = PipelineConfig::merged(Some(json!({
            "gain": { "targetDb": -20.0, "foo": 1 },
            "capture": { "preference": "scripted", "latencyHint": "low" }
        })))
        .unwrap();
        assert_eq!(cfg.gain.target_db, -20.0);
        assert_eq!(cfg.extra.get("gain.foo"), Some(&json!(1)));
        assert_eq!(cfg.extra.get("capture.latencyHint"), Some(&json!("low")));
        assert_eq!(cfg.extra.len(), 2);
    }

    #[test]
    fn buffer_size_is_an_alias_for_frame_size() {
        let cfg = PipelineConfig::merged(Some(json!({ "bufferSize": 2048 }))).unwrap();
        assert_eq!(cfg.frame_size, 2_048);
        assert!(!cfg.extra.contains_key("bufferSize"));
    }

    #[test]
    fn zero_frame_size_is_rejected() {
        let err = PipelineConfig::merged(Some(json!({ "frameSize": 0 }))).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "frameSize", .. }), "{err}");
    }

    #[test]
    fn negative_frame_size_is_rejected() {
        let err = PipelineConfig::merged(Some(json!({ "frameSize": -4 }))).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed(_)), "{err}");
    }

    #[test]
    fn non_object_overrides_are_rejected() {
        let err = PipelineConfig::merged(Some(json!([1, 2]))).unwrap_err();
        assert_eq!(err, ConfigError::NotAnObject("array".into()));
    }

    #[test]
    fn duplicate_stage_is_rejected() {
        let err =
            PipelineConfig::merged(Some(json!({ "stageOrder": ["level", "gain", "level"] })))
                .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "stageOrder", .. }));
    }

    #[test]
    fn custom_stage_order_is_kept() {
        let cfg =
            PipelineConfig::merged(Some(json!({ "stageOrder": ["gain", "level"] }))).unwrap();
        assert_eq!(cfg.stage_order, vec![StageKind::Gain, StageKind::Level]);
    }

    #[test]
    fn frame_duration_for_defaults() {
        let cfg = PipelineConfig::default();
        assert!((cfg.frame_duration_ms() - 85.333).abs() < 0.01);
    }

    #[test]
    fn toml_round_trip_preserves_values() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");

        let mut cfg = PipelineConfig::merged(Some(json!({ "hunterProfile": "elk" }))).unwrap();
        cfg.sample_rate = 44_100;
        cfg.capture.preference = CapturePreference::Scripted;
        cfg.save_to(&path).expect("save");

        let loaded = PipelineConfig::load_from(&path).expect("load");
        assert_eq!(loaded.sample_rate, 44_100);
        assert_eq!(loaded.capture.preference, CapturePreference::Scripted);
        assert_eq!(loaded.stage_order, cfg.stage_order);
        assert_eq!(loaded.extra.get("hunterProfile"), Some(&json!("elk")));
    }

    #[test]
    fn load_missing_returns_default() {
        let dir = tempdir().expect("temp dir");
        let cfg = PipelineConfig::load_from(&dir.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, PipelineConfig::default());
    }
}
