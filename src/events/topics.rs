//! Topic names published on the bus.

/// Subscribes to every topic.
pub const WILDCARD: &str = "*";

// Stages
pub const LEVEL_UPDATED: &str = "level-updated";
pub const CLIPPING_DETECTED: &str = "clipping-detected";
pub const NOISE_FLOOR_UPDATED: &str = "noise-floor-updated";
pub const VOICE_ACTIVITY_CHANGED: &str = "voice-activity-changed";
pub const GAIN_CHANGED: &str = "gain-changed";
pub const QUALITY_DEGRADED: &str = "quality-degraded";
pub const QUALITY_RECOVERED: &str = "quality-recovered";

// Performance
pub const PERFORMANCE_THRESHOLD_BREACHED: &str = "performance-threshold-breached";
pub const PERFORMANCE_NOMINAL: &str = "performance-nominal";
pub const MITIGATION_APPLIED: &str = "mitigation-applied";
pub const MITIGATION_REVERTED: &str = "mitigation-reverted";

// Engine
pub const ENGINE_ANALYSIS: &str = "engine-analysis";
pub const ENGINE_ERROR: &str = "engine-error";
pub const ENGINE_FALLBACK: &str = "engine-fallback";
pub const ENGINE_BACKPRESSURE: &str = "engine-backpressure";

// Capture
pub const CAPTURE_ERROR: &str = "capture-error";
pub const CAPTURE_FALLBACK: &str = "capture-fallback";

// Module health
pub const MODULE_DEGRADED: &str = "module-degraded";
pub const MODULE_RECOVERED: &str = "module-recovered";
pub const MODULE_FAILED: &str = "module-failed";

// Session
pub const SESSION_STARTED: &str = "session-started";
pub const SESSION_STOPPED: &str = "session-stopped";
pub const SESSION_ERROR: &str = "session-error";

// Library / recordings
pub const MASTER_CALL_LOADED: &str = "master-call-loaded";
pub const MASTER_CALL_PLAYBACK: &str = "master-call-playback";
pub const RECORDING_STARTED: &str = "recording-started";
pub const RECORDING_STOPPED: &str = "recording-stopped";
pub const RECORDING_LIMIT_REACHED: &str = "recording-limit-reached";
pub const RECORDING_ENHANCED: &str = "recording-enhanced";

/// Raised by the orchestrator when a quality alert reaches it.
pub const PIPELINE_QUALITY_ALERT: &str = "pipeline-quality-alert";
