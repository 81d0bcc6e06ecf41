//! The eleven modules composed by the orchestrator.
//!
//! Every module implements [`AudioModule`] (lifecycle + status).  The four
//! per-frame stages additionally implement [`FrameStage`].  Modules talk to
//! each other only through the [`EventBus`] handed to them in a
//! [`ModuleContext`].
//!
//! | Name | Type | Role |
//! |------|------|------|
//! | `event_manager` | [`EventManager`] | bus wrapper and statistics |
//! | `engine_manager` | [`EngineManager`] | analysis engine lifecycle, worker queue |
//! | `level_monitor` | [`LevelMonitor`] | RMS / peak metering |
//! | `noise_detector` | [`NoiseDetector`] | noise floor, voice activity |
//! | `gain_controller` | [`GainController`] | automatic gain, limiter |
//! | `quality_assessor` | [`QualityAssessor`] | per-frame quality score |
//! | `performance_monitor` | [`PerformanceMonitor`] | timing budget |
//! | `call_library_manager` | [`CallLibraryManager`] | master call catalog |
//! | `recording_enhancer` | [`RecordingEnhancer`] | session recordings |
//! | `format_converter` | [`FormatConverter`] | encode / decode / convert |
//! | `capture_graph_manager` | [`CaptureGraphManager`] | capture and playback I/O |

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::audio::Frame;
use crate::config::PipelineConfig;
use crate::events::{EventBus, PublishOutcome};

pub mod capture;
pub mod converter;
pub mod engine;
pub mod enhancer;
pub mod event_manager;
pub mod gain;
pub mod level;
pub mod library;
pub mod noise;
pub mod performance;
pub mod quality;
pub mod registry;

pub use capture::{CaptureGraphManager, CaptureInput, CaptureMode};
pub use converter::{
    AudioFormat, ConversionError, ConversionRequest, DecodedAudio, EncodedAudio, FormatConverter, FormatInfo,
};
pub use engine::{AnalysisEngine, BuiltinEngine, EngineAnalysis, EngineError, EngineManager};
pub use enhancer::{
    EnhanceOptions, EnhancedRecording, Recording, RecordingEnhancer, RecordingError, RecordingSummary,
};
pub use event_manager::EventManager;
pub use gain::GainController;
pub use level::LevelMonitor;
pub use library::{
    CallInfo, CallLibraryManager, CallSource, InMemoryCallSource, LibraryError, MasterCall, WavDirectorySource,
};
pub use noise::NoiseDetector;
pub use performance::{PerformanceMonitor, PerformanceReport};
pub use quality::QualityAssessor;
pub use registry::ModuleRegistry;

// ---------------------------------------------------------------------------
// ModuleName
// ---------------------------------------------------------------------------

/// Canonical identifier of each module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleName {
    EventManager,
    EngineManager,
    LevelMonitor,
    NoiseDetector,
    GainController,
    QualityAssessor,
    PerformanceMonitor,
    CallLibraryManager,
    RecordingEnhancer,
    FormatConverter,
    CaptureGraphManager,
}

impl ModuleName {
    /// All modules in initialization order.
    pub const ALL: [ModuleName; 11] = [
        ModuleName::EventManager,
        ModuleName::EngineManager,
        ModuleName::LevelMonitor,
        ModuleName::NoiseDetector,
        ModuleName::GainController,
        ModuleName::QualityAssessor,
        ModuleName::PerformanceMonitor,
        ModuleName::CallLibraryManager,
        ModuleName::RecordingEnhancer,
        ModuleName::FormatConverter,
        ModuleName::CaptureGraphManager,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::EventManager => "event_manager",
            Self::EngineManager => "engine_manager",
            Self::LevelMonitor => "level_monitor",
            Self::NoiseDetector => "noise_detector",
            Self::GainController => "gain_controller",
            Self::QualityAssessor => "quality_assessor",
            Self::PerformanceMonitor => "performance_monitor",
            Self::CallLibraryManager => "call_library_manager",
            Self::RecordingEnhancer => "recording_enhancer",
            Self::FormatConverter => "format_converter",
            Self::CaptureGraphManager => "capture_graph_manager",
        }
    }
}

impl fmt::Display for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown module `{0}`")]
pub struct UnknownModule(pub String);

impl FromStr for ModuleName {
    type Err = UnknownModule;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| UnknownModule(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// ModuleError
// ---------------------------------------------------------------------------

/// A fault raised by a module.
///
/// `critical` faults mean the module cannot continue without being
/// reinitialized; non-critical faults leave it usable in a degraded mode.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{module}: {message}")]
pub struct ModuleError {
    pub module: ModuleName,
    pub message: String,
    pub critical: bool,
}

impl ModuleError {
    pub fn degraded(module: ModuleName, message: impl Into<String>) -> Self {
        Self {
            module,
            message: message.into(),
            critical: false,
        }
    }

    pub fn critical(module: ModuleName, message: impl Into<String>) -> Self {
        Self {
            module,
            message: message.into(),
            critical: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Health & status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ModuleHealth {
    Healthy,
    Degraded(String),
    Failed(String),
}

impl ModuleHealth {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded(_) => "degraded",
            Self::Failed(_) => "failed",
        }
    }
}

/// Snapshot returned by `Orchestrator::module_states`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStatus {
    pub name: ModuleName,
    pub initialized: bool,
    pub health: ModuleHealth,
    /// Module-specific details.
    pub details: Value,
}

// ---------------------------------------------------------------------------
// ModuleContext
// ---------------------------------------------------------------------------

/// Shared handles injected into every module at construction.
#[derive(Clone)]
pub struct ModuleContext {
    pub bus: Arc<EventBus>,
    pub config: Arc<PipelineConfig>,
}

impl ModuleContext {
    pub fn new(bus: Arc<EventBus>, config: Arc<PipelineConfig>) -> Self {
        Self { bus, config }
    }

    /// Publish `payload` on `topic` as `source`.
    pub fn publish(&self, source: ModuleName, topic: &str, payload: Value) -> PublishOutcome {
        self.bus.publish(topic, Some(source), payload)
    }
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Lifecycle shared by every module.
#[async_trait]
pub trait AudioModule: Send {
    fn name(&self) -> ModuleName;

    /// Acquire resources.  Must be safe to call again after [`reset`](Self::reset).
    async fn initialize(&mut self) -> Result<(), ModuleError>;

    /// Release resources and return to the freshly constructed state.
    fn reset(&mut self);

    fn is_initialized(&self) -> bool;

    /// Module-specific status details.
    fn describe(&self) -> Value;
}

// Compile-time assertion: Box<dyn AudioModule> must be constructible.
const _: fn() = || {
    fn _assert_object_safe(_: Box<dyn AudioModule>) {}
};

/// Why a stage stopped a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// No voice activity and silent-frame dropping is enabled.
    Silence,
    /// A stage faulted while handling the frame.
    StageFault(ModuleName),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Continue,
    Drop(DropReason),
}

/// A per-frame processing step.
pub trait FrameStage: AudioModule {
    /// Annotate or transform `frame` in place.  The sample count is fixed.
    fn process(&mut self, frame: &mut Frame) -> Result<StageOutcome, ModuleError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) fn test_context() -> ModuleContext {
    test_context_with(PipelineConfig::default())
}

#[cfg(test)]
pub(crate) fn test_context_with(config: PipelineConfig) -> ModuleContext {
    let bus = Arc::new(EventBus::new(&config.events));
    ModuleContext::new(bus, Arc::new(config))
}
