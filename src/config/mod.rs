//! Configuration for the Huntmaster pipeline.
//!
//! Provides `PipelineConfig` (top-level settings), sub-configs for each
//! module, `AppPaths` for cross-platform directories, JSON override merging
//! via `PipelineConfig::merged` and TOML persistence via
//! `PipelineConfig::load` / `PipelineConfig::save_to`.

pub mod paths;
pub mod settings;

pub use paths::AppPaths;
pub use settings::{
    CaptureConfig, CapturePreference, ConfigError, EngineConfig, EventConfig, GainConfig,
    LevelConfig, LibraryConfig, NoiseConfig, PerformanceConfig, PipelineConfig, QualityConfig,
    RecordingConfig, RecoveryConfig,
};
