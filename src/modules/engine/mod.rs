//! Analysis engine boundary and its manager.
//!
//! # Overview
//!
//! [`AnalysisEngine`] is the interface to the signal-processing engine.  It
//! is object-safe and `Send + Sync` so it can be held behind a
//! `Box<dyn AnalysisEngine>` and driven from the engine worker thread.
//!
//! [`BuiltinEngine`] is a pure-Rust implementation (level, zero-crossing
//! rate, autocorrelation pitch, similarity to a loaded master call).  The
//! [`EngineManager`] falls back to it when a supplied engine fails to load.
//!
//! `MockEngine` (available under `#[cfg(test)]`) returns canned results or
//! errors so the manager and orchestrator can be tested without a real
//! engine.

use serde::Serialize;
use thiserror::Error;

pub mod builtin;
pub mod manager;
#[cfg(test)]
pub mod mock;

pub use builtin::BuiltinEngine;
pub use manager::EngineManager;
#[cfg(test)]
pub use mock::MockEngine;

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// The engine could not be brought up.
    #[error("engine failed to load: {0}")]
    LoadFailed(String),

    /// `analyze` was called before a successful `load`.
    #[error("engine is not loaded")]
    NotLoaded,

    /// The engine reported an unrecoverable internal fault.
    #[error("engine crashed: {0}")]
    Crashed(String),

    /// The engine rejected the samples it was given.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The analysis could not be completed this time.
    #[error("analysis failed: {0}")]
    Analysis(String),
}

impl EngineError {
    /// Stable code carried in `engine-error` payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::LoadFailed(_) => "ENGINE_LOAD_FAILED",
            Self::NotLoaded => "ENGINE_NOT_LOADED",
            Self::Crashed(_) => "ENGINE_CRASHED",
            Self::InvalidInput(_) => "ENGINE_INVALID_INPUT",
            Self::Analysis(_) => "ENGINE_ANALYSIS_FAILED",
        }
    }

    /// Critical errors require the engine to be reinitialized.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::LoadFailed(_) | Self::NotLoaded | Self::Crashed(_))
    }
}

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// What the loaded engine can do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineFeatures {
    pub pitch: bool,
    pub similarity: bool,
    pub multichannel: bool,
}

/// Session scope passed along with every analysis call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub session_id: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// A master call handed to the engine as comparison reference.
#[derive(Debug, Clone)]
pub struct ReferenceCall {
    pub call_id: String,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineAnalysis {
    pub session_id: String,
    pub sequence: u64,
    pub rms_db: f32,
    pub zero_crossing_rate: f32,
    /// Fundamental estimate, `None` when the frame is unvoiced.
    pub pitch_hz: Option<f32>,
    /// Similarity to the loaded reference in `0.0..=1.0`.
    pub similarity: Option<f32>,
}

// ---------------------------------------------------------------------------
// AnalysisEngine
// ---------------------------------------------------------------------------

/// Object-safe, thread-safe interface for analysis engines.
///
/// # Contract
///
/// - `load` is called once before any other method and again after every
///   reinitialization.  It may block; the manager runs it on the blocking
///   pool.
/// - `analyze` receives interleaved samples described by `session`.
/// - `end_session` discards per-session state.
pub trait AnalysisEngine: Send + Sync {
    fn name(&self) -> &str;

    fn load(&mut self) -> Result<EngineFeatures, EngineError>;

    fn analyze(
        &mut self,
        samples: &[f32],
        session: &SessionContext,
        sequence: u64,
    ) -> Result<EngineAnalysis, EngineError>;

    /// Use `reference` for similarity scoring.  Engines without similarity
    /// support ignore it.
    fn load_reference(&mut self, _reference: &ReferenceCall) -> Result<(), EngineError> {
        Ok(())
    }

    fn end_session(&mut self, session_id: &str);
}

// Compile-time assertion: Box<dyn AnalysisEngine> must be constructible.
const _: fn() = || {
    fn _assert_object_safe(_: Box<dyn AnalysisEngine>) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_errors_are_lifecycle_errors() {
        assert!(EngineError::Crashed("segfault".into()).is_critical());
        assert!(EngineError::NotLoaded.is_critical());
        assert!(EngineError::LoadFailed("x".into()).is_critical());
        assert!(!EngineError::Analysis("x".into()).is_critical());
        assert!(!EngineError::InvalidInput("x".into()).is_critical());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(EngineError::Crashed(String::new()).code(), "ENGINE_CRASHED");
        assert_eq!(EngineError::NotLoaded.code(), "ENGINE_NOT_LOADED");
    }

    #[test]
    fn box_dyn_engine_compiles() {
        let engine: Box<dyn AnalysisEngine> = Box::new(BuiltinEngine::new());
        assert_eq!(engine.name(), "builtin");
    }
}
