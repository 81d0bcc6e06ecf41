//! Errors surfaced by the orchestrator.
//!
//! Leaf errors convert into [`OrchestratorError`] with `?`; faults raised by
//! modules while running are normalized into a
//! [`ModuleErrorReport`](super::recovery::ModuleErrorReport) instead and go
//! through recovery.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::audio::{CaptureError, FrameError};
use crate::config::ConfigError;
use crate::modules::{
    ConversionError, LibraryError, ModuleError, ModuleName, RecordingError, UnknownModule,
};

/// Initialization steps that can fail.  Pipeline assembly, capture framing
/// and event subscription run afterwards and are infallible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitStep {
    AcquireCapture,
    InitializeModules,
}

impl fmt::Display for InitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AcquireCapture => "acquire capture",
            Self::InitializeModules => "initialize modules",
        })
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A module could not be constructed.
    #[error("construction failed: {0}")]
    Construction(String),

    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigError),

    #[error("initialization failed during {step}{}: {reason}", .module.map(|m| format!(" ({m})")).unwrap_or_default())]
    Initialization {
        step: InitStep,
        module: Option<ModuleName>,
        reason: String,
    },

    #[error("`{operation}` is not allowed while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("orchestrator has been cleaned up")]
    CleanedUp,

    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] FrameError),

    #[error(transparent)]
    UnknownModule(#[from] UnknownModule),

    #[error("recovery of {module} gave up after {attempts} attempts: {reason}")]
    RecoveryExhausted {
        module: ModuleName,
        attempts: u32,
        reason: String,
    },

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error("capture: {0}")]
    Capture(#[from] CaptureError),

    #[error("library: {0}")]
    Library(#[from] LibraryError),

    #[error("recording: {0}")]
    Recording(#[from] RecordingError),

    #[error("conversion: {0}")]
    Conversion(#[from] ConversionError),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialization_error_names_step_and_module() {
        let err = OrchestratorError::Initialization {
            step: InitStep::InitializeModules,
            module: Some(ModuleName::CallLibraryManager),
            reason: "storage offline".into(),
        };
        assert_eq!(
            err.to_string(),
            "initialization failed during initialize modules (call_library_manager): storage offline"
        );

        let err = OrchestratorError::Initialization {
            step: InitStep::AcquireCapture,
            module: None,
            reason: "no input device".into(),
        };
        assert_eq!(err.to_string(), "initialization failed during acquire capture: no input device");
    }

    #[test]
    fn leaf_errors_convert() {
        let err: OrchestratorError = FrameError::Empty.into();
        assert!(matches!(err, OrchestratorError::InvalidFrame(FrameError::Empty)));
        let err: OrchestratorError = UnknownModule("x".into()).into();
        assert_eq!(err.to_string(), "unknown module `x`");
    }
}
