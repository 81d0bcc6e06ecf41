//! Pipeline orchestration for the Huntmaster capture/analysis engine.
//!
//! This module composes the eleven modules into one real-time pipeline and
//! owns the session state machine, fault recovery and performance
//! adaptation.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator::new(overrides)          ← merge config, construct modules
//!        │
//! Orchestrator::initialize().await      ← capture, module hooks, pipeline, events
//!        │
//! start_processing() ─► process_audio_frame / pump_capture ─► stop_processing()
//!        │                     │
//!        │                     ├─ stages (Arc snapshot, bypassable)
//!        │                     ├─ engine queue → engine-worker thread
//!        │                     └─ recording, performance timing
//!        │
//! service().await                       ← events, critical fault recovery
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use huntmaster_pipeline::pipeline::Orchestrator;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut orch = Orchestrator::new(Some(json!({
//!         "frameSize": 1024,
//!         "capture": { "preference": "scripted" },
//!     })))?;
//!     orch.initialize().await?;
//!
//!     let session = orch.start_processing()?;
//!     orch.capture_input().push_samples(&vec![0.0_f32; 4096]);
//!     for outcome in orch.pump_capture()? {
//!         println!("{session}: frame {} {:?}", outcome.sequence, outcome.status);
//!     }
//!     orch.service().await;
//!
//!     let summary = orch.stop_processing()?;
//!     println!("{summary:?}");
//!     orch.cleanup();
//!     Ok(())
//! }
//! ```

pub mod adaptation;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod stages;
pub mod state;

pub use adaptation::{AdaptationOutcome, Adapter, Mitigation, PerformanceSample};
pub use error::{InitStep, OrchestratorError};
pub use orchestrator::{Collaborators, EventDisposition, FrameOutcome, FrameStatus, Orchestrator};
pub use recovery::{HealthBook, ModuleErrorReport, RecoveryAction, RecoveryPolicy};
pub use stages::{BypassReason, Pipeline, StageKind};
pub use state::{
    LifecycleState, Session, SessionState, SessionSummary, StopSummary, SystemState,
    SESSION_ID_PREFIX,
};
