//! Session state machine and the snapshots handed to callers.
//!
//! [`SessionState`] drives frame admission.  [`LifecycleState`] tracks the
//! orchestrator itself (constructed, initialized, cleaned up).
//!
//! ```text
//! Idle ──start_processing──▶ Starting ──first frame──▶ Running
//!   ▲                                                     │
//!   └───────────── stop_processing ◀── Stopping ◀─────────┘
//!
//! any state ──recovery exhausted──▶ Error
//! Error ──recover_module / reinitialize──▶ Idle (open session closed)
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::adaptation::Mitigation;
use super::stages::{BypassReason, StageKind};
use crate::events::BusStats;
use crate::modules::enhancer::RecordingSummary;
use crate::modules::{CaptureMode, ModuleName};

/// Prefix of every session id.
pub const SESSION_ID_PREFIX: &str = "hm-session-";

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    /// Session opened; waiting for the first frame.
    Starting,
    Running,
    /// Draining capture and engine work.
    Stopping,
    /// A critical fault could not be recovered.
    Error,
}

impl SessionState {
    /// `true` while frames are admitted or being drained.
    ///
    /// ```
    /// use huntmaster_pipeline::pipeline::SessionState;
    ///
    /// assert!(!SessionState::Idle.is_busy());
    /// assert!(SessionState::Starting.is_busy());
    /// assert!(SessionState::Running.is_busy());
    /// assert!(SessionState::Stopping.is_busy());
    /// assert!(!SessionState::Error.is_busy());
    /// ```
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// Frames may enter the pipeline.
    pub fn accepts_frames(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Constructed,
    Initialized,
    CleanedUp,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One capture session, from `start_processing` to `stop_processing`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size: usize,
    pub frames_processed: u64,
    pub frames_dropped: u64,
}

impl Session {
    pub fn new(sample_rate: u32, channels: u16, frame_size: usize) -> Self {
        Self {
            id: format!("{SESSION_ID_PREFIX}{}", Uuid::new_v4()),
            started_at: Utc::now(),
            sample_rate,
            channels,
            frame_size,
            frames_processed: 0,
            frames_dropped: 0,
        }
    }

    pub fn summary(&self) -> SessionSummary {
        let ended_at = Utc::now();
        let duration = ended_at - self.started_at;
        SessionSummary {
            id: self.id.clone(),
            started_at: self.started_at,
            ended_at,
            duration_secs: duration.num_milliseconds() as f64 / 1_000.0,
            sample_rate: self.sample_rate,
            channels: self.channels,
            frame_size: self.frame_size,
            frames_processed: self.frames_processed,
            frames_dropped: self.frames_dropped,
        }
    }
}

/// Frozen record of a finished session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size: usize,
    pub frames_processed: u64,
    pub frames_dropped: u64,
}

/// Result of `stop_processing`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopSummary {
    /// `None` when no session was open.
    pub session: Option<SessionSummary>,
    /// Queued capture frames processed during the stop.
    pub flushed_frames: usize,
    /// Queued capture frames discarded because the flush timed out.
    pub discarded_frames: usize,
    /// Engine work finished within the timeout.
    pub engine_flushed: bool,
    /// The stop hit its timeout and discarded work.
    pub degraded: bool,
    pub recording: Option<RecordingSummary>,
}

// ---------------------------------------------------------------------------
// SystemState
// ---------------------------------------------------------------------------

/// Point-in-time view of the whole orchestrator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemState {
    pub lifecycle: LifecycleState,
    pub session_state: SessionState,
    pub session: Option<Session>,
    pub last_session: Option<SessionSummary>,
    pub active_stages: Vec<StageKind>,
    pub bypassed_stages: BTreeMap<StageKind, BypassReason>,
    pub mitigations: Vec<Mitigation>,
    pub frame_size: usize,
    pub monitor_sample_rate: u32,
    pub capture_mode: CaptureMode,
    pub degraded_modules: Vec<ModuleName>,
    pub failed_modules: Vec<ModuleName>,
    pub pending_faults: usize,
    pub bus: BusStats,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_states() {
        assert_eq!(SessionState::default(), SessionState::Idle);
        assert_eq!(LifecycleState::default(), LifecycleState::Constructed);
    }

    #[test]
    fn only_starting_and_running_accept_frames() {
        assert!(SessionState::Starting.accepts_frames());
        assert!(SessionState::Running.accepts_frames());
        assert!(!SessionState::Stopping.accepts_frames());
        assert!(!SessionState::Idle.accepts_frames());
        assert!(!SessionState::Error.accepts_frames());
    }

    #[test]
    fn session_ids_are_prefixed_and_unique() {
        let ids: std::collections::HashSet<String> = (0..100)
            .map(|_| Session::new(48_000, 1, 4_096).id)
            .collect();
        assert_eq!(ids.len(), 100);
        assert!(ids.iter().all(|id| id.starts_with(SESSION_ID_PREFIX)));
        // prefix + hyphenated UUID
        assert!(ids.iter().all(|id| id.len() == SESSION_ID_PREFIX.len() + 36));
    }

    #[test]
    fn summary_carries_counters() {
        let mut session = Session::new(44_100, 2, 1_024);
        session.frames_processed = 7;
        session.frames_dropped = 2;
        let summary = session.summary();
        assert_eq!(summary.id, session.id);
        assert_eq!(summary.frames_processed, 7);
        assert_eq!(summary.frames_dropped, 2);
        assert!(summary.duration_secs >= 0.0);
    }

    #[test]
    fn states_serialize_snake_case() {
        assert_eq!(serde_json::to_value(SessionState::Running).unwrap(), "running");
        assert_eq!(serde_json::to_value(LifecycleState::CleanedUp).unwrap(), "cleaned_up");
    }
}
