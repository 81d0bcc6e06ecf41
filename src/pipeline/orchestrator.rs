//! The orchestrator: owns the eleven modules, the stage pipeline and the
//! session state machine.
//!
//! ```text
//!  CaptureInput ──► capture queue ──► pump_capture ─┐
//!                                                   ▼
//!  process_audio_frame ──► Frame ──► [level → noise → gain → quality] ──┐
//!                                      (Arc snapshot per frame)         │
//!        ┌──────────────────────────────────────────────────────────────┘
//!        ├─► EngineManager::submit (bounded queue → engine-worker thread)
//!        ├─► RecordingEnhancer::append
//!        └─► PerformanceMonitor::record_frame
//!
//!  EventBus ──► inbox ──► dispatch_events ──► handle_module_event
//!  stage faults ──► pending_faults ──► service() ──► handle_module_error
//! ```
//!
//! Everything here runs on the caller's task.  The only suspension points
//! are module initialization and recovery backoff.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::adaptation::{AdaptationOutcome, Adapter, Knobs, Mitigation, PerformanceSample};
use super::error::{InitStep, OrchestratorError};
use super::recovery::{self, HealthBook, ModuleErrorReport, RecoveryAction, RecoveryPolicy};
use super::stages::{BypassReason, Pipeline, StageKind};
use super::state::{LifecycleState, Session, SessionState, SessionSummary, StopSummary, SystemState};
use crate::audio::{Frame, FrameAnnotations, FrameContext, PushOutcome};
use crate::config::PipelineConfig;
use crate::events::{topics, Event, EventBus, SubscriptionId};
use crate::modules::converter::DecodedAudio;
use crate::modules::engine::{ReferenceCall, SessionContext};
use crate::modules::enhancer::RecordingSummary;
use crate::modules::library::CallInfo;
use crate::modules::{
    AnalysisEngine, AudioModule, CallSource, ConversionRequest, DropReason, EncodedAudio,
    EnhanceOptions, EnhancedRecording, FormatInfo, AudioFormat, ModuleContext, ModuleName,
    ModuleRegistry, ModuleStatus, RecordingError, StageOutcome,
};

/// Topics the orchestrator reacts to.
const SUBSCRIBED_TOPICS: [&str; 6] = [
    topics::NOISE_FLOOR_UPDATED,
    topics::QUALITY_DEGRADED,
    topics::PERFORMANCE_THRESHOLD_BREACHED,
    topics::PERFORMANCE_NOMINAL,
    topics::ENGINE_ERROR,
    topics::CAPTURE_ERROR,
];

type Inbox = Arc<Mutex<VecDeque<Event>>>;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Replaceable collaborators.  `None` selects the built-in implementation.
#[derive(Default)]
pub struct Collaborators {
    pub engine: Option<Box<dyn AnalysisEngine>>,
    pub call_source: Option<Box<dyn CallSource>>,
}

/// What `handle_module_event` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDisposition {
    Handled,
    /// Not a topic the orchestrator acts on.
    Ignored,
    /// Payload was missing required fields; logged and dropped.
    Malformed,
    /// The orchestrator was cleaned up.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FrameStatus {
    Processed,
    Dropped { reason: DropReason },
}

/// Result of running one frame through the pipeline.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameOutcome {
    pub sequence: u64,
    pub session_id: String,
    pub status: FrameStatus,
    /// Stages that ran, in order.
    pub stages: Vec<StageKind>,
    pub annotations: FrameAnnotations,
    pub processing_ms: f64,
    /// The frame was accepted by the engine queue.
    pub engine_queued: bool,
    /// Processed samples.
    #[serde(skip)]
    pub samples: Vec<f32>,
}

impl FrameOutcome {
    pub fn is_processed(&self) -> bool {
        self.status == FrameStatus::Processed
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    bus: Arc<EventBus>,
    modules: ModuleRegistry,
    pipeline: Pipeline,
    adapter: Adapter,
    health: HealthBook,
    lifecycle: LifecycleState,
    session_state: SessionState,
    session: Option<Session>,
    last_session: Option<SessionSummary>,
    inbox: Inbox,
    subscriptions: Vec<SubscriptionId>,
    pending_faults: VecDeque<ModuleErrorReport>,
    frame_size: usize,
    next_sequence: u64,
    last_error: Option<String>,
}

impl Orchestrator {
    /// Merge `overrides` onto the defaults and construct every module.
    /// No I/O happens until [`initialize`](Self::initialize).
    pub fn new(overrides: Option<Value>) -> Result<Self, OrchestratorError> {
        Self::with_collaborators(overrides, Collaborators::default())
    }

    pub fn with_collaborators(
        overrides: Option<Value>,
        collaborators: Collaborators,
    ) -> Result<Self, OrchestratorError> {
        let config = Arc::new(PipelineConfig::merged(overrides)?);
        let bus = Arc::new(EventBus::new(&config.events));
        let ctx = ModuleContext::new(Arc::clone(&bus), Arc::clone(&config));

        let Collaborators { engine, call_source } = collaborators;
        let modules = catch_unwind(AssertUnwindSafe(|| ModuleRegistry::new(&ctx, engine, call_source)))
            .map_err(|panic| OrchestratorError::Construction(panic_message(panic.as_ref())))?;

        debug!(
            "orchestrator: constructed ({} Hz, {} ch, frame {})",
            config.sample_rate, config.channels, config.frame_size
        );
        Ok(Self {
            pipeline: Pipeline::new(&config.stage_order),
            adapter: Adapter::new(&config.performance),
            frame_size: config.frame_size,
            config,
            bus,
            modules,
            health: HealthBook::default(),
            lifecycle: LifecycleState::Constructed,
            session_state: SessionState::Idle,
            session: None,
            last_session: None,
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            subscriptions: Vec::new(),
            pending_faults: VecDeque::new(),
            next_sequence: 0,
            last_error: None,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.lifecycle
    }

    pub fn session_state(&self) -> SessionState {
        self.session_state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id.as_str())
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    /// Handle for feeding samples into the scripted capture path.
    pub fn capture_input(&self) -> crate::modules::CaptureInput {
        self.modules.capture_graph_manager.input()
    }

    // -----------------------------------------------------------------------
    // Initialization
    // -----------------------------------------------------------------------

    /// Bring every module up.  On failure everything done so far is rolled
    /// back and the orchestrator stays constructed, so the call can be
    /// retried.  A no-op once initialized.
    pub async fn initialize(&mut self) -> Result<(), OrchestratorError> {
        self.ensure_live()?;
        if self.lifecycle == LifecycleState::Initialized {
            return Ok(());
        }
        let started = Instant::now();

        // 1. capture graph
        if let Err(e) = self.modules.capture_graph_manager.initialize().await {
            self.rollback(&[]);
            return Err(init_error(InitStep::AcquireCapture, Some(e.module), e.message));
        }

        // 2. module hooks
        let mut done = Vec::new();
        for name in ModuleName::ALL {
            if name == ModuleName::CaptureGraphManager {
                continue;
            }
            if let Err(e) = self.modules.get_mut(name).initialize().await {
                error!("orchestrator: {name} failed to initialize: {}", e.message);
                self.rollback(&done);
                return Err(init_error(InitStep::InitializeModules, Some(name), e.message));
            }
            done.push(name);
        }

        // 3. pipeline
        self.pipeline = Pipeline::new(&self.config.stage_order);
        self.adapter.reset();

        // 4. capture framing
        self.frame_size = self.config.frame_size;
        let capture = &self.modules.capture_graph_manager;
        capture.set_frame_size(self.frame_size);
        capture.set_monitor_sample_rate(self.config.capture.monitor_sample_rate);

        // 5. subscriptions
        for topic in SUBSCRIBED_TOPICS {
            let inbox = Arc::clone(&self.inbox);
            let id = self.bus.subscribe(topic, move |event: &Event| {
                inbox
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_back(event.clone());
            });
            self.subscriptions.push(id);
        }

        self.lifecycle = LifecycleState::Initialized;
        info!(
            "orchestrator: initialized {} modules in {:.0?} (capture {:?})",
            ModuleName::ALL.len(),
            started.elapsed(),
            self.modules.capture_graph_manager.mode()
        );
        Ok(())
    }

    fn rollback(&mut self, initialized: &[ModuleName]) {
        for &name in initialized.iter().rev() {
            self.modules.get_mut(name).reset();
        }
        self.modules.capture_graph_manager.reset();
        self.unsubscribe_all();
        warn!("orchestrator: initialization rolled back");
    }

    /// Tear everything down and initialize again from scratch.  Clears any
    /// error state.
    pub async fn reinitialize(&mut self) -> Result<(), OrchestratorError> {
        self.ensure_live()?;
        if self.session.is_some() {
            self.stop_processing()?;
        }
        self.unsubscribe_all();
        self.modules.reset_all();
        self.health.clear();
        self.pending_faults.clear();
        self.drain_inbox();
        self.session_state = SessionState::Idle;
        self.lifecycle = LifecycleState::Constructed;
        self.last_error = None;
        info!("orchestrator: reinitializing");
        self.initialize().await
    }

    fn unsubscribe_all(&mut self) {
        for id in self.subscriptions.drain(..) {
            self.bus.unsubscribe(id);
        }
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    /// Open a session.  Returns its id.
    pub fn start_processing(&mut self) -> Result<String, OrchestratorError> {
        self.ensure_initialized("start_processing")?;
        if self.session_state != SessionState::Idle {
            return Err(OrchestratorError::InvalidState {
                operation: "start_processing",
                state: self.session_state.label(),
            });
        }

        self.session_state = SessionState::Starting;
        let capture = &mut self.modules.capture_graph_manager;
        capture.acquire();
        capture.set_frame_size(self.frame_size);
        if let Err(e) = capture.start() {
            self.session_state = SessionState::Idle;
            return Err(e.into());
        }

        let session = Session::new(self.config.sample_rate, self.config.channels, self.frame_size);
        let id = session.id.clone();
        self.modules.engine_manager.begin_session(SessionContext {
            session_id: id.clone(),
            sample_rate: session.sample_rate,
            channels: session.channels,
        });
        self.next_sequence = 0;
        self.session = Some(session);

        info!("orchestrator: session {id} started");
        self.publish(
            topics::SESSION_STARTED,
            json!({
                "sessionId": id,
                "sampleRate": self.config.sample_rate,
                "channels": self.config.channels,
                "frameSize": self.frame_size,
            }),
        );
        Ok(id)
    }

    /// Close the current session, draining queued work within
    /// `flushTimeoutMs`.  Pending master call playback is discarded.  Safe
    /// in any state.
    pub fn stop_processing(&mut self) -> Result<StopSummary, OrchestratorError> {
        self.ensure_live()?;
        self.modules.capture_graph_manager.clear_playback();
        if self.session.is_none() {
            return Ok(StopSummary {
                engine_flushed: true,
                ..StopSummary::default()
            });
        }

        let prior = self.session_state;
        self.session_state = SessionState::Stopping;
        self.modules.capture_graph_manager.stop();

        let deadline = Instant::now() + Duration::from_millis(self.config.recovery.flush_timeout_ms);
        let mut flushed_frames = 0;
        let mut discarded_frames = 0;
        while let Some(samples) = self.modules.capture_graph_manager.next_frame() {
            if Instant::now() >= deadline {
                discarded_frames = 1 + self.modules.capture_graph_manager.drain_frames().len();
                break;
            }
            match self.run_frame(samples) {
                Ok(_) => flushed_frames += 1,
                Err(e) => warn!("orchestrator: dropped queued frame during stop: {e}"),
            }
        }

        let engine_flushed = self
            .modules
            .engine_manager
            .flush(deadline.saturating_duration_since(Instant::now()));
        let degraded = discarded_frames > 0 || !engine_flushed;
        if degraded {
            warn!(
                "orchestrator: stop timed out after {} ms, discarded {discarded_frames} frames",
                self.config.recovery.flush_timeout_ms
            );
            self.modules.capture_graph_manager.release();
        }

        self.modules.engine_manager.end_session();
        let session = self.session.take();
        let recording = session
            .as_ref()
            .and_then(|s| self.modules.recording_enhancer.flush_session(&s.id));
        let summary = session.map(|s| s.summary());

        if let Some(summary) = &summary {
            info!(
                "orchestrator: session {} stopped ({} processed, {} dropped)",
                summary.id, summary.frames_processed, summary.frames_dropped
            );
            self.publish(
                topics::SESSION_STOPPED,
                json!({ "session": summary, "degraded": degraded }),
            );
        }
        self.last_session = summary.clone();
        self.session_state = if prior == SessionState::Error {
            SessionState::Error
        } else {
            SessionState::Idle
        };
        self.dispatch_events();

        Ok(StopSummary {
            session: summary,
            flushed_frames,
            discarded_frames,
            engine_flushed,
            degraded,
            recording,
        })
    }

    // -----------------------------------------------------------------------
    // Frame processing
    // -----------------------------------------------------------------------

    /// Run one block of interleaved samples through the pipeline.
    pub fn process_audio_frame(&mut self, samples: Vec<f32>) -> Result<FrameOutcome, OrchestratorError> {
        self.ensure_initialized("process_audio_frame")?;
        if !self.session_state.accepts_frames() {
            return Err(OrchestratorError::InvalidState {
                operation: "process_audio_frame",
                state: self.session_state.label(),
            });
        }
        self.run_frame(samples)
    }

    /// Process every frame waiting in the capture queue, in arrival order.
    pub fn pump_capture(&mut self) -> Result<Vec<FrameOutcome>, OrchestratorError> {
        self.ensure_initialized("pump_capture")?;
        let mut outcomes = Vec::new();
        while self.session_state.accepts_frames() {
            let Some(samples) = self.modules.capture_graph_manager.next_frame() else {
                break;
            };
            match self.run_frame(samples) {
                Ok(outcome) => outcomes.push(outcome),
                Err(OrchestratorError::InvalidFrame(e)) => {
                    warn!("orchestrator: skipping captured frame: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcomes)
    }

    fn run_frame(&mut self, samples: Vec<f32>) -> Result<FrameOutcome, OrchestratorError> {
        let session_id = self
            .session
            .as_ref()
            .map(|s| s.id.clone())
            .ok_or(OrchestratorError::InvalidState {
                operation: "process_audio_frame",
                state: "no session is open",
            })?;
        let sequence = self.next_sequence;
        let mut frame = Frame::new(
            samples,
            FrameContext {
                sequence,
                timestamp: Utc::now(),
                session_id: Some(session_id.clone()),
                sample_rate: self.config.sample_rate,
                channels: self.config.channels,
            },
        )?;
        self.next_sequence += 1;
        if self.session_state == SessionState::Starting {
            self.session_state = SessionState::Running;
            debug!("orchestrator: session {session_id} running");
        }

        let stages = self.pipeline.snapshot();
        let started = Instant::now();
        let mut timings = Vec::with_capacity(stages.len());
        let mut dropped = None;
        for &stage in stages.iter() {
            let stage_started = Instant::now();
            let result = self.run_stage(stage, &mut frame);
            timings.push((stage, elapsed_ms(stage_started)));
            match result {
                Ok(StageOutcome::Continue) => {}
                Ok(StageOutcome::Drop(reason)) => {
                    dropped = Some(reason);
                    break;
                }
                Err(report) => {
                    let module = report.module;
                    self.contain(report);
                    dropped = Some(DropReason::StageFault(module));
                    break;
                }
            }
        }

        let mut engine_queued = false;
        if dropped.is_none() {
            engine_queued = matches!(
                self.modules.engine_manager.submit(frame.samples(), sequence),
                Some(PushOutcome::Queued | PushOutcome::DroppedOldest)
            );
            self.modules.recording_enhancer.append(frame.samples());
        }

        let processing_ms = elapsed_ms(started);
        self.modules
            .performance_monitor
            .record_frame(processing_ms, frame.duration_ms(), &timings);
        if let Some(session) = self.session.as_mut() {
            if dropped.is_some() {
                session.frames_dropped += 1;
            } else {
                session.frames_processed += 1;
            }
        }
        self.dispatch_events();

        let status = match dropped {
            None => FrameStatus::Processed,
            Some(reason) => FrameStatus::Dropped { reason },
        };
        let annotations = frame.annotations.clone();
        Ok(FrameOutcome {
            sequence,
            session_id,
            status,
            stages: timings.iter().map(|&(s, _)| s).collect(),
            annotations,
            processing_ms,
            engine_queued,
            samples: frame.into_samples(),
        })
    }

    fn run_stage(&mut self, stage: StageKind, frame: &mut Frame) -> Result<StageOutcome, ModuleErrorReport> {
        let module = self.modules.stage_mut(stage);
        if !module.is_initialized() {
            return Err(ModuleErrorReport::new(
                stage.module(),
                "stage invoked while not initialized",
                true,
            ));
        }
        match catch_unwind(AssertUnwindSafe(|| module.process(frame))) {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(e.into()),
            Err(panic) => Err(ModuleErrorReport::new(
                stage.module(),
                format!("stage panicked: {}", panic_message(panic.as_ref())),
                true,
            )),
        }
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Handle every event collected since the last call.
    pub fn dispatch_events(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let next = self
                .inbox
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            let Some(event) = next else { break };
            self.handle_module_event(&event);
            handled += 1;
        }
        handled
    }

    fn drain_inbox(&self) {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// React to one bus event.  Never fails; after cleanup every event is
    /// `Rejected`.
    pub fn handle_module_event(&mut self, event: &Event) -> EventDisposition {
        if self.ensure_live().is_err() {
            debug!("orchestrator: rejected `{}` after cleanup", event.topic);
            return EventDisposition::Rejected;
        }
        match event.topic.as_str() {
            topics::NOISE_FLOOR_UPDATED => match event.payload.get("floorDb").and_then(Value::as_f64) {
                Some(floor) => {
                    self.modules.gain_controller.set_noise_floor_db(floor as f32);
                    EventDisposition::Handled
                }
                None => malformed(event),
            },
            topics::QUALITY_DEGRADED => match event.payload.get("score").and_then(Value::as_f64) {
                Some(score) => {
                    self.publish(
                        topics::PIPELINE_QUALITY_ALERT,
                        json!({
                            "score": score,
                            "sessionId": self.session_id(),
                            "source": event.source,
                        }),
                    );
                    EventDisposition::Handled
                }
                None => malformed(event),
            },
            topics::PERFORMANCE_THRESHOLD_BREACHED | topics::PERFORMANCE_NOMINAL => {
                match PerformanceSample::from_payload(&event.payload) {
                    Some(sample) => {
                        if let Err(e) = self.optimize_performance(&sample) {
                            debug!("orchestrator: performance sample ignored: {e}");
                        }
                        EventDisposition::Handled
                    }
                    None => malformed(event),
                }
            }
            topics::ENGINE_ERROR => {
                let payload = &event.payload;
                let message = payload.get("message").and_then(Value::as_str);
                let critical = payload.get("critical").and_then(Value::as_bool);
                let (Some(message), Some(critical)) = (message, critical) else {
                    return malformed(event);
                };
                let mut report = ModuleErrorReport::new(ModuleName::EngineManager, message, critical);
                if let Some(code) = payload.get("code").and_then(Value::as_str) {
                    report = report.with_code(code);
                }
                self.contain(report);
                EventDisposition::Handled
            }
            topics::CAPTURE_ERROR => match event.payload.get("message").and_then(Value::as_str) {
                Some(message) => {
                    self.contain(ModuleErrorReport::new(ModuleName::CaptureGraphManager, message, true));
                    EventDisposition::Handled
                }
                None => malformed(event),
            },
            _ => EventDisposition::Ignored,
        }
    }

    // -----------------------------------------------------------------------
    // Faults
    // -----------------------------------------------------------------------

    /// Synchronous part of fault handling: degrade now, queue critical
    /// faults for [`service`](Self::service).
    fn contain(&mut self, report: ModuleErrorReport) {
        if !report.critical {
            self.mark_degraded(&report);
            return;
        }
        warn!(
            "orchestrator: critical fault in {} queued for recovery: {}",
            report.module, report.error
        );
        if let Some(stage) = StageKind::for_module(report.module) {
            self.pipeline.bypass(stage, BypassReason::Fault);
        }
        if !self.pending_faults.iter().any(|r| r.module == report.module) {
            self.pending_faults.push_back(report);
        }
    }

    fn mark_degraded(&mut self, report: &ModuleErrorReport) {
        warn!("orchestrator: {} degraded: {}", report.module, report.error);
        self.health.degrade(report.module, report.error.clone());
        if self.config.recovery.bypass_degraded_stages {
            if let Some(stage) = StageKind::for_module(report.module) {
                self.pipeline.bypass(stage, BypassReason::Fault);
            }
        }
        self.publish(
            topics::MODULE_DEGRADED,
            json!({
                "module": report.module,
                "error": report.error,
                "code": report.code,
            }),
        );
    }

    /// Resolve queued events and faults.  Call regularly between frames.
    pub async fn service(&mut self) -> Vec<RecoveryAction> {
        if self.ensure_live().is_err() {
            return vec![RecoveryAction::Rejected];
        }
        self.dispatch_events();
        let mut actions = Vec::new();
        while let Some(report) = self.pending_faults.pop_front() {
            actions.push(self.handle_module_error(report).await);
            self.dispatch_events();
        }
        actions
    }

    /// Contain or recover a module fault.
    pub async fn handle_module_error(&mut self, report: ModuleErrorReport) -> RecoveryAction {
        if self.ensure_live().is_err() {
            warn!("orchestrator: rejected {} fault after cleanup: {}", report.module, report.error);
            return RecoveryAction::Rejected;
        }
        if !report.critical {
            self.mark_degraded(&report);
            return RecoveryAction::Degraded;
        }
        error!("orchestrator: critical fault in {}: {}", report.module, report.error);

        if report.module == ModuleName::CaptureGraphManager
            && self.modules.capture_graph_manager.fall_back_to_scripted(&report.error)
        {
            self.health
                .degrade(ModuleName::CaptureGraphManager, format!("scripted fallback: {}", report.error));
            return RecoveryAction::CaptureFallback;
        }

        match self.recover_module(report.module).await {
            Ok(attempts) => RecoveryAction::Recovered { attempts },
            Err(OrchestratorError::RecoveryExhausted { attempts, .. }) => RecoveryAction::Failed { attempts },
            Err(e) => {
                warn!("orchestrator: recovery of {} not attempted: {e}", report.module);
                RecoveryAction::Failed { attempts: 0 }
            }
        }
    }

    /// Reset and reinitialize `name` with backoff.  On success the module is
    /// rewired into the running session, or, when this clears the last
    /// failure, the session is closed and the state returns to `Idle`.  On
    /// exhaustion the session enters `Error`.
    pub async fn recover_module(&mut self, name: ModuleName) -> Result<u32, OrchestratorError> {
        self.ensure_live()?;
        let policy = RecoveryPolicy::from_config(&self.config.recovery);
        let monitor_rate = self.modules.capture_graph_manager.monitor_sample_rate();
        self.pending_faults.retain(|r| r.module != name);

        match recovery::recover(self.modules.get_mut(name), policy).await {
            Ok(attempts) => {
                self.rewire(name, monitor_rate);
                self.health.heal(name);
                self.publish(topics::MODULE_RECOVERED, json!({ "module": name, "attempts": attempts }));
                if self.session_state == SessionState::Error && self.health.failed().is_empty() {
                    // the failed session is closed; the next start opens a fresh one
                    if self.session.is_some() {
                        if let Err(e) = self.stop_processing() {
                            warn!("orchestrator: closing failed session: {e}");
                        }
                    }
                    self.session_state = SessionState::Idle;
                    self.last_error = None;
                    info!("orchestrator: left error state after recovering {name}");
                }
                Ok(attempts)
            }
            Err(failure) => {
                self.health.fail(name, failure.last_error.clone());
                self.publish(
                    topics::MODULE_FAILED,
                    json!({
                        "module": name,
                        "attempts": failure.attempts,
                        "error": failure.last_error,
                    }),
                );
                self.enter_error(format!("{name} failed: {}", failure.last_error));
                Err(OrchestratorError::RecoveryExhausted {
                    module: name,
                    attempts: failure.attempts,
                    reason: failure.last_error,
                })
            }
        }
    }

    /// Restore session wiring lost by a module reset.
    fn rewire(&mut self, name: ModuleName, monitor_rate: u32) {
        match name {
            ModuleName::CaptureGraphManager => {
                let capture = &mut self.modules.capture_graph_manager;
                capture.set_frame_size(self.frame_size);
                capture.set_monitor_sample_rate(monitor_rate);
                if self.session.is_some() {
                    if let Err(e) = capture.start() {
                        warn!("orchestrator: capture did not restart after recovery: {e}");
                    }
                }
            }
            ModuleName::EngineManager => {
                if let Some(session) = &self.session {
                    self.modules.engine_manager.begin_session(SessionContext {
                        session_id: session.id.clone(),
                        sample_rate: session.sample_rate,
                        channels: session.channels,
                    });
                }
            }
            _ => {
                if let Some(stage) = StageKind::for_module(name) {
                    self.pipeline.restore(stage, BypassReason::Fault);
                }
            }
        }
    }

    fn enter_error(&mut self, reason: String) {
        error!("orchestrator: entering error state: {reason}");
        self.session_state = SessionState::Error;
        self.publish(
            topics::SESSION_ERROR,
            json!({ "sessionId": self.session_id(), "reason": reason }),
        );
        self.last_error = Some(reason);
    }

    // -----------------------------------------------------------------------
    // Adaptation
    // -----------------------------------------------------------------------

    /// Feed one timing sample to the adapter and apply its decision.
    pub fn optimize_performance(&mut self, sample: &PerformanceSample) -> Result<AdaptationOutcome, OrchestratorError> {
        self.ensure_live()?;
        let knobs = Knobs {
            pipeline: &self.pipeline,
            frame_size: self.frame_size,
            monitor_sample_rate: self.modules.capture_graph_manager.monitor_sample_rate(),
        };
        let outcome = self.adapter.evaluate(sample, knobs);
        match &outcome {
            AdaptationOutcome::Applied { mitigation } => {
                self.apply_mitigation(*mitigation, true);
                info!("orchestrator: mitigation applied: {mitigation:?}");
                self.publish(
                    topics::MITIGATION_APPLIED,
                    json!({
                        "mitigation": mitigation,
                        "value": sample.value,
                        "threshold": sample.threshold,
                    }),
                );
            }
            AdaptationOutcome::Reverted { mitigation } => {
                self.apply_mitigation(*mitigation, false);
                info!("orchestrator: mitigation reverted: {mitigation:?}");
                self.publish(topics::MITIGATION_REVERTED, json!({ "mitigation": mitigation }));
            }
            AdaptationOutcome::Exhausted => {
                warn!(
                    "orchestrator: {} at {:.2} ms with no mitigation left",
                    sample.metric, sample.value
                );
            }
            AdaptationOutcome::Unchanged => {}
        }
        Ok(outcome)
    }

    fn apply_mitigation(&mut self, mitigation: Mitigation, apply: bool) {
        let capture = &self.modules.capture_graph_manager;
        match mitigation {
            Mitigation::BypassStage { stage } => {
                if apply {
                    self.pipeline.bypass(stage, BypassReason::Performance);
                } else {
                    self.pipeline.restore(stage, BypassReason::Performance);
                }
            }
            Mitigation::FrameSize { from, to } => {
                self.frame_size = if apply { to } else { from };
                capture.set_frame_size(self.frame_size);
            }
            Mitigation::MonitorSampleRate { from, to } => {
                capture.set_monitor_sample_rate(if apply { to } else { from });
            }
        }
    }

    // -----------------------------------------------------------------------
    // Background loop
    // -----------------------------------------------------------------------

    /// Pump capture and service faults until `shutdown` turns `true` or its
    /// sender is dropped.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), OrchestratorError> {
        self.ensure_initialized("run")?;
        let period_ms = (self.config.frame_duration_ms() / 4.0).clamp(1.0, 50.0);
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(period_ms / 1_000.0));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("orchestrator: run loop started ({period_ms:.1} ms tick)");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if self.session_state.accepts_frames() {
                        if let Err(e) = self.pump_capture() {
                            warn!("orchestrator: pump failed: {e}");
                        }
                    }
                    self.service().await;
                }
            }
        }
        info!("orchestrator: run loop stopped");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn system_state(&self) -> SystemState {
        SystemState {
            lifecycle: self.lifecycle,
            session_state: self.session_state,
            session: self.session.clone(),
            last_session: self.last_session.clone(),
            active_stages: self.pipeline.snapshot().to_vec(),
            bypassed_stages: self.pipeline.bypassed().clone(),
            mitigations: self.adapter.applied().to_vec(),
            frame_size: self.frame_size,
            monitor_sample_rate: self.modules.capture_graph_manager.monitor_sample_rate(),
            capture_mode: self.modules.capture_graph_manager.mode(),
            degraded_modules: self.health.degraded(),
            failed_modules: self.health.failed(),
            pending_faults: self.pending_faults.len(),
            bus: self.bus.stats(),
            last_error: self.last_error.clone(),
        }
    }

    pub fn module_states(&self) -> BTreeMap<ModuleName, ModuleStatus> {
        ModuleName::ALL
            .into_iter()
            .map(|name| {
                let module = self.modules.get(name);
                let status = ModuleStatus {
                    name,
                    initialized: module.is_initialized(),
                    health: self.health.health(name),
                    details: module.describe(),
                };
                (name, status)
            })
            .collect()
    }

    /// Canonical names of the modules, in initialization order.
    pub fn loaded_modules(&self) -> Vec<&'static str> {
        self.modules.names().iter().map(|m| m.as_str()).collect()
    }

    // -----------------------------------------------------------------------
    // Master calls
    // -----------------------------------------------------------------------

    pub fn master_call_library(&self) -> Result<Vec<CallInfo>, OrchestratorError> {
        self.ensure_live()?;
        Ok(self.modules.call_library_manager.catalog()?)
    }

    /// Make `id` the current master call and hand it to the engine as the
    /// similarity reference.
    pub fn load_master_call(&mut self, id: &str) -> Result<CallInfo, OrchestratorError> {
        self.ensure_initialized("load_master_call")?;
        let call = self.modules.call_library_manager.load(id)?;
        let info = call.info.clone();
        let reference = ReferenceCall {
            call_id: info.id.clone(),
            samples: call.samples.clone(),
            sample_rate: info.sample_rate,
            channels: info.channels,
        };
        if let Err(e) = self.modules.engine_manager.load_reference(reference) {
            let report = ModuleErrorReport::new(ModuleName::EngineManager, e.to_string(), e.is_critical())
                .with_code(e.code());
            self.contain(report);
        }
        Ok(info)
    }

    /// Queue a master call on the output path.  Loads `id` first when
    /// given, otherwise plays the current call.  Returns samples queued.
    pub fn play_master_call(&mut self, id: Option<&str>) -> Result<usize, OrchestratorError> {
        self.ensure_initialized("play_master_call")?;
        if let Some(id) = id {
            self.load_master_call(id)?;
        }
        let call = self
            .modules
            .call_library_manager
            .current()
            .ok_or(OrchestratorError::InvalidState {
                operation: "play_master_call",
                state: "no master call is loaded",
            })?;
        let call_id = call.info.id.clone();
        let queued = self.modules.capture_graph_manager.queue_playback(
            &call.samples,
            call.info.sample_rate,
            call.info.channels,
        );
        self.publish(
            topics::MASTER_CALL_PLAYBACK,
            json!({
                "id": call_id,
                "samples": queued,
                "sampleRate": self.modules.capture_graph_manager.monitor_sample_rate(),
            }),
        );
        Ok(queued)
    }

    /// Take up to `max` interleaved samples of queued master call audio at
    /// the monitoring rate, for the caller's output device.
    pub fn take_playback(&mut self, max: usize) -> Result<Vec<f32>, OrchestratorError> {
        self.ensure_live()?;
        Ok(self.modules.capture_graph_manager.take_playback(max))
    }

    // -----------------------------------------------------------------------
    // Recordings & conversion
    // -----------------------------------------------------------------------

    /// Start recording processed frames, bound to the open session if any.
    pub fn start_recording(&mut self) -> Result<String, OrchestratorError> {
        self.ensure_initialized("start_recording")?;
        let session_id = self.session.as_ref().map(|s| s.id.clone());
        Ok(self.modules.recording_enhancer.start(
            session_id.as_deref(),
            self.config.sample_rate,
            self.config.channels,
        )?)
    }

    pub fn stop_recording(&mut self) -> Result<RecordingSummary, OrchestratorError> {
        self.ensure_live()?;
        Ok(self.modules.recording_enhancer.stop()?)
    }

    /// Enhance a finished recording; `None` uses the configured defaults.
    pub fn enhance_recording(
        &mut self,
        id: &str,
        options: Option<EnhanceOptions>,
    ) -> Result<EnhancedRecording, OrchestratorError> {
        self.ensure_live()?;
        let enhancer = &mut self.modules.recording_enhancer;
        let options = options.unwrap_or_else(|| enhancer.default_options());
        Ok(enhancer.enhance(id, &options)?)
    }

    /// Encode a finished recording (its enhanced take when available).
    pub fn export_recording(&self, id: &str, format: AudioFormat) -> Result<EncodedAudio, OrchestratorError> {
        self.ensure_live()?;
        let recording = self.modules.recording_enhancer.get(id)?;
        if recording.is_active() {
            return Err(RecordingError::StillRecording(id.to_string()).into());
        }
        Ok(self.modules.format_converter.encode(
            recording.best_take(),
            recording.sample_rate,
            recording.channels,
            format,
        )?)
    }

    pub fn convert_audio_format(
        &self,
        audio: &EncodedAudio,
        request: &ConversionRequest,
    ) -> Result<EncodedAudio, OrchestratorError> {
        self.ensure_live()?;
        Ok(self.modules.format_converter.convert(audio, request)?)
    }

    pub fn decode_audio(&self, audio: &EncodedAudio) -> Result<DecodedAudio, OrchestratorError> {
        self.ensure_live()?;
        Ok(self.modules.format_converter.decode(audio)?)
    }

    pub fn supported_formats(&self) -> Result<Vec<FormatInfo>, OrchestratorError> {
        self.ensure_live()?;
        Ok(self.modules.format_converter.supported_formats())
    }

    // -----------------------------------------------------------------------
    // Cleanup
    // -----------------------------------------------------------------------

    /// Stop any session, release every module and detach from the bus.
    /// Idempotent; every later operation fails with `CleanedUp`.
    pub fn cleanup(&mut self) {
        if self.lifecycle == LifecycleState::CleanedUp {
            return;
        }
        if self.session.is_some() {
            if let Err(e) = self.stop_processing() {
                warn!("orchestrator: stop during cleanup failed: {e}");
            }
        }
        self.unsubscribe_all();
        self.modules.reset_all();
        self.bus.clear();
        self.pending_faults.clear();
        self.drain_inbox();
        self.session_state = SessionState::Idle;
        self.lifecycle = LifecycleState::CleanedUp;
        info!("orchestrator: cleaned up");
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn ensure_live(&self) -> Result<(), OrchestratorError> {
        if self.lifecycle == LifecycleState::CleanedUp {
            return Err(OrchestratorError::CleanedUp);
        }
        Ok(())
    }

    fn ensure_initialized(&self, operation: &'static str) -> Result<(), OrchestratorError> {
        match self.lifecycle {
            LifecycleState::Initialized => Ok(()),
            LifecycleState::CleanedUp => Err(OrchestratorError::CleanedUp),
            LifecycleState::Constructed => Err(OrchestratorError::InvalidState {
                operation,
                state: "not initialized",
            }),
        }
    }

    fn publish(&self, topic: &str, payload: Value) {
        self.bus.publish(topic, None, payload);
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn init_error(step: InitStep, module: Option<ModuleName>, reason: impl Into<String>) -> OrchestratorError {
    OrchestratorError::Initialization {
        step,
        module,
        reason: reason.into(),
    }
}

fn malformed(event: &Event) -> EventDisposition {
    warn!(
        "orchestrator: malformed `{}` payload dropped: {}",
        event.topic, event.payload
    );
    EventDisposition::Malformed
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1_000.0
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
