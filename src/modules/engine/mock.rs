//! Test double for [`AnalysisEngine`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{AnalysisEngine, EngineAnalysis, EngineError, EngineFeatures, SessionContext};

/// Canned engine.  Counters are shared so a test can keep observing the
/// engine after handing it to the manager.
#[derive(Clone)]
pub struct MockEngine {
    load_error: Arc<Mutex<Option<EngineError>>>,
    analyze_error: Arc<Mutex<Option<EngineError>>>,
    delay: Duration,
    pub loads: Arc<AtomicUsize>,
    pub analyses: Arc<AtomicUsize>,
    pub ended_sessions: Arc<Mutex<Vec<String>>>,
}

impl MockEngine {
    /// Loads and analyzes successfully.
    pub fn ok() -> Self {
        Self {
            load_error: Arc::new(Mutex::new(None)),
            analyze_error: Arc::new(Mutex::new(None)),
            delay: Duration::ZERO,
            loads: Arc::new(AtomicUsize::new(0)),
            analyses: Arc::new(AtomicUsize::new(0)),
            ended_sessions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fails every `load` with `error`.
    pub fn failing_load(error: EngineError) -> Self {
        let engine = Self::ok();
        engine.fail_loads(error);
        engine
    }

    /// Fails every `analyze` with `error` until [`heal`](Self::heal).
    pub fn failing_analyze(error: EngineError) -> Self {
        let engine = Self::ok();
        *engine.analyze_error.lock().unwrap() = Some(error);
        engine
    }

    /// Sleeps this long in every `analyze`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail every subsequent `load` with `error`.
    pub fn fail_loads(&self, error: EngineError) {
        *self.load_error.lock().unwrap() = Some(error);
    }

    /// Clear every injected failure.
    pub fn heal(&self) {
        *self.load_error.lock().unwrap() = None;
        *self.analyze_error.lock().unwrap() = None;
    }
}

impl AnalysisEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn load(&mut self) -> Result<EngineFeatures, EngineError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        match self.load_error.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(EngineFeatures::default()),
        }
    }

    fn analyze(
        &mut self,
        samples: &[f32],
        session: &SessionContext,
        sequence: u64,
    ) -> Result<EngineAnalysis, EngineError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.analyses.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.analyze_error.lock().unwrap().clone() {
            return Err(e);
        }
        Ok(EngineAnalysis {
            session_id: session.session_id.clone(),
            sequence,
            rms_db: crate::audio::dsp::linear_to_db(crate::audio::dsp::rms(samples)),
            zero_crossing_rate: 0.0,
            pitch_hz: None,
            similarity: None,
        })
    }

    fn end_session(&mut self, session_id: &str) {
        self.ended_sessions.lock().unwrap().push(session_id.to_string());
    }
}
