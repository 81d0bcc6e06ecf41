//! Engine lifecycle and the bounded analysis queue.
//!
//! ```text
//! frame loop ──submit──► BoundedQueue<AnalysisJob> ──► "engine-worker" thread
//!                         (drop-oldest / drop-newest)      │
//!                                                          ├─ Ok  → engine-analysis
//!                                                          └─ Err → engine-error
//! ```
//!
//! Loading runs on tokio's blocking pool.  When the supplied engine fails to
//! load and fallback is allowed, the built-in engine takes its place and
//! `engine-fallback` is published.  A critical analysis error parks the
//! worker (queued jobs are discarded) until the module is reinitialized.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::{json, Value};

use super::{
    AnalysisEngine, BuiltinEngine, EngineAnalysis, EngineError, EngineFeatures, ReferenceCall,
    SessionContext,
};
use crate::audio::queue::{BoundedQueue, PushOutcome};
use crate::events::topics;
use crate::modules::{AudioModule, ModuleContext, ModuleError, ModuleName};

const NAME: ModuleName = ModuleName::EngineManager;
const WORKER_POLL: Duration = Duration::from_millis(50);

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

type SharedEngine = Arc<Mutex<Box<dyn AnalysisEngine>>>;

struct AnalysisJob {
    samples: Vec<f32>,
    sequence: u64,
    session: Arc<SessionContext>,
}

/// Outstanding-work accounting shared with the worker.
#[derive(Default)]
struct WorkTracker {
    outstanding: Mutex<usize>,
    idle: Condvar,
    faulted: AtomicBool,
    analyzed: AtomicU64,
    failed: AtomicU64,
    last: Mutex<Option<EngineAnalysis>>,
}

impl WorkTracker {
    fn add(&self, n: usize) {
        *lock(&self.outstanding) += n;
    }

    fn finish(&self, n: usize) {
        let mut outstanding = lock(&self.outstanding);
        *outstanding = outstanding.saturating_sub(n);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        let guard = lock(&self.outstanding);
        let (guard, _) = self
            .idle
            .wait_timeout_while(guard, timeout, |n| *n > 0)
            .unwrap_or_else(PoisonError::into_inner);
        *guard == 0
    }
}

// ---------------------------------------------------------------------------
// EngineManager
// ---------------------------------------------------------------------------

pub struct EngineManager {
    ctx: ModuleContext,
    engine: SharedEngine,
    fallback_active: bool,
    features: Option<EngineFeatures>,
    queue: Arc<BoundedQueue<AnalysisJob>>,
    tracker: Arc<WorkTracker>,
    worker: Option<JoinHandle<()>>,
    session: Option<Arc<SessionContext>>,
    reference: Option<ReferenceCall>,
    initialized: bool,
}

impl EngineManager {
    /// Manage `engine`, or the built-in engine when `None`.
    pub fn new(ctx: ModuleContext, engine: Option<Box<dyn AnalysisEngine>>) -> Self {
        let cfg = &ctx.config.engine;
        let queue = Arc::new(BoundedQueue::new(cfg.queue_capacity, cfg.backpressure));
        let engine: Box<dyn AnalysisEngine> = engine.unwrap_or_else(|| Box::new(BuiltinEngine::new()));
        Self {
            ctx,
            engine: Arc::new(Mutex::new(engine)),
            fallback_active: false,
            features: None,
            queue,
            tracker: Arc::new(WorkTracker::default()),
            worker: None,
            session: None,
            reference: None,
            initialized: false,
        }
    }

    pub fn engine_name(&self) -> String {
        lock(&self.engine).name().to_string()
    }

    pub fn features(&self) -> Option<EngineFeatures> {
        self.features
    }

    pub fn fallback_active(&self) -> bool {
        self.fallback_active
    }

    /// A critical analysis error parked the worker.
    pub fn is_faulted(&self) -> bool {
        self.tracker.faulted.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    pub fn last_analysis(&self) -> Option<EngineAnalysis> {
        lock(&self.tracker.last).clone()
    }

    /// Open a session scope; subsequent analyses carry its context.
    pub fn begin_session(&mut self, session: SessionContext) {
        debug!("engine: session {} begins", session.session_id);
        self.session = Some(Arc::new(session));
    }

    /// Close the session scope and let the engine drop per-session state.
    pub fn end_session(&mut self) {
        if let Some(session) = self.session.take() {
            lock(&self.engine).end_session(&session.session_id);
            debug!("engine: session {} ended", session.session_id);
        }
    }

    /// Queue a frame for analysis without blocking.
    ///
    /// Returns `None` when nothing was offered: analysis disabled, no
    /// session, not initialized or the worker is parked after a fault.
    pub fn submit(&self, samples: &[f32], sequence: u64) -> Option<PushOutcome> {
        if !self.initialized || !self.ctx.config.engine.analysis_enabled || self.is_faulted() {
            return None;
        }
        let session = Arc::clone(self.session.as_ref()?);

        self.tracker.add(1);
        let outcome = self.queue.push(AnalysisJob {
            samples: samples.to_vec(),
            sequence,
            session,
        });
        if outcome != PushOutcome::Queued {
            self.tracker.finish(1);
        }
        if outcome.dropped() {
            self.ctx.publish(
                NAME,
                topics::ENGINE_BACKPRESSURE,
                json!({
                    "dropped": self.queue.dropped(),
                    "policy": self.queue.policy(),
                    "sequence": sequence,
                }),
            );
        }
        Some(outcome)
    }

    /// Wait up to `timeout` for queued analyses to finish.  On timeout the
    /// remaining jobs are discarded and `false` is returned.
    pub fn flush(&self, timeout: Duration) -> bool {
        if self.tracker.wait_idle(timeout) {
            return true;
        }
        let discarded = self.discard_pending();
        warn!("engine: flush timed out, discarded {discarded} queued analyses");
        false
    }

    fn discard_pending(&self) -> usize {
        let n = self.queue.drain().len();
        self.tracker.finish(n);
        n
    }

    /// Use `reference` for similarity scoring from now on, including after
    /// reinitialization.
    pub fn load_reference(&mut self, reference: ReferenceCall) -> Result<(), EngineError> {
        if self.initialized {
            lock(&self.engine).load_reference(&reference)?;
        }
        self.reference = Some(reference);
        Ok(())
    }

    fn spawn_worker(&mut self) -> Result<(), ModuleError> {
        let queue = Arc::clone(&self.queue);
        let engine = Arc::clone(&self.engine);
        let tracker = Arc::clone(&self.tracker);
        let ctx = self.ctx.clone();
        let budget = Duration::from_millis(self.ctx.config.engine.call_budget_ms);

        let handle = std::thread::Builder::new()
            .name("engine-worker".into())
            .spawn(move || worker_loop(&queue, &engine, &tracker, &ctx, budget))
            .map_err(|e| ModuleError::critical(NAME, format!("failed to spawn engine worker: {e}")))?;
        self.worker = Some(handle);
        Ok(())
    }

    fn stop_worker(&mut self) {
        self.discard_pending();
        self.queue.close();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("engine: worker thread panicked");
            }
        }
    }
}

fn worker_loop(
    queue: &BoundedQueue<AnalysisJob>,
    engine: &Mutex<Box<dyn AnalysisEngine>>,
    tracker: &WorkTracker,
    ctx: &ModuleContext,
    budget: Duration,
) {
    loop {
        let Some(job) = queue.pop_timeout(WORKER_POLL) else {
            if queue.is_closed() {
                break;
            }
            continue;
        };

        if !tracker.faulted.load(Ordering::Acquire) {
            let started = Instant::now();
            let result = catch_unwind(AssertUnwindSafe(|| {
                lock(engine).analyze(&job.samples, &job.session, job.sequence)
            }))
            .unwrap_or_else(|_| Err(EngineError::Crashed("engine panicked during analysis".into())));
            let elapsed = started.elapsed();
            if elapsed > budget {
                debug!(
                    "engine: frame {} took {:.1} ms (budget {} ms)",
                    job.sequence,
                    elapsed.as_secs_f64() * 1_000.0,
                    budget.as_millis()
                );
            }

            match result {
                Ok(analysis) => {
                    tracker.analyzed.fetch_add(1, Ordering::Relaxed);
                    ctx.publish(
                        NAME,
                        topics::ENGINE_ANALYSIS,
                        serde_json::to_value(&analysis).unwrap_or(Value::Null),
                    );
                    *lock(&tracker.last) = Some(analysis);
                }
                Err(err) => {
                    tracker.failed.fetch_add(1, Ordering::Relaxed);
                    let critical = err.is_critical();
                    if critical {
                        tracker.faulted.store(true, Ordering::Release);
                    }
                    warn!(
                        "engine: [{}] frame {} failed: {err}",
                        job.session.session_id, job.sequence
                    );
                    ctx.publish(
                        NAME,
                        topics::ENGINE_ERROR,
                        json!({
                            "code": err.code(),
                            "message": err.to_string(),
                            "critical": critical,
                            "sessionId": job.session.session_id,
                            "sequence": job.sequence,
                        }),
                    );
                }
            }
        }
        tracker.finish(1);
    }
    debug!("engine: worker exiting");
}

#[async_trait]
impl AudioModule for EngineManager {
    fn name(&self) -> ModuleName {
        NAME
    }

    async fn initialize(&mut self) -> Result<(), ModuleError> {
        if self.initialized {
            return Ok(());
        }

        let engine = Arc::clone(&self.engine);
        let loaded = tokio::task::spawn_blocking(move || {
            let mut engine = lock(&engine);
            let name = engine.name().to_string();
            engine.load().map(|features| (name, features))
        })
        .await
        .map_err(|e| ModuleError::critical(NAME, format!("engine warm-up task failed: {e}")))?;

        let features = match loaded {
            Ok((name, features)) => {
                info!("engine: `{name}` loaded ({features:?})");
                features
            }
            Err(err) if self.ctx.config.engine.allow_fallback => {
                warn!("engine: load failed ({err}), falling back to builtin engine");
                let mut builtin = BuiltinEngine::new();
                let features = builtin
                    .load()
                    .map_err(|e| ModuleError::critical(NAME, e.to_string()))?;
                *lock(&self.engine) = Box::new(builtin);
                self.fallback_active = true;
                self.ctx.publish(
                    NAME,
                    topics::ENGINE_FALLBACK,
                    json!({ "code": err.code(), "reason": err.to_string(), "engine": "builtin" }),
                );
                features
            }
            Err(err) => return Err(ModuleError::critical(NAME, err.to_string())),
        };

        if let Some(reference) = &self.reference {
            if let Err(e) = lock(&self.engine).load_reference(reference) {
                warn!("engine: could not restore master call `{}`: {e}", reference.call_id);
            }
        }

        self.features = Some(features);
        self.tracker.faulted.store(false, Ordering::Release);
        self.queue.reopen();
        self.spawn_worker()?;
        self.initialized = true;
        Ok(())
    }

    fn reset(&mut self) {
        self.stop_worker();
        self.features = None;
        self.initialized = false;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn describe(&self) -> Value {
        json!({
            "engine": self.engine_name(),
            "fallbackActive": self.fallback_active,
            "features": self.features,
            "sessionId": self.session.as_ref().map(|s| s.session_id.clone()),
            "queued": self.queued(),
            "dropped": self.dropped(),
            "analyzed": self.tracker.analyzed.load(Ordering::Relaxed),
            "failed": self.tracker.failed.load(Ordering::Relaxed),
            "faulted": self.is_faulted(),
            "lastAnalysis": self.last_analysis(),
        })
    }
}

impl Drop for EngineManager {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::queue::BackpressurePolicy;
    use crate::config::{EngineConfig, PipelineConfig};
    use crate::modules::engine::MockEngine;
    use crate::modules::{test_context, test_context_with};

    fn session() -> SessionContext {
        SessionContext {
            session_id: "hm-session-1".into(),
            sample_rate: 48_000,
            channels: 1,
        }
    }

    fn record(ctx: &ModuleContext, topic: &str) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        ctx.bus
            .subscribe(topic, move |e| sink.lock().unwrap().push(e.payload.clone()));
        seen
    }

    #[tokio::test]
    async fn analyses_flow_through_the_worker() {
        let ctx = test_context();
        let analyses = record(&ctx, topics::ENGINE_ANALYSIS);
        let mock = MockEngine::ok();
        let mut manager = EngineManager::new(ctx, Some(Box::new(mock.clone())));
        manager.initialize().await.unwrap();
        assert_eq!(mock.loads.load(Ordering::SeqCst), 1);

        manager.begin_session(session());
        assert_eq!(manager.submit(&[0.1; 64], 0), Some(PushOutcome::Queued));
        assert_eq!(manager.submit(&[0.1; 64], 1), Some(PushOutcome::Queued));
        assert!(manager.flush(Duration::from_secs(5)));

        let seen = analyses.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1]["sequence"], 1);
        assert_eq!(seen[0]["sessionId"], "hm-session-1");
    }

    #[tokio::test]
    async fn submit_without_session_is_ignored() {
        let mut manager = EngineManager::new(test_context(), Some(Box::new(MockEngine::ok())));
        manager.initialize().await.unwrap();
        assert_eq!(manager.submit(&[0.1; 64], 0), None);
    }

    #[tokio::test]
    async fn failed_load_falls_back_to_builtin() {
        let ctx = test_context();
        let fallbacks = record(&ctx, topics::ENGINE_FALLBACK);
        let mut manager = EngineManager::new(
            ctx,
            Some(Box::new(MockEngine::failing_load(EngineError::LoadFailed("no dsp".into())))),
        );
        manager.initialize().await.unwrap();
        assert!(manager.fallback_active());
        assert_eq!(manager.engine_name(), "builtin");
        assert_eq!(fallbacks.lock().unwrap()[0]["code"], "ENGINE_LOAD_FAILED");
    }

    #[tokio::test]
    async fn failed_load_without_fallback_is_critical() {
        let ctx = test_context_with(PipelineConfig {
            engine: EngineConfig {
                allow_fallback: false,
                ..EngineConfig::default()
            },
            ..PipelineConfig::default()
        });
        let mut manager = EngineManager::new(
            ctx,
            Some(Box::new(MockEngine::failing_load(EngineError::LoadFailed("no dsp".into())))),
        );
        let err = manager.initialize().await.unwrap_err();
        assert!(err.critical);
        assert!(!manager.is_initialized());
    }

    #[tokio::test]
    async fn critical_error_parks_worker_until_reinitialized() {
        let ctx = test_context();
        let errors = record(&ctx, topics::ENGINE_ERROR);
        let mock = MockEngine::failing_analyze(EngineError::Crashed("dsp fault".into()));
        let mut manager = EngineManager::new(ctx, Some(Box::new(mock.clone())));
        manager.initialize().await.unwrap();
        manager.begin_session(session());

        manager.submit(&[0.1; 64], 0);
        assert!(manager.flush(Duration::from_secs(5)));
        assert!(manager.is_faulted());
        assert_eq!(errors.lock().unwrap()[0]["critical"], true);
        assert_eq!(manager.submit(&[0.1; 64], 1), None);

        mock.heal();
        manager.reset();
        manager.initialize().await.unwrap();
        assert!(!manager.is_faulted());
        assert_eq!(manager.submit(&[0.1; 64], 2), Some(PushOutcome::Queued));
        assert!(manager.flush(Duration::from_secs(5)));
        assert_eq!(mock.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn full_queue_applies_backpressure() {
        let ctx = test_context_with(PipelineConfig {
            engine: EngineConfig {
                queue_capacity: 2,
                backpressure: BackpressurePolicy::DropNewest,
                ..EngineConfig::default()
            },
            ..PipelineConfig::default()
        });
        let backpressure = record(&ctx, topics::ENGINE_BACKPRESSURE);
        let mock = MockEngine::ok().with_delay(Duration::from_millis(30));
        let mut manager = EngineManager::new(ctx, Some(Box::new(mock)));
        manager.initialize().await.unwrap();
        manager.begin_session(session());

        for seq in 0..10 {
            manager.submit(&[0.1; 64], seq);
        }
        assert!(manager.dropped() >= 7, "dropped {}", manager.dropped());
        assert!(!backpressure.lock().unwrap().is_empty());
        assert!(manager.flush(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn flush_timeout_discards_pending_work() {
        let mock = MockEngine::ok().with_delay(Duration::from_millis(200));
        let mut manager = EngineManager::new(test_context(), Some(Box::new(mock)));
        manager.initialize().await.unwrap();
        manager.begin_session(session());
        for seq in 0..4 {
            manager.submit(&[0.1; 64], seq);
        }
        assert!(!manager.flush(Duration::from_millis(10)));
        assert_eq!(manager.queued(), 0);
    }

    #[tokio::test]
    async fn end_session_reaches_the_engine() {
        let mock = MockEngine::ok();
        let mut manager = EngineManager::new(test_context(), Some(Box::new(mock.clone())));
        manager.initialize().await.unwrap();
        manager.begin_session(session());
        manager.end_session();
        manager.end_session();
        assert_eq!(*mock.ended_sessions.lock().unwrap(), vec!["hm-session-1".to_string()]);
    }
}
