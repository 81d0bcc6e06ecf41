//! Pipeline timing against the real-time budget.
//!
//! The orchestrator reports how long each frame took (in total and per
//! stage).  Every `evaluate_every` frames the mean over the last
//! `window_frames` is compared with the budget, `frame duration ×
//! budget_ratio`, and the verdict is published as
//! `performance-threshold-breached` or `performance-nominal` with the
//! payload `{ metric, value, threshold }`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use log::warn;
use serde::Serialize;
use serde_json::{json, Value};

use super::{AudioModule, ModuleContext, ModuleError, ModuleName};
use crate::audio::RingBuffer;
use crate::events::topics;
use crate::pipeline::stages::StageKind;

/// Metric name carried by performance events.
pub const FRAME_PROCESSING_METRIC: &str = "frame_processing_ms";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageStats {
    pub calls: u64,
    pub mean_ms: f64,
    pub max_ms: f64,
}

/// One evaluation of the timing window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    pub metric: &'static str,
    /// Mean processing time over the window.
    pub value: f64,
    /// Budget the mean is compared with.
    pub threshold: f64,
    pub max_ms: f64,
    pub breached: bool,
}

pub struct PerformanceMonitor {
    ctx: ModuleContext,
    window: RingBuffer<f64>,
    frames_since_eval: usize,
    stages: BTreeMap<StageKind, StageStats>,
    last_report: Option<PerformanceReport>,
    breaches: u64,
    initialized: bool,
}

impl PerformanceMonitor {
    pub fn new(ctx: ModuleContext) -> Self {
        let window = RingBuffer::new(ctx.config.performance.window_frames);
        Self {
            ctx,
            window,
            frames_since_eval: 0,
            stages: BTreeMap::new(),
            last_report: None,
            breaches: 0,
            initialized: false,
        }
    }

    /// Record one frame; returns a report on evaluation frames.
    pub fn record_frame(
        &mut self,
        total_ms: f64,
        frame_duration_ms: f64,
        stage_timings: &[(StageKind, f64)],
    ) -> Option<PerformanceReport> {
        for &(stage, ms) in stage_timings {
            let stats = self.stages.entry(stage).or_default();
            stats.calls += 1;
            stats.mean_ms += (ms - stats.mean_ms) / stats.calls as f64;
            stats.max_ms = stats.max_ms.max(ms);
        }

        self.window.push(total_ms);
        self.frames_since_eval += 1;
        if self.frames_since_eval < self.ctx.config.performance.evaluate_every {
            return None;
        }
        self.frames_since_eval = 0;

        let report = PerformanceReport {
            metric: FRAME_PROCESSING_METRIC,
            value: self.window.mean().unwrap_or(0.0),
            threshold: frame_duration_ms * self.ctx.config.performance.budget_ratio,
            max_ms: self.window.max().unwrap_or(0.0),
            breached: false,
        };
        let report = PerformanceReport {
            breached: report.value > report.threshold,
            ..report
        };

        let payload = json!({
            "metric": report.metric,
            "value": report.value,
            "threshold": report.threshold,
            "maxMs": report.max_ms,
        });
        if report.breached {
            self.breaches += 1;
            warn!(
                "performance: {:.2} ms mean exceeds {:.2} ms budget",
                report.value, report.threshold
            );
            self.ctx.publish(
                ModuleName::PerformanceMonitor,
                topics::PERFORMANCE_THRESHOLD_BREACHED,
                payload,
            );
        } else {
            self.ctx.publish(ModuleName::PerformanceMonitor, topics::PERFORMANCE_NOMINAL, payload);
        }
        self.last_report = Some(report.clone());
        Some(report)
    }

    pub fn stage_stats(&self) -> &BTreeMap<StageKind, StageStats> {
        &self.stages
    }

    pub fn last_report(&self) -> Option<&PerformanceReport> {
        self.last_report.as_ref()
    }
}

#[async_trait]
impl AudioModule for PerformanceMonitor {
    fn name(&self) -> ModuleName {
        ModuleName::PerformanceMonitor
    }

    async fn initialize(&mut self) -> Result<(), ModuleError> {
        self.initialized = true;
        Ok(())
    }

    fn reset(&mut self) {
        self.window.clear();
        self.frames_since_eval = 0;
        self.stages.clear();
        self.last_report = None;
        self.breaches = 0;
        self.initialized = false;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn describe(&self) -> Value {
        json!({
            "lastReport": self.last_report,
            "breaches": self.breaches,
            "stages": self.stages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PerformanceConfig, PipelineConfig};
    use crate::modules::test_context_with;
    use std::sync::{Arc, Mutex};

    fn monitor(evaluate_every: usize) -> (PerformanceMonitor, Arc<Mutex<Vec<String>>>) {
        let ctx = test_context_with(PipelineConfig {
            performance: PerformanceConfig {
                window_frames: 4,
                evaluate_every,
                ..PerformanceConfig::default()
            },
            ..PipelineConfig::default()
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        for topic in [topics::PERFORMANCE_THRESHOLD_BREACHED, topics::PERFORMANCE_NOMINAL] {
            let sink = Arc::clone(&seen);
            ctx.bus
                .subscribe(topic, move |e| sink.lock().unwrap().push(e.topic.clone()));
        }
        (PerformanceMonitor::new(ctx), seen)
    }

    #[test]
    fn evaluates_every_n_frames() {
        let (mut pm, seen) = monitor(2);
        assert!(pm.record_frame(1.0, 10.0, &[]).is_none());
        let report = pm.record_frame(1.0, 10.0, &[]).unwrap();
        assert!(!report.breached);
        assert_eq!(report.threshold, 5.0);
        assert_eq!(*seen.lock().unwrap(), vec![topics::PERFORMANCE_NOMINAL.to_string()]);
    }

    #[test]
    fn slow_frames_breach_the_budget() {
        let (mut pm, seen) = monitor(1);
        let report = pm.record_frame(8.0, 10.0, &[]).unwrap();
        assert!(report.breached);
        assert_eq!(report.value, 8.0);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![topics::PERFORMANCE_THRESHOLD_BREACHED.to_string()]
        );
        assert_eq!(pm.describe()["breaches"], 1);
    }

    #[test]
    fn window_mean_forgets_old_frames() {
        let (mut pm, _) = monitor(1);
        pm.record_frame(100.0, 10.0, &[]);
        for _ in 0..4 {
            pm.record_frame(1.0, 10.0, &[]);
        }
        assert!(!pm.last_report().unwrap().breached);
    }

    #[test]
    fn stage_stats_track_mean_and_max() {
        let (mut pm, _) = monitor(10);
        pm.record_frame(3.0, 10.0, &[(StageKind::Level, 1.0), (StageKind::Gain, 2.0)]);
        pm.record_frame(3.0, 10.0, &[(StageKind::Level, 3.0)]);
        let level = pm.stage_stats()[&StageKind::Level];
        assert_eq!(level.calls, 2);
        assert!((level.mean_ms - 2.0).abs() < 1e-9);
        assert_eq!(level.max_ms, 3.0);
        assert_eq!(pm.stage_stats()[&StageKind::Gain].calls, 1);
    }
}
