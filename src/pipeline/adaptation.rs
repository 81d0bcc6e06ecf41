//! Performance-driven mitigation with hysteresis.
//!
//! Each performance sample is either a breach (`value > threshold`) or not.
//! A breach applies exactly one mitigation, trying in order:
//!
//! 1. bypass the next stage from `bypassPriority`
//! 2. halve the frame size, not below `minFrameSize`
//! 3. halve the monitoring sample rate, not below `minMonitorSampleRate`
//!
//! Applied mitigations form a stack.  After `recoverySamples` consecutive
//! samples at or below `threshold × hysteresisRatio` the most recent one is
//! reverted and the streak starts over.  Any sample above that level resets
//! the streak.
//!
//! The [`Adapter`] only decides; the orchestrator applies the result.

use serde::Serialize;
use serde_json::Value;

use super::stages::{Pipeline, StageKind};
use crate::config::PerformanceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mitigation {
    BypassStage { stage: StageKind },
    FrameSize { from: usize, to: usize },
    MonitorSampleRate { from: u32, to: u32 },
}

/// One timing observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSample {
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
}

impl PerformanceSample {
    pub fn new(metric: impl Into<String>, value: f64, threshold: f64) -> Self {
        Self {
            metric: metric.into(),
            value,
            threshold,
        }
    }

    /// Parse `{ metric, value, threshold }`; `None` when a field is missing
    /// or has the wrong type.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        Some(Self {
            metric: payload.get("metric")?.as_str()?.to_string(),
            value: payload.get("value")?.as_f64()?,
            threshold: payload.get("threshold")?.as_f64()?,
        })
    }

    pub fn breached(&self) -> bool {
        self.value > self.threshold
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdaptationOutcome {
    Applied { mitigation: Mitigation },
    Reverted { mitigation: Mitigation },
    /// Breach, but every mitigation is already at its limit.
    Exhausted,
    Unchanged,
}

/// Knob values the decision is based on.
#[derive(Debug, Clone, Copy)]
pub struct Knobs<'a> {
    pub pipeline: &'a Pipeline,
    pub frame_size: usize,
    pub monitor_sample_rate: u32,
}

#[derive(Debug, Clone)]
pub struct Adapter {
    priority: Vec<StageKind>,
    min_frame_size: usize,
    min_monitor_sample_rate: u32,
    hysteresis_ratio: f64,
    recovery_samples: u32,
    applied: Vec<Mitigation>,
    nominal_streak: u32,
}

impl Adapter {
    pub fn new(cfg: &PerformanceConfig) -> Self {
        Self {
            priority: cfg.bypass_priority.clone(),
            min_frame_size: cfg.min_frame_size,
            min_monitor_sample_rate: cfg.min_monitor_sample_rate,
            hysteresis_ratio: cfg.hysteresis_ratio,
            recovery_samples: cfg.recovery_samples.max(1),
            applied: Vec::new(),
            nominal_streak: 0,
        }
    }

    /// Mitigations in effect, oldest first.
    pub fn applied(&self) -> &[Mitigation] {
        &self.applied
    }

    pub fn reset(&mut self) {
        self.applied.clear();
        self.nominal_streak = 0;
    }

    pub fn evaluate(&mut self, sample: &PerformanceSample, knobs: Knobs<'_>) -> AdaptationOutcome {
        if sample.breached() {
            self.nominal_streak = 0;
            return match self.next_mitigation(knobs) {
                Some(mitigation) => {
                    self.applied.push(mitigation);
                    AdaptationOutcome::Applied { mitigation }
                }
                None => AdaptationOutcome::Exhausted,
            };
        }

        if sample.value > sample.threshold * self.hysteresis_ratio {
            self.nominal_streak = 0;
            return AdaptationOutcome::Unchanged;
        }

        self.nominal_streak += 1;
        if self.nominal_streak < self.recovery_samples {
            return AdaptationOutcome::Unchanged;
        }
        self.nominal_streak = 0;
        match self.applied.pop() {
            Some(mitigation) => AdaptationOutcome::Reverted { mitigation },
            None => AdaptationOutcome::Unchanged,
        }
    }

    fn next_mitigation(&self, knobs: Knobs<'_>) -> Option<Mitigation> {
        if let Some(stage) = knobs.pipeline.next_bypass_candidate(&self.priority) {
            return Some(Mitigation::BypassStage { stage });
        }
        let half = knobs.frame_size / 2;
        if half >= self.min_frame_size {
            return Some(Mitigation::FrameSize {
                from: knobs.frame_size,
                to: half,
            });
        }
        let half = knobs.monitor_sample_rate / 2;
        if half >= self.min_monitor_sample_rate {
            return Some(Mitigation::MonitorSampleRate {
                from: knobs.monitor_sample_rate,
                to: half,
            });
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
