//! The ordered list of per-frame stages and their runtime bypass state.
//!
//! Bypassing a stage never reorders the survivors.  Every change publishes
//! a fresh `Arc<[StageKind]>` snapshot; a frame admitted before the change
//! keeps running on the snapshot it was given.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::modules::ModuleName;

// ---------------------------------------------------------------------------
// StageKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Level,
    Noise,
    Gain,
    Quality,
}

impl StageKind {
    pub const DEFAULT_ORDER: [StageKind; 4] =
        [StageKind::Level, StageKind::Noise, StageKind::Gain, StageKind::Quality];

    /// Module implementing this stage.
    pub fn module(self) -> ModuleName {
        match self {
            Self::Level => ModuleName::LevelMonitor,
            Self::Noise => ModuleName::NoiseDetector,
            Self::Gain => ModuleName::GainController,
            Self::Quality => ModuleName::QualityAssessor,
        }
    }

    /// Inverse of [`module`](Self::module).
    pub fn for_module(name: ModuleName) -> Option<StageKind> {
        Self::DEFAULT_ORDER.into_iter().find(|s| s.module() == name)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Level => "level",
            Self::Noise => "noise",
            Self::Gain => "gain",
            Self::Quality => "quality",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Why a stage is currently skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassReason {
    /// Shed to stay within the timing budget.
    Performance,
    /// The stage's module is degraded or recovering.
    Fault,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    order: Vec<StageKind>,
    bypassed: BTreeMap<StageKind, BypassReason>,
    snapshot: Arc<[StageKind]>,
}

impl Pipeline {
    pub fn new(order: &[StageKind]) -> Self {
        Self {
            order: order.to_vec(),
            bypassed: BTreeMap::new(),
            snapshot: order.into(),
        }
    }

    /// Active stages, in configured order.  Cheap to clone.
    pub fn snapshot(&self) -> Arc<[StageKind]> {
        Arc::clone(&self.snapshot)
    }

    /// Full configured order, including bypassed stages.
    pub fn order(&self) -> &[StageKind] {
        &self.order
    }

    pub fn is_bypassed(&self, stage: StageKind) -> bool {
        self.bypassed.contains_key(&stage)
    }

    pub fn bypassed(&self) -> &BTreeMap<StageKind, BypassReason> {
        &self.bypassed
    }

    /// Skip `stage`.  Returns `false` if it is not part of the pipeline or is
    /// already bypassed.
    pub fn bypass(&mut self, stage: StageKind, reason: BypassReason) -> bool {
        if !self.order.contains(&stage) || self.bypassed.contains_key(&stage) {
            return false;
        }
        self.bypassed.insert(stage, reason);
        self.rebuild();
        true
    }

    /// Re-enable `stage` if it was bypassed for `reason`.
    pub fn restore(&mut self, stage: StageKind, reason: BypassReason) -> bool {
        if self.bypassed.get(&stage) != Some(&reason) {
            return false;
        }
        self.bypassed.remove(&stage);
        self.rebuild();
        true
    }

    /// First stage of `priority` that is present and still active.
    pub fn next_bypass_candidate(&self, priority: &[StageKind]) -> Option<StageKind> {
        priority
            .iter()
            .copied()
            .find(|s| self.order.contains(s) && !self.is_bypassed(*s))
    }

    /// Drop every bypass.
    pub fn restore_all(&mut self) {
        self.bypassed.clear();
        self.rebuild();
    }

    fn rebuild(&mut self) {
        self.snapshot = self
            .order
            .iter()
            .copied()
            .filter(|s| !self.bypassed.contains_key(s))
            .collect();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_order_is_level_noise_gain_quality() {
        let p = Pipeline::new(&StageKind::DEFAULT_ORDER);
        assert_eq!(
            &*p.snapshot(),
            &[StageKind::Level, StageKind::Noise, StageKind::Gain, StageKind::Quality]
        );
    }

    #[test]
    fn bypass_keeps_survivor_order() {
        let mut p = Pipeline::new(&StageKind::DEFAULT_ORDER);
        assert!(p.bypass(StageKind::Noise, BypassReason::Performance));
        assert_eq!(&*p.snapshot(), &[StageKind::Level, StageKind::Gain, StageKind::Quality]);
        assert!(!p.bypass(StageKind::Noise, BypassReason::Fault));
    }

    #[test]
    fn old_snapshot_is_unaffected_by_later_changes() {
        let mut p = Pipeline::new(&StageKind::DEFAULT_ORDER);
        let admitted = p.snapshot();
        p.bypass(StageKind::Quality, BypassReason::Performance);
        assert_eq!(admitted.len(), 4);
        assert_eq!(p.snapshot().len(), 3);
    }

    #[test]
    fn restore_requires_matching_reason() {
        let mut p = Pipeline::new(&StageKind::DEFAULT_ORDER);
        p.bypass(StageKind::Gain, BypassReason::Fault);
        assert!(!p.restore(StageKind::Gain, BypassReason::Performance));
        assert!(p.restore(StageKind::Gain, BypassReason::Fault));
        assert_eq!(p.snapshot().len(), 4);
    }

    #[test]
    fn candidate_follows_priority_and_skips_absent_stages() {
        let mut p = Pipeline::new(&[StageKind::Level, StageKind::Noise, StageKind::Gain]);
        let priority = [StageKind::Quality, StageKind::Noise];
        assert_eq!(p.next_bypass_candidate(&priority), Some(StageKind::Noise));
        p.bypass(StageKind::Noise, BypassReason::Performance);
        assert_eq!(p.next_bypass_candidate(&priority), None);
    }

    #[test]
    fn stage_module_mapping_round_trips() {
        for stage in StageKind::DEFAULT_ORDER {
            assert_eq!(StageKind::for_module(stage.module()), Some(stage));
        }
        assert_eq!(StageKind::for_module(ModuleName::FormatConverter), None);
    }
}
