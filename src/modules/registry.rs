//! Total mapping from [`ModuleName`] to live module instances.
//!
//! Each module is a typed field, so a registry without one of the eleven
//! modules cannot be built.  Lookups by name hand out trait objects; the
//! orchestrator uses the typed accessors for module-specific operations.

use super::{
    AnalysisEngine, AudioModule, CallLibraryManager, CallSource, CaptureGraphManager,
    EngineManager, EventManager, FormatConverter, FrameStage, GainController, LevelMonitor,
    ModuleContext, ModuleName, NoiseDetector, PerformanceMonitor, QualityAssessor,
    RecordingEnhancer,
};
use crate::pipeline::stages::StageKind;

pub struct ModuleRegistry {
    pub event_manager: EventManager,
    pub engine_manager: EngineManager,
    pub level_monitor: LevelMonitor,
    pub noise_detector: NoiseDetector,
    pub gain_controller: GainController,
    pub quality_assessor: QualityAssessor,
    pub performance_monitor: PerformanceMonitor,
    pub call_library_manager: CallLibraryManager,
    pub recording_enhancer: RecordingEnhancer,
    pub format_converter: FormatConverter,
    pub capture_graph_manager: CaptureGraphManager,
}

impl ModuleRegistry {
    /// Construct every module with the shared context.  No I/O happens here.
    pub fn new(
        ctx: &ModuleContext,
        engine: Option<Box<dyn AnalysisEngine>>,
        call_source: Option<Box<dyn CallSource>>,
    ) -> Self {
        Self {
            event_manager: EventManager::new(ctx.clone()),
            engine_manager: EngineManager::new(ctx.clone(), engine),
            level_monitor: LevelMonitor::new(ctx.clone()),
            noise_detector: NoiseDetector::new(ctx.clone()),
            gain_controller: GainController::new(ctx.clone()),
            quality_assessor: QualityAssessor::new(ctx.clone()),
            performance_monitor: PerformanceMonitor::new(ctx.clone()),
            call_library_manager: CallLibraryManager::new(ctx.clone(), call_source),
            recording_enhancer: RecordingEnhancer::new(ctx.clone()),
            format_converter: FormatConverter::new(ctx.clone()),
            capture_graph_manager: CaptureGraphManager::new(ctx.clone()),
        }
    }

    pub fn names(&self) -> [ModuleName; 11] {
        ModuleName::ALL
    }

    pub fn get(&self, name: ModuleName) -> &dyn AudioModule {
        match name {
            ModuleName::EventManager => &self.event_manager,
            ModuleName::EngineManager => &self.engine_manager,
            ModuleName::LevelMonitor => &self.level_monitor,
            ModuleName::NoiseDetector => &self.noise_detector,
            ModuleName::GainController => &self.gain_controller,
            ModuleName::QualityAssessor => &self.quality_assessor,
            ModuleName::PerformanceMonitor => &self.performance_monitor,
            ModuleName::CallLibraryManager => &self.call_library_manager,
            ModuleName::RecordingEnhancer => &self.recording_enhancer,
            ModuleName::FormatConverter => &self.format_converter,
            ModuleName::CaptureGraphManager => &self.capture_graph_manager,
        }
    }

    pub fn get_mut(&mut self, name: ModuleName) -> &mut dyn AudioModule {
        match name {
            ModuleName::EventManager => &mut self.event_manager,
            ModuleName::EngineManager => &mut self.engine_manager,
            ModuleName::LevelMonitor => &mut self.level_monitor,
            ModuleName::NoiseDetector => &mut self.noise_detector,
            ModuleName::GainController => &mut self.gain_controller,
            ModuleName::QualityAssessor => &mut self.quality_assessor,
            ModuleName::PerformanceMonitor => &mut self.performance_monitor,
            ModuleName::CallLibraryManager => &mut self.call_library_manager,
            ModuleName::RecordingEnhancer => &mut self.recording_enhancer,
            ModuleName::FormatConverter => &mut self.format_converter,
            ModuleName::CaptureGraphManager => &mut self.capture_graph_manager,
        }
    }

    pub fn stage_mut(&mut self, stage: StageKind) -> &mut dyn FrameStage {
        match stage {
            StageKind::Level => &mut self.level_monitor,
            StageKind::Noise => &mut self.noise_detector,
            StageKind::Gain => &mut self.gain_controller,
            StageKind::Quality => &mut self.quality_assessor,
        }
    }

    /// Reset every module in reverse initialization order.
    pub fn reset_all(&mut self) {
        for name in ModuleName::ALL.into_iter().rev() {
            self.get_mut(name).reset();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::test_context;

    #[test]
    fn every_name_resolves_to_its_module() {
        let registry = ModuleRegistry::new(&test_context(), None, None);
        for name in registry.names() {
            assert_eq!(registry.get(name).name(), name);
        }
    }

    #[test]
    fn stages_resolve_to_stage_modules() {
        let mut registry = ModuleRegistry::new(&test_context(), None, None);
        for stage in StageKind::DEFAULT_ORDER {
            assert_eq!(registry.stage_mut(stage).name(), stage.module());
        }
    }

    #[tokio::test]
    async fn reset_all_clears_initialization() {
        let mut registry = ModuleRegistry::new(&test_context(), None, None);
        for name in ModuleName::ALL {
            registry.get_mut(name).initialize().await.unwrap();
        }
        assert!(ModuleName::ALL.iter().all(|&n| registry.get(n).is_initialized()));
        registry.reset_all();
        assert!(ModuleName::ALL.iter().all(|&n| !registry.get(n).is_initialized()));
    }
}
