//! Fault normalization, module health and the retry loop used to recover
//! critical faults.
//!
//! ```text
//! ModuleError / engine-error / capture-error ──► ModuleErrorReport
//!     non-critical ──► HealthBook::degrade
//!     critical     ──► recover(): reset → initialize, backoff ×2 between tries
//!                        ├─ Ok  → HealthBook::heal
//!                        └─ Err → HealthBook::fail
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;

use crate::config::RecoveryConfig;
use crate::modules::{AudioModule, ModuleError, ModuleHealth, ModuleName};

// ---------------------------------------------------------------------------
// ModuleErrorReport
// ---------------------------------------------------------------------------

/// A module fault in the shape recovery works with.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleErrorReport {
    pub module: ModuleName,
    pub error: String,
    pub critical: bool,
    /// Stable error code when the module provides one.
    pub code: Option<String>,
}

impl ModuleErrorReport {
    pub fn new(module: ModuleName, error: impl Into<String>, critical: bool) -> Self {
        Self {
            module,
            error: error.into(),
            critical,
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl From<ModuleError> for ModuleErrorReport {
    fn from(e: ModuleError) -> Self {
        Self::new(e.module, e.message, e.critical)
    }
}

/// What `handle_module_error` did with a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Logged and marked degraded; the session continues.
    Degraded,
    /// The capture graph switched to its scripted input.
    CaptureFallback,
    Recovered { attempts: u32 },
    Failed { attempts: u32 },
    /// The orchestrator was cleaned up; nothing was touched.
    Rejected,
}

// ---------------------------------------------------------------------------
// HealthBook
// ---------------------------------------------------------------------------

/// Health of every module; absent means healthy.
#[derive(Debug, Clone, Default)]
pub struct HealthBook {
    entries: BTreeMap<ModuleName, ModuleHealth>,
}

impl HealthBook {
    pub fn health(&self, module: ModuleName) -> ModuleHealth {
        self.entries
            .get(&module)
            .cloned()
            .unwrap_or(ModuleHealth::Healthy)
    }

    /// Mark degraded unless already failed.
    pub fn degrade(&mut self, module: ModuleName, reason: impl Into<String>) {
        if !matches!(self.entries.get(&module), Some(ModuleHealth::Failed(_))) {
            self.entries.insert(module, ModuleHealth::Degraded(reason.into()));
        }
    }

    pub fn fail(&mut self, module: ModuleName, reason: impl Into<String>) {
        self.entries.insert(module, ModuleHealth::Failed(reason.into()));
    }

    pub fn heal(&mut self, module: ModuleName) {
        self.entries.remove(&module);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn degraded(&self) -> Vec<ModuleName> {
        self.matching(|h| matches!(h, ModuleHealth::Degraded(_)))
    }

    pub fn failed(&self) -> Vec<ModuleName> {
        self.matching(|h| matches!(h, ModuleHealth::Failed(_)))
    }

    fn matching(&self, pred: impl Fn(&ModuleHealth) -> bool) -> Vec<ModuleName> {
        self.entries
            .iter()
            .filter(|(_, h)| pred(h))
            .map(|(&m, _)| m)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Retry loop
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RecoveryPolicy {
    pub fn from_config(cfg: &RecoveryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            backoff: Duration::from_millis(cfg.backoff_ms),
        }
    }

    /// Wait before attempt `attempt` (1-based): none before the first, then
    /// `backoff`, `2 × backoff`, `4 × backoff`, …
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1_u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryFailure {
    pub attempts: u32,
    pub last_error: String,
}

/// Reset and reinitialize `module` until it comes up or the policy is
/// exhausted.  Returns the number of attempts used.
pub async fn recover(module: &mut dyn AudioModule, policy: RecoveryPolicy) -> Result<u32, RecoveryFailure> {
    let name = module.name();
    let mut last_error = String::new();
    for attempt in 1..=policy.max_attempts {
        let delay = policy.delay_before(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        module.reset();
        match module.initialize().await {
            Ok(()) => {
                info!("recovery: {name} recovered on attempt {attempt}");
                return Ok(attempt);
            }
            Err(e) => {
                warn!(
                    "recovery: {name} attempt {attempt}/{} failed: {}",
                    policy.max_attempts, e.message
                );
                last_error = e.message;
            }
        }
    }
    Err(RecoveryFailure {
        attempts: policy.max_attempts,
        last_error,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::library::FlakySource;
    use crate::modules::{test_context, CallLibraryManager};

    fn policy(max_attempts: u32) -> RecoveryPolicy {
        RecoveryPolicy {
            max_attempts,
            backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn backoff_doubles() {
        let p = RecoveryPolicy {
            max_attempts: 4,
            backoff: Duration::from_millis(100),
        };
        let delays: Vec<u128> = (1..=4).map(|a| p.delay_before(a).as_millis()).collect();
        assert_eq!(delays, vec![0, 100, 200, 400]);
    }

    #[test]
    fn huge_attempt_numbers_saturate() {
        let p = policy(1);
        assert_eq!(p.delay_before(200), Duration::from_millis(1).saturating_mul(u32::MAX));
    }

    #[test]
    fn report_from_module_error() {
        let report: ModuleErrorReport = ModuleError::critical(ModuleName::EngineManager, "crashed").into();
        assert_eq!(report.module, ModuleName::EngineManager);
        assert!(report.critical);
        assert_eq!(report.code, None);
    }

    #[test]
    fn failed_modules_are_not_downgraded_to_degraded() {
        let mut book = HealthBook::default();
        book.fail(ModuleName::EngineManager, "gone");
        book.degrade(ModuleName::EngineManager, "slow");
        book.degrade(ModuleName::LevelMonitor, "slow");
        assert_eq!(book.failed(), vec![ModuleName::EngineManager]);
        assert_eq!(book.degraded(), vec![ModuleName::LevelMonitor]);
        book.heal(ModuleName::EngineManager);
        assert_eq!(book.health(ModuleName::EngineManager), ModuleHealth::Healthy);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let mut library = CallLibraryManager::new(test_context(), Some(Box::new(FlakySource::new(2))));
        assert_eq!(recover(&mut library, policy(3)).await, Ok(3));
        assert!(library.is_initialized());
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let mut library = CallLibraryManager::new(test_context(), Some(Box::new(FlakySource::new(5))));
        let failure = recover(&mut library, policy(3)).await.unwrap_err();
        assert_eq!(failure.attempts, 3);
        assert!(failure.last_error.contains("storage offline"));
        assert!(!library.is_initialized());
    }
}
