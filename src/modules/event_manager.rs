//! Registry entry for the event bus.
//!
//! The bus itself is created before any other module and shared through
//! [`ModuleContext`]; this wrapper gives it a lifecycle and a status like
//! every other module.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{AudioModule, ModuleContext, ModuleError, ModuleName};
use crate::events::BusStats;

pub struct EventManager {
    ctx: ModuleContext,
    initialized: bool,
}

impl EventManager {
    pub fn new(ctx: ModuleContext) -> Self {
        Self {
            ctx,
            initialized: false,
        }
    }

    pub fn stats(&self) -> BusStats {
        self.ctx.bus.stats()
    }
}

#[async_trait]
impl AudioModule for EventManager {
    fn name(&self) -> ModuleName {
        ModuleName::EventManager
    }

    async fn initialize(&mut self) -> Result<(), ModuleError> {
        self.initialized = true;
        Ok(())
    }

    /// Refills the rate limiters and zeroes the counters.  Subscriptions
    /// belong to their owners and are left alone.
    fn reset(&mut self) {
        self.ctx.bus.reset();
        self.initialized = false;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn describe(&self) -> Value {
        json!({
            "stats": self.stats(),
            "ratePerSec": self.ctx.config.events.rate_per_sec,
            "burst": self.ctx.config.events.burst,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::test_context;

    #[tokio::test]
    async fn reset_zeroes_stats_but_keeps_subscriptions() {
        let ctx = test_context();
        let mut manager = EventManager::new(ctx.clone());
        manager.initialize().await.unwrap();
        ctx.bus.subscribe("t", |_| {});
        ctx.bus.publish("t", None, Value::Null);
        assert_eq!(manager.stats().published, 1);

        manager.reset();
        assert!(!manager.is_initialized());
        let stats = manager.stats();
        assert_eq!(stats.published, 0);
        assert_eq!(stats.subscriptions, 1);
        assert_eq!(manager.describe()["stats"]["subscriptions"], 1);
    }
}
