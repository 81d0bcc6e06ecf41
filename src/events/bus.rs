//! Publish/subscribe router shared by every module of one orchestrator.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;

use super::rate_limit::TokenBucket;
use super::topics;
use crate::config::EventConfig;
use crate::modules::ModuleName;

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub topic: String,
    pub payload: Value,
    /// Publishing module, `None` for the orchestrator itself.
    pub source: Option<ModuleName>,
    /// Bus-wide publish order.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
}

/// Subscriber callback.  Must not block; heavy work belongs elsewhere.
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Queued for delivery.
    Accepted,
    /// The topic's token bucket was empty; the event was discarded.
    RateLimited,
}

/// Counters exposed through the event manager's status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub rate_limited: u64,
    pub handler_panics: u64,
    pub subscriptions: usize,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<(SubscriptionId, Handler)>>>,
    limiters: Mutex<HashMap<String, TokenBucket>>,
    unlimited: HashSet<String>,
    rate_per_sec: f64,
    burst: u32,
    pending: Mutex<VecDeque<Event>>,
    dispatching: AtomicBool,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    rate_limited: AtomicU64,
    handler_panics: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EventBus {
    pub fn new(config: &EventConfig) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            limiters: Mutex::new(HashMap::new()),
            unlimited: config.unlimited_topics.iter().cloned().collect(),
            rate_per_sec: config.rate_per_sec,
            burst: config.burst,
            pending: Mutex::new(VecDeque::new()),
            dispatching: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(0),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            handler_panics: AtomicU64::new(0),
        }
    }

    /// Register `handler` for `topic` (or [`topics::WILDCARD`]).
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        debug!("bus: subscription {} on `{topic}`", id.0);
        id
    }

    /// Remove a subscription.  Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for handlers in subs.values_mut() {
            let before = handlers.len();
            handlers.retain(|(sid, _)| *sid != id);
            removed |= handlers.len() != before;
        }
        subs.retain(|_, handlers| !handlers.is_empty());
        removed
    }

    /// Publish an event.
    ///
    /// Delivery happens before this returns unless the bus is already
    /// dispatching (a handler publishing from inside a callback, or another
    /// thread mid-dispatch); then the event is delivered by that dispatcher,
    /// after everything queued before it.
    pub fn publish(&self, topic: &str, source: Option<ModuleName>, payload: Value) -> PublishOutcome {
        if !self.unlimited.contains(topic) && !self.admit(topic) {
            self.rate_limited.fetch_add(1, Ordering::Relaxed);
            debug!("bus: `{topic}` rate limited");
            return PublishOutcome::RateLimited;
        }

        let event = Event {
            topic: topic.to_string(),
            payload,
            source,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
        };
        self.published.fetch_add(1, Ordering::Relaxed);
        lock(&self.pending).push_back(event);
        self.dispatch();
        PublishOutcome::Accepted
    }

    fn admit(&self, topic: &str) -> bool {
        let mut limiters = lock(&self.limiters);
        limiters
            .entry(topic.to_string())
            .or_insert_with(|| TokenBucket::new(self.rate_per_sec, self.burst))
            .try_acquire()
    }

    fn dispatch(&self) {
        loop {
            if self
                .dispatching
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                return;
            }
            loop {
                let next = lock(&self.pending).pop_front();
                let Some(event) = next else { break };
                self.deliver(&event);
            }
            self.dispatching.store(false, Ordering::Release);
            // Another thread may have queued between our last pop and the store.
            if lock(&self.pending).is_empty() {
                return;
            }
        }
    }

    fn deliver(&self, event: &Event) {
        let handlers: Vec<Handler> = {
            let subs = self
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            subs.get(&event.topic)
                .into_iter()
                .chain(subs.get(topics::WILDCARD))
                .flatten()
                .map(|(_, h)| Arc::clone(h))
                .collect()
        };
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.handler_panics.fetch_add(1, Ordering::Relaxed);
                    warn!("bus: subscriber panicked while handling `{}`", event.topic);
                }
            }
        }
    }

    pub fn stats(&self) -> BusStats {
        let subscriptions = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum();
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
            subscriptions,
        }
    }

    /// Refill every bucket and zero the counters.  Subscriptions survive.
    pub fn reset(&self) {
        lock(&self.limiters).clear();
        self.published.store(0, Ordering::Relaxed);
        self.delivered.store(0, Ordering::Relaxed);
        self.rate_limited.store(0, Ordering::Relaxed);
        self.handler_panics.store(0, Ordering::Relaxed);
    }

    /// Drop every subscription and anything still queued.
    pub fn clear(&self) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        lock(&self.pending).clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bus() -> EventBus {
        EventBus::new(&EventConfig::default())
    }

    fn recorder(bus: &EventBus, topic: &str) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(topic, move |e| sink.lock().unwrap().push(e.clone()));
        seen
    }

    #[test]
    fn delivers_in_publish_order() {
        let bus = bus();
        let seen = recorder(&bus, "t");
        for i in 0..5 {
            bus.publish("t", Some(ModuleName::LevelMonitor), json!({ "i": i }));
        }
        let seen = seen.lock().unwrap();
        let order: Vec<i64> = seen.iter().map(|e| e.payload["i"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert!(seen.windows(2).all(|w| w[0].seq < w[1].seq));
        assert_eq!(seen[0].source, Some(ModuleName::LevelMonitor));
    }

    #[test]
    fn wildcard_sees_every_topic() {
        let bus = bus();
        let all = recorder(&bus, topics::WILDCARD);
        bus.publish("a", None, Value::Null);
        bus.publish("b", None, Value::Null);
        assert_eq!(all.lock().unwrap().len(), 2);
    }

    #[test]
    fn panicking_subscriber_is_isolated() {
        let bus = bus();
        bus.subscribe("t", |_| panic!("bad subscriber"));
        let seen = recorder(&bus, "t");
        bus.publish("t", None, Value::Null);
        bus.publish("t", None, Value::Null);
        assert_eq!(seen.lock().unwrap().len(), 2);
        let stats = bus.stats();
        assert_eq!(stats.handler_panics, 2);
        assert_eq!(stats.delivered, 2);
    }

    #[test]
    fn rate_limit_is_per_topic() {
        let bus = EventBus::new(&EventConfig {
            rate_per_sec: 0.001,
            burst: 2,
            unlimited_topics: vec![],
        });
        assert_eq!(bus.publish("a", None, Value::Null), PublishOutcome::Accepted);
        assert_eq!(bus.publish("a", None, Value::Null), PublishOutcome::Accepted);
        assert_eq!(bus.publish("a", None, Value::Null), PublishOutcome::RateLimited);
        assert_eq!(bus.publish("b", None, Value::Null), PublishOutcome::Accepted);
        assert_eq!(bus.stats().rate_limited, 1);
    }

    #[test]
    fn unlimited_topics_bypass_the_bucket() {
        let bus = EventBus::new(&EventConfig {
            rate_per_sec: 0.001,
            burst: 1,
            unlimited_topics: vec![topics::ENGINE_ERROR.into()],
        });
        for _ in 0..10 {
            assert_eq!(
                bus.publish(topics::ENGINE_ERROR, None, Value::Null),
                PublishOutcome::Accepted
            );
        }
    }

    #[test]
    fn reentrant_publish_is_delivered_after_current_event() {
        let bus = Arc::new(bus());
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let bus2 = Arc::clone(&bus);
            let order = Arc::clone(&order);
            bus.subscribe("first", move |_| {
                bus2.publish("second", None, Value::Null);
                order.lock().unwrap().push("first-done");
            });
        }
        {
            let order = Arc::clone(&order);
            bus.subscribe("second", move |_| order.lock().unwrap().push("second"));
        }
        bus.publish("first", None, Value::Null);
        assert_eq!(*order.lock().unwrap(), vec!["first-done", "second"]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = bus();
        let seen = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);
        let id = bus.subscribe("t", move |_| *sink.lock().unwrap() += 1);
        bus.publish("t", None, Value::Null);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish("t", None, Value::Null);
        assert_eq!(*seen.lock().unwrap(), 1);
        assert_eq!(bus.stats().subscriptions, 0);
    }
}
