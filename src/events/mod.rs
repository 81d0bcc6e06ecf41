//! Inter-module signalling.
//!
//! ```text
//! module ──publish(topic, payload)──► EventBus ──rate limit──► queue
//!                                                               │
//!                   subscribers (topic, "*") ◄──FIFO dispatch───┘
//! ```
//!
//! Every topic has its own token bucket; fault and session topics bypass
//! it so they are never lost.  Handlers run one at a time in publish order
//! and a panicking handler is isolated from the others.

pub mod bus;
pub mod rate_limit;
pub mod topics;

pub use bus::{BusStats, Event, EventBus, Handler, PublishOutcome, SubscriptionId};
pub use rate_limit::TokenBucket;
