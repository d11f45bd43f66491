//! Envelope producers.
//!
//! Two independent producers feed the shared queue: the low-latency
//! [`LiveCollector`] tailing push notifications, and the durability-backstop
//! [`BackfillCollector`] sweeping the change log for missed, failed, and
//! stuck events. Either one alone guarantees at-least-once delivery; together
//! they trade latency against robustness.

pub mod backfill;
pub mod listener;

pub use backfill::{BackfillCollector, BackfillConfig};
pub use listener::{ListenerConfig, LiveCollector};
