//! Delivery handlers: the seam between the pipeline and target systems.
//!
//! The pipeline owns locking, retry bookkeeping, and removal; a handler owns
//! nothing but the act of delivering one envelope to its target system. The
//! registry maps handler names from configuration onto constructors so
//! deployments pick handlers per subscription.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use campusidm_events::Envelope;

use crate::config::SubscriptionConfig;

/// Why a delivery attempt did not complete.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The attempt failed; the event stays in the change log and the failure
    /// count is incremented.
    #[error("delivery failed: {0}")]
    Failed(String),

    /// The handler does not deal in this event type. Treated like a failure
    /// so the record surfaces to operators instead of silently vanishing.
    #[error("unsupported event type")]
    Unsupported,
}

/// One target system's delivery logic.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError>;
}

type HandlerFactory = dyn Fn(&SubscriptionConfig) -> Arc<dyn DeliveryHandler> + Send + Sync;

/// Maps handler names from configuration onto constructors.
pub struct HandlerRegistry {
    factories: HashMap<String, Box<HandlerFactory>>,
}

impl HandlerRegistry {
    /// An empty registry with no handlers, not even the builtins.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with the builtin handlers registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("log", |_| Arc::new(LogHandler));
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&SubscriptionConfig) -> Arc<dyn DeliveryHandler> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Instantiate the handler a subscription names, or `None` when the name
    /// is unknown.
    pub fn resolve(&self, config: &SubscriptionConfig) -> Option<Arc<dyn DeliveryHandler>> {
        self.factories
            .get(config.handler.as_str())
            .map(|factory| factory(config))
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Builtin handler that logs each envelope and reports success. Useful for
/// smoke-testing a deployment before the real target integration exists.
pub struct LogHandler;

#[async_trait]
impl DeliveryHandler for LogHandler {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
        let event = envelope.event();
        info!(
            target_system = %envelope.channel(),
            event_id = event.id.as_i64(),
            event_type = %event.event_type,
            subject_entity = event.subject_entity.as_i64(),
            "event delivered to log",
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;
    use serde_json::json;

    use campusidm_core::{EntityId, EventId, TargetSystem};
    use campusidm_events::Event;

    fn subscription(handler: &str) -> SubscriptionConfig {
        SubscriptionConfig {
            handler: handler.to_string(),
            ..SubscriptionConfig::for_target("AD")
        }
    }

    fn envelope() -> Envelope {
        let event = Event::new(
            EventId::new(7),
            "account:create",
            EntityId::new(1001),
            None,
            Utc::now(),
            json!({"uname": "olanord"}),
        );
        Envelope::new(TargetSystem::new("AD").unwrap(), event)
    }

    #[tokio::test]
    async fn builtin_log_handler_resolves_and_delivers() {
        let registry = HandlerRegistry::with_builtins();
        let handler = registry.resolve(&subscription("log")).unwrap();
        assert!(handler.deliver(&envelope()).await.is_ok());
    }

    #[test]
    fn unknown_handler_name_resolves_to_none() {
        let registry = HandlerRegistry::with_builtins();
        assert!(registry.resolve(&subscription("exchange")).is_none());
    }

    #[test]
    fn registered_handler_shadows_nothing_and_resolves() {
        struct Rejecting;

        #[async_trait]
        impl DeliveryHandler for Rejecting {
            async fn deliver(&self, _: &Envelope) -> Result<(), DeliveryError> {
                Err(DeliveryError::Unsupported)
            }
        }

        let mut registry = HandlerRegistry::empty();
        registry.register("rejecting", |_| Arc::new(Rejecting));
        assert!(registry.resolve(&subscription("rejecting")).is_some());
        assert!(registry.resolve(&subscription("log")).is_none());
    }
}
