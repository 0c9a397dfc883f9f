//! Event emission interface for the relay.
//!
//! This crate is the single call surface business services use to emit an
//! event. It knows nothing about how events travel; delivery paths plug in as
//! `EventHandler`s.
//!
//! # Architecture
//!
//! - **Event**: a `(topic, audience, payload)` tuple stamped with the producer time
//! - **Audience**: which live sessions should see the event (ignored by durable delivery)
//! - **EventHandler**: trait implemented by each delivery path (fan-out, durable log)
//! - **EventPublisher**: calls handlers in registration order, logging and containing failures
//!
//! The relay registers the fan-out handler before the durable handler so that
//! real-time latency never waits on the durable write. A failing handler never
//! stops the remaining handlers and never surfaces as an error to the caller:
//! the event is a side effect of the business write, not part of it.

pub mod audience;
pub mod error;

pub use audience::Audience;
pub use error::Error;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// A business event handed to the relay by the originating service.
///
/// The payload shape is owned by the producer; the relay treats it as opaque JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Stream key for durable delivery, scoped by tenant or entity type (e.g. "tasks").
    pub topic: String,
    /// Who should see the event live.
    pub audience: Audience,
    pub payload: Value,
    pub produced_at: DateTime<Utc>,
}

impl Event {
    pub fn new(topic: impl Into<String>, audience: Audience, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            audience,
            payload,
            produced_at: Utc::now(),
        }
    }
}

/// Trait for delivery paths.
/// Implementations hand the event to their transport and report failures
/// instead of panicking; the publisher decides what to do with them.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Short name used in logs and emit reports.
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &Event) -> Result<(), Error>;
}

/// Outcome of one emit, per handler. Only used for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmitReport {
    pub delivered: Vec<&'static str>,
    pub failed: Vec<&'static str>,
}

impl EmitReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Publishes events to registered handlers.
/// Handlers are called sequentially in registration order.
#[derive(Clone)]
pub struct EventPublisher {
    handlers: Arc<Vec<Arc<dyn EventHandler>>>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Vec::new()),
        }
    }

    /// Register a new event handler.
    /// Note: This creates a new publisher instance with the additional handler.
    /// Store the returned publisher in your application state.
    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        let mut handlers = (*self.handlers).clone();
        handlers.push(handler);
        self.handlers = Arc::new(handlers);
        self
    }

    /// Names of the registered handlers in call order.
    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Build an event from its parts and publish it.
    pub async fn emit(
        &self,
        topic: impl Into<String>,
        audience: Audience,
        payload: Value,
    ) -> EmitReport {
        self.publish(Event::new(topic, audience, payload)).await
    }

    /// Publish an event to all registered handlers.
    /// If a handler errors, we log it and continue with the remaining handlers.
    pub async fn publish(&self, event: Event) -> EmitReport {
        let mut report = EmitReport::default();

        for handler in self.handlers.iter() {
            match handler.handle(&event).await {
                Ok(()) => report.delivered.push(handler.name()),
                Err(e) => {
                    error!(
                        "Handler {} failed for event on topic {} ({}): {e}",
                        handler.name(),
                        event.topic,
                        event.audience
                    );
                    report.failed.push(handler.name());
                }
            }
        }

        trace!(
            "Published event on topic {} to {} handler(s)",
            event.topic,
            self.handlers.len()
        );
        report
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}
