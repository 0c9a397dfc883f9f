use crate::event_log::EventLog;
use async_trait::async_trait;
use events::{Event, EventHandler};
use log::*;
use std::sync::Arc;

/// Stream an event topic is appended to, e.g. `events:tasks`.
pub fn stream_for(prefix: &str, topic: &str) -> String {
    format!("{prefix}{topic}")
}

/// Appends every emitted event to the durable log under its topic's stream.
pub struct DurableEventHandler {
    log: Arc<dyn EventLog>,
    stream_prefix: String,
}

impl DurableEventHandler {
    pub fn new(log: Arc<dyn EventLog>, stream_prefix: impl Into<String>) -> Self {
        Self {
            log,
            stream_prefix: stream_prefix.into(),
        }
    }
}

#[async_trait]
impl EventHandler for DurableEventHandler {
    fn name(&self) -> &'static str {
        "durable"
    }

    async fn handle(&self, event: &Event) -> Result<(), events::Error> {
        let stream = stream_for(&self.stream_prefix, &event.topic);
        let payload = serde_json::to_string(event)?;
        let id = self.log.append(&stream, &payload, event.produced_at).await?;
        trace!("Event on {} appended to {stream} as {id}", event.topic);
        Ok(())
    }
}
