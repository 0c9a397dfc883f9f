use crate::driver::PubSub;
use crate::subscriber::{channel_for, Envelope};
use async_trait::async_trait;
use events::{Event, EventHandler};
use log::*;
use std::sync::Arc;

/// Publishes every emitted event on the audience's fan-out channel.
pub struct FanoutEventHandler {
    pubsub: Arc<dyn PubSub>,
    origin: String,
    channel_prefix: String,
}

impl FanoutEventHandler {
    pub fn new(
        pubsub: Arc<dyn PubSub>,
        origin: impl Into<String>,
        channel_prefix: impl Into<String>,
    ) -> Self {
        Self {
            pubsub,
            origin: origin.into(),
            channel_prefix: channel_prefix.into(),
        }
    }
}

#[async_trait]
impl EventHandler for FanoutEventHandler {
    fn name(&self) -> &'static str {
        "fanout"
    }

    async fn handle(&self, event: &Event) -> Result<(), events::Error> {
        let channel = channel_for(&self.channel_prefix, &event.audience);
        let payload = serde_json::to_vec(&Envelope {
            origin: self.origin.clone(),
            event: event.clone(),
        })?;

        let receivers = self.pubsub.publish(&channel, payload).await?;
        if receivers == 0 {
            debug!("No fan-out subscriber on {channel}, event on {} not delivered live", event.topic);
        } else {
            trace!("Published event on {} to {receivers} subscriber(s) via {channel}", event.topic);
        }
        Ok(())
    }
}
