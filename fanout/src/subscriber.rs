use crate::driver::{PubSub, Subscription};
use crate::error::Error;
use events::{Audience, Event};
use hub::{Frame, Hub};
use log::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;

/// First pause before resubscribing after the subscription ended.
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_millis(500);
const MAX_RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(30);

/// What travels over the pub/sub transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Replica that published the event.
    pub origin: String,
    pub event: Event,
}

/// Channel an audience is published on, e.g. `fanout:org-42` or `fanout:user.alice`.
pub fn channel_for(prefix: &str, audience: &Audience) -> String {
    format!("{prefix}{}", audience.channel_suffix())
}

/// Bridges one pub/sub pattern subscription to the local Hub.
pub struct FanoutSubscriber {
    pubsub: Arc<dyn PubSub>,
    hub: Hub,
    pattern: String,
}

impl FanoutSubscriber {
    pub fn new(pubsub: Arc<dyn PubSub>, hub: Hub, pattern: impl Into<String>) -> Self {
        Self {
            pubsub,
            hub,
            pattern: pattern.into(),
        }
    }

    /// Subscribes, then dispatches on a background task until the hub stops.
    /// Events published after this returns reach the local hub.
    pub async fn start(self) -> Result<JoinHandle<()>, Error> {
        let subscription = self.pubsub.psubscribe(&self.pattern).await?;
        info!(
            "Fan-out subscribed to {} via {}",
            self.pattern,
            self.pubsub.driver_name()
        );
        Ok(tokio::spawn(self.supervise(subscription)))
    }

    /// Keeps a subscription alive for as long as the hub runs. When the
    /// backend closes it, resubscribes with exponential backoff; events
    /// published in between are lost.
    async fn supervise(self, mut subscription: Subscription) {
        let mut backoff = RESUBSCRIBE_BACKOFF;
        loop {
            match Self::dispatch(&mut subscription, &self.hub).await {
                Err(e) => {
                    info!("Stopping fan-out dispatch for {}: {e}", self.pattern);
                    return;
                }
                Ok(0) => {}
                Ok(_) => backoff = RESUBSCRIBE_BACKOFF,
            }
            warn!("Fan-out subscription {} ended", self.pattern);

            subscription = loop {
                time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_RESUBSCRIBE_BACKOFF);
                if self.hub.connected().await.is_err() {
                    debug!("Hub stopped, giving up fan-out subscription {}", self.pattern);
                    return;
                }
                match self.pubsub.psubscribe(&self.pattern).await {
                    Ok(subscription) => {
                        info!("Fan-out resubscribed to {}", self.pattern);
                        break subscription;
                    }
                    Err(e) => warn!("Fan-out failed to resubscribe to {}: {e}", self.pattern),
                }
            };
        }
    }

    /// Decodes envelopes and broadcasts them until the subscription ends,
    /// returning how many messages arrived. Fails once the hub has stopped.
    async fn dispatch(subscription: &mut Subscription, hub: &Hub) -> Result<usize, hub::Error> {
        let mut received = 0;
        while let Some(message) = subscription.next().await {
            received += 1;
            let envelope: Envelope = match serde_json::from_slice(&message.payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(
                        "Skipping undecodable fan-out message on {}: {e}",
                        message.channel
                    );
                    continue;
                }
            };

            trace!(
                "Fan-out message on {} from replica {}",
                message.channel,
                envelope.origin
            );
            let frame = Frame::from(&envelope.event);
            hub.broadcast(envelope.event.audience, frame).await?;
        }
        Ok(received)
    }
}
