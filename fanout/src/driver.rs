use crate::error::Error;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::fmt;

/// One message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// A live pattern subscription. Dropping it unsubscribes.
pub struct Subscription {
    pattern: String,
    messages: BoxStream<'static, FanoutMessage>,
}

impl Subscription {
    pub fn new(pattern: impl Into<String>, messages: BoxStream<'static, FanoutMessage>) -> Self {
        Self {
            pattern: pattern.into(),
            messages,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Next message, or `None` once the backend closed the subscription.
    pub async fn next(&mut self) -> Option<FanoutMessage> {
        self.messages.next().await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

/// Fire-and-forget pub/sub transport shared by every relay replica.
///
/// Messages published while nobody is subscribed are lost; the durable log
/// covers consumers that need every event.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publishes `payload` on `channel` and returns how many subscribers received it.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize, Error>;

    /// Subscribes to every channel matching a Redis-style glob pattern.
    async fn psubscribe(&self, pattern: &str) -> Result<Subscription, Error>;

    fn driver_name(&self) -> &'static str;
}
