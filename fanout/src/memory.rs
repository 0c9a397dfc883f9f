use crate::driver::{FanoutMessage, PubSub, Subscription};
use crate::error::Error;
use crate::pattern::ChannelPattern;
use async_trait::async_trait;
use log::*;
use tokio::sync::broadcast::{self, error::RecvError};

/// In-process pub/sub for a single replica (tests and local development).
///
/// A subscriber that falls more than `capacity` messages behind skips the
/// oldest ones, matching the lossy delivery of the Redis driver.
pub struct MemoryPubSub {
    sender: broadcast::Sender<FanoutMessage>,
}

impl MemoryPubSub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize, Error> {
        let message = FanoutMessage {
            channel: channel.to_string(),
            payload,
        };
        // Every subscriber sees every message and filters by its own pattern,
        // so this counts subscriptions rather than matching ones.
        Ok(self.sender.send(message).unwrap_or(0))
    }

    async fn psubscribe(&self, pattern: &str) -> Result<Subscription, Error> {
        let pattern = ChannelPattern::new(pattern);
        let name = pattern.as_str().to_string();
        let mut receiver = self.sender.subscribe();

        let messages = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(message) => {
                        if pattern.matches(&message.channel) {
                            yield message;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            "Subscription {} lagged behind, dropped {skipped} message(s)",
                            pattern.as_str()
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        };

        Ok(Subscription::new(name, Box::pin(messages)))
    }

    fn driver_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_only_matching_channels() {
        let pubsub = MemoryPubSub::default();
        let mut subscription = pubsub.psubscribe("fanout:org-*").await.unwrap();

        pubsub.publish("fanout:user.alice", b"skip".to_vec()).await.unwrap();
        pubsub.publish("fanout:org-42", b"hello".to_vec()).await.unwrap();

        assert_eq!(
            subscription.next().await,
            Some(FanoutMessage {
                channel: "fanout:org-42".to_string(),
                payload: b"hello".to_vec(),
            })
        );
        assert_eq!(subscription.pattern(), "fanout:org-*");
    }

    #[tokio::test]
    async fn messages_without_subscribers_are_lost() {
        let pubsub = MemoryPubSub::default();
        assert_eq!(pubsub.publish("fanout:all", b"early".to_vec()).await.unwrap(), 0);

        let mut subscription = pubsub.psubscribe("fanout:*").await.unwrap();
        assert_eq!(pubsub.publish("fanout:all", b"late".to_vec()).await.unwrap(), 1);
        assert_eq!(subscription.next().await.unwrap().payload, b"late".to_vec());
    }

    #[tokio::test]
    async fn every_subscriber_gets_its_own_copy() {
        let pubsub = MemoryPubSub::default();
        let mut first = pubsub.psubscribe("fanout:*").await.unwrap();
        let mut second = pubsub.psubscribe("fanout:*").await.unwrap();

        assert_eq!(pubsub.publish("fanout:all", b"x".to_vec()).await.unwrap(), 2);
        assert_eq!(first.next().await.unwrap().payload, b"x".to_vec());
        assert_eq!(second.next().await.unwrap().payload, b"x".to_vec());
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_oldest_messages() {
        let pubsub = MemoryPubSub::new(2);
        let mut subscription = pubsub.psubscribe("*").await.unwrap();

        for n in 0..4u8 {
            pubsub.publish("c", vec![n]).await.unwrap();
        }

        assert_eq!(subscription.next().await.unwrap().payload, vec![2]);
        assert_eq!(subscription.next().await.unwrap().payload, vec![3]);
    }
}
