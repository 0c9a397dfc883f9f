use crate::driver::{FanoutMessage, PubSub, Subscription};
use crate::error::{fanout_error, Error, FanoutErrorKind};
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client};
use async_trait::async_trait;
use futures::StreamExt;
use log::*;

/// Redis PUBLISH / PSUBSCRIBE driver shared by every replica pointed at the same server.
///
/// Publishing goes through a reconnecting `ConnectionManager`; every
/// subscription owns a dedicated connection because a subscribed connection
/// cannot issue other commands.
pub struct RedisPubSub {
    client: Client,
    connection: ConnectionManager,
}

impl RedisPubSub {
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = Client::open(url).map_err(|e| {
            error!("Invalid Redis URL for fan-out: {e}");
            fanout_error(FanoutErrorKind::Connection, e)
        })?;
        let connection = ConnectionManager::new(client.clone()).await.map_err(|e| {
            error!("Failed to connect fan-out to Redis: {e}");
            fanout_error(FanoutErrorKind::Connection, e)
        })?;

        info!("Fan-out connected to Redis");
        Ok(Self { client, connection })
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize, Error> {
        let mut connection = self.connection.clone();
        let receivers: usize = connection
            .publish(channel, payload)
            .await
            .map_err(|e| fanout_error(FanoutErrorKind::Publish, e))?;
        Ok(receivers)
    }

    async fn psubscribe(&self, pattern: &str) -> Result<Subscription, Error> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| fanout_error(FanoutErrorKind::Connection, e))?;
        pubsub
            .psubscribe(pattern)
            .await
            .map_err(|e| fanout_error(FanoutErrorKind::Subscribe, e))?;

        let messages = pubsub.into_on_message().map(|message| FanoutMessage {
            channel: message.get_channel_name().to_string(),
            payload: message.get_payload_bytes().to_vec(),
        });

        Ok(Subscription::new(pattern, messages.boxed()))
    }

    fn driver_name(&self) -> &'static str {
        "redis"
    }
}
