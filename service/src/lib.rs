use config::Config;
use durable::{DurableEventHandler, EntryHandler, EventLog, MemoryEventLog, RedisEventLog, WorkerPool};
use events::EventPublisher;
use fanout::{FanoutEventHandler, FanoutSubscriber, MemoryPubSub, PubSub, RedisPubSub};
use hub::Hub;
use log::*;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub mod audit;
pub mod config;
pub mod error;
pub mod logging;

pub use error::Error;

/// The stores shared by every replica: the durable log and the fan-out transport.
#[derive(Clone)]
pub struct Backend {
    pub event_log: Arc<dyn EventLog>,
    pub pubsub: Arc<dyn PubSub>,
}

impl Backend {
    /// Single-replica backend kept entirely in process memory.
    pub fn in_memory(fanout_buffer: usize) -> Self {
        Self {
            event_log: Arc::new(MemoryEventLog::new()),
            pubsub: Arc::new(MemoryPubSub::new(fanout_buffer)),
        }
    }
}

/// Connects to Redis when a URL is configured, otherwise falls back to in-memory stores.
pub async fn init_backend(config: &Config) -> Result<Backend, Error> {
    match config.redis_url() {
        Some(url) => {
            info!("Using Redis backend for fan-out and the durable log");
            let event_log = RedisEventLog::connect(url).await?;
            let pubsub = RedisPubSub::connect(url).await?;
            Ok(Backend {
                event_log: Arc::new(event_log),
                pubsub: Arc::new(pubsub),
            })
        }
        None => {
            warn!("No Redis URL configured, running as a single replica on in-memory backends");
            Ok(Backend::in_memory(config.fanout_buffer))
        }
    }
}

/// Producer for business services: fan-out first so live latency never
/// waits on the durable write, then the durable log.
pub fn event_publisher(config: &Config, backend: &Backend) -> EventPublisher {
    EventPublisher::new()
        .with_handler(Arc::new(FanoutEventHandler::new(
            backend.pubsub.clone(),
            config.replica_id(),
            config.fanout_channel_prefix.clone(),
        )))
        .with_handler(Arc::new(DurableEventHandler::new(
            backend.event_log.clone(),
            config.stream_prefix.clone(),
        )))
}

/// Subscribes the local hub to the fan-out pattern.
pub async fn start_fanout(
    config: &Config,
    backend: &Backend,
    hub: &Hub,
) -> Result<JoinHandle<()>, Error> {
    let subscriber = FanoutSubscriber::new(
        backend.pubsub.clone(),
        hub.clone(),
        config.fanout_pattern.clone(),
    );
    Ok(subscriber.start().await?)
}

/// Starts one worker pool per configured stream topic.
pub async fn start_worker_pools(
    config: &Config,
    backend: &Backend,
    handler: Arc<dyn EntryHandler>,
) -> Result<Vec<WorkerPool>, Error> {
    let mut pools = Vec::with_capacity(config.stream_topics.len());
    for topic in &config.stream_topics {
        let pool = WorkerPool::start(
            backend.event_log.clone(),
            handler.clone(),
            config.pool_config(topic),
        )
        .await;

        match pool {
            Ok(pool) => pools.push(pool),
            Err(e) => {
                error!("Failed to start workers for topic {topic}: {e}");
                for started in pools {
                    started.shutdown().await;
                }
                return Err(e.into());
            }
        }
    }
    Ok(pools)
}

// Service-level state shared with the web layer.
// Needs to implement Clone to be able to be passed into Router as State
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub hub: Hub,
    pub publisher: EventPublisher,
    pub event_log: Arc<dyn EventLog>,
}

impl AppState {
    pub fn new(config: Config, hub: Hub, backend: &Backend) -> Self {
        let publisher = event_publisher(&config, backend);
        Self {
            config,
            hub,
            publisher,
            event_log: backend.event_log.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn config() -> Config {
        Config::parse_from(["relay"]).set_replica_id("relay-test".to_string())
    }

    #[tokio::test]
    async fn without_redis_url_the_backend_is_in_memory() {
        let backend = init_backend(&config()).await.unwrap();
        assert_eq!(backend.event_log.backend_name(), "memory");
        assert_eq!(backend.pubsub.driver_name(), "memory");
    }

    #[tokio::test]
    async fn publisher_runs_fanout_before_durable() {
        let config = config();
        let backend = Backend::in_memory(16);
        let state = AppState::new(config, Hub::spawn(16), &backend);

        assert_eq!(state.publisher.handler_names(), ["fanout", "durable"]);
    }

    #[tokio::test]
    async fn emitted_events_land_in_the_topic_stream() {
        let config = config();
        let backend = Backend::in_memory(16);
        let publisher = event_publisher(&config, &backend);

        let report = publisher
            .emit(
                "tasks",
                events::Audience::channel("org-42"),
                serde_json::json!({"id": 1}),
            )
            .await;
        assert!(report.is_complete());

        let pool = config.pool_config("tasks");
        backend
            .event_log
            .create_group(&pool.stream, &pool.group)
            .await
            .unwrap();
        let read = backend
            .event_log
            .read_group(&pool.stream, &pool.group, "reader", 10, std::time::Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
    }
}
