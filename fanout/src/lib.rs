//! Cross-replica real-time fan-out.
//!
//! Every replica publishes the events it emits on a shared pub/sub transport
//! and subscribes to the same channel pattern, handing whatever arrives to its
//! local `Hub`. A client connected to any replica therefore sees events emitted
//! on any other replica.
//!
//! # Architecture
//!
//! - **PubSub driver**: `PubSub` trait with an in-memory driver for single
//!   replica deployments and tests, and a Redis driver (PUBLISH / PSUBSCRIBE).
//! - **Envelope**: the event plus the publishing replica's id, JSON encoded.
//! - **Channels**: `<prefix><audience suffix>`, so a pattern such as
//!   `fanout:*` picks up every audience.
//! - **FanoutEventHandler**: the `EventHandler` the producer calls.
//! - **FanoutSubscriber**: the receive loop that dispatches into the hub,
//!   resubscribing with backoff when the backend drops the subscription.
//!
//! Delivery is at-most-once: nothing is stored, and a replica that is not
//! subscribed at publish time never sees the message.

pub mod driver;
pub mod error;
pub mod handler;
pub mod memory;
pub mod pattern;
pub mod redis_pubsub;
pub mod subscriber;

pub use driver::{FanoutMessage, PubSub, Subscription};
pub use error::Error;
pub use handler::FanoutEventHandler;
pub use memory::MemoryPubSub;
pub use pattern::ChannelPattern;
pub use redis_pubsub::RedisPubSub;
pub use subscriber::{channel_for, Envelope, FanoutSubscriber};
