//! Durable event log, consumer groups and the delivery worker pool.
//!
//! Every emitted event is appended to a per-topic stream. Consumer groups,
//! one per downstream responsibility, read the stream competitively: each
//! entry goes to one worker of the group, which acknowledges it once the
//! business action succeeded.
//!
//! # Guarantees
//!
//! - **Durability across consumer absence**: a new group starts at the
//!   beginning of the stream, so entries appended before any worker ran are
//!   still delivered.
//! - **At-least-once**: an entry read but never acknowledged stays in the
//!   group's pending set. Once it has been idle for the claim timeout any
//!   worker may claim it, which increments its delivery count. Handlers must
//!   therefore tolerate duplicates.
//! - **No silent loss**: every entry is either acknowledged or, after a
//!   permanent failure or `max_deliveries` failed attempts, moved to the
//!   `<stream>:dead` stream together with its failure metadata.
//!
//! # Modules
//!
//! - `event_log`: the `EventLog` trait
//! - `memory` / `redis_log`: in-process and Redis Streams backends
//! - `worker`: `WorkerPool`, `EntryHandler` and failure classification
//! - `handler`: the `EventHandler` that appends emitted events

pub mod entry;
pub mod error;
pub mod event_log;
pub mod handler;
pub mod memory;
pub mod redis_log;
pub mod worker;

pub use entry::{DeadLetter, Delivery, Entry, EntryId, PendingEntry};
pub use error::Error;
pub use event_log::{dead_letter_stream, EventLog};
pub use handler::{stream_for, DurableEventHandler};
pub use memory::MemoryEventLog;
pub use redis_log::RedisEventLog;
pub use worker::{EntryHandler, HandlerError, PoolConfig, WorkerPool};
