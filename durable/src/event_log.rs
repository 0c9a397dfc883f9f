use crate::entry::{DeadLetter, Delivery, EntryId, PendingEntry};
use crate::error::Error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Name of the dead-letter stream kept next to `stream`.
pub fn dead_letter_stream(stream: &str) -> String {
    format!("{stream}:dead")
}

/// Append-only log with consumer groups and a pending set per group.
///
/// Every backend provides the same guarantees: an appended entry survives
/// until it is acknowledged by exactly one consumer of each group or moved to
/// the dead-letter stream, and entries read but never acknowledged stay in
/// the pending set where any consumer can claim them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Appends an entry. Does not depend on any consumer existing.
    async fn append(
        &self,
        stream: &str,
        payload: &str,
        produced_at: DateTime<Utc>,
    ) -> Result<EntryId, Error>;

    /// Creates `group` positioned at the start of `stream`, creating the stream if needed.
    /// Creating an existing group is a no-op.
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), Error>;

    /// Reads up to `count` entries never delivered to the group, waiting up to
    /// `block` for new ones. Every returned entry joins the pending set owned
    /// by `consumer` with a delivery count of 1.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, Error>;

    /// Removes entries from the pending set for good. Returns how many were pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<usize, Error>;

    /// Pending-set rows in id order.
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, Error>;

    /// Transfers ownership of entries idle for at least `min_idle` to
    /// `consumer`, incrementing their delivery count and resetting their idle time.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<Delivery>, Error>;

    /// Atomically records the delivery in the dead-letter stream and acknowledges it.
    async fn dead_letter(
        &self,
        group: &str,
        delivery: &Delivery,
        reason: &str,
    ) -> Result<EntryId, Error>;

    /// Dead letters recorded for `stream`, oldest first.
    async fn dead_letters(&self, stream: &str) -> Result<Vec<DeadLetter>, Error>;

    /// Re-appends a dead letter's payload to `stream`, targeted at the group
    /// that dead-lettered it, and removes the record. Returns the id of the new entry.
    async fn replay_dead_letter(&self, stream: &str, id: &EntryId) -> Result<EntryId, Error>;

    /// Releases entries every group of `stream` has already acknowledged or
    /// dead-lettered. Entries still pending or not yet delivered to some group
    /// are kept, as is everything on a stream without groups. Returns how many
    /// entries were released.
    async fn trim(&self, stream: &str) -> Result<usize, Error>;

    fn backend_name(&self) -> &'static str;
}
