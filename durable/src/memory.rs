use crate::entry::{DeadLetter, Delivery, Entry, EntryId, PendingEntry};
use crate::error::{durable_error, DurableErrorKind, Error};
use crate::event_log::{dead_letter_stream, EventLog};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::*;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{self, Instant};

struct StoredEntry {
    payload: String,
    produced_at: DateTime<Utc>,
    target_group: Option<String>,
}

impl StoredEntry {
    fn to_entry(&self, stream: &str, id: EntryId) -> Entry {
        Entry {
            id,
            stream: stream.to_string(),
            payload: self.payload.clone(),
            produced_at: self.produced_at,
            target_group: self.target_group.clone(),
        }
    }
}

struct PendingState {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Default)]
struct Group {
    last_delivered: Option<EntryId>,
    pending: BTreeMap<EntryId, PendingState>,
}

#[derive(Default)]
struct Stream {
    entries: BTreeMap<EntryId, StoredEntry>,
    last_id: Option<EntryId>,
    groups: HashMap<String, Group>,
}

impl Stream {
    fn append(
        &mut self,
        payload: String,
        produced_at: DateTime<Utc>,
        target_group: Option<String>,
    ) -> EntryId {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let id = match self.last_id {
            Some(last) => last.next(now),
            None => EntryId::new(now, 0),
        };
        self.entries.insert(
            id,
            StoredEntry {
                payload,
                produced_at,
                target_group,
            },
        );
        self.last_id = Some(id);
        id
    }

    /// Drops entries at or before every group's read position that no group still has pending.
    fn trim(&mut self) -> usize {
        let Some(read_by_all) = self
            .groups
            .values()
            .map(|group| group.last_delivered)
            .min()
            .flatten()
        else {
            return 0;
        };

        let groups = &self.groups;
        let released: Vec<EntryId> = self
            .entries
            .range(..=read_by_all)
            .map(|(id, _)| *id)
            .filter(|id| groups.values().all(|group| !group.pending.contains_key(id)))
            .collect();
        for id in &released {
            self.entries.remove(id);
        }
        released.len()
    }
}

#[derive(Default)]
struct DeadLetterStream {
    last_id: Option<EntryId>,
    records: BTreeMap<EntryId, DeadLetter>,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, Stream>,
    dead: HashMap<String, DeadLetterStream>,
}

fn missing_group(stream: &str, group: &str) -> Error {
    durable_error(
        DurableErrorKind::MissingGroup,
        format!("no group {group} on stream {stream}"),
    )
}

/// In-process event log for a single replica (tests and local development).
///
/// Pending-set idle times follow the tokio clock so paused-time tests can
/// exercise claim timeouts.
#[derive(Default)]
pub struct MemoryEventLog {
    state: Mutex<State>,
    appended: Notify,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    async fn try_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<Delivery>, Error> {
        let mut state = self.state.lock().await;
        let log = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| missing_group(stream, group))?;
        let Stream {
            entries, groups, ..
        } = log;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| missing_group(stream, group))?;

        let fresh: Vec<EntryId> = match group_state.last_delivered {
            Some(last) => entries
                .range(last..)
                .map(|(id, _)| *id)
                .filter(|id| *id > last)
                .take(count)
                .collect(),
            None => entries.keys().copied().take(count).collect(),
        };

        let now = Instant::now();
        let mut deliveries = Vec::with_capacity(fresh.len());
        for id in fresh {
            group_state.pending.insert(
                id,
                PendingState {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            group_state.last_delivered = Some(id);

            deliveries.push(Delivery {
                entry: entries[&id].to_entry(stream, id),
                delivery_count: 1,
            });
        }
        Ok(deliveries)
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(
        &self,
        stream: &str,
        payload: &str,
        produced_at: DateTime<Utc>,
    ) -> Result<EntryId, Error> {
        let id = {
            let mut state = self.state.lock().await;
            state
                .streams
                .entry(stream.to_string())
                .or_default()
                .append(payload.to_string(), produced_at, None)
        };
        self.appended.notify_waiters();
        trace!("Appended entry {id} to {stream}");
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let log = state.streams.entry(stream.to_string()).or_default();
        if !log.groups.contains_key(group) {
            log.groups.insert(group.to_string(), Group::default());
            debug!("Created consumer group {group} on {stream}");
        }
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, Error> {
        let deadline = Instant::now() + block;
        loop {
            // Register interest before looking, so an append in between still wakes us.
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let deliveries = self.try_read(stream, group, consumer, count).await?;
            if !deliveries.is_empty() || Instant::now() >= deadline {
                return Ok(deliveries);
            }
            if time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<usize, Error> {
        let mut state = self.state.lock().await;
        let Some(group_state) = state
            .streams
            .get_mut(stream)
            .and_then(|log| log.groups.get_mut(group))
        else {
            return Ok(0);
        };

        Ok(ids
            .iter()
            .filter(|id| group_state.pending.remove(*id).is_some())
            .count())
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, Error> {
        let state = self.state.lock().await;
        let group_state = state
            .streams
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .ok_or_else(|| missing_group(stream, group))?;

        let now = Instant::now();
        Ok(group_state
            .pending
            .iter()
            .take(count)
            .map(|(id, pending)| PendingEntry {
                id: *id,
                consumer: pending.consumer.clone(),
                idle: now.saturating_duration_since(pending.delivered_at),
                delivery_count: pending.delivery_count,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<Delivery>, Error> {
        let mut state = self.state.lock().await;
        let log = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| missing_group(stream, group))?;
        let Stream {
            entries, groups, ..
        } = log;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| missing_group(stream, group))?;

        let now = Instant::now();
        let mut claimed = Vec::new();
        for id in ids {
            let Some(pending) = group_state.pending.get_mut(id) else {
                continue;
            };
            if now.saturating_duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            let Some(stored) = entries.get(id) else {
                group_state.pending.remove(id);
                continue;
            };

            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.delivery_count += 1;
            claimed.push(Delivery {
                entry: stored.to_entry(stream, *id),
                delivery_count: pending.delivery_count,
            });
        }
        Ok(claimed)
    }

    async fn dead_letter(
        &self,
        group: &str,
        delivery: &Delivery,
        reason: &str,
    ) -> Result<EntryId, Error> {
        let entry = &delivery.entry;
        let mut state = self.state.lock().await;

        let dead = state.dead.entry(entry.stream.clone()).or_default();
        let now = Utc::now();
        let millis = now.timestamp_millis().max(0) as u64;
        let id = match dead.last_id {
            Some(last) => last.next(millis),
            None => EntryId::new(millis, 0),
        };
        dead.last_id = Some(id);
        dead.records.insert(
            id,
            DeadLetter {
                id,
                stream: entry.stream.clone(),
                group: group.to_string(),
                entry_id: entry.id,
                payload: entry.payload.clone(),
                produced_at: entry.produced_at,
                delivery_count: delivery.delivery_count,
                reason: reason.to_string(),
                failed_at: now,
            },
        );

        if let Some(group_state) = state
            .streams
            .get_mut(&entry.stream)
            .and_then(|log| log.groups.get_mut(group))
        {
            group_state.pending.remove(&entry.id);
        }

        debug!(
            "Dead-lettered entry {} of {} to {} as {id}",
            entry.id,
            entry.stream,
            dead_letter_stream(&entry.stream)
        );
        Ok(id)
    }

    async fn dead_letters(&self, stream: &str) -> Result<Vec<DeadLetter>, Error> {
        let state = self.state.lock().await;
        Ok(state
            .dead
            .get(stream)
            .map(|dead| dead.records.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn replay_dead_letter(&self, stream: &str, id: &EntryId) -> Result<EntryId, Error> {
        let replayed = {
            let mut state = self.state.lock().await;
            let record = state
                .dead
                .get_mut(stream)
                .and_then(|dead| dead.records.remove(id))
                .ok_or_else(|| {
                    durable_error(
                        DurableErrorKind::NotFound,
                        format!("no dead letter {id} for {stream}"),
                    )
                })?;
            state
                .streams
                .entry(stream.to_string())
                .or_default()
                .append(record.payload, record.produced_at, Some(record.group))
        };
        self.appended.notify_waiters();
        info!("Replayed dead letter {id} onto {stream} as {replayed}");
        Ok(replayed)
    }

    async fn trim(&self, stream: &str) -> Result<usize, Error> {
        let mut state = self.state.lock().await;
        let released = state.streams.get_mut(stream).map_or(0, Stream::trim);
        if released > 0 {
            debug!("Trimmed {released} acknowledged entries from {stream}");
        }
        Ok(released)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
