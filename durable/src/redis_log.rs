use crate::entry::{DeadLetter, Delivery, Entry, EntryId, PendingEntry};
use crate::error::{durable_error, DurableErrorKind, Error};
use crate::event_log::{dead_letter_stream, EventLog};
use ::redis::aio::{ConnectionManager, MultiplexedConnection};
use ::redis::streams::{
    StreamClaimReply, StreamId, StreamInfoGroupsReply, StreamPendingCountReply,
    StreamPendingReply, StreamRangeReply, StreamReadOptions, StreamReadReply,
};
use ::redis::{AsyncCommands, Client, FromRedisValue, RedisResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::*;
use serde_json::Map;
use std::collections::HashMap;
use std::time::Duration;

/// Field naming the only group a replayed entry is meant for.
const TARGET_GROUP: &str = "target_group";

/// Event log on Redis Streams.
///
/// Short commands share one reconnecting `ConnectionManager`. Blocking
/// XREADGROUP calls would stall every other command queued behind them, so
/// each consumer gets a dedicated connection, dropped after a failure and
/// reopened on the next read.
pub struct RedisEventLog {
    client: Client,
    connection: ConnectionManager,
    readers: DashMap<String, MultiplexedConnection>,
}

impl RedisEventLog {
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = Client::open(url).map_err(|e| {
            error!("Invalid Redis URL for the event log: {e}");
            Error::from(e)
        })?;
        let connection = ConnectionManager::new(client.clone()).await.map_err(|e| {
            error!("Failed to connect the event log to Redis: {e}");
            Error::from(e)
        })?;

        info!("Event log connected to Redis");
        Ok(Self {
            client,
            connection,
            readers: DashMap::new(),
        })
    }

    async fn reader(&self, consumer: &str) -> Result<MultiplexedConnection, Error> {
        let cached = self.readers.get(consumer).map(|c| c.value().clone());
        if let Some(connection) = cached {
            return Ok(connection);
        }

        let connection = self.client.get_multiplexed_async_connection().await?;
        debug!("Opened read connection for consumer {consumer}");
        self.readers.insert(consumer.to_string(), connection.clone());
        Ok(connection)
    }

    /// Current delivery count of a pending entry; 1 if the row vanished meanwhile.
    async fn delivery_count(&self, stream: &str, group: &str, id: &str) -> Result<u32, Error> {
        let mut connection = self.connection.clone();
        let reply: StreamPendingCountReply = connection
            .xpending_count(stream, group, id, id, 1)
            .await?;
        Ok(reply
            .ids
            .first()
            .map(|row| row.times_delivered as u32)
            .unwrap_or(1))
    }

    /// Moves entries that failed to decode to the dead-letter stream so they
    /// stop blocking the pending set. A failed move leaves the entry pending
    /// for the next sweep.
    async fn quarantine(&self, group: &str, malformed: Vec<(Delivery, Error)>) {
        for (delivery, err) in malformed {
            let id = delivery.entry.id;
            error!(
                "Entry {id} of {} could not be decoded: {err}",
                delivery.entry.stream
            );
            let reason = format!("undecodable entry: {err}");
            if let Err(e) = self.dead_letter(group, &delivery, &reason).await {
                warn!("Failed to dead-letter undecodable entry {id}: {e}");
            }
        }
    }

    /// Lowest id any group may still need: its oldest pending entry, or the
    /// entry after its read position.
    async fn retained_from(&self, stream: &str) -> Result<Option<EntryId>, Error> {
        let mut connection = self.connection.clone();
        let groups: StreamInfoGroupsReply = connection.xinfo_groups(stream).await?;
        if groups.groups.is_empty() {
            return Ok(None);
        }

        let mut floor: Option<EntryId> = None;
        for group in &groups.groups {
            let summary: StreamPendingReply = connection.xpending(stream, &group.name).await?;
            let needed = match summary {
                StreamPendingReply::Data(pending) if pending.count > 0 => {
                    pending.start_id.parse()?
                }
                _ => group.last_delivered_id.parse::<EntryId>()?.next(0),
            };
            floor = Some(floor.map_or(needed, |floor| floor.min(needed)));
        }
        Ok(floor)
    }
}

/// A batch of raw stream entries split into decoded deliveries and
/// undecodable ones salvaged for the dead-letter stream.
#[derive(Default)]
struct Decoded {
    deliveries: Vec<Delivery>,
    malformed: Vec<(Delivery, Error)>,
}

fn decode_batch<'a>(
    stream: &str,
    raws: impl IntoIterator<Item = &'a StreamId>,
    delivery_count: impl Fn(&StreamId) -> u32,
) -> Decoded {
    let mut decoded = Decoded::default();
    for raw in raws {
        let delivery_count = delivery_count(raw);
        match entry_from(stream, raw) {
            Ok(entry) => decoded.deliveries.push(Delivery {
                entry,
                delivery_count,
            }),
            Err(err) => match salvage(stream, raw) {
                Ok(entry) => decoded.malformed.push((
                    Delivery {
                        entry,
                        delivery_count,
                    },
                    err,
                )),
                Err(e) => error!("Skipping unaddressable entry {} of {stream}: {e}", raw.id),
            },
        }
    }
    decoded
}

fn field<T: FromRedisValue>(raw: &StreamId, name: &str) -> Result<T, Error> {
    raw.get(name).ok_or_else(|| {
        durable_error(
            DurableErrorKind::Encoding,
            format!("entry {} has no readable {name} field", raw.id),
        )
    })
}

fn timestamp(millis: i64) -> Result<DateTime<Utc>, Error> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        durable_error(
            DurableErrorKind::Encoding,
            format!("timestamp {millis} out of range"),
        )
    })
}

fn entry_from(stream: &str, raw: &StreamId) -> Result<Entry, Error> {
    Ok(Entry {
        id: raw.id.parse()?,
        stream: stream.to_string(),
        payload: field(raw, "payload")?,
        produced_at: timestamp(field(raw, "produced_at")?)?,
        target_group: raw.get(TARGET_GROUP),
    })
}

/// Best-effort entry for a raw one `entry_from` rejected. The payload falls
/// back to every field rendered as a JSON object, the production time to the
/// time encoded in the id.
fn salvage(stream: &str, raw: &StreamId) -> Result<Entry, Error> {
    let id: EntryId = raw.id.parse()?;
    let payload = raw.get("payload").unwrap_or_else(|| raw_fields(raw));
    let produced_at = raw
        .get::<i64>("produced_at")
        .and_then(DateTime::from_timestamp_millis)
        .or_else(|| DateTime::from_timestamp_millis(id.millis() as i64))
        .unwrap_or_else(Utc::now);

    Ok(Entry {
        id,
        stream: stream.to_string(),
        payload,
        produced_at,
        target_group: raw.get(TARGET_GROUP),
    })
}

fn raw_fields(raw: &StreamId) -> String {
    let fields: Map<String, serde_json::Value> = raw
        .map
        .iter()
        .map(|(name, value)| {
            let text = String::from_redis_value(value).unwrap_or_else(|_| format!("{value:?}"));
            (name.clone(), serde_json::Value::String(text))
        })
        .collect();
    serde_json::Value::Object(fields).to_string()
}

fn dead_letter_from(raw: &StreamId) -> Result<DeadLetter, Error> {
    let entry_id: String = field(raw, "entry_id")?;
    Ok(DeadLetter {
        id: raw.id.parse()?,
        stream: field(raw, "stream")?,
        group: field(raw, "group")?,
        entry_id: entry_id.parse()?,
        payload: field(raw, "payload")?,
        produced_at: timestamp(field(raw, "produced_at")?)?,
        delivery_count: field(raw, "delivery_count")?,
        reason: field(raw, "reason")?,
        failed_at: timestamp(field(raw, "failed_at")?)?,
    })
}

#[async_trait]
impl EventLog for RedisEventLog {
    async fn append(
        &self,
        stream: &str,
        payload: &str,
        produced_at: DateTime<Utc>,
    ) -> Result<EntryId, Error> {
        let mut connection = self.connection.clone();
        let fields = [
            ("payload", payload.to_string()),
            ("produced_at", produced_at.timestamp_millis().to_string()),
        ];
        let id: String = connection.xadd(stream, "*", &fields).await?;
        trace!("Appended entry {id} to {stream}");
        id.parse()
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), Error> {
        let mut connection = self.connection.clone();
        let created: RedisResult<()> = connection
            .xgroup_create_mkstream(stream, group, "0")
            .await;

        match created {
            Ok(()) => {
                info!("Created consumer group {group} on {stream}");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!("Consumer group {group} on {stream} already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, Error> {
        let mut connection = self.reader(consumer).await?;
        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        // BLOCK 0 would wait forever.
        if !block.is_zero() {
            options = options.block(block.as_millis() as usize);
        }

        let reply: Option<StreamReadReply> =
            match connection.xread_options(&[stream], &[">"], &options).await {
                Ok(reply) => reply,
                Err(e) => {
                    self.readers.remove(consumer);
                    return Err(e.into());
                }
            };

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };
        let raws = reply.keys.iter().flat_map(|key| key.ids.iter());
        let decoded = decode_batch(stream, raws, |_| 1);
        self.quarantine(group, decoded.malformed).await;
        Ok(decoded.deliveries)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<usize, Error> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
        let mut connection = self.connection.clone();
        let acked: usize = connection.xack(stream, group, &ids).await?;
        Ok(acked)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, Error> {
        let mut connection = self.connection.clone();
        let reply: StreamPendingCountReply = connection
            .xpending_count(stream, group, "-", "+", count)
            .await?;

        reply
            .ids
            .into_iter()
            .map(|row| {
                Ok(PendingEntry {
                    id: row.id.parse()?,
                    consumer: row.consumer,
                    idle: Duration::from_millis(row.last_delivered_ms as u64),
                    delivery_count: row.times_delivered as u32,
                })
            })
            .collect()
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<Delivery>, Error> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
        let mut connection = self.connection.clone();
        let reply: StreamClaimReply = connection
            .xclaim(stream, group, consumer, min_idle.as_millis() as u64, &ids)
            .await?;

        let mut counts = HashMap::with_capacity(reply.ids.len());
        for raw in &reply.ids {
            let count = self.delivery_count(stream, group, &raw.id).await?;
            counts.insert(raw.id.as_str(), count);
        }
        let decoded = decode_batch(stream, &reply.ids, |raw| {
            counts.get(raw.id.as_str()).copied().unwrap_or(1)
        });
        self.quarantine(group, decoded.malformed).await;
        Ok(decoded.deliveries)
    }

    async fn dead_letter(
        &self,
        group: &str,
        delivery: &Delivery,
        reason: &str,
    ) -> Result<EntryId, Error> {
        let entry = &delivery.entry;
        let dead_stream = dead_letter_stream(&entry.stream);
        let fields = [
            ("stream", entry.stream.clone()),
            ("group", group.to_string()),
            ("entry_id", entry.id.to_string()),
            ("payload", entry.payload.clone()),
            ("produced_at", entry.produced_at.timestamp_millis().to_string()),
            ("delivery_count", delivery.delivery_count.to_string()),
            ("reason", reason.to_string()),
            ("failed_at", Utc::now().timestamp_millis().to_string()),
        ];

        let mut connection = self.connection.clone();
        let (dead_id,): (String,) = ::redis::pipe()
            .atomic()
            .xadd(&dead_stream, "*", &fields)
            .xack(&entry.stream, group, &[entry.id.to_string()])
            .ignore()
            .query_async(&mut connection)
            .await?;

        debug!(
            "Dead-lettered entry {} of {} to {dead_stream} as {dead_id}",
            entry.id, entry.stream
        );
        dead_id.parse()
    }

    async fn dead_letters(&self, stream: &str) -> Result<Vec<DeadLetter>, Error> {
        let mut connection = self.connection.clone();
        let reply: StreamRangeReply = connection.xrange_all(dead_letter_stream(stream)).await?;
        reply.ids.iter().map(dead_letter_from).collect()
    }

    async fn replay_dead_letter(&self, stream: &str, id: &EntryId) -> Result<EntryId, Error> {
        let dead_stream = dead_letter_stream(stream);
        let raw_id = id.to_string();
        let mut connection = self.connection.clone();

        let reply: StreamRangeReply = connection.xrange(&dead_stream, &raw_id, &raw_id).await?;
        let record = match reply.ids.first() {
            Some(raw) => dead_letter_from(raw)?,
            None => {
                return Err(durable_error(
                    DurableErrorKind::NotFound,
                    format!("no dead letter {id} for {stream}"),
                ))
            }
        };

        let fields = [
            ("payload", record.payload),
            ("produced_at", record.produced_at.timestamp_millis().to_string()),
            (TARGET_GROUP, record.group),
        ];
        let (replayed,): (String,) = ::redis::pipe()
            .atomic()
            .xadd(stream, "*", &fields)
            .xdel(&dead_stream, &[&raw_id])
            .ignore()
            .query_async(&mut connection)
            .await?;

        info!("Replayed dead letter {id} onto {stream} as {replayed}");
        replayed.parse()
    }

    async fn trim(&self, stream: &str) -> Result<usize, Error> {
        let Some(min_id) = self.retained_from(stream).await? else {
            return Ok(0);
        };

        let mut connection = self.connection.clone();
        let released: usize = ::redis::cmd("XTRIM")
            .arg(stream)
            .arg("MINID")
            .arg(min_id.to_string())
            .query_async(&mut connection)
            .await?;
        if released > 0 {
            debug!("Trimmed {released} acknowledged entries from {stream}");
        }
        Ok(released)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::redis::Value;

    const STREAM: &str = "events:tasks";

    fn raw(id: &str, fields: &[(&str, &str)]) -> StreamId {
        StreamId {
            id: id.to_string(),
            map: fields
                .iter()
                .map(|(name, value)| {
                    (name.to_string(), Value::BulkString(value.as_bytes().to_vec()))
                })
                .collect(),
        }
    }

    fn good(id: &str) -> StreamId {
        raw(id, &[("payload", "{\"n\":1}"), ("produced_at", "1700000000000")])
    }

    #[test]
    fn entries_decode_from_their_fields() {
        let entry = entry_from(STREAM, &good("1700000000005-2")).unwrap();

        assert_eq!(entry.id, EntryId::new(1_700_000_000_005, 2));
        assert_eq!(entry.stream, STREAM);
        assert_eq!(entry.payload, "{\"n\":1}");
        assert_eq!(entry.produced_at.timestamp_millis(), 1_700_000_000_000);
        assert!(entry.target_group.is_none());

        let replayed = raw(
            "1700000000006-0",
            &[("payload", "x"), ("produced_at", "1"), (TARGET_GROUP, "push")],
        );
        let entry = entry_from(STREAM, &replayed).unwrap();
        assert_eq!(entry.target_group.as_deref(), Some("push"));
    }

    #[test]
    fn malformed_entries_are_rejected_with_their_kind() {
        let cases = [
            (raw("1-0", &[("produced_at", "1")]), DurableErrorKind::Encoding),
            (raw("1-0", &[("payload", "x")]), DurableErrorKind::Encoding),
            (
                raw("1-0", &[("payload", "x"), ("produced_at", "yesterday")]),
                DurableErrorKind::Encoding,
            ),
            (
                raw("1-0", &[("payload", "x"), ("produced_at", "9223372036854775807")]),
                DurableErrorKind::Encoding,
            ),
            (
                raw("not-an-id", &[("payload", "x"), ("produced_at", "1")]),
                DurableErrorKind::InvalidEntryId,
            ),
        ];

        for (raw, kind) in cases {
            let err = entry_from(STREAM, &raw).unwrap_err();
            assert_eq!(err.error_kind, kind, "{raw:?}");
        }
    }

    #[test]
    fn one_bad_entry_does_not_sink_its_batch() {
        let batch = [
            good("1700000000000-0"),
            raw("1700000000001-0", &[("body", "legacy")]),
            good("1700000000002-0"),
        ];

        let decoded = decode_batch(STREAM, &batch, |_| 3);

        let ids: Vec<String> = decoded
            .deliveries
            .iter()
            .map(|d| d.entry.id.to_string())
            .collect();
        assert_eq!(ids, ["1700000000000-0", "1700000000002-0"]);
        assert!(decoded.deliveries.iter().all(|d| d.delivery_count == 3));

        assert_eq!(decoded.malformed.len(), 1);
        let (salvaged, err) = &decoded.malformed[0];
        assert_eq!(err.error_kind, DurableErrorKind::Encoding);
        assert_eq!(salvaged.delivery_count, 3);
        assert_eq!(salvaged.entry.id, EntryId::new(1_700_000_000_001, 0));
        assert_eq!(salvaged.entry.produced_at.timestamp_millis(), 1_700_000_000_001);
        let fields: serde_json::Value = serde_json::from_str(&salvaged.entry.payload).unwrap();
        assert_eq!(fields, serde_json::json!({ "body": "legacy" }));
    }

    #[test]
    fn salvage_keeps_a_readable_payload() {
        let unreadable_time = raw("5-0", &[("payload", "kept"), ("produced_at", "soon")]);
        let entry = salvage(STREAM, &unreadable_time).unwrap();
        assert_eq!(entry.payload, "kept");
        assert_eq!(entry.produced_at.timestamp_millis(), 5);
    }

    #[test]
    fn unaddressable_entries_are_dropped_from_the_batch() {
        let decoded = decode_batch(STREAM, &[raw("garbage", &[])], |_| 1);
        assert!(decoded.deliveries.is_empty());
        assert!(decoded.malformed.is_empty());
    }

    #[test]
    fn dead_letters_decode_every_field() {
        let record = raw(
            "1700000000100-0",
            &[
                ("stream", STREAM),
                ("group", "push"),
                ("entry_id", "1700000000000-4"),
                ("payload", "poison"),
                ("produced_at", "1700000000000"),
                ("delivery_count", "5"),
                ("reason", "max deliveries exceeded: timeout"),
                ("failed_at", "1700000000099"),
            ],
        );

        let dead = dead_letter_from(&record).unwrap();
        assert_eq!(dead.id, EntryId::new(1_700_000_000_100, 0));
        assert_eq!(dead.stream, STREAM);
        assert_eq!(dead.group, "push");
        assert_eq!(dead.entry_id, EntryId::new(1_700_000_000_000, 4));
        assert_eq!(dead.payload, "poison");
        assert_eq!(dead.delivery_count, 5);
        assert_eq!(dead.reason, "max deliveries exceeded: timeout");
        assert_eq!(dead.failed_at.timestamp_millis(), 1_700_000_000_099);

        let mut truncated = record.clone();
        truncated.map.remove("reason");
        let err = dead_letter_from(&truncated).unwrap_err();
        assert_eq!(err.error_kind, DurableErrorKind::Encoding);
    }
}
