use crate::error::{durable_error, DurableErrorKind, Error};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Stream entry id in `<millis>-<seq>` form, ordered by time then sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntryId {
    millis: u64,
    seq: u64,
}

impl EntryId {
    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    pub fn millis(&self) -> u64 {
        self.millis
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// The smallest id greater than `self`, taking the clock's millis when it moved forward.
    pub fn next(&self, now_millis: u64) -> Self {
        if now_millis > self.millis {
            Self::new(now_millis, 0)
        } else {
            Self::new(self.millis, self.seq + 1)
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || durable_error(DurableErrorKind::InvalidEntryId, format!("'{s}'"));
        let (millis, seq) = s.split_once('-').ok_or_else(invalid)?;
        Ok(Self {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for EntryId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntryId> for String {
    fn from(id: EntryId) -> Self {
        id.to_string()
    }
}

/// An appended entry. The payload is opaque to the log.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: EntryId,
    pub stream: String,
    pub payload: String,
    pub produced_at: DateTime<Utc>,
    /// Set on replayed dead letters: only this group processes the entry,
    /// every other group acknowledges it unseen.
    pub target_group: Option<String>,
}

impl Entry {
    /// Whether `group` should process this entry.
    pub fn is_for(&self, group: &str) -> bool {
        self.target_group.as_deref().map_or(true, |target| target == group)
    }
}

/// An entry handed to one consumer of a group.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub entry: Entry,
    /// 1 on the first read; every claim adds one.
    pub delivery_count: u32,
}

/// One row of a group's pending set.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub id: EntryId,
    pub consumer: String,
    /// Time since the entry was last delivered.
    pub idle: Duration,
    pub delivery_count: u32,
}

/// An entry that exhausted its retries or failed permanently, kept in `<stream>:dead`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Id within the dead-letter stream.
    pub id: EntryId,
    /// Stream the entry was originally appended to.
    pub stream: String,
    pub group: String,
    pub entry_id: EntryId,
    pub payload: String,
    pub produced_at: DateTime<Utc>,
    pub delivery_count: u32,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_ids_parse_and_order() {
        let early: EntryId = "1700000000000-3".parse().unwrap();
        let later: EntryId = "1700000000001-0".parse().unwrap();

        assert_eq!(early, EntryId::new(1_700_000_000_000, 3));
        assert!(early < later);
        assert!(EntryId::new(5, 1) > EntryId::new(5, 0));
        assert_eq!(early.to_string(), "1700000000000-3");
    }

    #[test]
    fn malformed_ids_are_rejected() {
        for raw in ["", "12", "12-", "-3", "a-b", "1-2-3"] {
            let err = raw.parse::<EntryId>().unwrap_err();
            assert_eq!(err.error_kind, DurableErrorKind::InvalidEntryId, "{raw}");
        }
    }

    #[test]
    fn next_id_is_monotonic_even_when_the_clock_stalls() {
        let id = EntryId::new(100, 4);
        assert_eq!(id.next(100), EntryId::new(100, 5));
        assert_eq!(id.next(90), EntryId::new(100, 5));
        assert_eq!(id.next(101), EntryId::new(101, 0));
    }

    #[test]
    fn replayed_entries_belong_to_their_target_group_only() {
        let mut entry = Entry {
            id: EntryId::new(1, 0),
            stream: "events:tasks".to_string(),
            payload: "{}".to_string(),
            produced_at: Utc::now(),
            target_group: None,
        };
        assert!(entry.is_for("push"));
        assert!(entry.is_for("audit"));

        entry.target_group = Some("push".to_string());
        assert!(entry.is_for("push"));
        assert!(!entry.is_for("audit"));
    }

    #[test]
    fn entry_id_serializes_as_a_string() {
        let json = serde_json::to_string(&EntryId::new(42, 7)).unwrap();
        assert_eq!(json, "\"42-7\"");
        assert_eq!(serde_json::from_str::<EntryId>(&json).unwrap(), EntryId::new(42, 7));
    }
}
