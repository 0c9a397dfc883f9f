//! Error types for the `durable` crate.

use std::error::Error as StdError;
use std::fmt;

#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: DurableErrorKind,
}

#[derive(Debug, PartialEq)]
pub enum DurableErrorKind {
    /// The backing store could not be reached.
    Connection,
    /// The backing store rejected a command.
    Command,
    /// Reading from a consumer group that was never created.
    MissingGroup,
    /// A stored entry or dead letter is missing fields or holds garbage.
    Encoding,
    InvalidEntryId,
    NotFound,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Durable log error: {:?}", self.error_kind)?;
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        let error_kind = if err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_io_error()
            || err.is_timeout()
        {
            DurableErrorKind::Connection
        } else if err.code() == Some("NOGROUP") {
            DurableErrorKind::MissingGroup
        } else {
            DurableErrorKind::Command
        };

        Error {
            source: Some(Box::new(err)),
            error_kind,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: DurableErrorKind::Encoding,
        }
    }
}

impl From<Error> for events::Error {
    fn from(err: Error) -> Self {
        events::error::delivery_error(events::error::DeliveryErrorKind::Durable, err)
    }
}

/// Helper function to create an error that carries only a message.
pub fn durable_error(kind: DurableErrorKind, message: impl Into<String>) -> Error {
    let message: String = message.into();
    Error {
        source: Some(message.into()),
        error_kind: kind,
    }
}
