//! Error types for the `events` crate.
//!
//! Delivery paths translate their own errors into this type at the
//! `EventHandler` boundary so the publisher can log them uniformly.

use std::error::Error as StdError;
use std::fmt;

/// Root error type returned by event handlers.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: EventErrorKind,
}

/// Major categories of failures while handing an event to a delivery path.
#[derive(Debug, PartialEq)]
pub enum EventErrorKind {
    /// The event could not be serialized for transport.
    Encoding,
    /// The delivery path's backing store rejected or failed the write.
    Delivery(DeliveryErrorKind),
}

/// Which delivery path failed.
#[derive(Debug, PartialEq)]
pub enum DeliveryErrorKind {
    Fanout,
    Durable,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_kind {
            EventErrorKind::Encoding => write!(f, "Event encoding error")?,
            EventErrorKind::Delivery(kind) => write!(f, "Event delivery error: {kind:?}")?,
        }
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

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: EventErrorKind::Encoding,
        }
    }
}

/// Helper function to create delivery errors from any lower-layer error.
pub fn delivery_error<E>(kind: DeliveryErrorKind, err: E) -> Error
where
    E: StdError + Send + Sync + 'static,
{
    Error {
        source: Some(Box::new(err)),
        error_kind: EventErrorKind::Delivery(kind),
    }
}
