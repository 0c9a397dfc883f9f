//! Error types for the `fanout` crate.

use std::error::Error as StdError;
use std::fmt;

#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: FanoutErrorKind,
}

#[derive(Debug, PartialEq)]
pub enum FanoutErrorKind {
    /// Could not reach the pub/sub backend.
    Connection,
    Publish,
    Subscribe,
    /// An envelope could not be serialized or deserialized.
    Encoding,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Fan-out error: {:?}", self.error_kind)?;
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
            error_kind: FanoutErrorKind::Encoding,
        }
    }
}

impl From<Error> for events::Error {
    fn from(err: Error) -> Self {
        events::error::delivery_error(events::error::DeliveryErrorKind::Fanout, err)
    }
}

/// Helper function to wrap a backend error with a fan-out error kind.
pub fn fanout_error<E>(kind: FanoutErrorKind, err: E) -> Error
where
    E: StdError + Send + Sync + 'static,
{
    Error {
        source: Some(Box::new(err)),
        error_kind: kind,
    }
}
