//! Error types for the `service` crate.

use std::error::Error as StdError;
use std::fmt;

#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ServiceErrorKind,
}

/// Which piece of infrastructure failed to come up.
#[derive(Debug, PartialEq)]
pub enum ServiceErrorKind {
    EventLog,
    PubSub,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Service startup error: {:?}", self.error_kind)?;
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

impl From<durable::Error> for Error {
    fn from(err: durable::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ServiceErrorKind::EventLog,
        }
    }
}

impl From<fanout::Error> for Error {
    fn from(err: fanout::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ServiceErrorKind::PubSub,
        }
    }
}
