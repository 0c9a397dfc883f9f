//! Error types for the `hub` crate.

use std::error::Error as StdError;
use std::fmt;

#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: HubErrorKind,
}

#[derive(Debug, PartialEq)]
pub enum HubErrorKind {
    /// The hub's command loop has shut down and no longer accepts commands.
    Stopped,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.error_kind {
            HubErrorKind::Stopped => write!(f, "Hub error: command loop stopped"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

pub(crate) fn stopped() -> Error {
    Error {
        source: None,
        error_kind: HubErrorKind::Stopped,
    }
}
