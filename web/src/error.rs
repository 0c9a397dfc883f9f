use std::error::Error as StdError;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use durable::error::{DurableErrorKind, Error as DurableError};
use log::*;

#[derive(Debug)]
pub struct Error(DurableError);

impl StdError for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> core::result::Result<(), std::fmt::Error> {
        write!(fmt, "{}", self.0)
    }
}

// List of possible StatusCode variants https://docs.rs/http/latest/http/status/struct.StatusCode.html#associatedconstant.UNPROCESSABLE_ENTITY
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self.0.error_kind {
            DurableErrorKind::NotFound => (StatusCode::NOT_FOUND, "NOT FOUND").into_response(),
            DurableErrorKind::InvalidEntryId => {
                (StatusCode::UNPROCESSABLE_ENTITY, "UNPROCESSABLE ENTITY").into_response()
            }
            DurableErrorKind::Connection => {
                warn!("Event log unavailable: {}", self.0);
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE UNAVAILABLE").into_response()
            }
            DurableErrorKind::Command
            | DurableErrorKind::MissingGroup
            | DurableErrorKind::Encoding => {
                error!("Event log request failed: {}", self.0);
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL SERVER ERROR").into_response()
            }
        }
    }
}

impl From<DurableError> for Error {
    fn from(err: DurableError) -> Self {
        Self(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use durable::error::durable_error;

    fn status_for(kind: DurableErrorKind) -> StatusCode {
        Error::from(durable_error(kind, "test")).into_response().status()
    }

    #[test]
    fn durable_errors_map_to_status_codes() {
        assert_eq!(status_for(DurableErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(DurableErrorKind::InvalidEntryId),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(DurableErrorKind::Connection),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(DurableErrorKind::Encoding),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
