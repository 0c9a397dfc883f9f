use crate::extractors::RejectionType;
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use hub::Identity;
use log::*;

/// Header carrying the user id verified by the authentication gateway.
pub(crate) const USER_HEADER: &str = "x-authenticated-user";
/// Comma-separated audience scopes (e.g. tenant ids) the gateway granted the user.
pub(crate) const SCOPE_HEADER: &str = "x-audience-scope";

pub(crate) struct AuthenticatedUser(pub Identity);

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = RejectionType;

    // The gateway in front of the relay authenticates every request and
    // forwards the verified identity as trusted headers. A request without
    // them never reached the gateway's auth check and is rejected.
    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|user_id| !user_id.is_empty())
            .ok_or_else(|| {
                debug!("Rejecting request without a verified identity");
                (StatusCode::UNAUTHORIZED, "Unauthorized".to_string())
            })?;

        let scopes = parts
            .headers
            .get(SCOPE_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(parse_scopes)
            .unwrap_or_default();

        Ok(AuthenticatedUser(Identity::new(user_id, scopes)))
    }
}

fn parse_scopes(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|scope| !scope.is_empty())
        .map(str::to_string)
        .collect()
}
