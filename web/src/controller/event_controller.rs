use crate::extractors::authenticated_user::AuthenticatedUser;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use events::{Audience, EmitReport};
use log::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use service::AppState;
use utoipa::ToSchema;

#[derive(Debug, Deserialize, ToSchema)]
pub struct EmitRequest {
    /// Stream key for durable delivery, e.g. "tasks".
    pub topic: String,
    /// `{"scope":"channel","name":..}`, `{"scope":"user","user_id":..}` or `{"scope":"broadcast"}`.
    #[schema(value_type = Object)]
    pub audience: Audience,
    #[schema(value_type = Object)]
    pub payload: Value,
}

/// Which delivery paths accepted the event.
#[derive(Debug, Serialize, ToSchema)]
pub struct EmitResponse {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

impl From<EmitReport> for EmitResponse {
    fn from(report: EmitReport) -> Self {
        Self {
            delivered: report.delivered.into_iter().map(String::from).collect(),
            failed: report.failed.into_iter().map(String::from).collect(),
        }
    }
}

/// POST emit an event to live sessions and the durable log
///
/// Delivery failures never fail the request; they are reported per path.
#[utoipa::path(
    post,
    path = "/events",
    request_body = EmitRequest,
    responses(
        (status = 202, description = "Event accepted", body = EmitResponse),
        (status = 401, description = "Unauthorized"),
        (status = 422, description = "Empty topic"),
    )
)]
pub async fn emit(
    AuthenticatedUser(identity): AuthenticatedUser,
    State(app_state): State<AppState>,
    Json(request): Json<EmitRequest>,
) -> Response {
    if request.topic.trim().is_empty() {
        return (StatusCode::UNPROCESSABLE_ENTITY, "topic must not be empty").into_response();
    }

    debug!(
        "User {} emitting on topic {} to {}",
        identity.user_id, request.topic, request.audience
    );

    let report = app_state
        .publisher
        .emit(request.topic, request.audience, request.payload)
        .await;

    (StatusCode::ACCEPTED, Json(EmitResponse::from(report))).into_response()
}
