use crate::error::Error;
use crate::extractors::authenticated_user::AuthenticatedUser;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use durable::{stream_for, DeadLetter, EntryId};
use log::*;
use serde::Serialize;
use service::AppState;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct DeadLetterResponse {
    pub id: String,
    pub stream: String,
    pub group: String,
    pub entry_id: String,
    /// Original entry payload, verbatim.
    pub payload: String,
    pub produced_at: DateTime<Utc>,
    pub delivery_count: u32,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

impl From<DeadLetter> for DeadLetterResponse {
    fn from(dead: DeadLetter) -> Self {
        Self {
            id: dead.id.to_string(),
            stream: dead.stream,
            group: dead.group,
            entry_id: dead.entry_id.to_string(),
            payload: dead.payload,
            produced_at: dead.produced_at,
            delivery_count: dead.delivery_count,
            reason: dead.reason,
            failed_at: dead.failed_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ReplayResponse {
    /// Id of the entry re-appended to the topic stream.
    pub entry_id: String,
}

/// GET all dead letters recorded for a topic
#[utoipa::path(
    get,
    path = "/dead-letters/{topic}",
    params(
        ("topic" = String, Path, description = "Topic whose dead letters to list"),
    ),
    responses(
        (status = 200, description = "Dead letters, oldest first", body = [DeadLetterResponse]),
        (status = 401, description = "Unauthorized"),
        (status = 503, description = "Event log unavailable"),
    )
)]
pub async fn index(
    AuthenticatedUser(identity): AuthenticatedUser,
    State(app_state): State<AppState>,
    Path(topic): Path<String>,
) -> Result<impl IntoResponse, Error> {
    debug!("User {} listing dead letters for {topic}", identity.user_id);

    let stream = stream_for(&app_state.config.stream_prefix, &topic);
    let dead_letters: Vec<DeadLetterResponse> = app_state
        .event_log
        .dead_letters(&stream)
        .await?
        .into_iter()
        .map(DeadLetterResponse::from)
        .collect();

    Ok(Json(dead_letters))
}

/// POST re-append a dead letter to its topic stream
#[utoipa::path(
    post,
    path = "/dead-letters/{topic}/{id}/replay",
    params(
        ("topic" = String, Path, description = "Topic the dead letter belongs to"),
        ("id" = String, Path, description = "Dead letter id"),
    ),
    responses(
        (status = 201, description = "Dead letter replayed", body = ReplayResponse),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "No such dead letter"),
        (status = 422, description = "Malformed id"),
    )
)]
pub async fn replay(
    AuthenticatedUser(identity): AuthenticatedUser,
    State(app_state): State<AppState>,
    Path((topic, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, Error> {
    let id: EntryId = id.parse()?;
    let stream = stream_for(&app_state.config.stream_prefix, &topic);

    let entry_id = app_state.event_log.replay_dead_letter(&stream, &id).await?;
    info!(
        "User {} replayed dead letter {id} on {stream} as entry {entry_id}",
        identity.user_id
    );

    Ok((
        StatusCode::CREATED,
        Json(ReplayResponse {
            entry_id: entry_id.to_string(),
        }),
    ))
}
