use crate::controller::{dead_letter_controller, event_controller, health_check_controller};
use crate::ws::handler::ws_handler;
use axum::{
    routing::{get, post},
    Router,
};
use service::AppState;

use utoipa::OpenApi;
use utoipa_rapidoc::RapiDoc;

// This is the global definition of our OpenAPI spec. To be a part
// of the rendered spec, a path and schema must be listed here.
#[derive(OpenApi)]
#[openapi(
        info(
            title = "Relay API"
        ),
        paths(
            health_check_controller::health_check,
            event_controller::emit,
            dead_letter_controller::index,
            dead_letter_controller::replay,
        ),
        components(
            schemas(
                event_controller::EmitRequest,
                event_controller::EmitResponse,
                dead_letter_controller::DeadLetterResponse,
                dead_letter_controller::ReplayResponse,
            )
        ),
        tags(
            (name = "relay", description = "Real-time fan-out and durable event delivery")
        )
    )]
struct ApiDoc;

pub fn define_routes(app_state: AppState) -> Router {
    Router::new()
        .merge(health_routes())
        .merge(websocket_routes(app_state.clone()))
        .merge(event_routes(app_state.clone()))
        .merge(dead_letter_routes(app_state))
        .merge(RapiDoc::with_openapi("/api-docs/openapi.json", ApiDoc::openapi()).path("/rapidoc"))
}

fn health_routes() -> Router {
    Router::new().route("/health", get(health_check_controller::health_check))
}

fn websocket_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(app_state)
}

fn event_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/events", post(event_controller::emit))
        .with_state(app_state)
}

fn dead_letter_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/dead-letters/:topic", get(dead_letter_controller::index))
        .route(
            "/dead-letters/:topic/:id/replay",
            post(dead_letter_controller::replay),
        )
        .with_state(app_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use axum::response::Response;
    use chrono::Utc;
    use clap::Parser;
    use durable::EntryId;
    use hub::Hub;
    use serde_json::{json, Value};
    use service::{config::Config, Backend};
    use std::time::Duration;
    use tower::ServiceExt;

    fn app_state(backend: &Backend) -> AppState {
        let config = Config::parse_from(["relay"]).set_replica_id("relay-test".to_string());
        AppState::new(config, Hub::spawn(16), backend)
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn authenticated(builder: axum::http::request::Builder) -> axum::http::request::Builder {
        builder
            .header("x-authenticated-user", "operator")
            .header("x-audience-scope", "org-42")
    }

    /// Appends one entry to `events:tasks` and dead-letters it.
    async fn dead_letter_one(backend: &Backend) -> EntryId {
        let log = &backend.event_log;
        log.append("events:tasks", r#"{"broken":true}"#, Utc::now())
            .await
            .unwrap();
        log.create_group("events:tasks", "audit").await.unwrap();
        let deliveries = log
            .read_group("events:tasks", "audit", "audit-0", 1, Duration::ZERO)
            .await
            .unwrap();
        log.dead_letter("audit", &deliveries[0], "malformed payload")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn health_check_responds_ok() {
        let backend = Backend::in_memory(16);
        let app = define_routes(app_state(&backend));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn websocket_upgrade_requires_an_identity() {
        let backend = Backend::in_memory(16);
        let state = app_state(&backend);
        let hub = state.hub.clone();
        let app = define_routes(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/ws")
                    .header(header::CONNECTION, "upgrade")
                    .header(header::UPGRADE, "websocket")
                    .header(header::SEC_WEBSOCKET_VERSION, "13")
                    .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(hub.connected().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn emitted_events_are_accepted_and_reported() {
        let backend = Backend::in_memory(16);
        let app = define_routes(app_state(&backend));

        let request = authenticated(Request::builder())
            .method("POST")
            .uri("/events")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({
                    "topic": "tasks",
                    "audience": {"scope": "channel", "name": "org-42"},
                    "payload": {"id": 1, "status": "done"}
                })
                .to_string(),
            ))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(
            json_body(response).await,
            json!({"delivered": ["fanout", "durable"], "failed": []})
        );
    }

    #[tokio::test]
    async fn emitting_without_a_topic_is_rejected() {
        let backend = Backend::in_memory(16);
        let app = define_routes(app_state(&backend));

        let request = authenticated(Request::builder())
            .method("POST")
            .uri("/events")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({"topic": " ", "audience": {"scope": "broadcast"}, "payload": {}})
                    .to_string(),
            ))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn dead_letters_are_listed_per_topic() {
        let backend = Backend::in_memory(16);
        let id = dead_letter_one(&backend).await;
        let app = define_routes(app_state(&backend));

        let response = app
            .oneshot(
                authenticated(Request::builder())
                    .uri("/dead-letters/tasks")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let listed = body.as_array().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["id"], json!(id.to_string()));
        assert_eq!(listed[0]["stream"], json!("events:tasks"));
        assert_eq!(listed[0]["reason"], json!("malformed payload"));
        assert_eq!(listed[0]["delivery_count"], json!(1));
    }

    #[tokio::test]
    async fn replaying_a_dead_letter_moves_it_back_to_the_stream() {
        let backend = Backend::in_memory(16);
        let id = dead_letter_one(&backend).await;
        let app = define_routes(app_state(&backend));
        let uri = format!("/dead-letters/tasks/{id}/replay");

        let response = app
            .clone()
            .oneshot(
                authenticated(Request::builder())
                    .method("POST")
                    .uri(&uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let remaining = backend
            .event_log
            .dead_letters("events:tasks")
            .await
            .unwrap();
        assert!(remaining.is_empty());

        let again = app
            .oneshot(
                authenticated(Request::builder())
                    .method("POST")
                    .uri(&uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_dead_letter_ids_are_unprocessable() {
        let backend = Backend::in_memory(16);
        let app = define_routes(app_state(&backend));

        let response = app
            .oneshot(
                authenticated(Request::builder())
                    .method("POST")
                    .uri("/dead-letters/tasks/not-an-id/replay")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
