use crate::api::handler::PanelHandler;
use crate::error::{AppError, ErrorBody};
use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::Stream;
use serde_json::{json, Map, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.code() {
            "invalid_params" => StatusCode::BAD_REQUEST,
            "blocked" => StatusCode::FORBIDDEN,
            "not_found" => StatusCode::NOT_FOUND,
            "unsupported" => StatusCode::NOT_IMPLEMENTED,
            "engine" => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": ErrorBody::from(&self) }))).into_response()
    }
}

pub fn router(handler: Arc<PanelHandler>) -> Router {
    Router::new()
        .route("/api/actions", get(list_actions))
        .route("/api/actions/:action", post(dispatch_action))
        .route("/api/events", get(event_stream))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(handler)
}

async fn list_actions(State(handler): State<Arc<PanelHandler>>) -> impl IntoResponse {
    Json(handler.list_actions())
}

/// An empty body or `null` means no params.
fn params_from_body(body: &[u8]) -> Result<Map<String, Value>, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(body).map_err(|e| AppError::InvalidInputArgument(e.to_string()))? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(AppError::InvalidInputArgument(format!(
            "params must be a JSON object, got {}",
            other
        ))),
    }
}

async fn dispatch_action(
    State(handler): State<Arc<PanelHandler>>,
    Path(action): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let params = params_from_body(&body)?;
    Ok(Json(handler.dispatch(&action, params).await?))
}

async fn event_stream(State(handler): State<Arc<PanelHandler>>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut events = handler.events().subscribe();
    let stream = async_stream::stream! {
        loop {
            match events.recv().await {
                Ok(event) => match Event::default().event("lifecycle").id(event.seq.to_string()).json_data(&event) {
                    Ok(sse_event) => yield Ok::<Event, Infallible>(sse_event),
                    Err(e) => warn!(error = %e, seq = event.seq, "Failed to encode lifecycle event"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "SSE client fell behind; events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c; serving until killed");
        std::future::pending::<()>().await;
    }
}

pub async fn serve_sse(handler: Arc<PanelHandler>, host: &str, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", host, port))?;
    info!(address = %listener.local_addr()?, "Listening for HTTP/SSE clients");

    axum::serve(listener, router(handler.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    handler.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handler::testing::handler;
    use crate::engine::EngineCli;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn call(app: Router, method: &str, uri: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn actions_are_listed_and_dispatched() {
        let (runner, handler) = handler();
        let app = router(handler);

        let (status, body) = call(app.clone(), "GET", "/api/actions", "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().iter().any(|a| a["name"] == "list_images"));

        let engine = EngineCli::new("docker");
        runner.respond(engine.images(), Ok(""));
        runner.respond(engine.image_usage(), Ok(""));
        let (status, body) = call(app, "POST", "/api/actions/list_images", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "No images found.");
    }

    #[tokio::test]
    async fn errors_map_to_http_statuses() {
        let (runner, handler) = handler();
        let app = router(handler);

        let (status, body) = call(app.clone(), "POST", "/api/actions/nope", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "not_found");

        let (status, _) = call(app.clone(), "POST", "/api/actions/open_manage", "[1, 2]").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        runner.respond(vec!["docker".into(), "start".into(), "web1".into()], Err("No such container: web1"));
        let (status, body) = call(
            app,
            "POST",
            "/api/actions/container_action",
            r#"{"name": "web1", "action": "start"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"]["message"].as_str().unwrap().contains("No such container"));
    }

    #[tokio::test]
    async fn blocked_commands_are_forbidden() {
        let (runner, handler) = handler();
        runner.respond(EngineCli::new("docker").logs("db1", 100), Ok(""));
        let app = router(handler);

        call(app.clone(), "POST", "/api/actions/open_manage", r#"{"name": "db1"}"#).await;
        call(app.clone(), "POST", "/api/actions/open_terminal", "null").await;
        let (status, body) = call(app, "POST", "/api/actions/run_command", r#"{"command": "shutdown now"}"#).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "blocked");
    }
}
