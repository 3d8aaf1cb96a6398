//! HTTP and WebSocket surface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::execution::ExecutionId;
use crate::gateway::WireEvent;
use crate::orchestrator::{Orchestrator, SubmitRequest};
use crate::stream::Subscription;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/execute", post(execute))
        .route("/api/executions", get(list_executions))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/cancel", post(cancel_execution))
        .route("/api/executions/{id}/events", get(execution_events))
        .layer(CorsLayer::permissive())
        .with_state(orchestrator)
}

/// Serve until Ctrl-C, then cancel running executions and release their sandboxes.
pub async fn serve(orchestrator: Arc<Orchestrator>, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    let addr: SocketAddr = listener.local_addr()?;
    info!(%addr, backend = orchestrator.backend_name(), "Listening");

    axum::serve(listener, router(orchestrator.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    orchestrator.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "OK", "message": "Server is running!" }))
}

async fn execute(
    State(orchestrator): State<Arc<Orchestrator>>,
    body: std::result::Result<Json<SubmitRequest>, JsonRejection>,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.body_text()))?;
    let id = orchestrator
        .submit(request)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(json!({ "executionId": id })))
}

async fn list_executions(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    Json(orchestrator.list())
}

async fn get_execution(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    orchestrator
        .status(&ExecutionId::from(id))
        .map(Json)
        .map_err(|e| ApiError::not_found(e.to_string()))
}

async fn cancel_execution(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let cancelled = orchestrator
        .cancel(&ExecutionId::from(id))
        .map_err(|e| ApiError::not_found(e.to_string()))?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "cancelled": cancelled }))))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    since: Option<u64>,
}

async fn execution_events(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    // Subscribe before upgrading so unknown ids get a plain 404 and no
    // event is missed between the check and the handshake.
    let subscription = match orchestrator.subscribe(&ExecutionId::from(id), query.since) {
        Ok(subscription) => subscription,
        Err(e) => return ApiError::not_found(e.to_string()).into_response(),
    };

    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| stream_events(socket, subscription)),
        Err(rejection) => rejection.into_response(),
    }
}

async fn stream_events(mut socket: WebSocket, mut subscription: Subscription) {
    let id = subscription.execution_id().clone();
    debug!(execution_id = %id, "Subscriber attached");

    loop {
        tokio::select! {
            event = subscription.next() => match event {
                Some(event) => {
                    let payload = match serde_json::to_string(&WireEvent::from(event.as_ref())) {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(execution_id = %id, error = %e, "Failed to encode event");
                            break;
                        }
                    };
                    if socket.send(Message::Text(payload.into())).await.is_err() {
                        return;
                    }
                    if event.is_terminal() {
                        break;
                    }
                }
                None => {
                    if subscription.lagged() {
                        debug!(execution_id = %id, last_seq = subscription.last_seq(), "Subscriber fell behind");
                        let frame = CloseFrame {
                            code: close_code::AGAIN,
                            reason: format!("lagged after seq {}", subscription.last_seq()).into(),
                        };
                        let _ = socket.send(Message::Close(Some(frame))).await;
                        return;
                    }
                    break;
                }
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    debug!(execution_id = %id, "Subscriber left");
                    return;
                }
                _ => {}
            },
        }
    }

    let _ = socket.send(Message::Close(None)).await;
}
