//! HTTP surface for the stock analysis orchestrator
//!
//! POST /chat runs one coordinator request and streams its events over
//! SSE; GET /health reports liveness. The stream always terminates with
//! the [DONE] marker, even when the worker dies before its final event.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::agent::Coordinator;
use crate::events::{EventEmitter, StreamEvent, DONE_MARKER};
use crate::models::ChatRequest;

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Arc<Coordinator>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Chat Endpoint
/// =============================

fn validate(req: &ChatRequest) -> std::result::Result<(), String> {
    if req.user_id <= 0 {
        return Err("user_id must be positive".to_string());
    }
    if req.thread_id.trim().is_empty() {
        return Err("thread_id must not be empty".to_string());
    }
    if req.message.trim().is_empty() {
        return Err("message must not be empty".to_string());
    }
    Ok(())
}

async fn chat(
    State(state): State<ApiState>,
    Json(req): Json<ChatRequest>,
) -> std::result::Result<
    Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>,
    (StatusCode, Json<ApiResponse>),
> {
    if let Err(reason) = validate(&req) {
        return Err((StatusCode::BAD_REQUEST, Json(ApiResponse::error(reason))));
    }

    info!(
        thread_id = %req.thread_id,
        user_id = req.user_id,
        "chat request accepted"
    );

    let (emitter, rx) = EventEmitter::channel(64);
    let coordinator = state.coordinator.clone();
    tokio::spawn(async move { coordinator.handle(req, emitter).await });

    let stream = frame_events(rx).map(|payload| Ok(Event::default().data(payload)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// =============================
/// Stream Framing
/// =============================

struct Framing {
    rx: mpsc::Receiver<StreamEvent>,
    final_seen: bool,
    done_sent: bool,
}

/// One JSON line per event, a synthesized final if the worker dropped the
/// channel without one, then the [DONE] marker.
pub fn frame_events(rx: mpsc::Receiver<StreamEvent>) -> impl Stream<Item = String> {
    stream::unfold(
        Framing {
            rx,
            final_seen: false,
            done_sent: false,
        },
        |mut framing| async move {
            if framing.done_sent {
                return None;
            }
            if framing.final_seen {
                framing.done_sent = true;
                return Some((DONE_MARKER.to_string(), framing));
            }

            let event = match framing.rx.recv().await {
                Some(event) => event,
                None => {
                    warn!("worker dropped the stream before its final event");
                    StreamEvent::Final {
                        message: "요청 처리가 중단되었습니다.".to_string(),
                        context: serde_json::Value::Null,
                        proposal: None,
                        error: Some("stream ended without a final event".to_string()),
                    }
                }
            };
            if event.is_final() {
                framing.final_seen = true;
            }

            let payload = serde_json::to_string(&event).unwrap_or_else(|e| {
                warn!(error = %e, "event serialization failed");
                format!(
                    r#"{{"type":"final","message":"","context":null,"proposal":null,"error":"{}"}}"#,
                    "event serialization failed"
                )
            });
            Some((payload, framing))
        },
    )
}

/// =============================
/// Router
/// =============================

pub fn create_router(coordinator: Arc<Coordinator>) -> Router {
    let state = ApiState { coordinator };

    Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    coordinator: Arc<Coordinator>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(coordinator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API server listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
