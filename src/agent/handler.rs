//! HTTP and WebSocket routes for the agent module
//!
//! REST endpoints for session management plus the WebSocket upgrade route
//! for CLI and browser connections. All handlers delegate to
//! [`AgentService`]; none carry logic of their own.

use crate::agent::service::AgentService;
use crate::agent::transport;
use crate::agent::types::*;
use crate::error::Error;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;

/// Shared state for agent handlers
#[derive(Clone)]
pub struct AgentState {
    pub service: Arc<AgentService>,
}

/// Create the agent router with all REST and WebSocket endpoints
pub fn agent_router(state: AgentState) -> Router {
    Router::new()
        // REST endpoints
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/:id", get(get_session).delete(delete_session))
        // WebSocket endpoints: /ws/cli/:id and /ws/browser/:id
        .route("/ws/*path", get(transport::ws_upgrade))
        .with_state(state)
}

/// Create session request body
#[derive(Debug, Default, Deserialize)]
struct CreateSessionRequest {
    cwd: Option<String>,
    model: Option<String>,
    permission_mode: Option<String>,
}

/// Create a session and launch its CLI process
async fn create_session(
    State(state): State<AgentState>,
    request: Option<Json<CreateSessionRequest>>,
) -> impl IntoResponse {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let options = SessionOptions {
        cwd: request.cwd,
        model: request.model,
        permission_mode: request.permission_mode,
    };

    match state.service.create_session(options).await {
        Ok(info) => (StatusCode::CREATED, Json(serde_json::json!(info))),
        Err(e) => {
            let status = match e {
                Error::Launch(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(serde_json::json!({ "error": e.to_string() })))
        }
    }
}

/// List all sessions in creation order
async fn list_sessions(State(state): State<AgentState>) -> impl IntoResponse {
    Json(state.service.list_sessions().await)
}

/// Get a specific session by ID
async fn get_session(State(state): State<AgentState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.service.get_session(&id).await {
        Some(info) => (StatusCode::OK, Json(serde_json::json!(info))),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": Error::SessionNotFound(id).to_string() })),
        ),
    }
}

/// Delete a session. Unknown ids succeed as well.
async fn delete_session(
    State(state): State<AgentState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    state.service.delete_session(&id).await;
    StatusCode::NO_CONTENT
}
