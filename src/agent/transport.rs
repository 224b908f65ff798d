//! WebSocket transport adapter
//!
//! Classifies upgrade requests by path into CLI or browser endpoints and
//! pumps frames between the socket and the bridge. Holds no session state.
//!
//! ```text
//! /ws/cli/{session_id}      CLI dial-back (NDJSON)
//! /ws/browser/{session_id}  browser client (JSON)
//! ```

use crate::agent::bridge::AgentBridge;
use crate::agent::handler::AgentState;
use crate::agent::types::{ConnectionKind, SocketCommand, SocketHandle};
use crate::error::{Error, Result};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use regex::Regex;
use std::borrow::Cow;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;

static ENDPOINT_RE: OnceLock<Regex> = OnceLock::new();

fn endpoint_regex() -> &'static Regex {
    ENDPOINT_RE.get_or_init(|| {
        Regex::new(r"^/ws/(cli|browser)/([0-9a-f-]{1,64})$").expect("endpoint pattern is valid")
    })
}

/// Classified WebSocket endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub kind: ConnectionKind,
    pub session_id: String,
}

/// Classify an upgrade request path
pub fn classify(path: &str) -> Result<Endpoint> {
    let captures = endpoint_regex()
        .captures(path)
        .ok_or_else(|| Error::InvalidEndpoint(path.to_string()))?;
    let kind = match &captures[1] {
        "cli" => ConnectionKind::Cli,
        _ => ConnectionKind::Browser,
    };
    Ok(Endpoint {
        kind,
        session_id: captures[2].to_string(),
    })
}

/// Upgrade handler for `/ws/*path`.
///
/// The path is validated before the upgrade; anything that is not a CLI or
/// browser endpoint with a well-formed session id gets HTTP 400.
pub async fn ws_upgrade(
    State(state): State<AgentState>,
    uri: Uri,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let endpoint = match classify(uri.path()) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            tracing::warn!(path = %uri.path(), "Rejected WebSocket upgrade: {}", e);
            return bad_request(e.to_string());
        }
    };
    let Some(ws) = ws else {
        return bad_request("WebSocket upgrade required".to_string());
    };

    let bridge = state.service.bridge().clone();
    ws.on_upgrade(move |socket| handle_socket(socket, endpoint, bridge))
        .into_response()
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

/// Drive one upgraded connection until either side closes it
async fn handle_socket(socket: WebSocket, endpoint: Endpoint, bridge: Arc<AgentBridge>) {
    let Endpoint { kind, session_id } = endpoint;
    let connection_id = uuid::Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel for bridge → socket outbound frames
    let (tx, mut rx) = mpsc::unbounded_channel::<SocketCommand>();
    let handle = SocketHandle::new(connection_id.clone(), tx);

    let opened = match kind {
        ConnectionKind::Cli => bridge.handle_cli_open(&session_id, handle).await,
        ConnectionKind::Browser => bridge.handle_browser_open(&session_id, handle).await,
    };
    if let Err(e) = opened {
        tracing::warn!(
            session_id = %session_id,
            kind = ?kind,
            "Rejected WebSocket connection: {}",
            e
        );
        let _ = ws_sender
            .send(Message::Close(Some(CloseFrame {
                code: e.close_code(),
                reason: Cow::Owned(e.to_string()),
            })))
            .await;
        return;
    }

    tracing::debug!(
        session_id = %session_id,
        connection_id = %connection_id,
        kind = ?kind,
        "WebSocket connected"
    );

    // Forward bridge → socket frames
    let send_session_id = session_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                SocketCommand::Text(text) => {
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        tracing::debug!(session_id = %send_session_id, "WebSocket send failed");
                        break;
                    }
                }
                SocketCommand::Close { code, reason } => {
                    let _ = ws_sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: Cow::Owned(reason),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Dispatch socket → bridge frames
    let recv_bridge = bridge.clone();
    let recv_session_id = session_id.clone();
    let recv_connection_id = connection_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            let text = match msg {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        tracing::warn!(session_id = %recv_session_id, "Dropping non-UTF-8 binary frame");
                        continue;
                    }
                },
                Message::Close(_) => break,
                _ => continue,
            };
            match kind {
                ConnectionKind::Cli => {
                    recv_bridge
                        .handle_cli_message(&recv_session_id, &recv_connection_id, &text)
                        .await
                }
                ConnectionKind::Browser => {
                    recv_bridge
                        .handle_browser_message(&recv_session_id, &recv_connection_id, &text)
                        .await
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    match kind {
        ConnectionKind::Cli => bridge.handle_cli_close(&session_id, &connection_id).await,
        ConnectionKind::Browser => {
            bridge
                .handle_browser_close(&session_id, &connection_id)
                .await
        }
    }

    tracing::debug!(
        session_id = %session_id,
        connection_id = %connection_id,
        kind = ?kind,
        "WebSocket disconnected"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_cli_endpoint() {
        let endpoint = classify("/ws/cli/0f8e2c1a-9b7d-4c3e-a1f2-123456789abc").unwrap();
        assert_eq!(endpoint.kind, ConnectionKind::Cli);
        assert_eq!(endpoint.session_id, "0f8e2c1a-9b7d-4c3e-a1f2-123456789abc");
    }

    #[test]
    fn test_classify_browser_endpoint() {
        let endpoint = classify("/ws/browser/abc-123").unwrap();
        assert_eq!(endpoint.kind, ConnectionKind::Browser);
        assert_eq!(endpoint.session_id, "abc-123");
    }

    #[test]
    fn test_classify_rejects_bad_paths() {
        for path in [
            "/ws/cli/",
            "/ws/cli",
            "/ws/agent/abc",
            "/ws/cli/ABC",
            "/ws/cli/abc_def",
            "/ws/browser/abc/extra",
            "/ws/cli/../etc",
            "/api/sessions",
        ] {
            assert!(
                matches!(classify(path), Err(Error::InvalidEndpoint(_))),
                "expected rejection for {}",
                path
            );
        }
    }

    #[test]
    fn test_classify_rejects_overlong_id() {
        let path = format!("/ws/browser/{}", "a".repeat(65));
        assert!(classify(&path).is_err());
    }
}
