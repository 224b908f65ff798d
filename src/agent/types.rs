//! Wire protocol and session types for the CLI bridge
//!
//! Defines all message types exchanged between:
//! - CLI ↔ Server (NDJSON, newline-delimited JSON)
//! - Server ↔ Browser (JSON)
//! - Session state, connection handles and lifecycle events

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Exit code recorded when the real process status is unavailable
/// (spawn failure, dial-back timeout, exit signal never observed)
pub const SYNTHETIC_EXIT_CODE: i32 = -1;

// =============================================================================
// CLI → Server messages (NDJSON)
// =============================================================================

/// Top-level CLI message (parsed from NDJSON lines)
///
/// Only the fields the bridge acts on are decoded; the raw line is what gets
/// forwarded to browsers.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CliMessage {
    System(CliSystemMessage),
    Assistant,
    User,
    StreamEvent,
    Result,
    ToolProgress,
    ToolUseSummary,
    AuthStatus,
    KeepAlive,
    PermissionRequest(PermissionRequest),
    ControlRequest(CliControlRequestMessage),
    ControlCancelRequest { request_id: String },
}

impl CliMessage {
    /// Whether this message means the CLI is actively working on a turn
    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            CliMessage::Assistant | CliMessage::StreamEvent | CliMessage::ToolProgress
        )
    }
}

/// System message (subtype: "init" or "status")
#[derive(Debug, Clone, Deserialize)]
pub struct CliSystemMessage {
    #[serde(default)]
    pub subtype: String,
    pub session_id: Option<String>,
}

/// Control request (Claude-style permission prompt and other control traffic)
#[derive(Debug, Clone, Deserialize)]
pub struct CliControlRequestMessage {
    pub request_id: String,
    pub request: ControlRequestBody,
}

/// Body of a control request
#[derive(Debug, Clone, Deserialize)]
pub struct ControlRequestBody {
    pub subtype: String,
    pub tool_name: Option<String>,
    pub input: Option<serde_json::Value>,
    pub permission_suggestions: Option<Vec<serde_json::Value>>,
    pub description: Option<String>,
    pub tool_use_id: Option<String>,
}

impl CliControlRequestMessage {
    /// Convert a `can_use_tool` control request into a permission request
    pub fn into_permission_request(self) -> Option<PermissionRequest> {
        if self.request.subtype != "can_use_tool" {
            return None;
        }
        Some(PermissionRequest {
            request_id: self.request_id,
            tool_name: self.request.tool_name.unwrap_or_default(),
            input: self.request.input.unwrap_or(serde_json::Value::Null),
            description: self.request.description,
            tool_use_id: self.request.tool_use_id,
            permission_suggestions: self.request.permission_suggestions,
        })
    }
}

/// Permission request from CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub request_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_suggestions: Option<Vec<serde_json::Value>>,
}

/// Wire format the CLI used to ask for a permission; the response is sent
/// back in the matching format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOrigin {
    /// `permission_request` message, answered with the browser's response verbatim
    Native,
    /// `control_request` / `can_use_tool`, answered with a `control_response`
    ControlRequest,
}

/// One parsed NDJSON line: the raw text plus its decoded envelope
#[derive(Debug, Clone)]
pub struct CliFrame {
    pub raw: String,
    pub message: CliMessage,
}

// =============================================================================
// Server → Browser messages (JSON)
// =============================================================================

/// Messages the bridge itself produces for browser clients.
///
/// CLI traffic is forwarded as-is; these are the synthetic additions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserIncomingMessage {
    PermissionRequest(PermissionRequest),
    PermissionCancelled {
        request_id: String,
    },
    SessionExited {
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
    },
    CliConnected,
    CliDisconnected,
    Error {
        message: String,
    },
}

impl BrowserIncomingMessage {
    pub fn to_json(&self) -> String {
        // Serializing these variants cannot fail: no maps with non-string keys
        serde_json::to_string(self).unwrap_or_default()
    }
}

// =============================================================================
// Browser → Server messages (JSON)
// =============================================================================

/// Message received from browser clients
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserOutgoingMessage {
    PermissionResponse {
        request_id: String,
        behavior: PermissionBehavior,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        updated_input: Option<serde_json::Value>,
        #[serde(default)]
        updated_permissions: Option<Vec<serde_json::Value>>,
    },
    UserMessage {
        content: serde_json::Value,
    },
    Interrupt,
    SetModel {
        model: String,
    },
    SetPermissionMode {
        mode: String,
    },
}

/// Browser's decision on a permission request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionBehavior {
    Allow,
    Deny,
}

// =============================================================================
// Session state types
// =============================================================================

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Session registered, waiting for the CLI to dial back
    Starting,
    /// CLI WebSocket connected, idle
    Connected,
    /// CLI is working on a turn
    Running,
    /// Process terminated
    Exited,
}

/// Descriptive session metadata supplied at creation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionOptions {
    pub cwd: Option<String>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
}

/// Session summary exposed to the REST facade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub state: SessionState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub cwd: Option<String>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub created_at: i64,
    pub cli_connected: bool,
    pub browser_count: usize,
    pub buffered_messages: usize,
    pub pending_permissions: usize,
    pub cli_session_id: Option<String>,
}

// =============================================================================
// Connection handles
// =============================================================================

/// Kind of WebSocket peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    Cli,
    Browser,
}

/// Command for a connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketCommand {
    Text(String),
    Close { code: u16, reason: String },
}

/// Bridge-side handle to one live WebSocket connection
#[derive(Debug, Clone)]
pub struct SocketHandle {
    id: String,
    tx: mpsc::UnboundedSender<SocketCommand>,
}

impl SocketHandle {
    pub fn new(id: impl Into<String>, tx: mpsc::UnboundedSender<SocketCommand>) -> Self {
        Self { id: id.into(), tx }
    }

    /// Connection id assigned by the transport
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a text frame; false if the writer task is gone
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.tx.send(SocketCommand::Text(text.into())).is_ok()
    }

    pub fn send_message(&self, msg: &BrowserIncomingMessage) -> bool {
        self.send_text(msg.to_json())
    }

    /// Ask the writer task to send a close frame and stop
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.tx.send(SocketCommand::Close {
            code,
            reason: reason.into(),
        });
    }
}

// =============================================================================
// Lifecycle events (process layer → bridge)
// =============================================================================

/// Process-layer notifications consumed by the bridge event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// CLI process started
    Spawned { session_id: String, pid: Option<u32> },
    /// CLI process could not be started
    SpawnFailed { session_id: String, error: String },
    /// CLI process terminated
    Exited {
        session_id: String,
        exit_code: Option<i32>,
    },
    /// Dial-back deadline passed
    DialBackTimeout { session_id: String },
    /// Grace period between socket close and process exit elapsed
    ExitGraceElapsed { session_id: String },
    /// Exited-session TTL elapsed
    ReapCheck { session_id: String },
}

impl LifecycleEvent {
    pub fn session_id(&self) -> &str {
        match self {
            LifecycleEvent::Spawned { session_id, .. }
            | LifecycleEvent::SpawnFailed { session_id, .. }
            | LifecycleEvent::Exited { session_id, .. }
            | LifecycleEvent::DialBackTimeout { session_id }
            | LifecycleEvent::ExitGraceElapsed { session_id }
            | LifecycleEvent::ReapCheck { session_id } => session_id,
        }
    }
}

// =============================================================================
// Helper functions
// =============================================================================

/// Parse NDJSON data into CLI frames, skipping malformed lines
pub fn parse_ndjson(data: &str) -> Vec<CliFrame> {
    data.split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            serde_json::from_str::<CliMessage>(line)
                .map(|message| CliFrame {
                    raw: line.to_string(),
                    message,
                })
                .map_err(|e| {
                    let preview: String = line.chars().take(200).collect();
                    tracing::warn!("NDJSON parse error: {} (line: {})", e, preview);
                })
                .ok()
        })
        .collect()
}

/// Convert a permission allow response to CLI NDJSON format
pub fn permission_allow_to_cli_ndjson(
    request_id: &str,
    updated_input: &Option<serde_json::Value>,
    updated_permissions: &Option<Vec<serde_json::Value>>,
) -> serde_json::Value {
    let mut response = serde_json::json!({
        "behavior": "allow",
    });
    if let Some(input) = updated_input {
        response["updatedInput"] = input.clone();
    }
    if let Some(perms) = updated_permissions {
        response["updatedPermissions"] = serde_json::Value::Array(perms.clone());
    }

    serde_json::json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": response,
        }
    })
}

/// Convert a permission deny response to CLI NDJSON format
pub fn permission_deny_to_cli_ndjson(
    request_id: &str,
    message: &Option<String>,
) -> serde_json::Value {
    serde_json::json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": {
                "behavior": "deny",
                "message": message.as_deref().unwrap_or("Denied by user"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_system_init_message() {
        let line = r#"{"type":"system","subtype":"init","uuid":"abc","session_id":"s1","cwd":"/tmp","tools":["Bash"]}"#;
        let frames = parse_ndjson(line);
        assert_eq!(frames.len(), 1);
        match &frames[0].message {
            CliMessage::System(sys) => {
                assert_eq!(sys.subtype, "init");
                assert_eq!(sys.session_id.as_deref(), Some("s1"));
            }
            _ => panic!("Expected System message"),
        }
        assert_eq!(frames[0].raw, line);
    }

    #[test]
    fn test_parse_permission_request() {
        let line = r#"{"type":"permission_request","request_id":"r1","tool_name":"Bash","input":{"command":"ls"}}"#;
        let frames = parse_ndjson(line);
        match &frames[0].message {
            CliMessage::PermissionRequest(req) => {
                assert_eq!(req.request_id, "r1");
                assert_eq!(req.tool_name, "Bash");
                assert_eq!(req.input["command"], "ls");
                assert!(req.description.is_none());
            }
            _ => panic!("Expected PermissionRequest message"),
        }
    }

    #[test]
    fn test_parse_control_request() {
        let line = r#"{"type":"control_request","request_id":"r1","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"ls"},"tool_use_id":"tu1"}}"#;
        let frames = parse_ndjson(line);
        let CliMessage::ControlRequest(cr) = frames[0].message.clone() else {
            panic!("Expected ControlRequest message");
        };
        let perm = cr.into_permission_request().unwrap();
        assert_eq!(perm.request_id, "r1");
        assert_eq!(perm.tool_name, "Bash");
        assert_eq!(perm.tool_use_id.as_deref(), Some("tu1"));
    }

    #[test]
    fn test_non_permission_control_request() {
        let line = r#"{"type":"control_request","request_id":"r2","request":{"subtype":"hook_callback"}}"#;
        let frames = parse_ndjson(line);
        let CliMessage::ControlRequest(cr) = frames[0].message.clone() else {
            panic!("Expected ControlRequest message");
        };
        assert!(cr.into_permission_request().is_none());
    }

    #[test]
    fn test_parse_passthrough_kinds_ignore_fields() {
        let data = r#"{"type":"assistant","message":{"id":"m1","content":[]}}
{"type":"stream_event","event":{"type":"content_block_delta"}}
{"type":"result","subtype":"success","is_error":false}
{"type":"keep_alive"}"#;
        let frames = parse_ndjson(data);
        assert_eq!(frames.len(), 4);
        assert!(matches!(frames[0].message, CliMessage::Assistant));
        assert!(frames[1].message.is_activity());
        assert!(matches!(frames[2].message, CliMessage::Result));
        assert!(matches!(frames[3].message, CliMessage::KeepAlive));
    }

    #[test]
    fn test_parse_ndjson_skips_malformed_and_unknown() {
        let data = "not json\n{\"type\":\"keep_alive\"}\n{broken\n{\"type\":\"mystery\"}";
        let frames = parse_ndjson(data);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0].message, CliMessage::KeepAlive));
    }

    #[test]
    fn test_session_exited_wire_format() {
        let json = BrowserIncomingMessage::SessionExited { exit_code: Some(2) }.to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "session_exited");
        assert_eq!(value["exitCode"], 2);
    }

    #[test]
    fn test_permission_request_wire_format_is_flat() {
        let msg = BrowserIncomingMessage::PermissionRequest(PermissionRequest {
            request_id: "r1".to_string(),
            tool_name: "Bash".to_string(),
            input: serde_json::json!({"command": "ls"}),
            description: None,
            tool_use_id: None,
            permission_suggestions: None,
        });
        let value: serde_json::Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(value["type"], "permission_request");
        assert_eq!(value["request_id"], "r1");
        assert!(value.get("description").is_none());
    }

    #[test]
    fn test_browser_outgoing_message_deserialization() {
        let json = r#"{"type":"permission_response","request_id":"r1","behavior":"allow"}"#;
        let msg: BrowserOutgoingMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(
            msg,
            BrowserOutgoingMessage::PermissionResponse {
                behavior: PermissionBehavior::Allow,
                ..
            }
        ));

        let json = r#"{"type":"user_message","content":"hello"}"#;
        let msg: BrowserOutgoingMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, BrowserOutgoingMessage::UserMessage { .. }));

        let json = r#"{"type":"interrupt"}"#;
        let msg: BrowserOutgoingMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, BrowserOutgoingMessage::Interrupt));
    }

    #[test]
    fn test_browser_outgoing_rejects_bad_behavior() {
        let json = r#"{"type":"permission_response","request_id":"r1","behavior":"maybe"}"#;
        assert!(serde_json::from_str::<BrowserOutgoingMessage>(json).is_err());
    }

    #[test]
    fn test_permission_allow_to_cli_ndjson() {
        let ndjson = permission_allow_to_cli_ndjson(
            "r1",
            &Some(serde_json::json!({"command": "ls -la"})),
            &None,
        );
        assert_eq!(ndjson["type"], "control_response");
        assert_eq!(ndjson["response"]["request_id"], "r1");
        assert_eq!(ndjson["response"]["response"]["behavior"], "allow");
        assert_eq!(
            ndjson["response"]["response"]["updatedInput"]["command"],
            "ls -la"
        );
    }

    #[test]
    fn test_permission_deny_to_cli_ndjson() {
        let ndjson = permission_deny_to_cli_ndjson("r1", &None);
        assert_eq!(ndjson["response"]["response"]["behavior"], "deny");
        assert_eq!(ndjson["response"]["response"]["message"], "Denied by user");
    }

    #[test]
    fn test_socket_handle_commands() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = SocketHandle::new("c1", tx);
        assert!(handle.send_text("hello"));
        handle.close(1000, "bye");
        assert_eq!(rx.try_recv().unwrap(), SocketCommand::Text("hello".into()));
        assert_eq!(
            rx.try_recv().unwrap(),
            SocketCommand::Close {
                code: 1000,
                reason: "bye".into()
            }
        );
        drop(rx);
        assert!(!handle.send_text("gone"));
    }
}
