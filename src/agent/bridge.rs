//! WebSocket message bridge between CLI and browser
//!
//! Routes messages between the coding-assistant CLI (NDJSON) and browser
//! clients (JSON). Owns the session registry: every handler takes the write
//! lock, runs to completion without awaiting I/O, and releases it. Socket
//! writes are channel sends to per-connection writer tasks.
//!
//! CLI output produced while no browser is attached is buffered and flushed
//! in order to the next browser that attaches. Notices the bridge emits
//! itself reach attached browsers only and never occupy the buffer.
//! Permission requests are correlated by request id; a response is
//! forwarded at most once.

use crate::agent::registry::{BufferedMessage, Session, SessionRegistry};
use crate::agent::types::*;
use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

/// Core message router between CLI and browser WebSocket connections
pub struct AgentBridge {
    registry: Arc<RwLock<SessionRegistry>>,
    config: BridgeConfig,
    /// Timers re-enter the bridge through the lifecycle event loop
    events: mpsc::UnboundedSender<LifecycleEvent>,
}

impl AgentBridge {
    /// Create a new bridge
    pub fn new(config: BridgeConfig, events: mpsc::UnboundedSender<LifecycleEvent>) -> Self {
        Self {
            registry: Arc::new(RwLock::new(SessionRegistry::new(
                config.outbound_buffer_limit,
            ))),
            config,
            events,
        }
    }

    // =========================================================================
    // Session management
    // =========================================================================

    /// Register a new session in `starting` state
    pub async fn create_session(&self, options: SessionOptions) -> String {
        let mut registry = self.registry.write().await;
        let session_id = registry.create(options);
        tracing::info!(session_id = %session_id, "Session created");
        session_id
    }

    /// Record that a CLI process is being launched for this session, so its
    /// exit signal is awaited before the session is finalised
    pub async fn track_process(&self, session_id: &str) {
        let mut registry = self.registry.write().await;
        if let Some(session) = registry.get_mut(session_id) {
            session.process_tracked = true;
        }
    }

    pub async fn get_session(&self, session_id: &str) -> Option<SessionInfo> {
        self.registry.read().await.get(session_id).map(Session::info)
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.registry.read().await.list()
    }

    /// Remove a session and close its sockets. Returns false for unknown ids.
    pub async fn remove_session(&self, session_id: &str) -> bool {
        let removed = self.registry.write().await.remove(session_id).is_some();
        if removed {
            tracing::info!(session_id, "Session removed");
        }
        removed
    }

    /// Close every socket of every session. Sessions stay registered.
    pub async fn shutdown(&self) {
        let mut registry = self.registry.write().await;
        for session in registry.iter_mut() {
            session.close_sockets(1001, "server shutting down");
        }
        tracing::info!(sessions = registry.len(), "Bridge shut down");
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Handle CLI WebSocket connection open.
    ///
    /// Unknown and exited sessions are rejected; the caller closes the socket
    /// with [`Error::close_code`]. A previous CLI socket is superseded.
    pub async fn handle_cli_open(&self, session_id: &str, socket: SocketHandle) -> Result<()> {
        let mut registry = self.registry.write().await;
        let session = registry
            .get_mut(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        if session.is_exited() {
            return Err(Error::SessionExited(session_id.to_string()));
        }

        let connection_id = socket.id().to_string();
        if let Some(old) = session.cli.replace(socket) {
            tracing::warn!(
                session_id,
                old_connection = old.id(),
                new_connection = %connection_id,
                "CLI reconnected, superseding previous socket"
            );
            old.close(1000, "superseded by new CLI connection");
        }

        session.state = SessionState::Connected;
        Self::forward_notice(session, &BrowserIncomingMessage::CliConnected);

        tracing::info!(session_id, connection_id = %connection_id, "CLI connected to bridge");
        Ok(())
    }

    /// Handle CLI WebSocket connection close
    pub async fn handle_cli_close(&self, session_id: &str, connection_id: &str) {
        let mut registry = self.registry.write().await;
        let Some(session) = registry.get_mut(session_id) else {
            return;
        };
        if !session.is_current_cli(connection_id) {
            tracing::debug!(session_id, connection_id, "Superseded CLI socket closed");
            return;
        }

        session.cli = None;
        Self::cancel_permissions(session);
        Self::forward_notice(session, &BrowserIncomingMessage::CliDisconnected);
        tracing::info!(session_id, connection_id, "CLI disconnected from bridge");

        if session.is_exited() {
            return;
        }
        if let Some(exit_code) = session.process_exit {
            self.finalize(session, exit_code);
        } else if !session.process_tracked {
            self.finalize(session, None);
        } else {
            self.schedule(
                self.config.exit_grace(),
                LifecycleEvent::ExitGraceElapsed {
                    session_id: session_id.to_string(),
                },
            );
        }
    }

    /// Handle browser WebSocket connection open.
    ///
    /// The new browser receives pending permission requests that are not in
    /// the backlog, then the backlog, then `session_exited` if the session
    /// already ended.
    pub async fn handle_browser_open(&self, session_id: &str, socket: SocketHandle) -> Result<()> {
        let mut registry = self.registry.write().await;
        let session = registry
            .get_mut(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        let backlog = session.pending_outbound.drain();
        let buffered: HashSet<&str> = backlog
            .iter()
            .filter_map(|m| m.permission_id.as_deref())
            .collect();

        // Requests outside the backlog were forwarded live or evicted from
        // it, so they predate everything still buffered
        let mut replayed = 0;
        for pending in session.pending_permissions_ordered() {
            if !buffered.contains(pending.request.request_id.as_str()) {
                socket.send_text(pending.text.clone());
                replayed += 1;
            }
        }
        for msg in &backlog {
            socket.send_text(msg.text.clone());
        }

        if session.is_exited() {
            socket.send_message(&BrowserIncomingMessage::SessionExited {
                exit_code: session.exit_code,
            });
        }

        let connection_id = socket.id().to_string();
        session.browsers.insert(connection_id.clone(), socket);

        tracing::info!(
            session_id,
            connection_id = %connection_id,
            flushed = backlog.len(),
            replayed,
            "Browser connected to bridge"
        );
        Ok(())
    }

    /// Handle browser WebSocket connection close. No lifecycle effect.
    pub async fn handle_browser_close(&self, session_id: &str, connection_id: &str) {
        let mut registry = self.registry.write().await;
        let Some(session) = registry.get_mut(session_id) else {
            return;
        };
        session.browsers.remove(connection_id);
        tracing::debug!(session_id, connection_id, "Browser disconnected from bridge");

        if session.is_exited() && session.browsers.is_empty() {
            self.schedule_reap(session_id);
        }
    }

    // =========================================================================
    // CLI → Browser message routing
    // =========================================================================

    /// Route one CLI frame (one or more NDJSON lines) to browsers
    pub async fn handle_cli_message(&self, session_id: &str, connection_id: &str, raw: &str) {
        let frames = parse_ndjson(raw);
        if frames.is_empty() {
            return;
        }

        let mut registry = self.registry.write().await;
        let Some(session) = registry.get_mut(session_id) else {
            tracing::warn!(session_id, "CLI message for unknown session");
            return;
        };
        if !session.is_current_cli(connection_id) {
            tracing::debug!(session_id, connection_id, "Ignoring message from superseded CLI socket");
            return;
        }

        for frame in frames {
            Self::route_cli_frame(session, frame);
        }
    }

    fn route_cli_frame(session: &mut Session, frame: CliFrame) {
        let CliFrame { raw, message } = frame;
        match message {
            CliMessage::KeepAlive => {
                // Silently consumed
            }
            CliMessage::System(sys) => {
                if sys.subtype == "init" {
                    if let Some(cli_sid) = sys.session_id {
                        session.cli_session_id = Some(cli_sid);
                    }
                }
                Self::forward(session, raw, None);
            }
            CliMessage::PermissionRequest(request) => {
                Self::record_permission(session, request, PermissionOrigin::Native, raw);
            }
            CliMessage::ControlRequest(cr) => match cr.into_permission_request() {
                Some(request) => {
                    let normalised =
                        BrowserIncomingMessage::PermissionRequest(request.clone()).to_json();
                    Self::record_permission(
                        session,
                        request,
                        PermissionOrigin::ControlRequest,
                        normalised,
                    );
                }
                None => Self::forward(session, raw, None),
            },
            CliMessage::ControlCancelRequest { request_id } => {
                if session.pending_permissions.remove(&request_id).is_some() {
                    tracing::debug!(session_id = %session.id, request_id = %request_id, "Permission request cancelled by CLI");
                    Self::withdraw_permission(session, request_id);
                }
            }
            CliMessage::Result => {
                if session.state == SessionState::Running {
                    session.state = SessionState::Connected;
                }
                Self::forward(session, raw, None);
            }
            other => {
                if other.is_activity() && session.state == SessionState::Connected {
                    session.state = SessionState::Running;
                }
                Self::forward(session, raw, None);
            }
        }
    }

    fn record_permission(
        session: &mut Session,
        request: PermissionRequest,
        origin: PermissionOrigin,
        text: String,
    ) {
        let request_id = request.request_id.clone();
        tracing::debug!(
            session_id = %session.id,
            request_id = %request_id,
            tool = %request.tool_name,
            "Permission requested"
        );
        session.add_pending_permission(request, origin, text.clone());
        Self::forward(session, text, Some(request_id));
    }

    // =========================================================================
    // Browser → CLI message routing
    // =========================================================================

    /// Route a browser message to the CLI
    pub async fn handle_browser_message(&self, session_id: &str, connection_id: &str, raw: &str) {
        let msg: BrowserOutgoingMessage = match serde_json::from_str(raw) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(session_id, connection_id, "Dropping malformed browser message: {}", e);
                return;
            }
        };

        let mut registry = self.registry.write().await;
        let Some(session) = registry.get_mut(session_id) else {
            tracing::warn!(session_id, "Browser message for unknown session");
            return;
        };
        let Some(browser) = session.browsers.get(connection_id).cloned() else {
            tracing::debug!(session_id, connection_id, "Message from detached browser");
            return;
        };

        match msg {
            BrowserOutgoingMessage::PermissionResponse {
                request_id,
                behavior,
                message,
                updated_input,
                updated_permissions,
            } => {
                let Some(pending) = session.pending_permissions.remove(&request_id) else {
                    tracing::warn!(
                        session_id,
                        request_id = %request_id,
                        "Permission response for unknown request"
                    );
                    Self::reply_error(&browser, Error::UnknownPermission(request_id).to_string());
                    return;
                };

                let Some(cli) = session.cli.as_ref() else {
                    tracing::warn!(session_id, request_id = %request_id, "Permission response dropped, CLI not connected");
                    Self::reply_error(
                        &browser,
                        format!(
                            "{}; permission response dropped",
                            Error::NotConnected(session_id.to_string())
                        ),
                    );
                    return;
                };

                let line = match pending.origin {
                    PermissionOrigin::Native => raw.trim().to_string(),
                    PermissionOrigin::ControlRequest => {
                        let ndjson = match behavior {
                            PermissionBehavior::Allow => permission_allow_to_cli_ndjson(
                                &request_id,
                                &updated_input,
                                &updated_permissions,
                            ),
                            PermissionBehavior::Deny => {
                                permission_deny_to_cli_ndjson(&request_id, &message)
                            }
                        };
                        ndjson.to_string()
                    }
                };
                Self::send_to_cli(session_id, cli, &line);
                tracing::debug!(session_id, request_id = %request_id, ?behavior, "Permission resolved");
            }
            BrowserOutgoingMessage::UserMessage { .. }
            | BrowserOutgoingMessage::Interrupt
            | BrowserOutgoingMessage::SetModel { .. }
            | BrowserOutgoingMessage::SetPermissionMode { .. } => match session.cli.as_ref() {
                Some(cli) => Self::send_to_cli(session_id, cli, raw.trim()),
                None => {
                    tracing::warn!(session_id, connection_id, "Browser message rejected, CLI not connected");
                    Self::reply_error(&browser, Error::NotConnected(session_id.to_string()).to_string());
                }
            },
        }
    }

    // =========================================================================
    // Lifecycle events
    // =========================================================================

    /// Apply a process-layer event. Returns true when the session's process
    /// should be killed.
    pub async fn handle_lifecycle_event(&self, event: LifecycleEvent) -> bool {
        let mut registry = self.registry.write().await;
        let session_id = event.session_id().to_string();

        if let LifecycleEvent::ReapCheck { .. } = event {
            let reapable = registry
                .get(&session_id)
                .map(|s| s.is_exited() && s.browsers.is_empty())
                .unwrap_or(false);
            if reapable {
                registry.remove(&session_id);
                tracing::info!(session_id = %session_id, "Reaped exited session");
            }
            return false;
        }

        let Some(session) = registry.get_mut(&session_id) else {
            tracing::debug!(session_id = %session_id, ?event, "Lifecycle event for unknown session");
            return false;
        };

        match event {
            LifecycleEvent::Spawned { pid, .. } => {
                session.pid = pid;
                session.process_tracked = true;
                tracing::debug!(session_id = %session_id, ?pid, "CLI process recorded");
                false
            }
            LifecycleEvent::SpawnFailed { error, .. } => {
                tracing::warn!(session_id = %session_id, "CLI spawn failed: {}", error);
                self.finalize(session, Some(SYNTHETIC_EXIT_CODE));
                false
            }
            LifecycleEvent::Exited { exit_code, .. } => {
                session.process_exit = Some(exit_code);
                if session.is_exited() {
                    return false;
                }
                if session.cli.is_none() {
                    self.finalize(session, exit_code);
                } else {
                    // Wait for the socket close, bounded by the grace period
                    self.schedule(
                        self.config.exit_grace(),
                        LifecycleEvent::ExitGraceElapsed {
                            session_id: session_id.clone(),
                        },
                    );
                }
                false
            }
            LifecycleEvent::DialBackTimeout { .. } => {
                if session.state != SessionState::Starting {
                    return false;
                }
                tracing::warn!(session_id = %session_id, "CLI did not dial back in time");
                self.finalize(session, Some(SYNTHETIC_EXIT_CODE));
                true
            }
            LifecycleEvent::ExitGraceElapsed { .. } => {
                if session.is_exited() {
                    false
                } else if let Some(exit_code) = session.process_exit {
                    self.finalize(session, exit_code);
                    false
                } else if session.cli.is_none() {
                    tracing::warn!(session_id = %session_id, "No exit status after CLI disconnect");
                    self.finalize(session, Some(SYNTHETIC_EXIT_CODE));
                    true
                } else {
                    // CLI dialed back again in the meantime
                    false
                }
            }
            LifecycleEvent::ReapCheck { .. } => false,
        }
    }

    /// Move a session to `exited` and notify browsers. Idempotent.
    fn finalize(&self, session: &mut Session, exit_code: Option<i32>) {
        if session.is_exited() {
            return;
        }
        session.state = SessionState::Exited;
        session.exit_code = exit_code;
        if let Some(cli) = session.cli.take() {
            cli.close(1000, "session exited");
        }
        Self::cancel_permissions(session);
        Self::forward_notice(session, &BrowserIncomingMessage::SessionExited { exit_code });

        tracing::info!(session_id = %session.id, ?exit_code, "Session exited");

        if session.browsers.is_empty() {
            self.schedule_reap(&session.id);
        }
    }

    fn schedule_reap(&self, session_id: &str) {
        if let Some(ttl) = self.config.exited_session_ttl() {
            self.schedule(
                ttl,
                LifecycleEvent::ReapCheck {
                    session_id: session_id.to_string(),
                },
            );
        }
    }

    /// Deliver `event` to the lifecycle loop after `delay`
    fn schedule(&self, delay: Duration, event: LifecycleEvent) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        });
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    /// Cancel every outstanding permission request, oldest first
    fn cancel_permissions(session: &mut Session) {
        let cancelled: Vec<String> = session
            .pending_permissions_ordered()
            .into_iter()
            .map(|p| p.request.request_id.clone())
            .collect();
        session.pending_permissions.clear();
        for request_id in cancelled {
            Self::withdraw_permission(session, request_id);
        }
    }

    /// Tell attached browsers a request is void, or pull it from the backlog
    /// when nobody has seen it yet
    fn withdraw_permission(session: &mut Session, request_id: String) {
        if session.browsers.is_empty() {
            session.pending_outbound.remove_permission(&request_id);
        } else {
            Self::forward_notice(
                session,
                &BrowserIncomingMessage::PermissionCancelled { request_id },
            );
        }
    }

    /// Bridge-originated notice: attached browsers only, never buffered
    fn forward_notice(session: &Session, msg: &BrowserIncomingMessage) {
        Self::broadcast(session, &msg.to_json());
    }

    /// CLI output: broadcast to attached browsers, or buffer when none is attached
    fn forward(session: &mut Session, text: String, permission_id: Option<String>) {
        if session.browsers.is_empty() {
            if let Some(dropped) = session.pending_outbound.push(BufferedMessage {
                text,
                permission_id,
            }) {
                let preview: String = dropped.text.chars().take(80).collect();
                tracing::warn!(
                    session_id = %session.id,
                    "Outbound buffer full, dropped oldest message: {}",
                    preview
                );
            }
            return;
        }
        Self::broadcast(session, &text);
    }

    fn broadcast(session: &Session, text: &str) {
        for (connection_id, browser) in &session.browsers {
            if !browser.send_text(text.to_string()) {
                tracing::debug!(session_id = %session.id, connection_id = %connection_id, "Browser writer closed");
            }
        }
    }

    fn send_to_cli(session_id: &str, cli: &SocketHandle, line: &str) {
        if !cli.send_text(format!("{}\n", line)) {
            tracing::warn!(session_id, "CLI writer closed");
        }
    }

    fn reply_error(browser: &SocketHandle, message: String) {
        browser.send_message(&BrowserIncomingMessage::Error { message });
    }
}
