//! In-memory session registry
//!
//! Owns every [`Session`] keyed by id, in insertion order. The registry does
//! no locking and no I/O; the bridge serialises all access to it.

use crate::agent::types::*;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// A CLI message waiting for a browser to attach
#[derive(Debug, Clone)]
pub struct BufferedMessage {
    pub text: String,
    /// Request id when the message is a permission request
    pub permission_id: Option<String>,
}

/// Bounded FIFO of CLI output held while no browser is attached.
///
/// Lossy: once full, the oldest message is dropped to make room.
#[derive(Debug)]
pub struct OutboundBuffer {
    messages: VecDeque<BufferedMessage>,
    limit: usize,
}

impl OutboundBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    /// Append a message, returning the evicted one if the bound was hit
    pub fn push(&mut self, message: BufferedMessage) -> Option<BufferedMessage> {
        let dropped = if self.messages.len() >= self.limit {
            self.messages.pop_front()
        } else {
            None
        };
        self.messages.push_back(message);
        dropped
    }

    /// Withdraw a buffered permission request. Returns whether one was held.
    pub fn remove_permission(&mut self, request_id: &str) -> bool {
        let before = self.messages.len();
        self.messages
            .retain(|m| m.permission_id.as_deref() != Some(request_id));
        self.messages.len() != before
    }

    pub fn drain(&mut self) -> Vec<BufferedMessage> {
        self.messages.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// A permission request awaiting the browser's answer
#[derive(Debug, Clone)]
pub struct PendingPermission {
    pub request: PermissionRequest,
    pub origin: PermissionOrigin,
    /// Browser-facing text exactly as first forwarded
    pub text: String,
    /// Arrival order within the session
    pub seq: u64,
}

/// Per-session state
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub state: SessionState,
    pub options: SessionOptions,
    pub created_at: i64,
    pub pid: Option<u32>,
    /// Final exit code, meaningful once `state` is `Exited`
    pub exit_code: Option<i32>,
    /// CLI's own session id from its `system`/`init` message
    pub cli_session_id: Option<String>,
    pub cli: Option<SocketHandle>,
    pub browsers: HashMap<String, SocketHandle>,
    pub pending_outbound: OutboundBuffer,
    pub pending_permissions: HashMap<String, PendingPermission>,
    permission_seq: u64,
    /// A process was launched for this session, so an exit signal will arrive
    pub process_tracked: bool,
    /// Exit status reported by the launcher, before reconciliation
    pub process_exit: Option<Option<i32>>,
}

impl Session {
    fn new(id: String, options: SessionOptions, buffer_limit: usize) -> Self {
        Self {
            id,
            state: SessionState::Starting,
            options,
            created_at: chrono::Utc::now().timestamp_millis(),
            pid: None,
            exit_code: None,
            cli_session_id: None,
            cli: None,
            browsers: HashMap::new(),
            pending_outbound: OutboundBuffer::new(buffer_limit),
            pending_permissions: HashMap::new(),
            permission_seq: 0,
            process_tracked: false,
            process_exit: None,
        }
    }

    pub fn is_exited(&self) -> bool {
        self.state == SessionState::Exited
    }

    /// Whether `connection_id` is the current CLI socket
    pub fn is_current_cli(&self, connection_id: &str) -> bool {
        self.cli.as_ref().map(|c| c.id() == connection_id) == Some(true)
    }

    /// Record a permission request awaiting an answer. A repeated request id
    /// replaces the earlier entry and moves to the back.
    pub fn add_pending_permission(
        &mut self,
        request: PermissionRequest,
        origin: PermissionOrigin,
        text: String,
    ) {
        self.permission_seq += 1;
        self.pending_permissions.insert(
            request.request_id.clone(),
            PendingPermission {
                request,
                origin,
                text,
                seq: self.permission_seq,
            },
        );
    }

    /// Pending permissions ordered by arrival
    pub fn pending_permissions_ordered(&self) -> Vec<&PendingPermission> {
        let mut pending: Vec<&PendingPermission> = self.pending_permissions.values().collect();
        pending.sort_by_key(|p| p.seq);
        pending
    }

    /// Close every socket owned by this session
    pub fn close_sockets(&mut self, code: u16, reason: &str) {
        if let Some(cli) = self.cli.take() {
            cli.close(code, reason);
        }
        for (_, browser) in self.browsers.drain() {
            browser.close(code, reason);
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            state: self.state,
            pid: self.pid,
            exit_code: self.exit_code,
            cwd: self.options.cwd.clone(),
            model: self.options.model.clone(),
            permission_mode: self.options.permission_mode.clone(),
            created_at: self.created_at,
            cli_connected: self.cli.is_some(),
            browser_count: self.browsers.len(),
            buffered_messages: self.pending_outbound.len(),
            pending_permissions: self.pending_permissions.len(),
            cli_session_id: self.cli_session_id.clone(),
        }
    }
}

/// Session id → session map with insertion order
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
    /// Insertion order: front = oldest
    order: VecDeque<String>,
    buffer_limit: usize,
}

impl SessionRegistry {
    /// Create a registry whose sessions buffer at most `buffer_limit`
    /// outbound messages each
    pub fn new(buffer_limit: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            order: VecDeque::new(),
            buffer_limit,
        }
    }

    /// Allocate a fresh id and register a `starting` session
    pub fn create(&mut self, options: SessionOptions) -> String {
        let id = loop {
            let candidate = Uuid::new_v4().to_string();
            if !self.sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        self.sessions.insert(
            id.clone(),
            Session::new(id.clone(), options, self.buffer_limit),
        );
        self.order.push_back(id.clone());
        id
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn get_mut(&mut self, session_id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(session_id)
    }

    /// Remove a session, closing its sockets. No-op for unknown ids.
    pub fn remove(&mut self, session_id: &str) -> Option<Session> {
        let mut session = self.sessions.remove(session_id)?;
        self.order.retain(|id| id != session_id);
        session.close_sockets(1000, "session deleted");
        Some(session)
    }

    /// Session summaries in insertion order
    pub fn list(&self) -> Vec<SessionInfo> {
        self.order
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .map(Session::info)
            .collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
