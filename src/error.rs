//! ClawRelay error types

use thiserror::Error;

/// ClawRelay error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No session registered under this id
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Session already reached its terminal state
    #[error("Session has exited: {0}")]
    SessionExited(String),

    /// No CLI socket is attached to the session
    #[error("CLI not connected for session {0}")]
    NotConnected(String),

    /// Permission response for a request id that is not pending
    #[error("Unknown or already resolved permission request: {0}")]
    UnknownPermission(String),

    /// WebSocket path that matches neither endpoint shape
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// CLI process could not be spawned
    #[error("Launch error: {0}")]
    Launch(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

}

impl Error {
    /// WebSocket close code used when a connection is rejected for this error
    pub fn close_code(&self) -> u16 {
        match self {
            // Policy violation: unknown or finished session
            Error::SessionNotFound(_) | Error::SessionExited(_) => 1008,
            _ => 1011,
        }
    }
}

/// Result type alias for ClawRelay operations
pub type Result<T> = std::result::Result<T, Error>;
