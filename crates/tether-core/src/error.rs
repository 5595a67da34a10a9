//! Error taxonomy.
//!
//! Transport-level failures (`ConnectError`, `SendError`, `TransportError`)
//! are recovered inside the session. Only `CallError`, `StartError` and
//! `SessionClosedError` reach application callers.

use std::time::Duration;

use thiserror::Error;

/// Failure to establish a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("Endpoint unreachable: {cause}")]
    Unreachable { cause: String },
}

impl ConnectError {
    /// Wrap any displayable cause as `Unreachable`.
    pub fn unreachable(cause: impl std::fmt::Display) -> Self {
        Self::Unreachable {
            cause: cause.to_string(),
        }
    }
}

/// Failure to write a frame on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Envelope could not be encoded: {0}")]
    Encode(String),
}

/// Failure of an RPC call. Every call resolves with a value or one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("Call timed out")]
    Timeout,
    #[error("Connection lost before a reply arrived")]
    ConnectionLost,
    #[error("Session closed")]
    SessionClosed,
    #[error("Remote error: {0}")]
    Remote(String),
}

/// The session has been shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Session closed")]
pub struct SessionClosedError;

impl From<SessionClosedError> for CallError {
    fn from(_: SessionClosedError) -> Self {
        Self::SessionClosed
    }
}

/// Failure to admit a job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartError {
    #[error("Job already registered: {0}")]
    DuplicateJobId(String),
    #[error("Job cancelled before it started: {0}")]
    Cancelled(String),
    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

/// Raw transport failure below the framing layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,
    #[error("Transport error: {0}")]
    Io(String),
}

/// Failure inside a command handler, turned into an `error` reply.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Start(#[from] StartError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Failed(String),
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: String, value: String },
    #[error("Missing required setting: {0}")]
    Missing(String),
}
