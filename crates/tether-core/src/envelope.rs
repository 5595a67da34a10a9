//! Message envelope shared by outbound and inbound traffic.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Well-known command names.
pub mod commands {
    /// Registration sent on every (re)connect.
    pub const HELLO: &str = "hello";
    /// Successful reply to a correlated call.
    pub const REPLY: &str = "reply";
    /// Failed reply to a correlated call.
    pub const ERROR: &str = "error";
    /// Liveness probe answered by the remote.
    pub const PING: &str = "PING";
    /// Start a job.
    pub const RUN: &str = "RUN";
    /// Cancel a job.
    pub const KILL: &str = "KILL";
    /// List running jobs.
    pub const LIST_RUNNING: &str = "LIST_RUNNING";
    /// Fire-and-forget notification of a finished job.
    pub const JOB_FINISHED: &str = "job_finished";
}

/// Opaque token pairing a call with its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single message on the wire.
///
/// A present `correlation_id` means the sender expects a reply tagged
/// with the same id. Replies use the `reply` or `error` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Command name used for routing.
    pub command: String,
    /// Command payload.
    #[serde(default)]
    pub data: Value,
    /// Correlation id for request/reply pairs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

impl Envelope {
    /// Create a fire-and-forget envelope.
    #[must_use]
    pub fn new(command: impl Into<String>, data: Value) -> Self {
        Self {
            command: command.into(),
            data,
            correlation_id: None,
        }
    }

    /// Tag this envelope with a correlation id.
    #[must_use]
    pub fn with_correlation(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Successful reply to `id`.
    #[must_use]
    pub fn reply(id: CorrelationId, data: Value) -> Self {
        Self::new(commands::REPLY, data).with_correlation(id)
    }

    /// Error reply to `id`.
    #[must_use]
    pub fn error_reply(id: CorrelationId, message: impl Into<String>) -> Self {
        Self::new(
            commands::ERROR,
            serde_json::json!({ "message": message.into() }),
        )
        .with_correlation(id)
    }

    /// Whether the sender expects a reply.
    #[must_use]
    pub const fn expects_reply(&self) -> bool {
        self.correlation_id.is_some()
    }

    /// Whether this is an error reply.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.command == commands::ERROR
    }

    /// Extract the message of an error reply.
    #[must_use]
    pub fn error_message(&self) -> String {
        self.data
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| self.data.to_string(), ToOwned::to_owned)
    }
}
