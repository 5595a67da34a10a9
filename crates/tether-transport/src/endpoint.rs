//! Connection endpoint.
//!
//! Single responsibility: produce one live connection for an endpoint, or fail.
//! No retry logic lives here; the session owns retry and backoff.

use std::{future::Future, pin::Pin, time::Duration, time::SystemTime};

use async_trait::async_trait;
use futures::{Sink, Stream};
use tether_core::{ConnectError, Endpoint, TransportError};

/// A raw frame below the envelope layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Only surfaced by transports that do not answer pings themselves.
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Write half of a connection.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;

/// Read half of a connection.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// One live transport instance.
///
/// Can only be obtained from a `Connector`. Replaced, never mutated,
/// when the session reconnects.
pub struct Connection {
    address: String,
    created_at: SystemTime,
    sink: FrameSink,
    stream: FrameStream,
}

impl Connection {
    /// Wrap an established sink/stream pair.
    #[must_use]
    pub fn new(address: impl Into<String>, sink: FrameSink, stream: FrameStream) -> Self {
        Self {
            address: address.into(),
            created_at: SystemTime::now(),
            sink,
            stream,
        }
    }

    /// Remote address this connection was made to.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// When the connection was established.
    #[must_use]
    pub const fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Split into write and read halves.
    #[must_use]
    pub fn into_parts(self) -> (FrameSink, FrameStream) {
        (self.sink, self.stream)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Trait for connection endpoints.
///
/// Implementations make a single attempt and must enforce `timeout`.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Attempt one handshake with `endpoint`.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Connection, ConnectError>;
}

/// Run a handshake future under `timeout`, mapping expiry to `ConnectError::Timeout`.
///
/// # Errors
/// Returns `Timeout` if the deadline passes, otherwise the future's own error.
pub async fn within<F>(timeout: Duration, attempt: F) -> Result<Connection, ConnectError>
where
    F: Future<Output = Result<Connection, ConnectError>> + Send,
{
    tokio::time::timeout(timeout, attempt)
        .await
        .unwrap_or(Err(ConnectError::Timeout(timeout)))
}
