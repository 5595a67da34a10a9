//! Core traits shared across crates.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{Envelope, SessionClosedError};

/// Capability to send envelopes to the remote peer.
///
/// Implemented by the reconnecting session. Handlers hold an `Outbox`
/// instead of the session itself so they can be tested in isolation.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Queue an envelope for delivery. Resolves once written.
    async fn post(&self, envelope: Envelope) -> Result<(), SessionClosedError>;
}

#[async_trait]
impl<T: Outbox + ?Sized> Outbox for Arc<T> {
    async fn post(&self, envelope: Envelope) -> Result<(), SessionClosedError> {
        (**self).post(envelope).await
    }
}

/// Application-level registration replayed on every (re)connect.
#[async_trait]
pub trait Handshake: Send + Sync {
    /// Build the envelope sent before the connection is considered ready.
    ///
    /// Returning `None` skips the handshake.
    async fn hello(&self) -> Option<Envelope>;
}

/// Handshake that sends nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHandshake;

#[async_trait]
impl Handshake for NoHandshake {
    async fn hello(&self) -> Option<Envelope> {
        None
    }
}
