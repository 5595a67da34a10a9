//! Core abstractions for the tether duplex transport.
//!
//! This crate provides the fundamental building blocks:
//! - `Envelope` - The message shape exchanged in both directions
//! - Error taxonomy shared by every layer
//! - `SessionConfig` - Connection, keep-alive and retry settings
//! - `EventLog` - Broadcast + history of session diagnostics
//! - `BlockingFeed` - Bridge from a blocking producer into async code
//! - `Outbox` and `Handshake` traits

pub mod config;
pub mod envelope;
pub mod error;
pub mod events;
pub mod feed;
pub mod traits;

pub use config::{AllowHeader, Endpoint, KeepAlive, SessionConfig};
pub use envelope::{CorrelationId, Envelope, commands};
pub use error::{
    CallError, ConfigError, ConnectError, HandlerError, SendError, SessionClosedError,
    StartError, TransportError,
};
pub use events::{EventLog, SessionEvent};
pub use feed::{BlockingFeed, FeedSender};
pub use traits::{Handshake, NoHandshake, Outbox};
