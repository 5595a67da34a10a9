//! Transport layer: connection endpoints and framed duplex channels.
//!
//! Provides:
//! - `Connector` - One connect attempt per call, timeout enforced
//! - `DuplexChannel` - Envelope framing, keep-alive, close notification
//! - Wire protocol (JSON text frames)
//! - WebSocket connector (feature: websocket)
//! - In-memory connector for tests and embedding

pub mod channel;
pub mod endpoint;
pub mod memory;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use channel::{ChannelSender, CloseReason, DuplexChannel};
pub use endpoint::{Connection, ConnectionState, Connector, Frame, FrameSink, FrameStream};
pub use memory::{MemoryConnector, MemoryPeer, PeerListener};

#[cfg(feature = "websocket")]
pub use websocket::WsConnector;
