//! Session supervision for the tether transport.
//!
//! Provides:
//! - `ReconnectingSession` - One stable logical connection over many physical ones
//! - `RpcCorrelator` - Request/reply matching by correlation id

pub mod correlator;
pub mod session;

pub use correlator::{PendingHandle, RpcCorrelator};
pub use session::{ReconnectingSession, SessionState};
