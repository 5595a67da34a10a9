//! Broadcast + history store of session diagnostics.
//!
//! Every state transition of a session is recorded here. Late subscribers
//! get the retained history first, then live events.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Default number of events retained for late subscribers.
const HISTORY_EVENTS: usize = 256;

/// A diagnostic emitted on a session state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A connect attempt is about to start.
    Connecting { attempt: u32 },
    /// A connect attempt or handshake failed.
    ConnectFailed { attempt: u32, error: String },
    /// A connection was promoted to current.
    Opened { epoch: u64 },
    /// The current connection went away.
    Disconnected {
        epoch: u64,
        reason: String,
        abnormal: bool,
    },
    /// The session reached its terminal state.
    Closed,
}

/// Event store with broadcast and bounded history.
pub struct EventLog {
    history: RwLock<VecDeque<SessionEvent>>,
    capacity: usize,
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    /// Create a log retaining the default number of events.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_EVENTS)
    }

    /// Create a log retaining at most `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            history: RwLock::new(VecDeque::with_capacity(capacity.min(32))),
            capacity,
            sender,
        }
    }

    /// Record an event and fan it out to live subscribers.
    pub fn push(&self, event: SessionEvent) {
        let _ = self.sender.send(event.clone());

        let mut history = self
            .history
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if history.len() == self.capacity {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Receiver for live events only.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Snapshot of the retained history.
    #[must_use]
    pub fn history(&self) -> Vec<SessionEvent> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Stream that yields history first, then live events.
    ///
    /// Lagged receivers skip the events they missed.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, SessionEvent> {
        let rx = self.subscribe();
        let history = self.history();

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        hist.chain(live).boxed()
    }
}
