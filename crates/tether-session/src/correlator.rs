//! Request/reply correlation.
//!
//! Each outstanding call parks a oneshot under a fresh correlation id. The
//! receive loop hands every inbound envelope to `handle_inbound`, which
//! resolves the matching call and passes everything else through.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde_json::Value;
use tether_core::{CallError, CorrelationId, Envelope, commands};
use tokio::{
    sync::oneshot,
    time::{self, Instant},
};
use tracing::debug;

type Resolver = oneshot::Sender<Result<Value, CallError>>;

struct PendingCall {
    tx: Resolver,
    /// Epoch the request was written on; unset while queued.
    epoch: Option<u64>,
    created_at: Instant,
}

/// Table of outstanding calls.
#[derive(Default)]
pub struct RpcCorrelator {
    pending: Mutex<HashMap<CorrelationId, PendingCall>>,
}

impl RpcCorrelator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<CorrelationId, PendingCall>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park a new call under a fresh id.
    ///
    /// The call is abandoned when the returned handle is dropped.
    #[must_use]
    pub fn register(self: &Arc<Self>, timeout: Option<Duration>) -> PendingHandle {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let id = {
            let mut table = self.table();
            let mut id = CorrelationId::random();
            while table.contains_key(&id) {
                id = CorrelationId::random();
            }
            table.insert(
                id.clone(),
                PendingCall {
                    tx,
                    epoch: None,
                    created_at: now,
                },
            );
            id
        };

        PendingHandle {
            id,
            rx,
            deadline: timeout.map(|t| now + t),
            correlator: Arc::clone(self),
        }
    }

    /// Record that the call is being written on `epoch`.
    ///
    /// Returns `false` if the call is no longer pending and the write
    /// should be skipped.
    pub fn bind(&self, id: &CorrelationId, epoch: u64) -> bool {
        self.table().get_mut(id).is_some_and(|call| {
            call.epoch = Some(epoch);
            true
        })
    }

    /// Whether `id` still awaits a reply.
    #[must_use]
    pub fn is_pending(&self, id: &CorrelationId) -> bool {
        self.table().contains_key(id)
    }

    /// Resolve the call a reply belongs to.
    ///
    /// Returns the envelope back if it is not a reply. Replies for ids that
    /// are no longer pending are discarded.
    pub fn handle_inbound(&self, envelope: Envelope) -> Option<Envelope> {
        let is_reply = envelope.command == commands::REPLY || envelope.is_error();
        let Some(id) = envelope.correlation_id.as_ref().filter(|_| is_reply) else {
            return Some(envelope);
        };

        let Some(call) = self.table().remove(id) else {
            debug!(correlation_id = %id, "Discarding reply with no pending call");
            return None;
        };

        let result = if envelope.is_error() {
            Err(CallError::Remote(envelope.error_message()))
        } else {
            Ok(envelope.data)
        };
        debug!(
            correlation_id = %id,
            elapsed_ms = u64::try_from(call.created_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Reply matched"
        );
        let _ = call.tx.send(result);
        None
    }

    /// Fail every call written on `epoch` with `ConnectionLost`.
    pub fn invalidate_epoch(&self, epoch: u64) -> usize {
        self.fail_where(|call| call.epoch == Some(epoch), &CallError::ConnectionLost)
    }

    /// Fail every call written on an epoch older than `epoch`.
    pub fn invalidate_before(&self, epoch: u64) -> usize {
        self.fail_where(
            |call| call.epoch.is_some_and(|e| e < epoch),
            &CallError::ConnectionLost,
        )
    }

    /// Fail every pending call, written or not.
    pub fn close_all(&self, err: &CallError) -> usize {
        self.fail_where(|_| true, err)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.table().len()
    }

    fn fail_where(&self, predicate: impl Fn(&PendingCall) -> bool, err: &CallError) -> usize {
        let failed: Vec<PendingCall> = {
            let mut table = self.table();
            let ids: Vec<CorrelationId> = table
                .iter()
                .filter(|(_, call)| predicate(call))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| table.remove(id)).collect()
        };

        let count = failed.len();
        for call in failed {
            let _ = call.tx.send(Err(err.clone()));
        }
        if count > 0 {
            debug!(count, error = %err, "Failed pending calls");
        }
        count
    }

    fn abandon(&self, id: &CorrelationId) {
        self.table().remove(id);
    }
}

/// Caller side of a pending call.
pub struct PendingHandle {
    id: CorrelationId,
    rx: oneshot::Receiver<Result<Value, CallError>>,
    deadline: Option<Instant>,
    correlator: Arc<RpcCorrelator>,
}

impl PendingHandle {
    #[must_use]
    pub const fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// Wait for the reply, up to the deadline given at registration.
    ///
    /// # Errors
    /// Returns `Timeout` once the deadline passes, or whatever error the
    /// call was resolved with.
    pub async fn wait(mut self) -> Result<Value, CallError> {
        let rx = &mut self.rx;
        let received = match self.deadline {
            Some(deadline) => match time::timeout_at(deadline, rx).await {
                Ok(received) => received,
                Err(_) => return Err(CallError::Timeout),
            },
            None => rx.await,
        };
        received.unwrap_or(Err(CallError::SessionClosed))
    }
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        self.correlator.abandon(&self.id);
    }
}
