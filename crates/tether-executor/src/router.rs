//! Command registry and dispatch.
//!
//! Each inbound command runs in its own task so a slow handler never
//! stalls the receive loop. Handler errors and panics stop at this
//! boundary and become `error` replies when the remote expects one.

use std::{any::Any, collections::HashMap, future::Future, panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use futures::{FutureExt, Stream, StreamExt};
use serde_json::Value;
use tether_core::{CorrelationId, Envelope, HandlerError, Outbox, SessionClosedError};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// What a handler gets besides the payload.
#[derive(Clone)]
pub struct CommandContext {
    pub command: String,
    /// Present when the remote expects a reply.
    pub correlation_id: Option<CorrelationId>,
    outbox: Arc<dyn Outbox>,
}

impl CommandContext {
    /// Send an unsolicited envelope to the remote.
    ///
    /// # Errors
    /// Returns `SessionClosedError` once the session is shut down.
    pub async fn notify(&self, envelope: Envelope) -> Result<(), SessionClosedError> {
        self.outbox.post(envelope).await
    }

    #[must_use]
    pub fn outbox(&self) -> Arc<dyn Outbox> {
        Arc::clone(&self.outbox)
    }
}

/// Trait implemented by every command handler.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle one command. `Ok` becomes the reply payload.
    async fn handle(&self, data: Value, ctx: CommandContext) -> Result<Value, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Value, CommandContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, data: Value, ctx: CommandContext) -> Result<Value, HandlerError> {
        (self.0)(data, ctx).await
    }
}

/// Registry mapping command names to handlers.
pub struct CommandRouter {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
    outbox: Arc<dyn Outbox>,
}

impl CommandRouter {
    /// Create an empty router replying through `outbox`.
    #[must_use]
    pub fn new(outbox: Arc<dyn Outbox>) -> Self {
        Self {
            handlers: HashMap::new(),
            outbox,
        }
    }

    /// Register a handler, replacing any previous one for `command`.
    pub fn register(&mut self, command: &str, handler: impl CommandHandler + 'static) {
        if self
            .handlers
            .insert(command.to_owned(), Arc::new(handler))
            .is_some()
        {
            warn!(command, "Replaced existing command handler");
        }
    }

    /// Register a closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, command: &str, handler: F)
    where
        F: Fn(Value, CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register(command, FnHandler(handler));
    }

    /// Registered command names, sorted.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn has_command(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }

    /// Spawn the handler for `envelope`.
    ///
    /// Unknown commands are logged and dropped; `None` is returned.
    pub fn dispatch(&self, envelope: Envelope) -> Option<JoinHandle<()>> {
        let Envelope {
            command,
            data,
            correlation_id,
        } = envelope;

        let Some(handler) = self.handlers.get(&command).map(Arc::clone) else {
            warn!(command, correlation_id = ?correlation_id, "Unknown command");
            return None;
        };

        let outbox = Arc::clone(&self.outbox);
        let ctx = CommandContext {
            command: command.clone(),
            correlation_id: correlation_id.clone(),
            outbox: Arc::clone(&outbox),
        };

        Some(tokio::spawn(async move {
            debug!(command, "Dispatching");
            let result = match AssertUnwindSafe(handler.handle(data, ctx))
                .catch_unwind()
                .await
            {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => {
                    warn!(command, "Handler failed: {e}");
                    Err(e.to_string())
                }
                Err(panic) => {
                    error!(command, "Handler panicked: {}", panic_message(panic.as_ref()));
                    Err(format!("Handler for {command} panicked"))
                }
            };

            let Some(id) = correlation_id else {
                return;
            };
            let reply = match result {
                Ok(value) => Envelope::reply(id, value),
                Err(message) => Envelope::error_reply(id, message),
            };
            if outbox.post(reply).await.is_err() {
                debug!(command, "Session closed before the reply was sent");
            }
        }))
    }

    /// Dispatch every envelope from `incoming` until it ends.
    pub async fn run<S>(&self, mut incoming: S)
    where
        S: Stream<Item = Envelope> + Unpin,
    {
        while let Some(envelope) = incoming.next().await {
            self.dispatch(envelope);
        }
        debug!("Inbound stream ended");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
