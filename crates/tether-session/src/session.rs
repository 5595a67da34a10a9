//! Reconnecting session.
//!
//! Two background tasks per session:
//! - the supervisor connects, replays the handshake, publishes the current
//!   channel and runs the receive loop until the connection dies, then
//!   starts over after `reconnect_delay`;
//! - the writer drains the outbound queue in FIFO order, always writing to
//!   whatever channel is current at the moment of the write.
//!
//! The current channel lives in a `watch` written only by the supervisor
//! (and by `cancel`).

use std::{
    fmt,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use futures::{FutureExt, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tether_core::{
    CallError, CorrelationId, Endpoint, Envelope, EventLog, Handshake, Outbox, SendError,
    SessionClosedError, SessionConfig, SessionEvent,
};
use tether_transport::{ChannelSender, Connection, Connector, DuplexChannel};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time,
};
use tokio_stream::wrappers::{UnboundedReceiverStream, WatchStream};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::correlator::RpcCorrelator;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Started, supervisor not yet running.
    Idle,
    /// Waiting for a connection; sends are queued.
    Connecting,
    /// A connection is current; sends are written.
    Open,
    /// Shutdown requested; sends fail.
    Closing,
    /// Terminal.
    Closed,
}

impl SessionState {
    const fn is_shutting_down(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

#[derive(Clone)]
struct Current {
    state: SessionState,
    channel: Option<ChannelSender>,
}

/// A queued write.
struct Outbound {
    envelope: Envelope,
    /// Set for calls; the write is skipped once the call is no longer pending.
    call_id: Option<CorrelationId>,
    /// Set for sends; the write is skipped once the sender gave up.
    done: Option<oneshot::Sender<()>>,
}

impl Outbound {
    fn abandoned(&self, correlator: &RpcCorrelator) -> bool {
        self.done.as_ref().is_some_and(oneshot::Sender::is_closed)
            || self
                .call_id
                .as_ref()
                .is_some_and(|id| !correlator.is_pending(id))
    }

    fn complete(self) {
        if let Some(done) = self.done {
            let _ = done.send(());
        }
    }
}

struct Inner {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    handshake: Arc<dyn Handshake>,
    correlator: Arc<RpcCorrelator>,
    current: watch::Sender<Current>,
    outbound: mpsc::UnboundedSender<Outbound>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    events: Arc<EventLog>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    /// Publish a new state. Refused once shutdown has begun.
    fn transition(&self, state: SessionState, channel: Option<ChannelSender>) -> bool {
        self.current.send_if_modified(|current| {
            if current.state.is_shutting_down()
                || (current.state == state && channel.is_none() && current.channel.is_none())
            {
                return false;
            }
            *current = Current { state, channel };
            true
        })
    }

    fn state(&self) -> SessionState {
        self.current.borrow().state
    }
}

/// One stable logical connection over a sequence of physical ones.
///
/// Cheap to clone. The session shuts down when `cancel` is called or the
/// last clone is dropped.
#[derive(Clone)]
pub struct ReconnectingSession {
    inner: Arc<Inner>,
    _guard: Arc<DropGuard>,
}

impl ReconnectingSession {
    /// Start the supervisor and writer tasks.
    ///
    /// Must be called from within a tokio runtime. The first connect
    /// attempt starts immediately.
    #[must_use]
    pub fn start(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        handshake: Arc<dyn Handshake>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (current, _) = watch::channel(Current {
            state: SessionState::Idle,
            channel: None,
        });
        let (outbound, queue) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            config,
            connector,
            handshake,
            correlator: Arc::new(RpcCorrelator::new()),
            current,
            outbound,
            incoming: Mutex::new(Some(incoming_rx)),
            events: Arc::new(EventLog::new()),
            cancel: cancel.clone(),
            tasks: Mutex::new(Vec::new()),
        });

        let supervisor = tokio::spawn(supervise(Arc::clone(&inner), incoming_tx));
        let writer = tokio::spawn(drain(Arc::clone(&inner), queue));
        inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([supervisor, writer]);

        Self {
            inner,
            _guard: Arc::new(cancel.drop_guard()),
        }
    }

    /// Queue an envelope and wait until it has been written.
    ///
    /// While the session is connecting the write waits for the next open
    /// connection; transient failures never fail a send.
    ///
    /// # Errors
    /// Returns `SessionClosedError` once shutdown has begun.
    pub async fn send(&self, envelope: Envelope) -> Result<(), SessionClosedError> {
        let (done, written) = oneshot::channel();
        self.enqueue(Outbound {
            envelope,
            call_id: None,
            done: Some(done),
        })?;
        written.await.map_err(|_| SessionClosedError)
    }

    /// Send a request and wait for the correlated reply.
    ///
    /// `timeout` defaults to the configured call timeout and covers the
    /// time spent queued.
    ///
    /// # Errors
    /// Returns `Timeout`, `ConnectionLost` if the connection carrying the
    /// request died, `SessionClosed`, or `Remote` for an error reply.
    pub async fn call(
        &self,
        command: &str,
        data: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        let timeout = timeout.unwrap_or_else(|| self.inner.config.call_timeout());
        let pending = self.inner.correlator.register(Some(timeout));
        let id = pending.id().clone();
        debug!(command, correlation_id = %id, "Calling");

        self.enqueue(Outbound {
            envelope: Envelope::new(command, data).with_correlation(id.clone()),
            call_id: Some(id),
            done: None,
        })?;
        pending.wait().await
    }

    /// Answer a request received from the remote.
    ///
    /// # Errors
    /// Returns `SessionClosedError` once shutdown has begun.
    pub async fn reply(
        &self,
        correlation_id: CorrelationId,
        result: Result<Value, String>,
    ) -> Result<(), SessionClosedError> {
        let envelope = match result {
            Ok(data) => Envelope::reply(correlation_id, data),
            Err(message) => Envelope::error_reply(correlation_id, message),
        };
        self.send(envelope).await
    }

    fn enqueue(&self, item: Outbound) -> Result<(), SessionClosedError> {
        if self.inner.state().is_shutting_down() {
            return Err(SessionClosedError);
        }
        self.inner
            .outbound
            .send(item)
            .map_err(|_| SessionClosedError)
    }

    /// Inbound envelopes that are not replies to our calls.
    ///
    /// Envelopes arriving before this is called, or after the stream is
    /// dropped, are discarded. Returns `None` after the first call.
    pub fn take_incoming(&self) -> Option<UnboundedReceiverStream<Envelope>> {
        self.inner
            .incoming
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(UnboundedReceiverStream::new)
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Stream of states, starting with the current one.
    pub fn state_changes(&self) -> impl Stream<Item = SessionState> + Send + Unpin + 'static {
        WatchStream::new(self.inner.current.subscribe()).map(|current| current.state)
    }

    /// Diagnostics emitted on every transition.
    #[must_use]
    pub fn events(&self) -> &Arc<EventLog> {
        &self.inner.events
    }

    /// Number of calls awaiting a reply.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Stop reconnecting and close the current connection.
    ///
    /// Idempotent and non-blocking. Queued sends and pending calls fail
    /// with `SessionClosed`.
    pub fn cancel(&self) {
        let first = self.inner.current.send_if_modified(|current| {
            if current.state.is_shutting_down() {
                return false;
            }
            *current = Current {
                state: SessionState::Closing,
                channel: None,
            };
            true
        });
        if first {
            info!("Session shutdown requested");
        }
        self.inner.cancel.cancel();
    }

    /// Cancel and wait up to `timeout` for the background tasks to finish.
    ///
    /// Returns `false` if they did not finish in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if tasks.is_empty() {
            return true;
        }

        if time::timeout(timeout, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!("Session shutdown timed out after {timeout:?}");
            return false;
        }
        true
    }
}

impl fmt::Debug for ReconnectingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectingSession")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Outbox for ReconnectingSession {
    async fn post(&self, envelope: Envelope) -> Result<(), SessionClosedError> {
        self.send(envelope).await
    }
}

async fn supervise(inner: Arc<Inner>, incoming: mpsc::UnboundedSender<Envelope>) {
    tokio::select! {
        () = inner.cancel.cancelled() => {}
        () = connect_loop(&inner, &incoming) => {}
    }

    inner.current.send_replace(Current {
        state: SessionState::Closed,
        channel: None,
    });
    let failed = inner.correlator.close_all(&CallError::SessionClosed);
    inner.events.push(SessionEvent::Closed);
    info!(failed_calls = failed, "Session closed");
}

async fn connect_loop(inner: &Inner, incoming: &mpsc::UnboundedSender<Envelope>) {
    let endpoint = inner.config.endpoint();
    let mut epoch = 0u64;
    let mut attempt = 0u32;
    let mut retry = false;

    loop {
        if retry {
            time::sleep(inner.config.reconnect_delay()).await;
        }
        retry = true;
        attempt = attempt.saturating_add(1);

        inner.transition(SessionState::Connecting, None);
        inner.events.push(SessionEvent::Connecting { attempt });
        debug!(attempt, url = %endpoint.url, "Connecting");

        let connection = match connect(inner, &endpoint).await {
            Ok(connection) => connection,
            Err(error) => {
                warn!(attempt, "Connect failed: {error}");
                inner
                    .events
                    .push(SessionEvent::ConnectFailed { attempt, error });
                continue;
            }
        };

        epoch += 1;
        let mut channel = DuplexChannel::open(connection, epoch, &inner.config.keep_alive);
        inner.correlator.invalidate_before(epoch);

        if let Err(error) = handshake(inner, &channel).await {
            warn!(attempt, epoch, "Handshake failed: {error}");
            inner
                .events
                .push(SessionEvent::ConnectFailed { attempt, error });
            continue;
        }

        if !inner.transition(SessionState::Open, Some(channel.sender())) {
            return;
        }
        attempt = 0;
        inner.events.push(SessionEvent::Opened { epoch });
        info!(epoch, address = channel.address(), "Session open");

        let mut inbound = channel.receive();
        while let Some(envelope) = inbound.next().await {
            if route(inner, incoming, envelope).is_err() {
                error!(epoch, "Inbound routing panicked, dropping the connection");
                channel.close();
                break;
            }
        }

        let reason = channel.closed().await;
        inner.transition(SessionState::Connecting, None);
        let lost = inner.correlator.invalidate_epoch(epoch);
        warn!(epoch, %reason, lost_calls = lost, "Connection lost");
        inner.events.push(SessionEvent::Disconnected {
            epoch,
            reason: reason.to_string(),
            abnormal: reason.is_abnormal(),
        });
    }
}

/// One connect attempt. A panicking connector counts as a failed attempt.
async fn connect(inner: &Inner, endpoint: &Endpoint) -> Result<Connection, String> {
    match AssertUnwindSafe(
        inner
            .connector
            .connect(endpoint, inner.config.connect_timeout()),
    )
    .catch_unwind()
    .await
    {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err("connector panicked".to_owned()),
    }
}

/// Hand one inbound envelope to the correlator, then to the router.
///
/// Non-replies are dropped while nobody holds the incoming stream.
fn route(
    inner: &Inner,
    incoming: &mpsc::UnboundedSender<Envelope>,
    envelope: Envelope,
) -> std::thread::Result<()> {
    std::panic::catch_unwind(AssertUnwindSafe(|| {
        let Some(envelope) = inner.correlator.handle_inbound(envelope) else {
            return;
        };
        let untaken = inner
            .incoming
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if untaken {
            debug!(command = %envelope.command, "Incoming stream not taken, dropping envelope");
        } else if let Err(dropped) = incoming.send(envelope) {
            debug!(command = %dropped.0.command, "Incoming stream closed, dropping envelope");
        }
    }))
}

/// Write the hello envelope directly on a fresh channel.
///
/// Bounded by the connect timeout; a stalled write fails the attempt.
async fn handshake(inner: &Inner, channel: &DuplexChannel) -> Result<(), String> {
    let hello = AssertUnwindSafe(inner.handshake.hello())
        .catch_unwind()
        .await
        .map_err(|_| "handshake panicked".to_owned())?;

    if let Some(hello) = hello {
        let timeout = inner.config.connect_timeout();
        time::timeout(timeout, channel.send(&hello))
            .await
            .map_err(|_| format!("hello not written within {timeout:?}"))?
            .map_err(|e| e.to_string())?;
        debug!(epoch = channel.epoch(), command = %hello.command, "Handshake sent");
    }
    Ok(())
}

async fn drain(inner: Arc<Inner>, mut queue: mpsc::UnboundedReceiver<Outbound>) {
    tokio::select! {
        () = inner.cancel.cancelled() => {}
        () = write_loop(&inner, &mut queue) => {}
    }
    // Dropping the rest fails their senders with `SessionClosedError`.
    queue.close();
    debug!("Writer stopped");
}

async fn write_loop(inner: &Inner, queue: &mut mpsc::UnboundedReceiver<Outbound>) {
    let mut current = inner.current.subscribe();
    // Highest epoch a write has already failed on.
    let mut stale = 0u64;

    while let Some(item) = queue.recv().await {
        loop {
            if item.abandoned(&inner.correlator) {
                break;
            }
            let Some(channel) = next_open(&mut current, stale).await else {
                return;
            };
            if let Some(id) = &item.call_id {
                if !inner.correlator.bind(id, channel.epoch()) {
                    break;
                }
            }

            match channel.send(&item.envelope).await {
                Ok(()) => {
                    item.complete();
                    break;
                }
                Err(SendError::ConnectionClosed) => {
                    debug!(epoch = channel.epoch(), "Write hit a closed connection, retrying on the next one");
                    stale = channel.epoch();
                }
                Err(e @ SendError::Encode(_)) => {
                    error!(command = %item.envelope.command, "Dropping envelope: {e}");
                    break;
                }
            }
        }
    }
}

/// Wait for an open channel newer than `stale`. `None` once shutting down.
async fn next_open(current: &mut watch::Receiver<Current>, stale: u64) -> Option<ChannelSender> {
    let current = current
        .wait_for(|current| {
            current.state.is_shutting_down()
                || current
                    .channel
                    .as_ref()
                    .is_some_and(|channel| channel.epoch() > stale)
        })
        .await
        .ok()?;
    current.channel.clone()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tether_core::{ConnectError, NoHandshake, TransportError};
    use tether_transport::{Frame, FrameSink, FrameStream, MemoryConnector, MemoryPeer, PeerListener};
    use tokio::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    struct Hello;

    #[async_trait]
    impl Handshake for Hello {
        async fn hello(&self) -> Option<Envelope> {
            Some(Envelope::new("hello", json!({ "slots": 1 })))
        }
    }

    fn config() -> SessionConfig {
        let mut config = SessionConfig::new("mem://hub");
        config.reconnect_delay_ms = 100;
        config
    }

    fn start_with(
        config: SessionConfig,
        handshake: Arc<dyn Handshake>,
    ) -> (ReconnectingSession, Arc<MemoryConnector>, PeerListener) {
        let (connector, listener) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let session = ReconnectingSession::start(config, connector.clone(), handshake);
        (session, connector, listener)
    }

    fn start() -> (ReconnectingSession, Arc<MemoryConnector>, PeerListener) {
        start_with(config(), Arc::new(NoHandshake))
    }

    /// Answer every call with `"PONG"` until the client hangs up.
    fn echo(mut peer: MemoryPeer) {
        tokio::spawn(async move {
            while let Some(request) = peer.recv().await {
                if let Some(id) = request.correlation_id {
                    peer.send(&Envelope::reply(id, json!("PONG")));
                }
            }
        });
    }

    #[tokio::test]
    async fn call_resolves_with_matching_reply() {
        let (session, _connector, mut listener) = start();
        echo(listener.accept().await.unwrap());

        let started = Instant::now();
        let reply = session
            .call("PING", json!({}), Some(Duration::from_secs(1)))
            .await;
        assert_eq!(assert_ok!(reply), json!("PONG"));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(session.pending_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_times_out_on_deadline() {
        let (session, _connector, mut listener) = start();
        let _peer = listener.accept().await.unwrap();

        let started = Instant::now();
        let err = assert_err!(
            session
                .call("PING", json!({}), Some(Duration::from_millis(200)))
                .await
        );
        let elapsed = started.elapsed();
        assert_eq!(err, CallError::Timeout);
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(250));
        assert_eq!(session.pending_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_fails_calls_before_next_attempt() {
        let (session, connector, mut listener) = start();
        let mut peer = listener.accept().await.unwrap();

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.call("PING", json!(1), None).await }
        });
        let second = tokio::spawn({
            let session = session.clone();
            async move { session.call("PING", json!(2), None).await }
        });
        assert!(peer.recv().await.is_some());
        assert!(peer.recv().await.is_some());
        peer.close();

        assert_eq!(first.await.unwrap(), Err(CallError::ConnectionLost));
        assert_eq!(second.await.unwrap(), Err(CallError::ConnectionLost));
        assert_eq!(connector.attempts(), 1);

        let events = session.events().history();
        assert!(events.contains(&SessionEvent::Disconnected {
            epoch: 1,
            reason: "closed by remote".into(),
            abnormal: true,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_sends_are_released_in_order() {
        let (session, connector, mut listener) = start();
        connector.refuse_next("hub down");

        let peer_side = async {
            let mut peer = listener.accept().await.unwrap();
            let mut commands = Vec::new();
            for _ in 0..3 {
                commands.push(peer.recv().await.unwrap().command);
            }
            commands
        };
        let (a, b, c, commands) = tokio::join!(
            session.send(Envelope::new("A", json!(null))),
            session.send(Envelope::new("B", json!(null))),
            session.send(Envelope::new("C", json!(null))),
            peer_side,
        );

        assert_ok!(a);
        assert_ok!(b);
        assert_ok!(c);
        assert_eq!(commands, ["A", "B", "C"]);
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_is_replayed_before_queued_traffic() {
        let (session, _connector, mut listener) = start_with(config(), Arc::new(Hello));

        let mut peer = listener.accept().await.unwrap();
        assert_eq!(peer.recv().await.unwrap().command, "hello");
        peer.close();

        let queued = tokio::spawn({
            let session = session.clone();
            async move { session.send(Envelope::new("after", json!(null))).await }
        });

        let mut peer = listener.accept().await.unwrap();
        assert_eq!(peer.recv().await.unwrap().command, "hello");
        assert_eq!(peer.recv().await.unwrap().command, "after");
        assert_ok!(queued.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_is_retried() {
        let mut config = config();
        config.connect_timeout_ms = 500;
        let (session, connector, mut listener) = start_with(config, Arc::new(NoHandshake));
        connector.hang_next();

        let _peer = listener.accept().await.unwrap();
        let mut states = session.state_changes();
        while states.next().await != Some(SessionState::Open) {}

        assert_eq!(connector.attempts(), 2);
        let events = session.events().history();
        assert!(matches!(
            events.as_slice(),
            [
                SessionEvent::Connecting { attempt: 1 },
                SessionEvent::ConnectFailed { attempt: 1, .. },
                SessionEvent::Connecting { attempt: 2 },
                SessionEvent::Opened { epoch: 1 },
            ]
        ));
    }

    #[tokio::test]
    async fn non_reply_envelopes_reach_incoming() {
        let (session, _connector, mut listener) = start();
        let peer = listener.accept().await.unwrap();
        let mut incoming = session.take_incoming().unwrap();
        assert!(session.take_incoming().is_none());

        peer.send(&Envelope::reply("stale".into(), json!(null)));
        peer.send(&Envelope::new("RUN", json!({ "job_id": "a" })).with_correlation("r1".into()));

        let routed = incoming.next().await.unwrap();
        assert_eq!(routed.command, "RUN");
        assert_eq!(routed.correlation_id, Some("r1".into()));
    }

    #[tokio::test]
    async fn envelopes_before_take_are_dropped() {
        let (session, _connector, mut listener) = start();
        let mut peer = listener.accept().await.unwrap();

        peer.send(&Envelope::new("early", json!(null)));
        let call = tokio::spawn({
            let session = session.clone();
            async move { session.call("PING", json!({}), None).await }
        });
        let request = peer.recv().await.unwrap();
        peer.send(&Envelope::reply(request.correlation_id.unwrap(), json!("PONG")));
        assert_ok!(call.await.unwrap());

        let mut incoming = session.take_incoming().unwrap();
        peer.send(&Envelope::new("late", json!(null)));
        assert_eq!(incoming.next().await.unwrap().command, "late");
    }

    enum Fault {
        Panic,
        StalledSink,
    }

    /// Misbehaves on the first attempt, then delegates.
    struct FaultyOnce {
        fault: Mutex<Option<Fault>>,
        inner: MemoryConnector,
    }

    impl FaultyOnce {
        fn start(
            fault: Fault,
            config: SessionConfig,
            handshake: Arc<dyn Handshake>,
        ) -> (ReconnectingSession, PeerListener) {
            let (inner, listener) = MemoryConnector::new();
            let connector = Self {
                fault: Mutex::new(Some(fault)),
                inner,
            };
            let session = ReconnectingSession::start(config, Arc::new(connector), handshake);
            (session, listener)
        }
    }

    #[async_trait]
    impl Connector for FaultyOnce {
        async fn connect(
            &self,
            endpoint: &Endpoint,
            timeout: Duration,
        ) -> Result<Connection, ConnectError> {
            let fault = self.fault.lock().unwrap().take();
            match fault {
                Some(Fault::Panic) => panic!("connector exploded"),
                Some(Fault::StalledSink) => {
                    let sink: FrameSink =
                        Box::pin(futures::sink::unfold((), |(), _frame: Frame| {
                            futures::future::pending::<Result<(), TransportError>>()
                        }));
                    let stream: FrameStream =
                        Box::pin(futures::stream::pending::<Result<Frame, TransportError>>());
                    Ok(Connection::new("mem://stalled", sink, stream))
                }
                None => self.inner.connect(endpoint, timeout).await,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_connector_counts_as_failed_attempt() {
        let (session, mut listener) =
            FaultyOnce::start(Fault::Panic, config(), Arc::new(NoHandshake));

        let sent = tokio::spawn({
            let session = session.clone();
            async move { session.send(Envelope::new("status", json!({}))).await }
        });
        let mut peer = listener.accept().await.unwrap();
        assert_eq!(peer.recv().await.unwrap().command, "status");
        assert_ok!(sent.await.unwrap());

        assert_eq!(session.state(), SessionState::Open);
        assert!(session.events().history().contains(&SessionEvent::ConnectFailed {
            attempt: 1,
            error: "connector panicked".into(),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_hello_fails_the_attempt() {
        let mut config = config();
        config.connect_timeout_ms = 500;
        let (session, mut listener) =
            FaultyOnce::start(Fault::StalledSink, config, Arc::new(Hello));

        let mut peer = listener.accept().await.unwrap();
        assert_eq!(peer.recv().await.unwrap().command, "hello");
        let mut states = session.state_changes();
        while states.next().await != Some(SessionState::Open) {}

        let events = session.events().history();
        assert!(events.iter().any(|event| matches!(
            event,
            SessionEvent::ConnectFailed { attempt: 1, error } if error.starts_with("hello not written")
        )));
        assert!(events.contains(&SessionEvent::Opened { epoch: 2 }));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (session, _connector, mut listener) = start();
        let mut peer = listener.accept().await.unwrap();

        let pending = tokio::spawn({
            let session = session.clone();
            async move { session.call("PING", json!({}), None).await }
        });
        assert!(peer.recv().await.is_some());

        session.cancel();
        session.cancel();
        assert!(session.shutdown(Duration::from_secs(1)).await);
        assert!(session.shutdown(Duration::from_secs(1)).await);

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(pending.await.unwrap(), Err(CallError::SessionClosed));
        assert_err!(session.send(Envelope::new("late", json!(null))).await);
        assert_eq!(
            session.call("late", json!(null), None).await,
            Err(CallError::SessionClosed)
        );
        assert!(peer.recv().await.is_none());
        assert_eq!(session.events().history().last(), Some(&SessionEvent::Closed));
    }

    #[tokio::test]
    async fn remote_error_reply_surfaces_as_remote() {
        let (session, _connector, mut listener) = start();
        let mut peer = listener.accept().await.unwrap();
        tokio::spawn(async move {
            while let Some(request) = peer.recv().await {
                if let Some(id) = request.correlation_id {
                    peer.send(&Envelope::error_reply(id, "unknown job"));
                }
            }
        });

        assert_eq!(
            session.call("KILL", json!({ "job_id": "x" }), None).await,
            Err(CallError::Remote("unknown job".into()))
        );
    }
}
