//! In-process connector.
//!
//! Each accepted connect attempt yields a `MemoryPeer` on the listener,
//! which plays the remote side. Attempts can be scripted to be refused or
//! to hang until the connect timeout.

use std::{
    collections::VecDeque,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{
    SinkExt, StreamExt,
    channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
};
use tether_core::{ConnectError, Endpoint, Envelope, TransportError};
use tokio::sync::mpsc;

use crate::{
    endpoint::{Connection, Connector, Frame, within},
    protocol,
};

/// Scripted outcome of one connect attempt.
#[derive(Debug, Clone)]
enum Plan {
    Accept,
    Refuse(String),
    Hang,
}

/// Connector whose connections terminate in this process.
pub struct MemoryConnector {
    plan: Mutex<VecDeque<Plan>>,
    accepted: mpsc::UnboundedSender<MemoryPeer>,
    attempts: AtomicUsize,
}

/// Receives the remote side of every accepted connection.
pub struct PeerListener {
    rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl PeerListener {
    /// Wait for the next accepted connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.rx.recv().await
    }
}

impl MemoryConnector {
    /// Create a connector and the listener for its peers.
    ///
    /// Attempts are accepted unless scripted otherwise.
    #[must_use]
    pub fn new() -> (Self, PeerListener) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Self {
            plan: Mutex::new(VecDeque::new()),
            accepted,
            attempts: AtomicUsize::new(0),
        };
        (connector, PeerListener { rx })
    }

    /// Refuse the next unscripted attempt.
    pub fn refuse_next(&self, cause: impl Into<String>) {
        self.push(Plan::Refuse(cause.into()));
    }

    /// Make the next unscripted attempt hang until its timeout.
    pub fn hang_next(&self) {
        self.push(Plan::Hang);
    }

    /// Number of connect attempts made so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn push(&self, plan: Plan) {
        self.plan
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(plan);
    }

    fn next_plan(&self) -> Plan {
        self.plan
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(Plan::Accept)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Connection, ConnectError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let plan = self.next_plan();

        within(timeout, async {
            match plan {
                Plan::Refuse(cause) => Err(ConnectError::Unreachable { cause }),
                Plan::Hang => futures::future::pending().await,
                Plan::Accept => {
                    let (client_tx, peer_rx) = unbounded();
                    let (peer_tx, client_rx) = unbounded();

                    let peer = MemoryPeer {
                        tx: peer_tx,
                        rx: peer_rx,
                        auto_pong: true,
                    };
                    self.accepted
                        .send(peer)
                        .map_err(|_| ConnectError::unreachable("listener dropped"))?;

                    let sink = client_tx.sink_map_err(|_| TransportError::Closed);
                    let stream = client_rx.map(Ok);
                    Ok(Connection::new(
                        endpoint.url.clone(),
                        Box::pin(sink),
                        Box::pin(stream),
                    ))
                }
            }
        })
        .await
    }
}

/// The remote end of an in-memory connection.
pub struct MemoryPeer {
    tx: UnboundedSender<Frame>,
    rx: UnboundedReceiver<Frame>,
    auto_pong: bool,
}

impl MemoryPeer {
    /// Stop answering pings, to simulate a half-dead remote.
    pub fn set_auto_pong(&mut self, enabled: bool) {
        self.auto_pong = enabled;
    }

    /// Send an envelope to the client.
    ///
    /// Returns `false` if the client side is gone.
    pub fn send(&self, envelope: &Envelope) -> bool {
        protocol::encode(envelope)
            .is_ok_and(|text| self.tx.unbounded_send(Frame::Text(text)).is_ok())
    }

    /// Send a raw frame to the client.
    pub fn send_frame(&self, frame: Frame) -> bool {
        self.tx.unbounded_send(frame).is_ok()
    }

    /// Next raw frame from the client, or `None` once it hung up.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        self.rx.next().await
    }

    /// Next envelope from the client, answering pings along the way.
    ///
    /// Returns `None` once the client closed the connection.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.next().await? {
                Frame::Text(text) => match protocol::decode(text.as_bytes()) {
                    Ok(envelope) => return Some(envelope),
                    Err(e) => tracing::warn!("Peer received undecodable frame: {e}"),
                },
                Frame::Binary(bytes) => match protocol::decode(&bytes) {
                    Ok(envelope) => return Some(envelope),
                    Err(e) => tracing::warn!("Peer received undecodable frame: {e}"),
                },
                Frame::Ping(payload) => {
                    if self.auto_pong {
                        let _ = self.tx.unbounded_send(Frame::Pong(payload));
                    }
                }
                Frame::Pong(_) => {}
                Frame::Close => return None,
            }
        }
    }

    /// Close the connection from the remote side.
    pub fn close(self) {
        let _ = self.tx.unbounded_send(Frame::Close);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn accepted_connection_reaches_peer() {
        let (connector, mut listener) = MemoryConnector::new();
        let conn = connector
            .connect(&Endpoint::new("mem://a"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(conn.address(), "mem://a");

        let mut peer = listener.accept().await.unwrap();
        let (mut sink, _stream) = conn.into_parts();
        sink.send(Frame::Text(r#"{"command":"hello"}"#.into()))
            .await
            .unwrap();
        assert_eq!(peer.recv().await.unwrap().command, "hello");
    }

    #[tokio::test]
    async fn refused_attempt_is_unreachable() {
        let (connector, _listener) = MemoryConnector::new();
        connector.refuse_next("connection refused");
        let err = connector
            .connect(&Endpoint::new("mem://a"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ConnectError::Unreachable {
                cause: "connection refused".into()
            }
        );
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_attempt_times_out() {
        let (connector, _listener) = MemoryConnector::new();
        connector.hang_next();
        let err = connector
            .connect(&Endpoint::new("mem://a"), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err, ConnectError::Timeout(Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn peer_send_reaches_client_stream() {
        let (connector, mut listener) = MemoryConnector::new();
        let conn = connector
            .connect(&Endpoint::new("mem://a"), Duration::from_secs(1))
            .await
            .unwrap();
        let peer = listener.accept().await.unwrap();
        assert!(peer.send(&Envelope::new("RUN", json!({}))));

        let (_sink, mut stream) = conn.into_parts();
        let frame = stream.next().await.unwrap().unwrap();
        assert!(matches!(frame, Frame::Text(text) if text.contains("RUN")));
    }
}
