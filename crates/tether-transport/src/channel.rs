//! Framed duplex channel over one live connection.
//!
//! A reader task owns the inbound half: it decodes frames into envelopes,
//! runs the keep-alive timer and tears the connection down when anything
//! goes wrong. Writers share the outbound half behind an async mutex so
//! every envelope is written as exactly one frame. Pings and pongs go
//! through a separate control task, so the reader never waits on the sink.

use std::{
    fmt,
    sync::Arc,
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use tether_core::{Envelope, KeepAlive, SendError};
use tokio::{
    sync::{Mutex, mpsc, watch},
    time::{self, Instant, MissedTickBehavior},
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    endpoint::{Connection, ConnectionState, Frame, FrameSink, FrameStream},
    protocol,
};

/// Upper bound on flushing the close frame during teardown.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Why a channel closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The remote end closed the connection.
    Remote,
    /// Closed locally via `close()` or drop.
    Local,
    /// No pong arrived within the keep-alive timeout.
    KeepAliveTimeout,
    /// The transport failed.
    Transport(String),
}

impl CloseReason {
    /// Whether the close was not requested by this side.
    #[must_use]
    pub const fn is_abnormal(&self) -> bool {
        !matches!(self, Self::Local)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote => f.write_str("closed by remote"),
            Self::Local => f.write_str("closed locally"),
            Self::KeepAliveTimeout => f.write_str("keep-alive timeout"),
            Self::Transport(cause) => write!(f, "transport error: {cause}"),
        }
    }
}

#[derive(Debug, Clone)]
enum Status {
    Open,
    Closing(CloseReason),
    Closed(CloseReason),
}

struct Shared {
    epoch: u64,
    address: String,
    sink: Mutex<FrameSink>,
    status: watch::Sender<Status>,
    cancel: CancellationToken,
}

impl Shared {
    fn is_open(&self) -> bool {
        matches!(*self.status.borrow(), Status::Open)
    }

    /// Record the first close reason and stop the reader.
    fn begin_close(&self, reason: CloseReason) {
        self.status.send_if_modified(|status| {
            if matches!(status, Status::Open) {
                *status = Status::Closing(reason);
                true
            } else {
                false
            }
        });
        self.cancel.cancel();
    }

    fn pending_reason(&self) -> CloseReason {
        match &*self.status.borrow() {
            Status::Closing(reason) | Status::Closed(reason) => reason.clone(),
            Status::Open => CloseReason::Local,
        }
    }

    /// Write one frame. Gives up, releasing the sink, once closing begins.
    async fn write(&self, frame: Frame) -> Result<(), SendError> {
        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(SendError::ConnectionClosed),
            result = async move {
                let mut sink = self.sink.lock().await;
                // Checked under the lock so no frame follows teardown.
                if !self.is_open() {
                    return Ok(false);
                }
                sink.send(frame).await.map(|()| true)
            } => result,
        };

        match result {
            Ok(true) => Ok(()),
            Ok(false) => Err(SendError::ConnectionClosed),
            Err(e) => {
                warn!(epoch = self.epoch, "Write failed: {e}");
                self.begin_close(CloseReason::Transport(e.to_string()));
                Err(SendError::ConnectionClosed)
            }
        }
    }
}

/// Cloneable write handle for a channel.
#[derive(Clone)]
pub struct ChannelSender {
    shared: Arc<Shared>,
}

impl ChannelSender {
    /// Write one envelope as one frame.
    ///
    /// # Errors
    /// Returns `ConnectionClosed` once the channel is no longer open, and
    /// `Encode` if the envelope cannot be serialized.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), SendError> {
        let text = protocol::encode(envelope).map_err(|e| SendError::Encode(e.to_string()))?;
        self.shared.write(Frame::Text(text)).await
    }

    /// Connection epoch this sender writes to.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.shared.epoch
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Close the channel. Idempotent.
    pub fn close(&self) {
        self.shared.begin_close(CloseReason::Local);
    }
}

impl fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSender")
            .field("epoch", &self.shared.epoch)
            .field("address", &self.shared.address)
            .finish_non_exhaustive()
    }
}

/// A live, framed connection.
///
/// Dropping the channel closes it.
pub struct DuplexChannel {
    shared: Arc<Shared>,
    inbound: Option<mpsc::UnboundedReceiver<Envelope>>,
}

impl DuplexChannel {
    /// Take ownership of `connection` and start the reader task.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn open(connection: Connection, epoch: u64, keep_alive: &KeepAlive) -> Self {
        let address = connection.address().to_owned();
        let (sink, stream) = connection.into_parts();
        let (status, _) = watch::channel(Status::Open);
        let shared = Arc::new(Shared {
            epoch,
            address,
            sink: Mutex::new(sink),
            status,
            cancel: CancellationToken::new(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let (control, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_control(Arc::clone(&shared), control_rx));
        tokio::spawn(read_loop(
            Arc::clone(&shared),
            stream,
            tx,
            control,
            *keep_alive,
        ));
        debug!(epoch, address = %shared.address, "Channel open");

        Self {
            shared,
            inbound: Some(rx),
        }
    }

    /// Inbound envelopes for this connection.
    ///
    /// The stream ends when the connection closes. Only the first call
    /// yields envelopes; later calls get an empty stream.
    pub fn receive(&mut self) -> UnboundedReceiverStream<Envelope> {
        let rx = self.inbound.take().unwrap_or_else(|| {
            let (_, rx) = mpsc::unbounded_channel();
            rx
        });
        UnboundedReceiverStream::new(rx)
    }

    /// Write one envelope as one frame.
    ///
    /// # Errors
    /// See [`ChannelSender::send`].
    pub async fn send(&self, envelope: &Envelope) -> Result<(), SendError> {
        self.sender().send(envelope).await
    }

    #[must_use]
    pub fn sender(&self) -> ChannelSender {
        ChannelSender {
            shared: Arc::clone(&self.shared),
        }
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.shared.epoch
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        match &*self.shared.status.borrow() {
            Status::Open => ConnectionState::Open,
            Status::Closing(_) => ConnectionState::Closing,
            Status::Closed(_) => ConnectionState::Closed,
        }
    }

    /// Reason the channel closed, once it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        match &*self.shared.status.borrow() {
            Status::Closed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Wait until the channel has fully closed.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.shared.status.subscribe();
        match rx.wait_for(|status| matches!(status, Status::Closed(_))).await {
            Ok(status) => match &*status {
                Status::Closed(reason) => reason.clone(),
                _ => CloseReason::Local,
            },
            Err(_) => CloseReason::Local,
        }
    }

    /// Close the channel. Idempotent.
    pub fn close(&self) {
        self.shared.begin_close(CloseReason::Local);
    }
}

impl Drop for DuplexChannel {
    fn drop(&mut self) {
        self.shared.begin_close(CloseReason::Local);
    }
}

impl fmt::Debug for DuplexChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexChannel")
            .field("epoch", &self.shared.epoch)
            .field("address", &self.shared.address)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn deliver(inbound: &mpsc::UnboundedSender<Envelope>, bytes: &[u8], epoch: u64) {
    match protocol::decode(bytes) {
        Ok(envelope) => {
            let _ = inbound.send(envelope);
        }
        Err(e) => warn!(epoch, "Skipping undecodable frame: {e}"),
    }
}

/// Writes pings and pongs queued by the reader.
async fn write_control(shared: Arc<Shared>, mut frames: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = frames.recv().await {
        if shared.write(frame).await.is_err() {
            break;
        }
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut stream: FrameStream,
    inbound: mpsc::UnboundedSender<Envelope>,
    control: mpsc::UnboundedSender<Frame>,
    keep_alive: KeepAlive,
) {
    let epoch = shared.epoch;
    let pings = keep_alive.interval_ms > 0;
    let period = if pings {
        keep_alive.interval()
    } else {
        Duration::from_secs(3600)
    };
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pong_deadline: Option<Instant> = None;

    let reason = loop {
        let deadline = pong_deadline;
        tokio::select! {
            biased;

            () = shared.cancel.cancelled() => break shared.pending_reason(),

            frame = stream.next() => match frame {
                Some(Ok(Frame::Text(text))) => deliver(&inbound, text.as_bytes(), epoch),
                Some(Ok(Frame::Binary(bytes))) => deliver(&inbound, &bytes, epoch),
                Some(Ok(Frame::Ping(payload))) => {
                    let _ = control.send(Frame::Pong(payload));
                }
                Some(Ok(Frame::Pong(_))) => {
                    pong_deadline = None;
                    ticker.reset();
                }
                Some(Ok(Frame::Close)) | None => break CloseReason::Remote,
                Some(Err(e)) => break CloseReason::Transport(e.to_string()),
            },

            _ = ticker.tick(), if pings && deadline.is_none() => {
                // The deadline runs even if the ping is stuck behind the sink.
                pong_deadline = Some(Instant::now() + keep_alive.timeout());
                let _ = control.send(Frame::Ping(Vec::new()));
            }

            () = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                warn!(epoch, "No pong within {:?}", keep_alive.timeout());
                break CloseReason::KeepAliveTimeout;
            }
        }
    };

    shared.begin_close(reason);
    let reason = shared.pending_reason();
    drop(control);

    let flush = async {
        let mut sink = shared.sink.lock().await;
        let _ = sink.send(Frame::Close).await;
        let _ = sink.close().await;
    };
    if time::timeout(CLOSE_GRACE, flush).await.is_err() {
        debug!(epoch, "Close frame not flushed in time");
    }

    debug!(epoch, %reason, "Channel closed");
    shared.status.send_replace(Status::Closed(reason));
    drop(inbound);
}
