//! WebSocket connector.
//!
//! Connects with tokio-tungstenite and adapts the socket into a frame
//! sink/stream pair. Ping frames are answered by tungstenite itself and are
//! not surfaced.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt, future};
use tether_core::{ConnectError, Endpoint, TransportError};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        Error as WsError,
        client::IntoClientRequest,
        handshake::client::Request,
        http::{HeaderName, HeaderValue, header::AUTHORIZATION},
        protocol::Message,
    },
};
use tracing::debug;

use crate::endpoint::{Connection, Connector, Frame, within};

/// Connector for `ws://` and `wss://` endpoints.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl WsConnector {
    /// Create a new websocket connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Connection, ConnectError> {
        let request = build_request(endpoint)?;
        debug!(url = %endpoint.url, "Connecting to WebSocket");

        within(timeout, async {
            let (ws, _response) = connect_async(request)
                .await
                .map_err(ConnectError::unreachable)?;

            let (sink, stream) = ws.split();
            let sink = sink
                .with(|frame: Frame| future::ready(Ok::<_, WsError>(into_message(frame))))
                .sink_map_err(|e| TransportError::Io(e.to_string()));
            let stream = stream.filter_map(|item| {
                future::ready(match item {
                    Ok(message) => from_message(message).map(Ok),
                    Err(e) => Some(Err(TransportError::Io(e.to_string()))),
                })
            });

            debug!(url = %endpoint.url, "WebSocket connected");
            Ok(Connection::new(
                endpoint.url.clone(),
                Box::pin(sink),
                Box::pin(stream),
            ))
        })
        .await
    }
}

/// Build the upgrade request, attaching the credential and allow header.
fn build_request(endpoint: &Endpoint) -> Result<Request, ConnectError> {
    let mut request = endpoint
        .url
        .as_str()
        .into_client_request()
        .map_err(ConnectError::unreachable)?;

    if let Some(token) = &endpoint.token {
        let value =
            HeaderValue::from_str(&format!("Bearer {token}")).map_err(ConnectError::unreachable)?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    if let Some(header) = &endpoint.allow_header {
        let name =
            HeaderName::from_bytes(header.name.as_bytes()).map_err(ConnectError::unreachable)?;
        let value = HeaderValue::from_str(&header.value).map_err(ConnectError::unreachable)?;
        request.headers_mut().insert(name, value);
    }

    Ok(request)
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data.into()),
        Frame::Ping(data) => Message::Ping(data.into()),
        Frame::Pong(data) => Message::Pong(data.into()),
        Frame::Close => Message::Close(None),
    }
}

fn from_message(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        Message::Binary(data) => Some(Frame::Binary(data.to_vec())),
        Message::Pong(data) => Some(Frame::Pong(data.to_vec())),
        Message::Close(_) => Some(Frame::Close),
        // Pong is queued by tungstenite; raw frames never reach us on read.
        Message::Ping(_) | Message::Frame(_) => None,
    }
}
