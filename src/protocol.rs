use crate::{error::DataError, exchange::ConnectionParams};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Bytes, Error as WsError, Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

/// Convenient type alias for a tungstenite `WebSocketStream`.
pub type WebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport-agnostic frame consumed from a streaming connection.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// Textual payload, handed verbatim to the exchange adapter.
    Text(String),
    /// Transport-level heartbeat response.
    Pong,
    /// Peer closed the connection, with an optional close reason.
    Closed(Option<String>),
}

/// One established streaming connection. The collector owns exactly one at a time.
#[async_trait]
pub trait Connection: Send {
    /// Deliver a frame to the exchange verbatim.
    async fn send_text(&mut self, frame: String) -> Result<(), DataError>;

    /// Transport-level heartbeat ping.
    async fn ping(&mut self) -> Result<(), DataError>;

    /// Next inbound frame. `None` means the stream ended without a close frame.
    async fn next_frame(&mut self) -> Option<Result<Frame, DataError>>;

    /// Best-effort close handshake.
    async fn close(&mut self);
}

/// Opens [`Connection`]s. The production implementation dials WebSockets; tests swap in
/// channel-backed fakes.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn Connection>, DataError>;
}

/// Issues the REST requests backing fallback polling.
#[async_trait]
pub trait RestClient: Send + Sync {
    async fn get_text(&self, url: &str) -> Result<String, DataError>;
}

/// Determine whether a [`WsError`] indicates the peer is gone rather than a frame-level
/// problem on a live connection.
pub fn is_disconnect(error: &WsError) -> bool {
    matches!(
        error,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Io(_)
            | WsError::Protocol(ProtocolError::SendAfterClosing)
    )
}

/// [`Connector`] implementation dialling `wss://` endpoints via tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn Connection>, DataError> {
        debug!(url = %params.ws_url, "attempting to establish WebSocket connection");
        let (websocket, _) =
            connect_async(params.ws_url.as_str())
                .await
                .map_err(|error| DataError::Handshake {
                    url: params.ws_url.clone(),
                    reason: error.to_string(),
                })?;

        Ok(Box::new(WsConnection { inner: websocket }))
    }
}

/// [`Connection`] over an established tungstenite [`WebSocket`].
#[derive(Debug)]
pub struct WsConnection {
    inner: WebSocket,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send_text(&mut self, frame: String) -> Result<(), DataError> {
        self.inner
            .send(WsMessage::text(frame))
            .await
            .map_err(|error| DataError::Transport(error.to_string()))
    }

    async fn ping(&mut self) -> Result<(), DataError> {
        self.inner
            .send(WsMessage::Ping(Bytes::new()))
            .await
            .map_err(|error| DataError::Transport(error.to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, DataError>> {
        loop {
            let message = match self.inner.next().await? {
                Ok(message) => message,
                Err(error) if is_disconnect(&error) => {
                    return Some(Ok(Frame::Closed(Some(error.to_string()))));
                }
                Err(error) => return Some(Err(DataError::Transport(error.to_string()))),
            };

            match message {
                WsMessage::Text(text) => return Some(Ok(Frame::Text(text.to_string()))),
                WsMessage::Binary(binary) => match String::from_utf8(binary.to_vec()) {
                    Ok(text) => return Some(Ok(Frame::Text(text))),
                    Err(_) => {
                        debug!("skipping non-utf8 binary WebSocket message");
                        continue;
                    }
                },
                WsMessage::Ping(payload) => {
                    // Answer transport pings inline so the read loop never stalls them.
                    let _ = self.inner.send(WsMessage::Pong(payload)).await;
                    continue;
                }
                WsMessage::Pong(_) => return Some(Ok(Frame::Pong)),
                WsMessage::Close(close_frame) => {
                    return Some(Ok(Frame::Closed(
                        close_frame.map(|frame| frame.reason.to_string()),
                    )));
                }
                WsMessage::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}

/// [`RestClient`] implementation over a shared [`reqwest::Client`].
#[derive(Debug, Clone, Default)]
pub struct HttpRestClient {
    client: reqwest::Client,
}

impl HttpRestClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RestClient for HttpRestClient {
    async fn get_text(&self, url: &str) -> Result<String, DataError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|error| DataError::Transport(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DataError::Transport(format!(
                "GET {url} returned status {status}"
            )));
        }

        response
            .text()
            .await
            .map_err(|error| DataError::Transport(error.to_string()))
    }
}
