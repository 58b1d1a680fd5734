//! WebSocket connector.
//!
//! Implements [`Connector`] over tokio-tungstenite. Each connection is
//! authenticated with a [`Frame::Auth`] handshake and then carries JSON text
//! frames in both directions. Two background tasks per connection do the
//! I/O; both stop when the connection's shutdown token is cancelled.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use url::Url;

use chatlink_proto::frame::{self, AuthPayload, Frame};

use super::{Connection, Connector, TransportError};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default timeout for establishing the WebSocket connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for the server's answer to the auth frame.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-direction frame buffer.
pub const DEFAULT_FRAME_BUFFER: usize = 256;

/// WebSocket implementation of [`Connector`].
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
    auth_timeout: Duration,
    frame_buffer: usize,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            frame_buffer: DEFAULT_FRAME_BUFFER,
        }
    }
}

impl WsConnector {
    /// Create a connector with default timeouts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the TCP/WebSocket connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the handshake answer timeout.
    #[must_use]
    pub const fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    /// Override the per-direction frame buffer.
    #[must_use]
    pub const fn with_frame_buffer(mut self, frames: usize) -> Self {
        self.frame_buffer = frames;
        self
    }
}

impl Connector for WsConnector {
    /// Connect and authenticate.
    ///
    /// Performs the following steps:
    /// 1. Establishes a WebSocket connection to `url` (connect timeout)
    /// 2. Sends a [`Frame::Auth`] with `auth`
    /// 3. Waits for [`Frame::Accepted`] (auth timeout)
    /// 4. Spawns the reader and writer tasks
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if connecting or authenticating times out.
    /// - [`TransportError::Unreachable`] if the host refuses the connection.
    /// - [`TransportError::Rejected`] if the server refuses the credentials.
    /// - [`TransportError::Protocol`] for unexpected handshake replies.
    async fn connect(
        &self,
        url: &Url,
        auth: &AuthPayload,
        shutdown: CancellationToken,
    ) -> Result<Connection, TransportError> {
        let (ws_stream, _response) =
            tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
                .await
                .map_err(|_| {
                    tracing::warn!(url = %url, "channel WebSocket connect timed out");
                    TransportError::Timeout
                })?
                .map_err(|e| {
                    tracing::warn!(url = %url, err = %e, "channel WebSocket connect failed");
                    map_ws_connect_error(url, e)
                })?;

        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        let auth_text = frame::encode(&Frame::Auth(auth.clone()))
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        ws_sender
            .send(Message::Text(auth_text.into()))
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "failed to send auth frame");
                TransportError::Io(std::io::Error::other(format!("failed to send auth: {e}")))
            })?;

        let reply = tokio::time::timeout(self.auth_timeout, ws_reader.next())
            .await
            .map_err(|_| {
                tracing::warn!(url = %url, "channel auth answer timed out");
                TransportError::Timeout
            })?;

        match reply {
            Some(Ok(Message::Text(text))) => match frame::decode(text.as_str()) {
                Ok(Frame::Accepted) => {
                    tracing::info!(url = %url, identity = %auth.identity, "channel authenticated");
                }
                Ok(Frame::Rejected { reason }) => {
                    tracing::warn!(reason = %reason, "channel auth rejected");
                    return Err(TransportError::Rejected(reason));
                }
                Ok(other) => {
                    tracing::warn!(?other, "unexpected frame during auth");
                    return Err(TransportError::Protocol(
                        "unexpected frame during auth".to_string(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed auth answer");
                    return Err(TransportError::Protocol(format!(
                        "malformed auth answer: {e}"
                    )));
                }
            },
            Some(Ok(Message::Close(_))) | None => {
                tracing::warn!("server closed connection during auth");
                return Err(TransportError::ConnectionClosed);
            }
            Some(Ok(_)) => {
                return Err(TransportError::Protocol(
                    "non-text frame during auth".to_string(),
                ));
            }
            Some(Err(e)) => {
                tracing::warn!(err = %e, "WebSocket error during auth");
                return Err(TransportError::Io(std::io::Error::other(format!(
                    "WebSocket error during auth: {e}"
                ))));
            }
        }

        let buffer = self.frame_buffer.max(1);
        let (in_tx, in_rx) = mpsc::channel(buffer);
        let (out_tx, out_rx) = mpsc::channel(buffer);

        tokio::spawn(reader_loop(ws_reader, in_tx, shutdown.clone()));
        tokio::spawn(writer_loop(ws_sender, out_rx, shutdown.clone()));

        Ok(Connection::new(out_tx, in_rx, shutdown))
    }
}

/// Background task: decode incoming text frames and forward them.
///
/// Malformed frames are logged and skipped; the connection stays up.
/// Exits on close, read error, or shutdown, and cancels `shutdown` so the
/// writer stops too.
async fn reader_loop(mut ws_reader: WsReader, tx: mpsc::Sender<Frame>, shutdown: CancellationToken) {
    loop {
        let msg = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            msg = ws_reader.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => match frame::decode(text.as_str()) {
                Ok(frame) => {
                    if tx.send(frame).await.is_err() {
                        // Connection dropped.
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed channel frame, skipping");
                }
            },
            Some(Ok(Message::Close(_))) => {
                tracing::info!("channel WebSocket closed by server");
                break;
            }
            Some(Ok(_)) => {
                // Ping/pong/binary are not part of the protocol.
            }
            Some(Err(e)) => {
                tracing::warn!(err = %e, "channel WebSocket read error");
                break;
            }
            None => break,
        }
    }
    shutdown.cancel();
    tracing::debug!("channel reader task exiting");
}

/// Background task: encode outgoing frames onto the socket.
async fn writer_loop(
    mut ws_sender: WsSender,
    mut rx: mpsc::Receiver<Frame>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            frame = rx.recv() => frame,
        };
        let Some(frame) = frame else { break };

        let text = match frame::encode(&frame) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(err = %e, "dropping unencodable frame");
                continue;
            }
        };
        if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
            tracing::warn!(err = %e, "channel send failed");
            break;
        }
    }
    let _ = ws_sender.send(Message::Close(None)).await;
    let _ = ws_sender.close().await;
    shutdown.cancel();
    tracing::debug!("channel writer task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(url: &Url, err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(url.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Tls(_) => TransportError::Io(std::io::Error::other(format!("TLS error: {err}"))),
        WsError::Http(response) => TransportError::Protocol(format!(
            "channel HTTP error: status {}",
            response.status()
        )),
        other => TransportError::Io(std::io::Error::other(format!(
            "channel connection error: {other}"
        ))),
    }
}
