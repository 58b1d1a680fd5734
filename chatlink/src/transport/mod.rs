//! Transport layer for the chat channel.
//!
//! Defines the [`Connector`] trait that opens one authenticated,
//! message-framed connection. Reconnection is layered on top by
//! [`socket::Socket`], which follows an injected [`ReconnectPolicy`].
//! Concrete connectors:
//! - [`ws::WsConnector`]: WebSocket client (tokio-tungstenite)
//! - [`loopback::LoopbackConnector`]: in-process scripted connector for testing

pub mod loopback;
pub mod policy;
pub mod socket;
pub mod ws;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use chatlink_proto::frame::{AuthPayload, Frame};

pub use policy::ReconnectPolicy;

/// Errors that can occur while opening or using a connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection was closed before the operation completed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The endpoint could not be reached.
    #[error("endpoint {0} is unreachable")]
    Unreachable(String),

    /// The server refused the handshake.
    #[error("handshake rejected: {0}")]
    Rejected(String),

    /// The peer spoke something other than the channel protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One authenticated connection.
///
/// Outgoing frames are queued on an mpsc sender; incoming frames are read
/// with [`Connection::recv`], which returns `None` once the transport has
/// gone away. Dropping the connection (or calling [`Connection::close`])
/// cancels its shutdown token, which the connector's I/O tasks honor.
#[derive(Debug)]
pub struct Connection {
    outgoing: mpsc::Sender<Frame>,
    incoming: mpsc::Receiver<Frame>,
    shutdown: CancellationToken,
}

impl Connection {
    /// Assemble a connection from its parts.
    #[must_use]
    pub const fn new(
        outgoing: mpsc::Sender<Frame>,
        incoming: mpsc::Receiver<Frame>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            outgoing,
            incoming,
            shutdown,
        }
    }

    /// A sender for outgoing frames.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<Frame> {
        self.outgoing.clone()
    }

    /// Receive the next incoming frame, or `None` once the transport closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.incoming.recv().await
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Whether [`close`](Self::close) was called or the shutdown token fired.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Opens authenticated connections to a channel endpoint.
///
/// A connector performs exactly one attempt per call; retry timing is the
/// caller's business. Implementations must stop all I/O for the returned
/// [`Connection`] once `shutdown` is cancelled.
pub trait Connector: Send + Sync + 'static {
    /// Connect to `url` and authenticate with `auth`.
    fn connect(
        &self,
        url: &Url,
        auth: &AuthPayload,
        shutdown: CancellationToken,
    ) -> impl std::future::Future<Output = Result<Connection, TransportError>> + Send;
}
