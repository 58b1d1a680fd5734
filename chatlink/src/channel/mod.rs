//! Channel lifecycle.
//!
//! A channel is one logical connection bound to a [`ChannelKey`]
//! (namespace, identity, credential). [`ChannelManager`] owns the single
//! live [`ChannelHandle`] for the current key and replaces it whenever the
//! key changes. Consumers get clones of the handle that can observe status,
//! emit events and ask for a reconnect, but never close it.

pub mod manager;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use url::Url;

use chatlink_proto::frame::{AuthPayload, FrameError};

use crate::auth::{Credential, Identity};
use crate::transport::socket::Socket;

pub use manager::ChannelManager;

/// Errors surfaced by channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// There is no live connection to send on.
    #[error("channel is not connected")]
    NotConnected,

    /// The event body could not be encoded.
    #[error(transparent)]
    Encode(#[from] FrameError),

    /// The base address cannot have a namespace appended.
    #[error("base address {0} cannot carry a namespace path")]
    InvalidBaseUrl(Url),
}

/// Connection status of a channel.
///
/// `ready` implies `connected`. `active` is true while the socket is either
/// connected or working through its reconnection loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStatus {
    /// A transport connection is open and authenticated.
    pub connected: bool,
    /// The consumer finished its per-connection setup.
    pub ready: bool,
    /// Connected, connecting, or waiting to retry.
    pub active: bool,
}

/// Why a live connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client closed the channel.
    Client,
    /// The server closed the channel deliberately.
    Server(String),
    /// The transport dropped underneath the channel.
    Transport,
}

/// Events published by a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A connection was established and authenticated.
    Connected,
    /// The live connection ended.
    Disconnected {
        /// What ended it.
        reason: DisconnectReason,
    },
    /// A reconnection attempt is scheduled.
    ReconnectAttempt {
        /// 1-based attempt number since the last live connection.
        attempt: u32,
        /// Wait before the attempt.
        delay: Duration,
    },
    /// Connected again after `attempts` retries.
    Reconnected {
        /// Retries it took.
        attempts: u32,
    },
    /// A bounded policy ran out of attempts; the channel is parked.
    ReconnectFailed,
    /// An application event from the server.
    Message {
        /// Event name.
        event: String,
        /// Event body.
        data: serde_json::Value,
    },
}

/// The inputs a channel is bound to.
///
/// Only constructible when all three parts are present and non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelKey {
    namespace: String,
    identity: Identity,
    credential: Credential,
}

impl ChannelKey {
    /// Build a key, or `None` if any part is missing or empty.
    #[must_use]
    pub fn from_parts(
        namespace: &str,
        identity: Option<&Identity>,
        credential: Option<&Credential>,
    ) -> Option<Self> {
        let identity = identity.filter(|i| !i.is_empty())?;
        let credential = credential.filter(|c| !c.is_empty())?;
        if namespace.is_empty() {
            return None;
        }
        Some(Self {
            namespace: namespace.to_string(),
            identity: identity.clone(),
            credential: credential.clone(),
        })
    }

    /// Namespace path segment.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Bound identity.
    #[must_use]
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Bound credential.
    #[must_use]
    pub const fn credential(&self) -> &Credential {
        &self.credential
    }

    /// The handshake payload for this key.
    #[must_use]
    pub fn auth_payload(&self) -> AuthPayload {
        AuthPayload::new(self.identity.as_str(), self.credential.as_str())
    }
}

/// One logical connection, bound to a [`ChannelKey`].
///
/// Clones share the connection. Only the owning [`ChannelManager`] can
/// close it.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    key: Arc<ChannelKey>,
    socket: Socket,
}

impl ChannelHandle {
    pub(crate) fn new(key: ChannelKey, socket: Socket) -> Self {
        Self {
            key: Arc::new(key),
            socket,
        }
    }

    /// Key this channel is bound to.
    #[must_use]
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// Endpoint of this channel.
    #[must_use]
    pub fn url(&self) -> &Url {
        self.socket.url()
    }

    /// Current status snapshot.
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        self.socket.status()
    }

    /// Observe status transitions.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.socket.watch_status()
    }

    /// Subscribe to channel events from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.socket.subscribe()
    }

    /// Lossless, ordered event stream from now on.
    #[must_use]
    pub fn tap(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        self.socket.tap()
    }

    /// Request an explicit reconnect. No-op while connected or reconnecting.
    pub fn reconnect(&self) -> bool {
        self.socket.reconnect()
    }

    /// Mark the channel ready for application traffic. Ignored unless connected.
    pub fn mark_ready(&self) -> bool {
        self.socket.mark_ready()
    }

    /// Withdraw readiness, e.g. before re-joining a room.
    pub fn clear_ready(&self) -> bool {
        self.socket.clear_ready()
    }

    /// Send a named event.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotConnected`] when there is no live
    /// connection, or [`ChannelError::Encode`] for unserializable bodies.
    pub async fn emit<T: Serialize + Sync>(&self, event: &str, data: &T) -> Result<(), ChannelError> {
        self.socket.emit(event, data).await
    }

    /// Whether both handles refer to the same connection.
    #[must_use]
    pub fn same_channel(&self, other: &Self) -> bool {
        self.socket.same_socket(&other.socket)
    }

    pub(crate) fn close(&self) {
        self.socket.close();
    }
}
