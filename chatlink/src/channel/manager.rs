//! [`ChannelManager`]: one live channel per key.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{ChannelError, ChannelHandle, ChannelKey};
use crate::auth::{Credential, Identity};
use crate::transport::socket::{DEFAULT_EVENT_CAPACITY, Socket};
use crate::transport::{Connector, ReconnectPolicy};

/// Owns the channel for the current [`ChannelKey`].
///
/// [`apply`](Self::apply) tears the old channel down before deciding
/// whether a new one is warranted, so two keys never have live channels at
/// the same time. The transport's own close is not awaited.
pub struct ChannelManager<C> {
    connector: Arc<C>,
    base_url: Url,
    policy: ReconnectPolicy,
    event_capacity: usize,
    current: watch::Sender<Option<ChannelHandle>>,
}

impl<C: Connector> ChannelManager<C> {
    /// Create an idle manager.
    #[must_use]
    pub fn new(connector: Arc<C>, base_url: Url, policy: ReconnectPolicy) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            connector,
            base_url,
            policy,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            current,
        }
    }

    /// Capacity of each channel's event broadcast.
    #[must_use]
    pub const fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Reconnection policy injected into every channel.
    #[must_use]
    pub const fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Endpoint for a namespace: `<base_url>/<namespace>`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidBaseUrl`] if the base cannot take a path.
    pub fn channel_url(&self, namespace: &str) -> Result<Url, ChannelError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ChannelError::InvalidBaseUrl(self.base_url.clone()))?
            .pop_if_empty()
            .push(namespace);
        Ok(url)
    }

    /// Bind the manager to `key`.
    ///
    /// Same key as now: nothing happens. Otherwise the current channel is
    /// torn down, and a new one is opened if `key` is complete. Returns
    /// whether the exposed handle changed.
    pub fn apply(&self, key: Option<ChannelKey>) -> bool {
        let unchanged = self.current.borrow().as_ref().map(ChannelHandle::key) == key.as_ref();
        if unchanged {
            return false;
        }

        if let Some(old) = self.current.send_replace(None) {
            teardown(&old);
        }

        let Some(key) = key else {
            tracing::debug!("channel key incomplete, idle");
            return true;
        };

        let url = match self.channel_url(key.namespace()) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(err = %e, "cannot build channel address");
                return true;
            }
        };

        tracing::info!(
            url = %url,
            identity = %key.identity(),
            "opening channel"
        );
        let socket = Socket::open(
            Arc::clone(&self.connector),
            url,
            key.auth_payload(),
            self.policy,
            self.event_capacity,
        );
        self.current
            .send_replace(Some(ChannelHandle::new(key, socket)));
        true
    }

    /// The live channel, if the key is complete.
    #[must_use]
    pub fn handle(&self) -> Option<ChannelHandle> {
        self.current.borrow().clone()
    }

    /// Observe handle replacements. This is the read-only accessor handed to
    /// consumers.
    #[must_use]
    pub fn watch_handle(&self) -> watch::Receiver<Option<ChannelHandle>> {
        self.current.subscribe()
    }

    /// Tear down the current channel and go idle.
    pub fn release(&self) {
        if let Some(old) = self.current.send_replace(None) {
            teardown(&old);
        }
    }

    /// Drive [`apply`](Self::apply) from a credential stream until `cancel`
    /// fires or the stream ends.
    pub fn follow(
        self: &Arc<Self>,
        namespace: String,
        identity: Option<Identity>,
        mut credentials: watch::Receiver<Option<Credential>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let credential = credentials.borrow_and_update().clone();
                let key =
                    ChannelKey::from_parts(&namespace, identity.as_ref(), credential.as_ref());
                if cancel.is_cancelled() {
                    break;
                }
                manager.apply(key);

                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    changed = credentials.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("channel key follower exiting");
        })
    }
}

impl<C> Drop for ChannelManager<C> {
    fn drop(&mut self) {
        if let Some(old) = self.current.send_replace(None) {
            teardown(&old);
        }
    }
}

/// Disconnect only a connected channel; always stop its reconnect loop.
fn teardown(handle: &ChannelHandle) {
    let status = handle.status();
    if status.connected {
        tracing::info!(url = %handle.url(), "disconnecting channel");
    } else {
        tracing::debug!(url = %handle.url(), active = status.active, "discarding unconnected channel");
    }
    handle.close();
}
