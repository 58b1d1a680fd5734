//! Reconnecting socket built on a [`Connector`].
//!
//! A [`Socket`] owns one background supervisor task that connects, pumps
//! inbound frames into a broadcast channel, and on transport loss retries
//! according to its [`ReconnectPolicy`]. Status is published through a
//! `watch` channel so observers never poll.
//!
//! # State machine
//!
//! ```text
//!            connect ok                 transport drop
//! Connecting ───────────► Connected ─────────────────► Backoff ──► Connecting
//!     ▲  │ connect err                  │ server close     │ attempts exhausted
//!     │  └──────────────► Backoff       ▼                  ▼
//!     └──────────────────────────── Parked ◄───────────────┘
//!                  reconnect()
//! ```
//!
//! `active` is true in every state except `Parked`. Cancelling the socket
//! (close or drop of the last clone) ends the supervisor from any state.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

use chatlink_proto::frame::{AuthPayload, Frame};

use super::{Connection, Connector, ReconnectPolicy};
use crate::channel::{ChannelError, ChannelEvent, ChannelStatus, DisconnectReason};

/// Default capacity of the per-socket event broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// State shared between [`Socket`] clones and the supervisor task.
struct Shared {
    status: watch::Sender<ChannelStatus>,
    events: broadcast::Sender<ChannelEvent>,
    taps: Mutex<Vec<mpsc::UnboundedSender<ChannelEvent>>>,
    outgoing: Mutex<Option<mpsc::Sender<Frame>>>,
    wake: Notify,
}

impl Shared {
    fn publish(&self, event: ChannelEvent) {
        self.taps.lock().retain(|tap| tap.send(event.clone()).is_ok());
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_connected(&self, sender: mpsc::Sender<Frame>) {
        *self.outgoing.lock() = Some(sender);
        self.status.send_modify(|s| {
            s.connected = true;
            s.active = true;
        });
    }

    fn set_disconnected(&self, still_active: bool) {
        *self.outgoing.lock() = None;
        self.status.send_modify(|s| {
            s.connected = false;
            s.ready = false;
            s.active = still_active;
        });
    }

    fn set_active(&self, active: bool) {
        self.status.send_if_modified(|s| {
            if s.active == active {
                false
            } else {
                s.active = active;
                true
            }
        });
    }
}

struct Inner {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    url: Url,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A reconnecting, message-framed channel to one endpoint.
///
/// Cheap to clone; all clones observe the same connection. The supervisor
/// stops when [`close`](Self::close) is called or the last clone is dropped.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("url", &self.inner.url.as_str())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Socket {
    /// Open a socket and start its supervisor on the current tokio runtime.
    ///
    /// The first connection attempt starts immediately; every later attempt
    /// is scheduled by the supervisor according to `policy`.
    pub fn open<C: Connector>(
        connector: Arc<C>,
        url: Url,
        auth: AuthPayload,
        policy: ReconnectPolicy,
        event_capacity: usize,
    ) -> Self {
        let (status, _) = watch::channel(ChannelStatus {
            connected: false,
            ready: false,
            active: true,
        });
        let (events, _) = broadcast::channel(event_capacity.max(1));
        let shared = Arc::new(Shared {
            status,
            events,
            taps: Mutex::new(Vec::new()),
            outgoing: Mutex::new(None),
            wake: Notify::new(),
        });
        let cancel = CancellationToken::new();

        let supervisor = Supervisor {
            connector,
            url: url.clone(),
            auth,
            policy,
            shared: Arc::clone(&shared),
            cancel: cancel.clone(),
        };
        tokio::spawn(supervisor.run());

        Self {
            inner: Arc::new(Inner {
                shared,
                cancel,
                url,
            }),
        }
    }

    /// Endpoint this socket connects to.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    /// Current status snapshot.
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        *self.inner.shared.status.borrow()
    }

    /// Observe status transitions.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.inner.shared.status.subscribe()
    }

    /// Subscribe to connection and message events from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.shared.events.subscribe()
    }

    /// Every event from now on, in order, without loss.
    ///
    /// Unlike [`subscribe`](Self::subscribe) this never lags; the tap is
    /// dropped once its receiver is.
    #[must_use]
    pub fn tap(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.shared.taps.lock().push(tx);
        rx
    }

    /// Ask a parked socket to connect again.
    ///
    /// Returns `false` without doing anything when the socket is connected,
    /// already trying to connect, or closed.
    ///
    /// The socket is marked active before the supervisor wakes, so a second
    /// request racing the first is a no-op.
    pub fn reconnect(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let claimed = self.inner.shared.status.send_if_modified(|s| {
            if s.connected || s.active {
                false
            } else {
                s.active = true;
                true
            }
        });
        if !claimed {
            return false;
        }
        tracing::info!(url = %self.inner.url, "manual reconnect requested");
        self.inner.shared.wake.notify_one();
        true
    }

    /// Mark the channel ready for application traffic.
    ///
    /// Ignored unless connected; readiness is cleared on every disconnect.
    pub fn mark_ready(&self) -> bool {
        self.inner.shared.status.send_if_modified(|s| {
            if s.connected && !s.ready {
                s.ready = true;
                true
            } else {
                false
            }
        })
    }

    /// Withdraw readiness while the consumer redoes its setup.
    ///
    /// Returns whether the status changed.
    pub fn clear_ready(&self) -> bool {
        self.inner.shared.status.send_if_modified(|s| {
            if s.ready {
                s.ready = false;
                true
            } else {
                false
            }
        })
    }

    /// Send a named event with a JSON body.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::NotConnected`] if there is no live connection.
    /// - [`ChannelError::Encode`] if `data` cannot be serialized.
    pub async fn emit<T: Serialize + Sync>(&self, event: &str, data: &T) -> Result<(), ChannelError> {
        let frame = Frame::event(event, data)?;
        let sender = self
            .inner
            .shared
            .outgoing
            .lock()
            .clone()
            .ok_or(ChannelError::NotConnected)?;
        sender
            .send(frame)
            .await
            .map_err(|_| ChannelError::NotConnected)?;
        tracing::trace!(event, "emitted channel event");
        Ok(())
    }

    /// Stop the supervisor and close any live connection. Idempotent.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Whether two handles refer to the same underlying socket.
    #[must_use]
    pub fn same_socket(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// How a live connection ended.
enum Ended {
    Cancelled,
    Server,
    Transport,
}

struct Supervisor<C> {
    connector: Arc<C>,
    url: Url,
    auth: AuthPayload,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl<C: Connector> Supervisor<C> {
    async fn run(self) {
        'connecting: loop {
            self.shared.set_active(true);
            // Failed attempts since the last live connection.
            let mut attempt: u32 = 0;

            loop {
                let result = tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => break 'connecting,
                    r = self.connector.connect(&self.url, &self.auth, self.cancel.child_token()) => r,
                };

                match result {
                    Ok(conn) => match self.run_connected(conn, attempt).await {
                        Ended::Cancelled => break 'connecting,
                        Ended::Server => {
                            if self.park().await {
                                continue 'connecting;
                            }
                            break 'connecting;
                        }
                        Ended::Transport => attempt = 0,
                    },
                    Err(e) => {
                        tracing::warn!(url = %self.url, attempt, err = %e, "channel connect failed");
                    }
                }

                attempt = attempt.saturating_add(1);
                if !self.policy.allows(attempt) {
                    tracing::warn!(url = %self.url, attempts = attempt - 1, "reconnection attempts exhausted");
                    self.shared.set_disconnected(false);
                    self.shared.publish(ChannelEvent::ReconnectFailed);
                    if self.park().await {
                        continue 'connecting;
                    }
                    break 'connecting;
                }

                let delay = self.policy.delay_for(attempt);
                tracing::warn!(url = %self.url, attempt, delay_ms = delay.as_millis(), "attempting to reconnect");
                self.shared
                    .publish(ChannelEvent::ReconnectAttempt { attempt, delay });
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => break 'connecting,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }

        self.shared.set_disconnected(false);
        tracing::debug!(url = %self.url, "socket supervisor exiting");
    }

    /// Drive one live connection until it ends.
    async fn run_connected(&self, mut conn: Connection, attempts: u32) -> Ended {
        self.shared.set_connected(conn.sender());
        tracing::info!(url = %self.url, "channel connected");
        self.shared.publish(ChannelEvent::Connected);
        if attempts > 0 {
            tracing::info!(attempts, "reconnected to server");
            self.shared.publish(ChannelEvent::Reconnected { attempts });
        }

        loop {
            let frame = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    conn.close();
                    self.shared.set_disconnected(false);
                    self.shared.publish(ChannelEvent::Disconnected {
                        reason: DisconnectReason::Client,
                    });
                    return Ended::Cancelled;
                }
                frame = conn.recv() => frame,
            };

            match frame {
                Some(Frame::Event { event, data }) => {
                    self.shared.publish(ChannelEvent::Message { event, data });
                }
                Some(Frame::Close { reason }) => {
                    tracing::info!(url = %self.url, reason = %reason, "server closed channel");
                    conn.close();
                    self.shared.set_disconnected(false);
                    self.shared.publish(ChannelEvent::Disconnected {
                        reason: DisconnectReason::Server(reason),
                    });
                    return Ended::Server;
                }
                Some(other) => {
                    tracing::debug!(?other, "unexpected frame on open channel");
                }
                None => {
                    tracing::warn!(url = %self.url, "channel transport closed");
                    self.shared.set_disconnected(true);
                    self.shared.publish(ChannelEvent::Disconnected {
                        reason: DisconnectReason::Transport,
                    });
                    return Ended::Transport;
                }
            }
        }
    }

    /// Wait for a manual reconnect. Returns `false` if cancelled.
    ///
    /// Callers publish the inactive status before parking.
    async fn park(&self) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            () = self.shared.wake.notified() => true,
        }
    }
}
