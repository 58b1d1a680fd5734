//! Chat session: a conversation view over a managed channel.
//!
//! [`ChatSession`] wires the pieces together for one identity: a
//! [`TokenProvider`] subscription feeds a [`ChannelManager`], an optional
//! [`ReachabilityWatcher`] watches the manager's handle, and an event pump
//! maps channel events onto [`GenerationState`] and [`SessionEvent`]s.
//!
//! # Architecture
//!
//! ```text
//! CredentialSource ─► TokenProvider ─► ChannelManager ─► ChannelHandle
//!                                            │                 │
//!                        ReachabilityWatcher ◄┘        event pump ─► SessionEvent
//! ```
//!
//! The host drains [`SessionEvent`]s and calls [`ChatSession::submit`],
//! [`ChatSession::cancel`] and friends in response to user input.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

use chatlink_proto::event;
use chatlink_proto::message::{ChatTitle, ConversationId, JoinRoom, ServerMessage, UserMessage};

use crate::alert::AlertSink;
use crate::auth::{CredentialSource, DEFAULT_REFRESH_INTERVAL, Identity, TokenProvider, TokenSubscription};
use crate::channel::{
    ChannelError, ChannelEvent, ChannelHandle, ChannelManager, ChannelStatus, DisconnectReason,
};
use crate::generation::{ActiveConversation, GenerationState};
use crate::reachability::{Reachability, ReachabilityWatcher};
use crate::scope::TaskScope;
use crate::transport::{Connector, ReconnectPolicy};

/// Default capacity of the session event channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Default view path used in recovery actions.
pub const DEFAULT_PATH: &str = "chat";

/// Everything a session needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Backend base address; the namespace is appended.
    pub base_url: Url,
    /// Channel namespace.
    pub namespace: String,
    /// Acting user, if known.
    pub identity: Option<Identity>,
    /// View path the "Refresh page" action navigates to.
    pub path: String,
    /// Reconnection policy for the channel.
    pub policy: ReconnectPolicy,
    /// Credential refresh cadence.
    pub refresh_interval: Duration,
    /// Capacity of the event channels.
    pub channel_capacity: usize,
    /// Conversation to open; a fresh one if `None`.
    pub conversation: Option<ConversationId>,
}

impl SessionConfig {
    /// A config with default policy, cadence and capacities.
    pub fn new(base_url: Url, namespace: impl Into<String>, identity: Option<Identity>) -> Self {
        Self {
            base_url,
            namespace: namespace.into(),
            identity,
            path: DEFAULT_PATH.to_string(),
            policy: ReconnectPolicy::default(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            conversation: None,
        }
    }
}

/// One-line connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionLabel {
    /// Connected and joined.
    Online,
    /// Connected, room not joined yet.
    Initializing,
    /// Not connected, retrying.
    Reconnecting,
    /// No channel, or parked.
    Offline,
}

impl ConnectionLabel {
    /// Label for a channel status, or for no channel at all.
    #[must_use]
    pub const fn from_status(status: Option<ChannelStatus>) -> Self {
        match status {
            Some(ChannelStatus {
                connected: true,
                ready: true,
                ..
            }) => Self::Online,
            Some(ChannelStatus {
                connected: true, ..
            }) => Self::Initializing,
            Some(ChannelStatus { active: true, .. }) => Self::Reconnecting,
            _ => Self::Offline,
        }
    }
}

impl std::fmt::Display for ConnectionLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Online => "Online",
            Self::Initializing => "Initializing...",
            Self::Reconnecting => "Reconnecting...",
            Self::Offline => "Offline",
        })
    }
}

/// Events delivered to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The connection label changed.
    Status(ConnectionLabel),
    /// A response chunk for the active conversation.
    Message(ServerMessage),
    /// A room-wide broadcast.
    Broadcast(serde_json::Value),
    /// A conversation got a generated title.
    TitleChanged(ChatTitle),
    /// A conversation started or stopped generating.
    GenerationChanged {
        /// Conversation.
        chat_id: ConversationId,
        /// New flag.
        generating: bool,
    },
}

/// Why a submission was refused.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The active conversation is still generating.
    #[error("conversation is still generating")]
    Busy,

    /// No channel exists (no identity or credential yet).
    #[error("no channel available")]
    NoChannel,

    /// Nothing was submitted in this conversation yet.
    #[error("no previous message to regenerate")]
    NothingToRegenerate,

    /// The channel refused the event.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

#[derive(Debug, Default)]
struct ViewState {
    generation: GenerationState,
    active: ActiveConversation,
    last_user: HashMap<ConversationId, UserMessage>,
}

/// A running chat session.
pub struct ChatSession<C> {
    channels: Arc<ChannelManager<C>>,
    tokens: TokenSubscription,
    follower: TaskScope,
    pump: TaskScope,
    watcher: Option<TaskScope>,
    state: Arc<Mutex<ViewState>>,
    events: mpsc::Sender<SessionEvent>,
}

impl<C: Connector> ChatSession<C> {
    /// Start every background task on the current runtime.
    ///
    /// With `reachability` present, a [`ReachabilityWatcher`] reconciles its
    /// signals with the channel.
    pub fn start<S: CredentialSource>(
        config: SessionConfig,
        connector: Arc<C>,
        source: Arc<S>,
        alerts: Arc<dyn AlertSink>,
        reachability: Option<mpsc::Receiver<Reachability>>,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let tokens = TokenProvider::new(source, Arc::clone(&alerts))
            .with_interval(config.refresh_interval)
            .subscribe(config.identity.clone());

        let channels = Arc::new(
            ChannelManager::new(connector, config.base_url.clone(), config.policy)
                .with_event_capacity(config.channel_capacity),
        );
        let follow_cancel = CancellationToken::new();
        let follower = TaskScope::new(
            follow_cancel.clone(),
            channels.follow(
                config.namespace.clone(),
                config.identity.clone(),
                tokens.watch(),
                follow_cancel,
            ),
        );

        let active = config
            .conversation
            .clone()
            .map_or_else(ActiveConversation::new, ActiveConversation::with_id);
        let state = Arc::new(Mutex::new(ViewState {
            active,
            ..ViewState::default()
        }));

        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity.max(1));
        let pump_cancel = CancellationToken::new();
        let pump = TaskScope::new(
            pump_cancel.clone(),
            tokio::spawn(event_pump(
                channels.watch_handle(),
                Arc::clone(&state),
                events_tx.clone(),
                pump_cancel,
            )),
        );

        let watcher = reachability.map(|signals| {
            ReachabilityWatcher::new(config.path.clone(), channels.watch_handle(), alerts)
                .spawn(signals)
        });

        tracing::info!(
            namespace = %config.namespace,
            identity = ?config.identity.as_ref().map(Identity::as_str),
            "chat session started"
        );

        (
            Self {
                channels,
                tokens,
                follower,
                pump,
                watcher,
                state,
                events: events_tx,
            },
            events_rx,
        )
    }

    /// The live channel, if any.
    #[must_use]
    pub fn channel(&self) -> Option<ChannelHandle> {
        self.channels.handle()
    }

    /// Current connection label.
    #[must_use]
    pub fn connection_label(&self) -> ConnectionLabel {
        ConnectionLabel::from_status(self.channels.handle().map(|h| h.status()))
    }

    /// Whether a credential is currently held.
    #[must_use]
    pub fn has_credential(&self) -> bool {
        self.tokens.credential().is_some()
    }

    /// Active conversation.
    #[must_use]
    pub fn active(&self) -> ConversationId {
        self.state.lock().active.current().clone()
    }

    /// Whether `id` is generating.
    #[must_use]
    pub fn is_generating(&self, id: &ConversationId) -> bool {
        self.state.lock().generation.is_generating(id)
    }

    /// Copy of the generation map.
    #[must_use]
    pub fn generation(&self) -> HashMap<ConversationId, bool> {
        self.state.lock().generation.snapshot()
    }

    /// Send `text` to the active conversation.
    ///
    /// The busy check and the transition to generating happen under one
    /// lock, so two concurrent submissions cannot both pass.
    ///
    /// # Errors
    ///
    /// - [`SubmitError::NoChannel`] without a channel.
    /// - [`SubmitError::Busy`] while the conversation is generating.
    /// - [`SubmitError::Channel`] if the emit fails; generation is ended again.
    pub async fn submit(&self, text: &str) -> Result<ConversationId, SubmitError> {
        let handle = self.channels.handle().ok_or(SubmitError::NoChannel)?;
        let message = {
            let mut state = self.state.lock();
            let chat_id = state.active.current().clone();
            if state.generation.is_generating(&chat_id) {
                return Err(SubmitError::Busy);
            }
            state.generation.begin(chat_id.clone());
            let message = UserMessage::new(chat_id.clone(), text);
            state.last_user.insert(chat_id, message.clone());
            message
        };
        self.send_user_message(&handle, message).await
    }

    /// Re-send the last message of the active conversation.
    ///
    /// # Errors
    ///
    /// As [`submit`](Self::submit), plus [`SubmitError::NothingToRegenerate`]
    /// when nothing was sent yet.
    pub async fn regenerate(&self) -> Result<ConversationId, SubmitError> {
        let handle = self.channels.handle().ok_or(SubmitError::NoChannel)?;
        let message = {
            let mut state = self.state.lock();
            let chat_id = state.active.current().clone();
            if state.generation.is_generating(&chat_id) {
                return Err(SubmitError::Busy);
            }
            let message = state
                .last_user
                .get(&chat_id)
                .cloned()
                .ok_or(SubmitError::NothingToRegenerate)?;
            state.generation.begin(chat_id);
            message
        };
        self.send_user_message(&handle, message).await
    }

    async fn send_user_message(
        &self,
        handle: &ChannelHandle,
        message: UserMessage,
    ) -> Result<ConversationId, SubmitError> {
        let chat_id = message.chat_id.clone();
        if let Err(e) = handle.emit(event::CHAT_MESSAGE, &message).await {
            tracing::warn!(chat_id = %chat_id, err = %e, "failed to send chat message");
            self.state.lock().generation.end(&chat_id);
            return Err(e.into());
        }
        tracing::debug!(chat_id = %chat_id, "chat message sent");
        self.notify(SessionEvent::GenerationChanged {
            chat_id: chat_id.clone(),
            generating: true,
        });
        Ok(chat_id)
    }

    /// Abort generation in the active conversation.
    ///
    /// # Errors
    ///
    /// [`SubmitError::NoChannel`] without a channel, [`SubmitError::Channel`]
    /// if the abort cannot be sent. Generation is ended either way.
    pub async fn cancel(&self) -> Result<(), SubmitError> {
        let chat_id = self.active();
        let was = {
            let mut state = self.state.lock();
            let was = state.generation.is_generating(&chat_id);
            state.generation.end(&chat_id);
            was
        };
        if was {
            self.notify(SessionEvent::GenerationChanged {
                chat_id: chat_id.clone(),
                generating: false,
            });
        }
        let handle = self.channels.handle().ok_or(SubmitError::NoChannel)?;
        handle.emit(event::ABORT, &chat_id).await?;
        tracing::info!(chat_id = %chat_id, "generation aborted");
        Ok(())
    }

    /// Switch to `id` and join its room.
    pub async fn select(&self, id: ConversationId) {
        self.state.lock().active.select(id.clone());
        self.join(id).await;
    }

    /// Switch to a fresh conversation and join its room.
    pub async fn new_conversation(&self) -> ConversationId {
        let id = self.state.lock().active.reset();
        self.join(id.clone()).await;
        id
    }

    async fn join(&self, room_id: ConversationId) {
        let Some(handle) = self.channels.handle() else {
            return;
        };
        // Not ready again until the new room is joined.
        handle.clear_ready();
        match handle.emit(event::JOIN_CHAT_ROOM, &JoinRoom { room_id }).await {
            Ok(()) => {
                handle.mark_ready();
            }
            // Re-joined on the next connect.
            Err(e) => tracing::debug!(err = %e, "join deferred until connected"),
        }
    }

    fn notify(&self, event: SessionEvent) {
        forward(&self.events, event);
    }

    /// Stop every task and close the channel.
    pub async fn shutdown(self) {
        tracing::info!("chat session shutting down");
        if let Some(watcher) = self.watcher {
            watcher.shutdown().await;
        }
        self.pump.shutdown().await;
        self.follower.shutdown().await;
        self.tokens.release();
        self.channels.release();
    }
}

/// Follow the manager's handle and translate its events.
async fn event_pump(
    mut handles: watch::Receiver<Option<ChannelHandle>>,
    state: Arc<Mutex<ViewState>>,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
) {
    let mut label = None;
    'handles: loop {
        let current = handles.borrow_and_update().clone();
        let Some(handle) = current else {
            publish_label(&events, &mut label, ConnectionLabel::Offline);
            if next_handle(&mut handles, &cancel).await {
                continue 'handles;
            }
            break 'handles;
        };

        let mut channel_events = handle.tap();
        let mut status = handle.watch_status();
        if handle.status().connected {
            on_connected(&handle, &state).await;
        }

        loop {
            let now = ConnectionLabel::from_status(Some(*status.borrow_and_update()));
            publish_label(&events, &mut label, now);

            tokio::select! {
                biased;
                () = cancel.cancelled() => break 'handles,
                changed = handles.changed() => {
                    if changed.is_err() {
                        break 'handles;
                    }
                    continue 'handles;
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        if next_handle(&mut handles, &cancel).await {
                            continue 'handles;
                        }
                        break 'handles;
                    }
                }
                received = channel_events.recv() => match received {
                    Some(ev) => {
                        if cancel.is_cancelled() {
                            break 'handles;
                        }
                        on_channel_event(&handle, ev, &state, &events).await;
                    }
                    None => {
                        if next_handle(&mut handles, &cancel).await {
                            continue 'handles;
                        }
                        break 'handles;
                    }
                },
            }
        }
    }
    tracing::debug!("session event pump exiting");
}

/// Wait for the next handle. Returns `false` on cancel or manager drop.
async fn next_handle(
    handles: &mut watch::Receiver<Option<ChannelHandle>>,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        changed = handles.changed() => changed.is_ok(),
    }
}

/// Hand an event to the host without waiting. State transitions have
/// already been applied, so a full queue only costs the notification.
fn forward(events: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    if let Err(e) = events.try_send(event) {
        tracing::warn!(err = %e, "host is not draining session events, dropped one");
    }
}

fn publish_label(
    events: &mpsc::Sender<SessionEvent>,
    last: &mut Option<ConnectionLabel>,
    now: ConnectionLabel,
) {
    if *last == Some(now) {
        return;
    }
    *last = Some(now);
    forward(events, SessionEvent::Status(now));
}

/// Join the active room, then mark the channel ready.
async fn on_connected(handle: &ChannelHandle, state: &Mutex<ViewState>) {
    if handle.status().ready {
        return;
    }
    let room_id = state.lock().active.current().clone();
    let join = JoinRoom {
        room_id: room_id.clone(),
    };
    match handle.emit(event::JOIN_CHAT_ROOM, &join).await {
        Ok(()) => {
            handle.mark_ready();
            tracing::info!(room = %room_id, "joined chat room");
        }
        Err(e) => tracing::warn!(room = %room_id, err = %e, "failed to join chat room"),
    }
}

async fn on_channel_event(
    handle: &ChannelHandle,
    ev: ChannelEvent,
    state: &Mutex<ViewState>,
    events: &mpsc::Sender<SessionEvent>,
) {
    match ev {
        ChannelEvent::Connected => on_connected(handle, state).await,
        ChannelEvent::Disconnected { reason } => {
            let cleared: Vec<ConversationId> = {
                let mut state = state.lock();
                let busy = state
                    .generation
                    .snapshot()
                    .into_iter()
                    .filter_map(|(id, generating)| generating.then_some(id))
                    .collect();
                state.generation.disconnect();
                busy
            };
            for chat_id in cleared {
                forward(
                    events,
                    SessionEvent::GenerationChanged {
                        chat_id,
                        generating: false,
                    },
                );
            }
            match reason {
                DisconnectReason::Server(reason) => {
                    tracing::info!(reason = %reason, "server disconnected, reconnecting");
                    handle.reconnect();
                }
                DisconnectReason::Transport => {
                    tracing::error!("network issue detected, awaiting automatic reconnect");
                }
                DisconnectReason::Client => {
                    tracing::debug!("channel closed locally");
                }
            }
        }
        ChannelEvent::ReconnectAttempt { attempt, delay } => {
            tracing::warn!(attempt, delay_ms = delay.as_millis(), "attempting to reconnect");
        }
        ChannelEvent::Reconnected { attempts } => {
            tracing::info!(attempts, "reconnected to server");
        }
        ChannelEvent::ReconnectFailed => {
            tracing::warn!("giving up on reconnection");
        }
        ChannelEvent::Message { event, data } => on_message(&event, data, state, events),
    }
}

fn on_message(
    name: &str,
    data: serde_json::Value,
    state: &Mutex<ViewState>,
    events: &mpsc::Sender<SessionEvent>,
) {
    match name {
        event::SERVER_MESSAGE => {
            let message: ServerMessage = match serde_json::from_value(data) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(err = %e, "malformed server message");
                    return;
                }
            };
            if message.is_done() {
                let was = {
                    let mut state = state.lock();
                    let was = state.generation.is_generating(&message.chat_id);
                    state.generation.end(&message.chat_id);
                    was
                };
                tracing::debug!(chat_id = %message.chat_id, "generation finished");
                if was {
                    forward(
                        events,
                        SessionEvent::GenerationChanged {
                            chat_id: message.chat_id,
                            generating: false,
                        },
                    );
                }
                return;
            }
            let active = state.lock().active.current() == &message.chat_id;
            if active {
                forward(events, SessionEvent::Message(message));
            }
        }
        event::CHAT_BROADCAST => {
            forward(events, SessionEvent::Broadcast(data));
        }
        event::AUTOGEN_CHAT_TITLE => match serde_json::from_value::<ChatTitle>(data) {
            Ok(title) => {
                forward(events, SessionEvent::TitleChanged(title));
            }
            Err(e) => tracing::warn!(err = %e, "malformed title update"),
        },
        other => tracing::debug!(event = other, "ignoring channel event"),
    }
}
