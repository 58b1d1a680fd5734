//! Loopback connector for testing.
//!
//! [`LoopbackConnector`] plays the server side in-process. Each connection
//! attempt is recorded together with how many earlier connections were still
//! live at that moment, and answered from a script of [`Outcome`]s. Tests
//! can push frames to the client, read what the client sent, and sever the
//! transport to simulate a network drop.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use chatlink_proto::frame::{AuthPayload, Frame};

use super::{Connection, Connector, TransportError};

/// Per-direction buffer of a loopback link.
const LINK_BUFFER: usize = 64;

/// How the loopback answers a connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Complete the handshake.
    Accept,
    /// Refuse the handshake with a reason.
    Reject(String),
    /// Fail as if the endpoint were unreachable.
    Fail,
}

/// A recorded connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    /// Endpoint the client dialed.
    pub url: Url,
    /// Credentials it presented.
    pub auth: AuthPayload,
    /// Accepted connections still open when this attempt started.
    pub live_connections: usize,
}

struct Link {
    shutdown: CancellationToken,
    to_client: Option<mpsc::Sender<Frame>>,
    from_client: mpsc::Receiver<Frame>,
}

impl Link {
    fn is_live(&self) -> bool {
        !self.shutdown.is_cancelled() && self.to_client.is_some()
    }
}

#[derive(Default)]
struct State {
    script: VecDeque<Outcome>,
    default: Option<Outcome>,
    attempts: Vec<ConnectAttempt>,
    links: Vec<Link>,
}

/// In-process [`Connector`] with a scripted server side.
#[derive(Default)]
pub struct LoopbackConnector {
    state: Mutex<State>,
}

impl LoopbackConnector {
    /// Create a connector that accepts every attempt.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an outcome for the next unscripted attempt.
    pub fn push_outcome(&self, outcome: Outcome) {
        self.state.lock().script.push_back(outcome);
    }

    /// Outcome used once the script is empty.
    pub fn set_default(&self, outcome: Outcome) {
        self.state.lock().default = Some(outcome);
    }

    /// All attempts so far, oldest first.
    #[must_use]
    pub fn attempts(&self) -> Vec<ConnectAttempt> {
        self.state.lock().attempts.clone()
    }

    /// Number of attempts so far.
    #[must_use]
    pub fn attempt_count(&self) -> usize {
        self.state.lock().attempts.len()
    }

    /// Accepted connections that are still open.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.state.lock().links.iter().filter(|l| l.is_live()).count()
    }

    /// Accepted connections that were closed by the client.
    #[must_use]
    pub fn closed_count(&self) -> usize {
        self.state
            .lock()
            .links
            .iter()
            .filter(|l| l.shutdown.is_cancelled())
            .count()
    }

    /// Push a frame to the most recent live connection.
    ///
    /// Returns `false` if there is none or its buffer is full.
    pub fn deliver(&self, frame: Frame) -> bool {
        let state = self.state.lock();
        state
            .links
            .iter()
            .rev()
            .find(|l| l.is_live())
            .and_then(|l| l.to_client.as_ref())
            .is_some_and(|tx| tx.try_send(frame).is_ok())
    }

    /// Drop the server side of the most recent live connection, as a
    /// network failure would. Returns `false` if there is none.
    pub fn sever(&self) -> bool {
        let mut state = self.state.lock();
        match state.links.iter_mut().rev().find(|l| l.is_live()) {
            Some(link) => {
                link.to_client = None;
                true
            }
            None => false,
        }
    }

    /// Frames the client sent on the most recent connection, oldest first.
    #[must_use]
    pub fn drain_sent(&self) -> Vec<Frame> {
        let mut state = self.state.lock();
        let mut frames = Vec::new();
        if let Some(link) = state.links.last_mut() {
            while let Ok(frame) = link.from_client.try_recv() {
                frames.push(frame);
            }
        }
        frames
    }

    fn answer(
        &self,
        url: &Url,
        auth: &AuthPayload,
        shutdown: CancellationToken,
    ) -> Result<Connection, TransportError> {
        let mut state = self.state.lock();
        let live_connections = state.links.iter().filter(|l| l.is_live()).count();
        state.attempts.push(ConnectAttempt {
            url: url.clone(),
            auth: auth.clone(),
            live_connections,
        });

        let outcome = state
            .script
            .pop_front()
            .or_else(|| state.default.clone())
            .unwrap_or(Outcome::Accept);

        match outcome {
            Outcome::Accept => {
                let (to_client, incoming) = mpsc::channel(LINK_BUFFER);
                let (outgoing, from_client) = mpsc::channel(LINK_BUFFER);
                state.links.push(Link {
                    shutdown: shutdown.clone(),
                    to_client: Some(to_client),
                    from_client,
                });
                tracing::debug!(url = %url, identity = %auth.identity, "loopback accepted connection");
                Ok(Connection::new(outgoing, incoming, shutdown))
            }
            Outcome::Reject(reason) => Err(TransportError::Rejected(reason)),
            Outcome::Fail => Err(TransportError::Unreachable(url.to_string())),
        }
    }
}

impl Connector for LoopbackConnector {
    async fn connect(
        &self,
        url: &Url,
        auth: &AuthPayload,
        shutdown: CancellationToken,
    ) -> Result<Connection, TransportError> {
        self.answer(url, auth, shutdown)
    }
}
