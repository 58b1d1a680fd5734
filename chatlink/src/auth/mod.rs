//! Bearer-credential lifecycle.
//!
//! [`TokenProvider`] keeps a [`Credential`] fresh for one [`Identity`] by
//! re-fetching it on a fixed cadence. Each [`TokenSubscription`] owns its
//! refresh task; releasing it (or dropping it) cancels the task, and the
//! cancellation is checked before every state mutation, so a fetch that
//! resolves after release changes nothing.
//!
//! # Invariant
//!
//! A fetched value equal to the held one is never re-published. Downstream
//! channel keys compare credentials by value, so a duplicate publish would
//! tear down a perfectly good channel.

pub mod source;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::alert::{Alert, AlertSink};
use crate::scope::TaskScope;

pub use source::{ConfiguredSource, FileCredentialSource, StaticCredentialSource};

/// Default refresh cadence.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// The acting user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    /// Wrap an identity string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identity is the empty string.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A short-lived bearer token. Compared by value; never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a token string.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the token is the empty string.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Errors from a [`CredentialSource`].
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// The source could not be read.
    #[error("failed to read credential: {0}")]
    Io(#[from] std::io::Error),

    /// The source answered with an empty token.
    #[error("credential source returned an empty token")]
    Empty,

    /// The source refused to issue a token.
    #[error("credential request refused: {0}")]
    Refused(String),
}

/// Issues credentials for an identity.
pub trait CredentialSource: Send + Sync + 'static {
    /// Fetch a current credential for `identity`.
    fn fetch(
        &self,
        identity: &Identity,
    ) -> impl std::future::Future<Output = Result<Credential, CredentialError>> + Send;
}

/// Periodically refreshes credentials from a [`CredentialSource`].
pub struct TokenProvider<S> {
    source: Arc<S>,
    alerts: Arc<dyn AlertSink>,
    interval: Duration,
}

impl<S: CredentialSource> TokenProvider<S> {
    /// Create a provider with the default 60 s cadence.
    pub fn new(source: Arc<S>, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            source,
            alerts,
            interval: DEFAULT_REFRESH_INTERVAL,
        }
    }

    /// Override the refresh cadence.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Start keeping a credential fresh for `identity`.
    ///
    /// An absent or empty identity yields a subscription that never holds
    /// a credential and never fetches.
    #[must_use]
    pub fn subscribe(&self, identity: Option<Identity>) -> TokenSubscription {
        let (tx, rx) = watch::channel(None);

        let Some(identity) = identity.filter(|i| !i.is_empty()) else {
            tracing::debug!("no identity, credential refresh not started");
            return TokenSubscription {
                rx,
                scope: TaskScope::idle(),
            };
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(refresh_loop(
            identity,
            Arc::clone(&self.source),
            Arc::clone(&self.alerts),
            self.interval,
            tx,
            cancel.clone(),
        ));
        TokenSubscription {
            rx,
            scope: TaskScope::new(cancel, task),
        }
    }
}

/// A live credential refresh. Dropping it stops the refresh.
#[derive(Debug)]
pub struct TokenSubscription {
    rx: watch::Receiver<Option<Credential>>,
    scope: TaskScope,
}

impl TokenSubscription {
    /// Latest credential, if any fetch has succeeded.
    #[must_use]
    pub fn credential(&self) -> Option<Credential> {
        self.rx.borrow().clone()
    }

    /// Observe credential replacements.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Option<Credential>> {
        self.rx.clone()
    }

    /// Stop refreshing. Later fetch results are discarded.
    pub fn release(&self) {
        self.scope.cancel();
    }

    /// Whether the refresh loop is still scheduled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.scope.is_running()
    }
}

/// Fetch now, then every `interval` after the previous attempt settles.
async fn refresh_loop<S: CredentialSource>(
    identity: Identity,
    source: Arc<S>,
    alerts: Arc<dyn AlertSink>,
    interval: Duration,
    tx: watch::Sender<Option<Credential>>,
    cancel: CancellationToken,
) {
    loop {
        tracing::debug!(identity = %identity, "fetching credential");
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            r = source.fetch(&identity) => r,
        };
        if cancel.is_cancelled() {
            break;
        }

        match result {
            Ok(fresh) => {
                let replaced = tx.send_if_modified(|held| {
                    if held.as_ref() == Some(&fresh) {
                        false
                    } else {
                        *held = Some(fresh);
                        true
                    }
                });
                tracing::debug!(identity = %identity, replaced, "credential refreshed");
            }
            Err(e) => {
                tracing::error!(identity = %identity, err = %e, "failed to fetch credential");
                alerts.raise(
                    Alert::persistent("Authentication error", format!("Could not refresh credentials: {e}"))
                        .destructive(),
                );
            }
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
    tracing::debug!(identity = %identity, "credential refresh stopped");
}
