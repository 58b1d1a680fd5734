//! Network reachability reconciliation.
//!
//! A [`ReachabilityWatcher`] consumes host-level connectivity transitions and
//! reconciles them with the current channel: a parked channel is asked to
//! reconnect, a missing channel raises a persistent alert with a refresh
//! action. Losing reachability is only logged; the transport notices on its
//! own.

pub mod probe;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::alert::{Alert, AlertSink, RecoveryAction};
use crate::channel::{ChannelHandle, ChannelStatus};
use crate::scope::TaskScope;

pub use probe::TcpProbe;

/// A host-level connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    /// The host regained network access.
    Reachable,
    /// The host lost network access.
    Unreachable,
}

/// What the watcher does with a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityAction {
    /// No channel exists: tell the user to refresh.
    RaiseAlert,
    /// The channel is parked: reconnect it.
    Reconnect,
    /// The channel is connected or already retrying.
    Ignore,
    /// Connectivity lost; nothing to do.
    LogOnly,
}

/// Decide the reaction to `signal` given the channel status, if any.
#[must_use]
pub const fn decide(signal: Reachability, channel: Option<&ChannelStatus>) -> ReachabilityAction {
    match (signal, channel) {
        (Reachability::Unreachable, _) => ReachabilityAction::LogOnly,
        (Reachability::Reachable, None) => ReachabilityAction::RaiseAlert,
        (Reachability::Reachable, Some(status)) if !status.connected && !status.active => {
            ReachabilityAction::Reconnect
        }
        (Reachability::Reachable, Some(_)) => ReachabilityAction::Ignore,
    }
}

/// The alert raised when connectivity returns but there is no channel.
#[must_use]
pub fn connection_alert(path: &str) -> Alert {
    Alert::persistent("Connection Error", "Please refresh the page")
        .destructive()
        .with_action(RecoveryAction::Navigate {
            path: format!("/{}", path.trim_start_matches('/')),
            label: "Refresh page".to_string(),
        })
}

/// Reconciles reachability signals with the current channel handle.
pub struct ReachabilityWatcher {
    path: String,
    handles: watch::Receiver<Option<ChannelHandle>>,
    alerts: Arc<dyn AlertSink>,
}

impl ReachabilityWatcher {
    /// Watch the handle published by a channel manager.
    pub fn new(
        path: impl Into<String>,
        handles: watch::Receiver<Option<ChannelHandle>>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            path: path.into(),
            handles,
            alerts,
        }
    }

    /// React to one signal against the handle current right now.
    pub fn handle_signal(&self, signal: Reachability) -> ReachabilityAction {
        let handle = self.handles.borrow().clone();
        let status = handle.as_ref().map(ChannelHandle::status);
        let action = decide(signal, status.as_ref());

        match action {
            ReachabilityAction::LogOnly => {
                tracing::info!("network unreachable");
            }
            ReachabilityAction::RaiseAlert => {
                tracing::warn!(path = %self.path, "network reachable but no channel exists");
                self.alerts.raise(connection_alert(&self.path));
            }
            ReachabilityAction::Reconnect => {
                if let Some(handle) = handle {
                    tracing::info!(url = %handle.url(), "network reachable, reconnecting channel");
                    handle.reconnect();
                }
            }
            ReachabilityAction::Ignore => {
                tracing::debug!("network reachable, channel already live");
            }
        }
        action
    }

    /// Handle signals on a background task until the returned scope is
    /// dropped or the signal stream ends.
    #[must_use]
    pub fn spawn(self, mut signals: mpsc::Receiver<Reachability>) -> TaskScope {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    s = signals.recv() => s,
                };
                let Some(signal) = signal else { break };
                if token.is_cancelled() {
                    break;
                }
                self.handle_signal(signal);
            }
            tracing::debug!("reachability watcher exiting");
        });
        TaskScope::new(cancel, task)
    }
}
