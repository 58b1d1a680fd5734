//! User-facing alerts.
//!
//! Components raise [`Alert`]s through an [`AlertSink`]; the host decides how
//! to render them. The CLI prints them, tests record them.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// How long an informational alert stays up by default.
pub const DEFAULT_ALERT_DURATION: Duration = Duration::from_secs(5);

/// Visual weight of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Informational.
    Info,
    /// Something is broken and needs attention.
    Destructive,
}

/// When an alert goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dismissal {
    /// Automatically after a duration.
    After(Duration),
    /// Only when the user dismisses it.
    Explicit,
}

/// A user-triggered way out of the alerted state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Reload the view at `path`.
    Navigate {
        /// Destination, always starting with `/`.
        path: String,
        /// Button label.
        label: String,
    },
}

/// One alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    /// Short headline.
    pub title: String,
    /// Detail line.
    pub description: String,
    /// Visual weight.
    pub severity: Severity,
    /// When it goes away.
    pub dismissal: Dismissal,
    /// Optional recovery action.
    pub action: Option<RecoveryAction>,
}

impl Alert {
    /// An informational alert that dismisses itself.
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            severity: Severity::Info,
            dismissal: Dismissal::After(DEFAULT_ALERT_DURATION),
            action: None,
        }
    }

    /// An alert that stays until dismissed.
    pub fn persistent(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            dismissal: Dismissal::Explicit,
            ..Self::new(title, description)
        }
    }

    /// Mark as destructive.
    #[must_use]
    pub fn destructive(mut self) -> Self {
        self.severity = Severity::Destructive;
        self
    }

    /// Attach a recovery action.
    #[must_use]
    pub fn with_action(mut self, action: RecoveryAction) -> Self {
        self.action = Some(action);
        self
    }
}

impl std::fmt::Display for Alert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.title, self.description)?;
        if let Some(RecoveryAction::Navigate { path, label }) = &self.action {
            write!(f, " [{label} -> {path}]")?;
        }
        Ok(())
    }
}

/// Where alerts go.
pub trait AlertSink: Send + Sync {
    /// Surface an alert. Must not block.
    fn raise(&self, alert: Alert);
}

/// Forwards alerts to an unbounded channel.
#[derive(Debug, Clone)]
pub struct AlertChannel {
    tx: mpsc::UnboundedSender<Alert>,
}

impl AlertChannel {
    /// Create a sink and the receiver its alerts arrive on.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Alert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AlertSink for AlertChannel {
    fn raise(&self, alert: Alert) {
        if self.tx.send(alert).is_err() {
            tracing::debug!("alert receiver dropped");
        }
    }
}

/// Keeps every alert in memory.
#[derive(Debug, Default)]
pub struct RecordingAlerts {
    raised: Mutex<Vec<Alert>>,
}

impl RecordingAlerts {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<Alert> {
        std::mem::take(&mut *self.raised.lock())
    }

    /// Number of alerts currently recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.raised.lock().len()
    }

    /// Whether nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raised.lock().is_empty()
    }
}

impl AlertSink for RecordingAlerts {
    fn raise(&self, alert: Alert) {
        self.raised.lock().push(alert);
    }
}
