//! TCP reachability probe.
//!
//! Periodically opens a TCP connection to the backend and reports
//! [`Reachability`] transitions. The host is assumed reachable at start, so
//! the first signal is only sent once the probe fails.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::Reachability;
use crate::scope::TaskScope;

/// Default delay between probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Default time allowed for one probe connect.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Polls a TCP endpoint and emits reachability transitions.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    addr: String,
    interval: Duration,
    timeout: Duration,
}

impl TcpProbe {
    /// Probe `addr` (`host:port`) with default timings.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            interval: DEFAULT_PROBE_INTERVAL,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Override the delay between probes.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Override the per-probe connect timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Address being probed.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// One probe.
    pub async fn check(&self) -> Reachability {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_)) => Reachability::Reachable,
            Ok(Err(e)) => {
                tracing::debug!(addr = %self.addr, err = %e, "probe connect failed");
                Reachability::Unreachable
            }
            Err(_) => {
                tracing::debug!(addr = %self.addr, "probe connect timed out");
                Reachability::Unreachable
            }
        }
    }

    /// Start probing. Signals arrive on the returned receiver until the
    /// scope is dropped.
    #[must_use]
    pub fn spawn(self, buffer: usize) -> (mpsc::Receiver<Reachability>, TaskScope) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(tx, cancel.clone()));
        (rx, TaskScope::new(cancel, task))
    }

    async fn run(self, tx: mpsc::Sender<Reachability>, cancel: CancellationToken) {
        let mut last = Reachability::Reachable;
        loop {
            let observed = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                r = self.check() => r,
            };
            if let Some(signal) = transition(last, observed) {
                tracing::info!(addr = %self.addr, ?signal, "reachability changed");
                last = signal;
                if tx.send(signal).await.is_err() {
                    break;
                }
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.interval) => {}
            }
        }
        tracing::debug!(addr = %self.addr, "reachability probe stopped");
    }
}

/// Signal to emit when `observed` follows `last`, if any.
#[must_use]
pub fn transition(last: Reachability, observed: Reachability) -> Option<Reachability> {
    (last != observed).then_some(observed)
}
