// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::let_and_return,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items
)]

//! Integration tests for the channel lifecycle.
//!
//! Drives a `ChannelManager` from a credential stream (either a bare `watch`
//! channel or a real `TokenProvider`) against the loopback connector, and
//! checks that every key change tears the old channel down before the new
//! one connects.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chatlink::alert::{AlertSink, RecordingAlerts};
use chatlink::auth::{Credential, CredentialError, CredentialSource, Identity, TokenProvider};
use chatlink::channel::{ChannelHandle, ChannelManager};
use chatlink::transport::ReconnectPolicy;
use chatlink::transport::loopback::LoopbackConnector;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use url::Url;

fn manager(connector: &Arc<LoopbackConnector>) -> Arc<ChannelManager<LoopbackConnector>> {
    Arc::new(ChannelManager::new(
        Arc::clone(connector),
        Url::parse("ws://backend.test").unwrap(),
        ReconnectPolicy::default(),
    ))
}

/// Wait until the manager exposes a handle satisfying `pred`.
async fn wait_handle(
    mgr: &ChannelManager<LoopbackConnector>,
    pred: impl Fn(&Option<ChannelHandle>) -> bool,
) -> Option<ChannelHandle> {
    let mut handles = mgr.watch_handle();
    let handle = tokio::time::timeout(Duration::from_secs(30), handles.wait_for(|h| pred(h)))
        .await
        .expect("handle timeout")
        .expect("manager dropped")
        .clone();
    handle
}

async fn wait_connected(handle: &ChannelHandle) {
    let mut status = handle.watch_status();
    tokio::time::timeout(Duration::from_secs(30), status.wait_for(|s| s.connected))
        .await
        .expect("connect timeout")
        .expect("status closed");
}

#[tokio::test(start_paused = true)]
async fn null_then_rotating_credential() {
    let connector = Arc::new(LoopbackConnector::new());
    let mgr = manager(&connector);
    let (tx, rx) = watch::channel(None);
    let cancel = CancellationToken::new();
    let follower = mgr.follow("ns".into(), Some(Identity::new("u1")), rx, cancel.clone());

    // No credential yet: idle, nothing dialed.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(mgr.handle().is_none());
    assert_eq!(connector.attempt_count(), 0);

    tx.send_replace(Some(Credential::new("tok-1")));
    let first = wait_handle(&mgr, Option::is_some).await.unwrap();
    wait_connected(&first).await;

    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].url.as_str(), "ws://backend.test/ns");
    assert_eq!(attempts[0].auth.identity, "u1");
    assert_eq!(attempts[0].auth.credential, "tok-1");

    tx.send_replace(Some(Credential::new("tok-2")));
    let second = wait_handle(&mgr, |h| {
        h.as_ref()
            .is_some_and(|h| h.key().credential().as_str() == "tok-2")
    })
    .await
    .unwrap();
    wait_connected(&second).await;

    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1].auth.credential, "tok-2");
    assert_eq!(attempts[1].live_connections, 0, "old channel closed first");
    assert_eq!(connector.closed_count(), 1);
    assert!(!first.status().connected);
    assert!(!second.same_channel(&first));

    cancel.cancel();
    follower.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn republishing_same_credential_keeps_channel() {
    let connector = Arc::new(LoopbackConnector::new());
    let mgr = manager(&connector);
    let (tx, rx) = watch::channel(Some(Credential::new("tok-1")));
    let cancel = CancellationToken::new();
    let _follower = mgr.follow("ns".into(), Some(Identity::new("u1")), rx, cancel.clone());

    let handle = wait_handle(&mgr, Option::is_some).await.unwrap();
    wait_connected(&handle).await;

    tx.send_replace(Some(Credential::new("tok-1")));
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(mgr.handle().unwrap().same_channel(&handle));
    assert_eq!(connector.attempt_count(), 1);
    assert_eq!(connector.closed_count(), 0);
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn losing_credential_tears_down() {
    let connector = Arc::new(LoopbackConnector::new());
    let mgr = manager(&connector);
    let (tx, rx) = watch::channel(Some(Credential::new("tok-1")));
    let cancel = CancellationToken::new();
    let _follower = mgr.follow("ns".into(), Some(Identity::new("u1")), rx, cancel.clone());

    let handle = wait_handle(&mgr, Option::is_some).await.unwrap();
    wait_connected(&handle).await;

    tx.send_replace(None);
    wait_handle(&mgr, Option::is_none).await;
    assert_eq!(connector.live_count(), 0);
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn missing_identity_never_connects() {
    let connector = Arc::new(LoopbackConnector::new());
    let mgr = manager(&connector);
    let (_tx, rx) = watch::channel(Some(Credential::new("tok-1")));
    let cancel = CancellationToken::new();
    let _follower = mgr.follow("ns".into(), None, rx, cancel.clone());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(mgr.handle().is_none());
    assert_eq!(connector.attempt_count(), 0);
    cancel.cancel();
}

/// Hands out tokens in order, then repeats the last one.
struct Rotating {
    tokens: Mutex<VecDeque<&'static str>>,
}

impl CredentialSource for Rotating {
    async fn fetch(&self, _identity: &Identity) -> Result<Credential, CredentialError> {
        let mut tokens = self.tokens.lock();
        let token = if tokens.len() > 1 {
            tokens.pop_front()
        } else {
            tokens.front().copied()
        };
        token.map(Credential::new).ok_or(CredentialError::Empty)
    }
}

#[tokio::test(start_paused = true)]
async fn token_provider_drives_reconnects() {
    let connector = Arc::new(LoopbackConnector::new());
    let mgr = manager(&connector);
    let source = Arc::new(Rotating {
        tokens: Mutex::new(VecDeque::from(["tok-1", "tok-1", "tok-2"])),
    });
    let alerts: Arc<dyn AlertSink> = Arc::new(RecordingAlerts::new());
    let tokens = TokenProvider::new(source, alerts).subscribe(Some(Identity::new("u1")));
    let cancel = CancellationToken::new();
    let _follower = mgr.follow("ns".into(), Some(Identity::new("u1")), tokens.watch(), cancel.clone());

    // t=0 tok-1, t=60 tok-1 (suppressed), t=120 tok-2.
    tokio::time::sleep(Duration::from_secs(90)).await;
    assert_eq!(connector.attempt_count(), 1);

    tokio::time::sleep(Duration::from_secs(40)).await;
    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1].auth.credential, "tok-2");
    assert!(attempts.iter().all(|a| a.live_connections == 0));
    assert_eq!(connector.live_count(), 1);

    tokens.release();
    cancel.cancel();
}
