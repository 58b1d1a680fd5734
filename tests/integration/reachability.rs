// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items
)]

//! Integration tests for reachability reconciliation.
//!
//! Wires a `ReachabilityWatcher` to a real `ChannelManager` over the loopback
//! connector and feeds it signals through the same mpsc channel a probe
//! would use.

use std::sync::Arc;
use std::time::Duration;

use chatlink::alert::{AlertSink, RecordingAlerts, RecoveryAction};
use chatlink::auth::{Credential, Identity};
use chatlink::channel::{ChannelEvent, ChannelHandle, ChannelKey, ChannelManager};
use chatlink::reachability::{Reachability, ReachabilityWatcher};
use chatlink::transport::ReconnectPolicy;
use chatlink::transport::loopback::{LoopbackConnector, Outcome};
use tokio::sync::mpsc;
use url::Url;

struct Rig {
    connector: Arc<LoopbackConnector>,
    manager: Arc<ChannelManager<LoopbackConnector>>,
    alerts: Arc<RecordingAlerts>,
    signals: mpsc::Sender<Reachability>,
    _watcher: chatlink::scope::TaskScope,
}

fn rig(policy: ReconnectPolicy) -> Rig {
    let connector = Arc::new(LoopbackConnector::new());
    let manager = Arc::new(ChannelManager::new(
        Arc::clone(&connector),
        Url::parse("ws://backend.test").unwrap(),
        policy,
    ));
    let alerts = Arc::new(RecordingAlerts::new());
    let (signals, rx) = mpsc::channel(8);
    let watcher = ReachabilityWatcher::new(
        "chat",
        manager.watch_handle(),
        Arc::clone(&alerts) as Arc<dyn AlertSink>,
    )
    .spawn(rx);
    Rig {
        connector,
        manager,
        alerts,
        signals,
        _watcher: watcher,
    }
}

fn key() -> ChannelKey {
    ChannelKey::from_parts(
        "ns",
        Some(&Identity::new("u1")),
        Some(&Credential::new("tok-1")),
    )
    .unwrap()
}

async fn wait_status(handle: &ChannelHandle, pred: impl Fn(&chatlink::channel::ChannelStatus) -> bool) {
    let mut status = handle.watch_status();
    tokio::time::timeout(Duration::from_secs(60), status.wait_for(|s| pred(s)))
        .await
        .expect("status timeout")
        .expect("status closed");
}

#[tokio::test(start_paused = true)]
async fn no_channel_raises_refresh_alert_per_regain() {
    let rig = rig(ReconnectPolicy::default());

    rig.signals.send(Reachability::Unreachable).await.unwrap();
    rig.signals.send(Reachability::Reachable).await.unwrap();
    rig.signals.send(Reachability::Unreachable).await.unwrap();
    rig.signals.send(Reachability::Reachable).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let raised = rig.alerts.take();
    assert_eq!(raised.len(), 2);
    for alert in &raised {
        assert_eq!(alert.title, "Connection Error");
        assert_eq!(alert.description, "Please refresh the page");
        assert_eq!(
            alert.action,
            Some(RecoveryAction::Navigate {
                path: "/chat".to_string(),
                label: "Refresh page".to_string(),
            })
        );
    }
    assert_eq!(rig.connector.attempt_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn connected_channel_is_left_alone() {
    let rig = rig(ReconnectPolicy::default());
    assert!(rig.manager.apply(Some(key())));
    let handle = rig.manager.handle().unwrap();
    wait_status(&handle, |s| s.connected).await;

    rig.signals.send(Reachability::Reachable).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(rig.connector.attempt_count(), 1);
    assert!(rig.alerts.is_empty());
    assert!(handle.status().connected);
}

#[tokio::test(start_paused = true)]
async fn exhausted_channel_reconnects_on_regain() {
    let rig = rig(ReconnectPolicy {
        max_attempts: Some(2),
        ..ReconnectPolicy::default()
    });
    rig.connector.push_outcome(Outcome::Fail);
    rig.connector.push_outcome(Outcome::Fail);
    rig.connector.push_outcome(Outcome::Fail);

    assert!(rig.manager.apply(Some(key())));
    let handle = rig.manager.handle().unwrap();
    let mut events = handle.subscribe();

    // Initial attempt plus two retries, then parked.
    wait_status(&handle, |s| !s.active).await;
    assert_eq!(rig.connector.attempt_count(), 3);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(rig.connector.attempt_count(), 3, "parked channel stays parked");

    let mut saw_failed = false;
    while let Ok(event) = events.try_recv() {
        saw_failed |= event == ChannelEvent::ReconnectFailed;
    }
    assert!(saw_failed);

    rig.signals.send(Reachability::Reachable).await.unwrap();
    wait_status(&handle, |s| s.connected).await;
    assert_eq!(rig.connector.attempt_count(), 4);
    assert!(rig.alerts.is_empty());
}

#[tokio::test(start_paused = true)]
async fn rapid_regains_trigger_one_attempt() {
    let rig = rig(ReconnectPolicy {
        max_attempts: Some(0),
        ..ReconnectPolicy::default()
    });
    rig.connector.push_outcome(Outcome::Fail);

    assert!(rig.manager.apply(Some(key())));
    let handle = rig.manager.handle().unwrap();
    wait_status(&handle, |s| !s.active).await;
    assert_eq!(rig.connector.attempt_count(), 1);

    rig.signals.send(Reachability::Reachable).await.unwrap();
    rig.signals.send(Reachability::Reachable).await.unwrap();
    wait_status(&handle, |s| s.connected).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(rig.connector.attempt_count(), 2);
    assert_eq!(rig.connector.live_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn released_channel_raises_alert() {
    let rig = rig(ReconnectPolicy::default());
    assert!(rig.manager.apply(Some(key())));
    let handle = rig.manager.handle().unwrap();
    wait_status(&handle, |s| s.connected).await;

    rig.manager.release();
    rig.signals.send(Reachability::Reachable).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(rig.alerts.len(), 1);
    assert_eq!(rig.connector.attempt_count(), 1);
}
