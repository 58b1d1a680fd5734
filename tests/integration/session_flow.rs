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

//! End-to-end session tests over the loopback connector.
//!
//! A `ChatSession` is started the way the binary starts it, with a
//! credential source, an alert sink and optionally a reachability stream,
//! and is then driven purely through frames delivered by the loopback
//! "server" and through its public operations.

use std::sync::Arc;
use std::time::Duration;

use chatlink::alert::{AlertSink, RecordingAlerts, RecoveryAction};
use chatlink::auth::{Credential, CredentialError, CredentialSource, Identity};
use chatlink::reachability::Reachability;
use chatlink::session::{ChatSession, ConnectionLabel, SessionConfig, SessionEvent};
use chatlink::transport::ReconnectPolicy;
use chatlink::transport::loopback::{LoopbackConnector, Outcome};
use chatlink_proto::event;
use chatlink_proto::frame::Frame;
use chatlink_proto::message::ConversationId;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

type Session = ChatSession<LoopbackConnector>;

/// A token the test can rotate between refreshes.
struct Rotatable {
    token: Mutex<String>,
}

impl Rotatable {
    fn new(token: &str) -> Arc<Self> {
        Arc::new(Self {
            token: Mutex::new(token.to_string()),
        })
    }

    fn set(&self, token: &str) {
        *self.token.lock() = token.to_string();
    }
}

impl CredentialSource for Rotatable {
    async fn fetch(&self, _identity: &Identity) -> Result<Credential, CredentialError> {
        let token = self.token.lock().clone();
        if token.is_empty() {
            return Err(CredentialError::Empty);
        }
        Ok(Credential::new(token))
    }
}

struct Harness {
    session: Session,
    events: mpsc::Receiver<SessionEvent>,
    connector: Arc<LoopbackConnector>,
    source: Arc<Rotatable>,
    alerts: Arc<RecordingAlerts>,
}

fn config(identity: Option<&str>, policy: ReconnectPolicy) -> SessionConfig {
    let mut config = SessionConfig::new(
        Url::parse("ws://backend.test").unwrap(),
        "ns",
        identity.map(Identity::new),
    );
    config.conversation = Some(ConversationId::from_external("c1"));
    config.policy = policy;
    config
}

fn start_with(
    config: SessionConfig,
    connector: Arc<LoopbackConnector>,
    reachability: Option<mpsc::Receiver<Reachability>>,
) -> Harness {
    let source = Rotatable::new("tok-1");
    let alerts = Arc::new(RecordingAlerts::new());
    let (session, events) = ChatSession::start(
        config,
        Arc::clone(&connector),
        Arc::clone(&source),
        Arc::clone(&alerts) as Arc<dyn AlertSink>,
        reachability,
    );
    Harness {
        session,
        events,
        connector,
        source,
        alerts,
    }
}

async fn wait_for(
    events: &mut mpsc::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    loop {
        let ev = tokio::time::timeout(Duration::from_secs(120), events.recv())
            .await
            .expect("session event timeout")
            .expect("session events closed");
        if pred(&ev) {
            return ev;
        }
    }
}

async fn wait_label(events: &mut mpsc::Receiver<SessionEvent>, label: ConnectionLabel) {
    wait_for(events, |e| *e == SessionEvent::Status(label)).await;
}

/// Poll with paused-clock sleeps until `check` holds.
async fn settle(mut check: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}

fn joined_rooms(frames: &[Frame]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|f| match f {
            Frame::Event { event: name, data } if name == event::JOIN_CHAT_ROOM => {
                data["room_id"].as_str().map(str::to_string)
            }
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn credential_rotation_moves_session_to_new_channel() {
    let mut h = start_with(
        config(Some("u1"), ReconnectPolicy::default()),
        Arc::new(LoopbackConnector::new()),
        None,
    );
    wait_label(&mut h.events, ConnectionLabel::Online).await;
    assert_eq!(joined_rooms(&h.connector.drain_sent()), ["c1"]);

    h.session.select(ConversationId::from_external("c2")).await;
    assert_eq!(joined_rooms(&h.connector.drain_sent()), ["c2"]);

    h.source.set("tok-2");
    // Next refresh is at t=60s.
    tokio::time::sleep(Duration::from_secs(61)).await;
    settle(|| {
        h.connector.attempt_count() == 2
            && h.session.connection_label() == ConnectionLabel::Online
    })
    .await;

    let attempts = h.connector.attempts();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1].auth.credential, "tok-2");
    assert_eq!(attempts[1].live_connections, 0);
    assert_eq!(h.connector.live_count(), 1);
    // The new channel joins the conversation that is active now.
    assert_eq!(joined_rooms(&h.connector.drain_sent()), ["c2"]);
    assert!(h.session.has_credential());

    h.session.shutdown().await;
    assert_eq!(h.connector.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn room_events_reach_the_host() {
    let mut h = start_with(
        config(Some("u1"), ReconnectPolicy::default()),
        Arc::new(LoopbackConnector::new()),
        None,
    );
    wait_label(&mut h.events, ConnectionLabel::Online).await;

    assert!(h.connector.deliver(
        Frame::event(
            event::CHAT_BROADCAST,
            &serde_json::json!({"sender": "u2", "content": "hello"}),
        )
        .unwrap()
    ));
    assert!(h.connector.deliver(
        Frame::event(
            event::AUTOGEN_CHAT_TITLE,
            &serde_json::json!({"chat_id": "c1", "title": "Greetings"}),
        )
        .unwrap()
    ));

    let broadcast = wait_for(&mut h.events, |e| matches!(e, SessionEvent::Broadcast(_))).await;
    let SessionEvent::Broadcast(data) = broadcast else {
        unreachable!()
    };
    assert_eq!(data["content"], "hello");

    let title = wait_for(&mut h.events, |e| matches!(e, SessionEvent::TitleChanged(_))).await;
    let SessionEvent::TitleChanged(title) = title else {
        unreachable!()
    };
    assert_eq!(title.chat_id.as_str(), "c1");
    assert_eq!(title.new_title, "Greetings");
}

#[tokio::test(start_paused = true)]
async fn rejected_handshake_retries_with_backoff() {
    let connector = Arc::new(LoopbackConnector::new());
    connector.push_outcome(Outcome::Reject("not yet".into()));
    let mut h = start_with(
        config(Some("u1"), ReconnectPolicy::default()),
        connector,
        None,
    );

    wait_label(&mut h.events, ConnectionLabel::Reconnecting).await;
    wait_label(&mut h.events, ConnectionLabel::Online).await;

    assert_eq!(h.connector.attempt_count(), 2);
    assert!(h.alerts.is_empty());
}

#[tokio::test(start_paused = true)]
async fn regained_network_revives_parked_channel() {
    let connector = Arc::new(LoopbackConnector::new());
    connector.push_outcome(Outcome::Fail);
    let (signals, rx) = mpsc::channel(4);
    let h = start_with(
        config(
            Some("u1"),
            ReconnectPolicy {
                max_attempts: Some(0),
                ..ReconnectPolicy::default()
            },
        ),
        connector,
        Some(rx),
    );

    settle(|| h.session.channel().is_some_and(|c| !c.status().active)).await;
    assert_eq!(h.session.connection_label(), ConnectionLabel::Offline);
    assert_eq!(h.connector.attempt_count(), 1);
    assert!(h.session.submit("hello").await.is_err());

    signals.send(Reachability::Unreachable).await.unwrap();
    signals.send(Reachability::Reachable).await.unwrap();
    settle(|| h.session.connection_label() == ConnectionLabel::Online).await;

    assert_eq!(h.connector.attempt_count(), 2);
    assert!(h.alerts.is_empty());
    let chat_id = h.session.submit("hello").await.unwrap();
    assert!(h.session.is_generating(&chat_id));
}

#[tokio::test(start_paused = true)]
async fn regained_network_without_identity_alerts() {
    let (signals, rx) = mpsc::channel(4);
    let mut h = start_with(
        config(None, ReconnectPolicy::default()),
        Arc::new(LoopbackConnector::new()),
        Some(rx),
    );
    wait_label(&mut h.events, ConnectionLabel::Offline).await;

    signals.send(Reachability::Reachable).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let raised = h.alerts.take();
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].title, "Connection Error");
    assert_eq!(
        raised[0].action,
        Some(RecoveryAction::Navigate {
            path: "/chat".into(),
            label: "Refresh page".into(),
        })
    );
    assert_eq!(h.connector.attempt_count(), 0);
    assert!(!h.session.has_credential());
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_keeps_session_online() {
    let mut h = start_with(
        config(Some("u1"), ReconnectPolicy::default()),
        Arc::new(LoopbackConnector::new()),
        None,
    );
    wait_label(&mut h.events, ConnectionLabel::Online).await;

    // A failed refresh keeps the last good credential.
    h.source.set("");
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(h.session.connection_label(), ConnectionLabel::Online);
    assert_eq!(h.connector.attempt_count(), 1);
    assert_eq!(h.alerts.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn done_survives_slow_host() {
    let mut cfg = config(Some("u1"), ReconnectPolicy::default());
    cfg.channel_capacity = 4;
    let mut h = start_with(cfg, Arc::new(LoopbackConnector::new()), None);

    // The host never drains until the end.
    settle(|| h.session.connection_label() == ConnectionLabel::Online).await;
    let chat_id = h.session.submit("hello").await.unwrap();
    assert!(h.session.is_generating(&chat_id));

    for n in 0..20 {
        assert!(h.connector.deliver(
            Frame::event(
                event::SERVER_MESSAGE,
                &serde_json::json!({"id": "m1", "chatId": "c1", "content": format!("chunk {n}")}),
            )
            .unwrap()
        ));
    }
    assert!(h.connector.deliver(
        Frame::event(
            event::SERVER_MESSAGE,
            &serde_json::json!({"id": "m1", "chatId": "c1", "content": "<done>"}),
        )
        .unwrap()
    ));
    for n in 0..20 {
        assert!(h.connector.deliver(
            Frame::event(event::CHAT_BROADCAST, &serde_json::json!({"n": n})).unwrap()
        ));
    }
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(!h.session.is_generating(&chat_id));
    while h.events.try_recv().is_ok() {}
    h.session.submit("again").await.unwrap();
    assert!(h.session.is_generating(&chat_id));
}
