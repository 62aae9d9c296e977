//! Scenario tests for the connection manager, driven through the in-memory
//! connector on a paused clock.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;

use crate::config::PresenceConfig;
use crate::core::events::{Notice, PresenceEvent};
use crate::core::manager::{ClientDeps, ConnectionState, PresenceClient};
use crate::core::registry::LinkRegistry;
use crate::credentials::StaticToken;
use crate::error::PresenceError;
use crate::preferences::{MemoryPreferences, PreferenceStore};
use crate::protocol::{OutboundFrame, TaskAction};
use crate::transport::mock::MockConnector;
use crate::transport::TransportCommand;

const PRIMARY: &str = "ws://app.test/api/online-users/ws";
const FALLBACK: &str = "ws://app.test:8002/ws";

struct Harness {
    client: PresenceClient,
    connector: MockConnector,
    prefs: Arc<MemoryPreferences>,
    events: broadcast::Receiver<PresenceEvent>,
}

fn config() -> PresenceConfig {
    PresenceConfig::with_origin("http://app.test")
}

fn build(
    token: StaticToken,
    prefs: MemoryPreferences,
    connector: MockConnector,
    registry: LinkRegistry,
    logout: Option<broadcast::Receiver<()>>,
) -> Harness {
    let prefs = Arc::new(prefs);
    let deps = ClientDeps::new(Arc::new(connector.clone()), Arc::new(token), prefs.clone()).with_registry(registry);
    let client = PresenceClient::spawn(config(), deps, logout).unwrap();
    let events = client.subscribe();
    Harness {
        client,
        connector,
        prefs,
        events,
    }
}

fn harness() -> Harness {
    build(
        StaticToken::new("Bearer abc123"),
        MemoryPreferences::default(),
        MockConnector::default(),
        LinkRegistry::new(),
        None,
    )
}

/// Lets the manager and timer tasks drain their queues.
async fn flush() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

async fn advance(ms: u64) {
    tokio::time::advance(Duration::from_millis(ms)).await;
    flush().await;
}

fn drain(rx: &mut broadcast::Receiver<PresenceEvent>) -> Vec<PresenceEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

fn snapshot(ids: &[i64]) -> String {
    let users: Vec<_> = ids
        .iter()
        .map(|id| json!({"id": id, "username": format!("user{}", id), "lastActivity": 100 + id}))
        .collect();
    json!({"action": "online_users_updated", "users": users}).to_string()
}

/// Connects, opens the first link and lets the handshake settle.
async fn connected(h: &Harness) {
    h.client.connect().unwrap();
    flush().await;
    h.connector.last().open();
    flush().await;
    advance(500).await;
    h.connector.last().commands();
}

#[tokio::test(start_paused = true)]
async fn handshake_authenticates_then_requests_snapshot_and_starts_timers() {
    let mut h = harness();
    h.client.connect().unwrap();
    flush().await;

    assert_eq!(h.connector.opened(), 1);
    let link = h.connector.link(0);
    assert_eq!(link.url.as_str(), PRIMARY);
    assert_eq!(h.client.status().state, ConnectionState::Connecting);
    assert!(h.client.status().is_loading);

    link.open();
    flush().await;
    assert_eq!(link.sent(), vec![json!({"type": "authenticate", "token": "abc123"})]);
    assert!(h.client.is_connected());

    advance(499).await;
    assert!(link.sent().is_empty(), "nothing before the settle delay");
    advance(1).await;
    assert_eq!(link.sent_types(), vec!["get_online_users"]);
    assert!(drain(&mut h.events).contains(&PresenceEvent::Connected));

    link.message(snapshot(&[1, 2]));
    flush().await;
    let view = h.client.presence();
    assert_eq!(view.count(), 2);
    let ids: Vec<i64> = view.sorted_by_recency().iter().map(|r| r.user_id).collect();
    assert_eq!(ids, vec![2, 1]);

    advance(30_000).await;
    assert_eq!(link.sent_types(), vec!["heartbeat"]);

    advance(30_000).await;
    let mut types = link.sent_types();
    types.sort();
    assert_eq!(types, vec!["get_online_users", "heartbeat"]);
}

#[tokio::test(start_paused = true)]
async fn enabled_privacy_mode_is_mirrored_after_settle() {
    let h = build(
        StaticToken::new("abc123"),
        MemoryPreferences::with_privacy_mode(true),
        MockConnector::default(),
        LinkRegistry::new(),
        None,
    );
    assert!(h.client.privacy_mode());
    h.client.connect().unwrap();
    flush().await;
    let link = h.connector.last();
    link.open();
    flush().await;
    link.commands();

    advance(500).await;
    assert_eq!(
        link.sent(),
        vec![json!({"type": "privacy_mode", "enabled": true}), json!({"type": "get_online_users"})]
    );
}

#[tokio::test(start_paused = true)]
async fn abnormal_close_retries_after_base_delay_and_resets_once_the_server_answers() {
    let mut h = harness();
    connected(&h).await;
    drain(&mut h.events);

    h.connector.link(0).close(1006, "");
    flush().await;

    let status = h.client.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.reconnect_attempts, 1);
    assert!(status.is_reconnecting);
    let events = drain(&mut h.events);
    assert!(events.contains(&PresenceEvent::Disconnected {
        code: 1006,
        reason: String::new()
    }));
    assert!(events.contains(&PresenceEvent::Reconnecting {
        attempt: 1,
        delay: Duration::from_secs(1)
    }));

    advance(999).await;
    assert_eq!(h.connector.opened(), 1);
    advance(1).await;
    assert_eq!(h.connector.opened(), 2);
    assert_eq!(h.connector.link(1).url.as_str(), PRIMARY);

    h.connector.link(1).open();
    flush().await;
    assert_eq!(h.client.status().reconnect_attempts, 1);
    advance(500).await;
    let status = h.client.status();
    assert!(status.is_connected);
    assert!(!status.is_reconnecting);
    assert_eq!(status.reconnect_attempts, 1, "settling alone does not refill the budget");

    h.connector.link(1).message(r#"{"error":"No token provided"}"#);
    flush().await;
    assert_eq!(h.client.status().reconnect_attempts, 1, "an error reply does not refill the budget");

    h.connector.link(1).message(snapshot(&[1]));
    flush().await;
    let status = h.client.status();
    assert_eq!(status.reconnect_attempts, 0);
    assert!(!status.is_reconnecting);
}

#[tokio::test(start_paused = true)]
async fn silent_server_exhausts_the_budget() {
    let mut h = harness();
    h.client.connect().unwrap();
    flush().await;

    // Every link is accepted, settles, then never hears a single frame.
    for _ in 0..6 {
        let link = h.connector.last();
        link.open();
        flush().await;
        advance(10_000).await;
        assert!(link.commands().contains(&TransportCommand::Close {
            code: 4000,
            reason: "handshake_timeout".into()
        }));
        advance(5_000).await;
    }

    assert_eq!(h.connector.opened(), 6);
    let events = drain(&mut h.events);
    let attempts: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            PresenceEvent::Reconnecting { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2, 3, 4, 5]);
    assert_eq!(
        events
            .iter()
            .filter(|e| **e == PresenceEvent::Notice(Notice::ServiceUnreachable))
            .count(),
        1
    );

    advance(60_000).await;
    assert_eq!(h.connector.opened(), 6);
    assert!(!h.client.status().is_reconnecting);
}

#[tokio::test(start_paused = true)]
async fn logout_reason_is_never_retried() {
    let h = harness();
    connected(&h).await;

    h.connector.link(0).close(1006, "user_logout");
    flush().await;
    advance(10_000).await;

    assert_eq!(h.connector.opened(), 1);
    let status = h.client.status();
    assert_eq!(status.reconnect_attempts, 0);
    assert!(!status.is_reconnecting);
}

#[tokio::test(start_paused = true)]
async fn normal_closure_is_never_retried() {
    let h = harness();
    connected(&h).await;

    h.connector.link(0).close(1000, "");
    flush().await;
    advance(10_000).await;
    assert_eq!(h.connector.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn capacity_refusal_surfaces_one_notice_and_stops() {
    let mut h = harness();
    connected(&h).await;
    drain(&mut h.events);

    h.connector.link(0).close(1008, "max_connections_reached");
    flush().await;
    advance(10_000).await;

    let notices: Vec<_> = drain(&mut h.events)
        .into_iter()
        .filter(|e| matches!(e, PresenceEvent::Notice(_)))
        .collect();
    assert_eq!(notices, vec![PresenceEvent::Notice(Notice::ServerAtCapacity)]);
    assert_eq!(h.connector.opened(), 1);
    assert!(h.client.status().error.unwrap().contains("try again later"));
}

#[tokio::test(start_paused = true)]
async fn per_user_limit_asks_to_close_other_tabs() {
    let mut h = harness();
    connected(&h).await;
    drain(&mut h.events);

    h.connector.link(0).close(1008, "max_user_connections_reached");
    flush().await;

    assert!(drain(&mut h.events).contains(&PresenceEvent::Notice(Notice::UserConnectionLimit)));
    assert!(h.client.status().error.unwrap().contains("close other tabs"));
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_surfaces_service_unreachable() {
    let mut h = harness();
    h.client.connect().unwrap();
    flush().await;

    // Six links: the first plus five retries, each accepted and then dropped
    // before the handshake settles.
    for _ in 0..6 {
        let link = h.connector.last();
        link.open();
        link.close(1006, "");
        flush().await;
        advance(5_000).await;
    }

    assert_eq!(h.connector.opened(), 6);
    let events = drain(&mut h.events);
    let attempts: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            PresenceEvent::Reconnecting { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2, 3, 4, 5]);
    assert_eq!(
        events
            .iter()
            .filter(|e| **e == PresenceEvent::Notice(Notice::ServiceUnreachable))
            .count(),
        1
    );

    let status = h.client.status();
    assert_eq!(status.reconnect_attempts, 0);
    assert!(!status.is_reconnecting);

    advance(10_000).await;
    assert_eq!(h.connector.opened(), 6);

    // A user-driven connect starts over with a fresh budget.
    h.client.connect().unwrap();
    flush().await;
    assert_eq!(h.connector.opened(), 7);
}

#[tokio::test(start_paused = true)]
async fn backoff_delays_grow_and_cap() {
    let mut h = harness();
    h.client.connect().unwrap();
    flush().await;

    for _ in 0..4 {
        let link = h.connector.last();
        link.open();
        link.close(1006, "");
        flush().await;
        advance(5_000).await;
    }

    let delays: Vec<u64> = drain(&mut h.events)
        .iter()
        .filter_map(|e| match e {
            PresenceEvent::Reconnecting { delay, .. } => Some(delay.as_millis() as u64),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![1000, 2000, 3000, 3000]);
}

#[tokio::test(start_paused = true)]
async fn primary_failure_falls_back_once_per_attempt() {
    let h = harness();
    h.client.connect().unwrap();
    flush().await;

    h.connector.link(0).error("connection refused");
    flush().await;
    assert_eq!(h.connector.opened(), 2);
    assert_eq!(h.connector.link(1).url.as_str(), FALLBACK);

    h.connector.link(1).error("connection refused");
    h.connector.link(1).close(1006, "");
    flush().await;
    assert_eq!(h.connector.opened(), 2, "the direct endpoint is not looped");
    assert_eq!(h.client.status().reconnect_attempts, 1);

    advance(1_000).await;
    assert_eq!(h.connector.opened(), 3);
    assert_eq!(h.connector.link(2).url.as_str(), PRIMARY);
}

#[tokio::test(start_paused = true)]
async fn events_from_abandoned_links_are_ignored() {
    let h = harness();
    h.client.connect().unwrap();
    flush().await;
    h.connector.link(0).error("connection refused");
    flush().await;

    let stale = h.connector.link(0);
    stale.open();
    stale.message(snapshot(&[7]));
    stale.close(1006, "");
    flush().await;

    assert_eq!(h.client.status().state, ConnectionState::Connecting);
    assert_eq!(h.client.presence().count(), 0);
    assert!(stale.sent().is_empty());
    assert_eq!(h.client.status().reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn bare_bearer_scheme_counts_as_no_credential() {
    let h = build(
        StaticToken::new("Bearer   "),
        MemoryPreferences::default(),
        MockConnector::default(),
        LinkRegistry::new(),
        None,
    );
    assert!(matches!(h.client.connect(), Err(PresenceError::Unauthenticated)));
    flush().await;
    assert_eq!(h.connector.opened(), 0);
}

#[tokio::test(start_paused = true)]
async fn missing_credential_fails_fast_without_io() {
    let h = build(
        StaticToken::none(),
        MemoryPreferences::default(),
        MockConnector::default(),
        LinkRegistry::new(),
        None,
    );
    assert!(matches!(h.client.connect(), Err(PresenceError::Unauthenticated)));
    flush().await;

    assert_eq!(h.connector.opened(), 0);
    let status = h.client.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert!(status.error.is_some());
}

#[tokio::test(start_paused = true)]
async fn frames_sent_while_not_open_are_dropped() {
    let h = harness();
    h.client.request_update().unwrap();
    h.client.send_frame(OutboundFrame::Heartbeat).unwrap();
    flush().await;
    assert_eq!(h.connector.opened(), 0);

    h.client.connect().unwrap();
    flush().await;
    h.client.send_frame(OutboundFrame::Heartbeat).unwrap();
    flush().await;
    let link = h.connector.last();
    link.open();
    flush().await;
    assert_eq!(link.sent_types(), vec!["authenticate"], "nothing is queued for later");
}

#[tokio::test(start_paused = true)]
async fn privacy_toggles_are_persisted_and_throttled() {
    let mut h = harness();
    connected(&h).await;
    drain(&mut h.events);
    let link = h.connector.link(0);

    h.client.set_privacy_mode(true).unwrap();
    h.client.set_privacy_mode(false).unwrap();
    h.client.set_privacy_mode(true).unwrap();
    h.client.set_privacy_mode(false).unwrap();
    flush().await;
    assert_eq!(link.sent(), vec![json!({"type": "privacy_mode", "enabled": true})]);

    advance(1_000).await;
    assert_eq!(link.sent(), vec![json!({"type": "privacy_mode", "enabled": false})]);
    advance(5_000).await;
    assert!(link.sent().iter().all(|f| f["type"] != "privacy_mode"));

    assert!(!h.prefs.load_privacy_mode());
    assert!(!h.client.privacy_mode());
    let toggles = drain(&mut h.events)
        .into_iter()
        .filter(|e| matches!(e, PresenceEvent::PrivacyModeChanged(_)))
        .count();
    assert_eq!(toggles, 4);
}

#[tokio::test(start_paused = true)]
async fn privacy_toggle_while_offline_is_only_persisted() {
    let h = harness();
    h.client.set_privacy_mode(true).unwrap();
    flush().await;
    assert!(h.prefs.load_privacy_mode());
    assert!(h.client.privacy_mode());
    assert_eq!(h.connector.opened(), 0);
}

#[tokio::test(start_paused = true)]
async fn silent_link_is_abandoned_after_handshake_timeout() {
    let h = harness();
    h.client.connect().unwrap();
    flush().await;
    let link = h.connector.link(0);
    link.open();
    flush().await;

    advance(9_999).await;
    assert!(h.client.is_connected());
    advance(1).await;

    assert!(link.commands().contains(&TransportCommand::Close {
        code: 4000,
        reason: "handshake_timeout".into()
    }));
    assert_eq!(h.client.status().reconnect_attempts, 1);
    advance(1_000).await;
    assert_eq!(h.connector.opened(), 2);
}

#[tokio::test(start_paused = true)]
async fn any_valid_frame_disarms_handshake_timeout() {
    let h = harness();
    connected(&h).await;
    h.connector.link(0).message(r#"{"type":"heartbeat_ack"}"#);
    flush().await;

    advance(20_000).await;
    assert!(h.client.is_connected());
    assert_eq!(h.connector.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_idempotent_and_clears_presence() {
    let mut h = harness();
    connected(&h).await;
    let link = h.connector.link(0);
    link.message(snapshot(&[1, 2, 3]));
    flush().await;
    assert_eq!(h.client.presence().count(), 3);
    drain(&mut h.events);

    h.client.disconnect().unwrap();
    h.client.disconnect().unwrap();
    flush().await;

    assert_eq!(h.client.presence().count(), 0);
    assert_eq!(
        link.commands(),
        vec![TransportCommand::Close {
            code: 1000,
            reason: "client_disconnect".into()
        }]
    );
    let disconnects = drain(&mut h.events)
        .into_iter()
        .filter(|e| matches!(e, PresenceEvent::Disconnected { .. }))
        .count();
    assert_eq!(disconnects, 1);

    link.close(1000, "client_disconnect");
    advance(10_000).await;
    assert_eq!(h.connector.opened(), 1);
    assert!(!link.sent().iter().any(|f| f["type"] == "heartbeat"), "timers stopped");
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_reconnect() {
    let h = harness();
    connected(&h).await;
    h.connector.link(0).close(1006, "");
    flush().await;
    assert!(h.client.status().is_reconnecting);

    h.client.disconnect().unwrap();
    flush().await;
    advance(10_000).await;

    assert_eq!(h.connector.opened(), 1);
    assert!(!h.client.status().is_reconnecting);
}

#[tokio::test(start_paused = true)]
async fn connect_while_open_refreshes_instead_of_reopening() {
    let h = harness();
    connected(&h).await;

    h.client.connect().unwrap();
    flush().await;
    assert_eq!(h.connector.opened(), 1);
    assert_eq!(h.connector.link(0).sent_types(), vec!["get_online_users"]);
}

#[tokio::test(start_paused = true)]
async fn connect_while_connecting_or_reconnecting_is_a_no_op() {
    let h = harness();
    h.client.connect().unwrap();
    h.client.connect().unwrap();
    flush().await;
    assert_eq!(h.connector.opened(), 1);

    h.connector.link(0).open();
    h.connector.link(0).close(1006, "");
    flush().await;
    h.client.connect().unwrap();
    flush().await;
    assert_eq!(h.connector.opened(), 1, "retry is already scheduled");

    advance(1_000).await;
    assert_eq!(h.connector.opened(), 2);
}

#[tokio::test(start_paused = true)]
async fn server_error_frames_keep_the_channel_open() {
    let mut h = harness();
    connected(&h).await;
    drain(&mut h.events);

    h.connector.link(0).message(r#"{"type":"error","message":"rate limited"}"#);
    flush().await;

    let status = h.client.status();
    assert!(status.is_connected);
    assert_eq!(status.error.as_deref(), Some("rate limited"));
    assert!(drain(&mut h.events).contains(&PresenceEvent::ServerError("rate limited".into())));
}

#[tokio::test(start_paused = true)]
async fn task_updates_are_published_and_received() {
    let mut h = harness();
    connected(&h).await;
    drain(&mut h.events);
    let link = h.connector.link(0);

    h.client
        .publish_task_update(TaskAction::Started, json!({"id": 9, "title": "Read"}))
        .unwrap();
    flush().await;
    assert_eq!(
        link.sent(),
        vec![json!({"type": "task_update", "action": "started", "task": {"id": 9, "title": "Read"}})]
    );

    link.message(json!({"type": "task_update", "action": "completed", "task": {"id": 9}, "sender_id": 4}).to_string());
    flush().await;
    assert!(drain(&mut h.events)
        .iter()
        .any(|e| matches!(e, PresenceEvent::TaskCompleted(a) if a.sender_id == 4)));
}

#[tokio::test(start_paused = true)]
async fn second_manager_adopts_the_open_link() {
    let registry = LinkRegistry::new();
    let connector = MockConnector::default();
    let a = build(
        StaticToken::new("aaa"),
        MemoryPreferences::default(),
        connector.clone(),
        registry.clone(),
        None,
    );
    let b = build(
        StaticToken::new("bbb"),
        MemoryPreferences::default(),
        connector.clone(),
        registry.clone(),
        None,
    );
    connected(&a).await;

    for _ in 0..3 {
        b.client.connect().unwrap();
        flush().await;
    }
    assert_eq!(connector.opened(), 1, "only one socket ever exists");
    assert!(b.client.is_connected());
    let link = connector.link(0);
    assert_eq!(link.sent_types(), vec!["get_online_users"; 3]);

    link.message(snapshot(&[1, 2]));
    flush().await;
    assert_eq!(a.client.presence().count(), 2);
    assert_eq!(b.client.presence().count(), 2);

    b.client.disconnect().unwrap();
    flush().await;
    assert!(link.commands().is_empty(), "an adopter never closes the owner's link");
    assert!(a.client.is_connected());
    assert_eq!(b.client.presence().count(), 0);
    assert_eq!(a.client.presence().count(), 2);
}

#[tokio::test(start_paused = true)]
async fn follower_adopts_once_the_owner_opens() {
    let registry = LinkRegistry::new();
    let connector = MockConnector::default();
    let a = build(
        StaticToken::new("aaa"),
        MemoryPreferences::default(),
        connector.clone(),
        registry.clone(),
        None,
    );
    let b = build(
        StaticToken::new("bbb"),
        MemoryPreferences::default(),
        connector.clone(),
        registry.clone(),
        None,
    );

    a.client.connect().unwrap();
    flush().await;
    b.client.connect().unwrap();
    flush().await;
    assert_eq!(connector.opened(), 1);
    assert_eq!(b.client.status().state, ConnectionState::Connecting);

    connector.link(0).open();
    flush().await;
    assert!(b.client.is_connected());
    assert_eq!(connector.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn adopter_follows_the_owner_through_a_reconnect() {
    let registry = LinkRegistry::new();
    let connector = MockConnector::default();
    let a = build(
        StaticToken::new("aaa"),
        MemoryPreferences::default(),
        connector.clone(),
        registry.clone(),
        None,
    );
    let b = build(
        StaticToken::new("bbb"),
        MemoryPreferences::default(),
        connector.clone(),
        registry.clone(),
        None,
    );
    connected(&a).await;
    b.client.connect().unwrap();
    flush().await;
    assert!(b.client.is_connected());

    connector.link(0).close(1006, "");
    flush().await;
    assert!(!b.client.is_connected());
    assert!(b.client.status().is_reconnecting);

    // Both retry after the base delay; the owner reopens and the adopter
    // attaches to that link instead of opening its own.
    advance(1_000).await;
    assert_eq!(connector.opened(), 2);
    connector.link(1).open();
    flush().await;
    assert!(b.client.is_connected());
    assert!(a.client.is_connected());
    assert_eq!(connector.opened(), 2);
}

#[tokio::test(start_paused = true)]
async fn logout_signal_closes_with_logout_reason() {
    let (logout_tx, logout_rx) = broadcast::channel(1);
    let h = build(
        StaticToken::new("abc123"),
        MemoryPreferences::default(),
        MockConnector::default(),
        LinkRegistry::new(),
        Some(logout_rx),
    );
    connected(&h).await;
    h.connector.link(0).message(snapshot(&[1]));
    flush().await;

    logout_tx.send(()).unwrap();
    flush().await;

    assert_eq!(
        h.connector.link(0).commands(),
        vec![TransportCommand::Close {
            code: 1000,
            reason: "user_logout".into()
        }]
    );
    assert_eq!(h.client.presence().count(), 0);
    advance(10_000).await;
    assert_eq!(h.connector.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn cleanup_behaves_like_logout() {
    let h = harness();
    connected(&h).await;
    h.client.cleanup().unwrap();
    flush().await;
    assert_eq!(
        h.connector.link(0).commands(),
        vec![TransportCommand::Close {
            code: 1000,
            reason: "user_logout".into()
        }]
    );
    assert_eq!(h.client.status().state, ConnectionState::Disconnected);
}
