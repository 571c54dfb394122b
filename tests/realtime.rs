mod common;

use common::*;
use portal_link::auth::SessionHandle;
use portal_link::domain_model::*;
use portal_link::domain_port::ConnMessage;
use portal_link::realtime::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, sleep};

use ConnectionState::*;

fn config() -> RealtimeConfig {
    RealtimeConfig::new("ws://portal.test/ws")
}

async fn manager_with(
    config: RealtimeConfig,
) -> (
    ConnectionManager,
    Arc<ChannelConnector>,
    mpsc::UnboundedReceiver<ServerEnd>,
    SessionHandle,
) {
    let (connector, ends) = ChannelConnector::new();
    let session = signed_in("T1", "R1").await;
    let manager = ConnectionManager::new(config, connector.clone(), session.clone());
    (manager, connector, ends, session)
}

async fn reach(manager: &ConnectionManager, state: ConnectionState) {
    manager
        .subscribe_state()
        .wait_for(|s| *s == state)
        .await
        .expect("manager alive");
}

async fn drain(rx: &mut broadcast::Receiver<ConnectionState>, n: usize) -> Vec<ConnectionState> {
    let mut seen = Vec::with_capacity(n);
    for _ in 0..n {
        seen.push(rx.recv().await.expect("transition"));
    }
    seen
}

#[tokio::test(start_paused = true)]
async fn unreachable_server_spends_the_budget_then_errors() {
    let (connector, _ends) = ChannelConnector::refusing();
    let session = signed_in("T1", "R1").await;
    let manager = ConnectionManager::new(
        config().with_max_reconnect_attempts(5),
        connector.clone(),
        session,
    );
    let start = Instant::now();

    manager.connect().await.unwrap();
    reach(&manager, Error).await;

    // the first open plus five reconnect attempts
    assert_eq!(connector.opens(), 6);
    assert_eq!(manager.reconnect_attempts(), 5);
    assert!(start.elapsed() >= 5 * DEFAULT_RECONNECT_INTERVAL);

    sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.opens(), 6);
    assert_eq!(manager.state(), Error);
}

#[tokio::test(start_paused = true)]
async fn unexpected_close_reconnects_after_the_interval() {
    let (manager, _connector, mut ends, _session) = manager_with(config()).await;
    let mut transitions = manager.subscribe_transitions();

    manager.connect().await.unwrap();
    let first = ends.recv().await.unwrap();
    assert_eq!(drain(&mut transitions, 2).await, vec![Connecting, Connected]);

    let dropped_at = Instant::now();
    drop(first);

    assert_eq!(
        drain(&mut transitions, 3).await,
        vec![Reconnecting, Connecting, Connected]
    );
    assert!(dropped_at.elapsed() >= DEFAULT_RECONNECT_INTERVAL);
    assert!(ends.recv().await.is_some());
}

#[tokio::test(start_paused = true)]
async fn attempt_counter_restarts_after_a_successful_connect() {
    let (manager, connector, mut ends, _session) =
        manager_with(config().with_max_reconnect_attempts(5)).await;

    manager.connect().await.unwrap();
    let first = ends.recv().await.unwrap();
    reach(&manager, Connected).await;

    drop(first);
    let second = ends.recv().await.unwrap();
    reach(&manager, Connected).await;
    assert_eq!(manager.reconnect_attempts(), 0);
    assert_eq!(connector.opens(), 2);

    connector.set_refuse(true);
    drop(second);
    reach(&manager, Error).await;

    // a full fresh budget was available for the second outage
    assert_eq!(connector.opens(), 2 + 5);
    assert_eq!(manager.reconnect_attempts(), 5);
}

#[tokio::test(start_paused = true)]
async fn handshake_carries_the_session_token() {
    let (manager, connector, mut ends, _session) = manager_with(config()).await;

    manager.connect().await.unwrap();
    let end = ends.recv().await.unwrap();

    assert_eq!(end.url, "ws://portal.test/ws?token=T1");
    assert_eq!(connector.urls(), vec![end.url.clone()]);
}

#[tokio::test(start_paused = true)]
async fn connect_is_a_noop_while_active() {
    let (manager, connector, mut ends, _session) = manager_with(config()).await;

    manager.connect().await.unwrap();
    let _end = ends.recv().await.unwrap();
    reach(&manager, Connected).await;
    manager.connect().await.unwrap();
    sleep(Duration::from_secs(1)).await;

    assert_eq!(connector.opens(), 1);
    assert_eq!(manager.state(), Connected);
}

#[tokio::test(start_paused = true)]
async fn connect_needs_a_session_and_a_live_manager() {
    let (connector, _ends) = ChannelConnector::new();
    let manager = ConnectionManager::new(config(), connector.clone(), SessionHandle::in_memory());
    assert_eq!(manager.connect().await, Err(RealtimeError::NoSession));
    assert_eq!(connector.opens(), 0);

    let (manager, _connector, _ends, _session) = manager_with(config()).await;
    manager.dispose().await;
    assert_eq!(manager.connect().await, Err(RealtimeError::Disposed));

    let (manager, _connector, _ends, _session) =
        manager_with(RealtimeConfig::new("not a url")).await;
    assert!(matches!(
        manager.connect().await,
        Err(RealtimeError::InvalidUrl(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn heartbeat_pings_on_the_interval_and_keeps_the_channel() {
    let (manager, _connector, mut ends, _session) = manager_with(config()).await;

    manager.connect().await.unwrap();
    let mut end = ends.recv().await.unwrap();
    let connected_at = Instant::now();

    let ping: serde_json::Value = serde_json::from_str(&end.next_text().await.unwrap()).unwrap();
    assert_eq!(ping["type"], "ping");
    assert!(connected_at.elapsed() >= DEFAULT_HEARTBEAT_INTERVAL);

    // unanswered pings are fine under the keep-alive policy
    sleep(Duration::from_secs(120)).await;
    assert_eq!(manager.state(), Connected);
}

#[tokio::test(start_paused = true)]
async fn zero_heartbeat_interval_disables_pings() {
    let (manager, connector, mut ends, _session) =
        manager_with(config().with_heartbeat_interval(Duration::ZERO)).await;

    manager.connect().await.unwrap();
    let mut end = ends.recv().await.unwrap();
    reach(&manager, Connected).await;

    sleep(Duration::from_secs(60)).await;
    assert!(end.from_client.try_recv().is_err());
    assert_eq!(manager.state(), Connected);
    assert_eq!(connector.opens(), 1);

    // the session loop is still pumping
    assert!(manager.send(&json!({"type": "subscribe", "data": "orders"})));
    let sent: serde_json::Value = serde_json::from_str(&end.next_text().await.unwrap()).unwrap();
    assert_eq!(sent["type"], "subscribe");

    manager.disconnect().await;
    assert_eq!(end.from_client.recv().await, Some(ConnMessage::Close));
}

#[tokio::test(start_paused = true)]
async fn missed_pong_drops_the_channel_when_configured() {
    let policy = HeartbeatPolicy::ReconnectOnMissedPong {
        timeout: Duration::from_secs(10),
    };
    let (manager, connector, mut ends, _session) =
        manager_with(config().with_heartbeat_policy(policy)).await;
    let mut transitions = manager.subscribe_transitions();

    manager.connect().await.unwrap();
    let mut end = ends.recv().await.unwrap();
    assert_eq!(drain(&mut transitions, 2).await, vec![Connecting, Connected]);

    // answered once, the channel survives the deadline
    end.next_text().await.unwrap();
    end.push(r#"{"type":"pong"}"#).await;
    sleep(Duration::from_secs(15)).await;
    assert_eq!(manager.state(), Connected);

    // ignored the next time, it is dropped and reopened
    end.next_text().await.unwrap();
    assert_eq!(drain(&mut transitions, 1).await, vec![Reconnecting]);
    assert!(ends.recv().await.is_some());
    assert_eq!(connector.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn transport_pings_are_answered() {
    let (manager, _connector, mut ends, _session) = manager_with(config()).await;

    manager.connect().await.unwrap();
    let mut end = ends.recv().await.unwrap();
    end.to_client.send(ConnMessage::Ping).await.unwrap();

    assert_eq!(end.from_client.recv().await, Some(ConnMessage::Pong));
}

#[tokio::test(start_paused = true)]
async fn inbound_messages_reach_their_handlers() {
    let (manager, _connector, mut ends, _session) = manager_with(config()).await;
    let store = Arc::new(NotificationStore::new());
    store.install(manager.router());
    let mut feed = store.subscribe();

    let (orders_tx, mut orders) = mpsc::unbounded_channel();
    manager.router().on("order_update", move |m: &RealtimeMessage| {
        let _ = orders_tx.send(m.data.clone());
    });

    manager.connect().await.unwrap();
    let end = ends.recv().await.unwrap();
    end.push(r#"{"type":"mystery","data":{}}"#).await;
    end.push("{ not json").await;
    end.push(r#"{"type":"pong"}"#).await;
    end.push(
        r#"{"type":"notification","data":{"type":"success","title":"Settled","message":"Batch 42 paid out"}}"#,
    )
    .await;
    end.push(r#"{"type":"order_update","data":{"order_id":"o-9","status":"paid"},"timestamp":"2024-05-01T10:00:00Z"}"#)
        .await;

    let first = feed.recv().await.unwrap();
    assert_eq!(first.level, NotificationLevel::Success);
    assert_eq!(first.title, "Settled");

    let second = feed.recv().await.unwrap();
    assert_eq!(second.title, "ORDER UPDATE");
    assert_eq!(orders.recv().await.unwrap()["order_id"], "o-9");

    assert_eq!(store.len(), 2);
    assert_eq!(manager.state(), Connected);
}

#[tokio::test(start_paused = true)]
async fn send_requires_an_open_channel() {
    let (manager, _connector, mut ends, _session) = manager_with(config()).await;
    let subscribe = json!({"type": "subscribe", "data": {"channel": "orders"}});
    assert!(!manager.send(&subscribe));

    manager.connect().await.unwrap();
    let mut end = ends.recv().await.unwrap();
    reach(&manager, Connected).await;

    assert!(manager.send(&subscribe));
    let sent: serde_json::Value = serde_json::from_str(&end.next_text().await.unwrap()).unwrap();
    assert_eq!(sent, subscribe);
}

#[tokio::test(start_paused = true)]
async fn intentional_disconnect_closes_without_reconnecting() {
    let (manager, connector, mut ends, _session) = manager_with(config()).await;

    manager.connect().await.unwrap();
    let mut end = ends.recv().await.unwrap();
    reach(&manager, Connected).await;

    manager.disconnect().await;
    assert_eq!(manager.state(), Disconnected);
    assert_eq!(end.from_client.recv().await, Some(ConnMessage::Close));

    sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.opens(), 1);
    assert_eq!(manager.state(), Disconnected);
}

#[tokio::test(start_paused = true)]
async fn clearing_the_session_stops_reconnects() {
    let (manager, connector, mut ends, session) = manager_with(config()).await;

    manager.connect().await.unwrap();
    let first = ends.recv().await.unwrap();
    reach(&manager, Connected).await;

    // the drop and the logout race; neither may lead to a new channel
    drop(first);
    assert!(session.clear().await);
    reach(&manager, Disconnected).await;

    sleep(Duration::from_secs(60)).await;
    assert_eq!(manager.state(), Disconnected);
    assert_eq!(connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn rotated_token_reopens_the_channel_quietly() {
    let (manager, _connector, mut ends, session) = manager_with(config()).await;
    let mut notices = manager.subscribe_notices();

    manager.connect().await.unwrap();
    let first = ends.recv().await.unwrap();
    assert!(first.url.ends_with("token=T1"));
    reach(&manager, Connected).await;
    assert_eq!(notices.recv().await.unwrap(), ConnectionNotice::Connected);

    let mut transitions = manager.subscribe_transitions();
    session
        .replace_tokens(AccessToken("T2".into()), RefreshToken("R2".into()))
        .await
        .unwrap();

    let second = ends.recv().await.unwrap();
    assert!(second.url.ends_with("token=T2"));
    assert_eq!(
        drain(&mut transitions, 3).await,
        vec![Disconnected, Connecting, Connected]
    );

    sleep(Duration::from_secs(10)).await;
    assert!(notices.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn status_notices_follow_the_outage() {
    let config = config()
        .with_reconnect_interval(Duration::from_secs(5))
        .with_warning_delay(Duration::from_secs(3));
    let (manager, _connector, mut ends, _session) = manager_with(config).await;
    let mut notices = manager.subscribe_notices();

    manager.connect().await.unwrap();
    let first = ends.recv().await.unwrap();
    assert_eq!(notices.recv().await.unwrap(), ConnectionNotice::Connected);

    drop(first);
    assert_eq!(
        notices.recv().await.unwrap(),
        ConnectionNotice::ReconnectingWarning
    );
    assert_eq!(
        notices.recv().await.unwrap(),
        ConnectionNotice::ReconnectingCleared
    );
    reach(&manager, Connected).await;

    // a reconnect is not a fresh connect
    sleep(Duration::from_secs(1)).await;
    assert!(notices.try_recv().is_err());
}
