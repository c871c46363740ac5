/// Connection lifecycle tests
/// Status reporting, health monitoring and subscription hygiene

extern crate chatsync_core;

use chatsync_core::event::SyncEvent;
use chatsync_core::rest::MemoryBackend;
use chatsync_core::transport::{MemoryTransport, Topic};
use chatsync_core::{
    Config, ConnectionStatus, Conversation, Credential, SessionWatch, SyncCoordinator, SyncError,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn setup() -> (SyncCoordinator, MemoryBackend, MemoryTransport, SessionWatch) {
    setup_with(Config::default())
}

fn setup_with(config: Config) -> (SyncCoordinator, MemoryBackend, MemoryTransport, SessionWatch) {
    let hub = MemoryTransport::new();
    let backend = MemoryBackend::with_transport(hub.clone());
    let session = SessionWatch::new(Some(Credential::new("alice", "token")));
    let coordinator = SyncCoordinator::new(
        config,
        Arc::new(backend.clone()),
        Arc::new(hub.clone()),
        session.clone(),
    );
    (coordinator, backend, hub, session)
}

fn conversation(id: &str, a: &str, b: &str) -> Conversation {
    Conversation {
        id: id.to_string(),
        participant_a: a.to_string(),
        participant_b: b.to_string(),
        participant_a_name: None,
        participant_b_name: None,
        last_message_text: None,
        last_message_at: Utc::now(),
    }
}

async fn wait_connected(coordinator: &SyncCoordinator) {
    while coordinator.connection_status() != ConnectionStatus::Connected {
        sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_status_degrades_and_recovers() {
    // Keep heartbeats out of the scripted failures
    let config = Config {
        health_check_interval: Duration::from_secs(3600),
        ..Config::default()
    };
    let (coordinator, _backend, hub, _session) = setup_with(config);
    coordinator.start().await;
    wait_connected(&coordinator).await;

    let mut events = coordinator.subscribe_events();
    hub.fail_next_subscribes((0..6).map(|_| SyncError::Network("offline".into())));
    hub.drop_topic(&Topic::conversation_list("alice"));

    let mut statuses = Vec::new();
    while statuses.last() != Some(&ConnectionStatus::Connected) {
        if let SyncEvent::StatusChanged { status } = events.recv().await.unwrap() {
            statuses.push(status);
        }
    }
    assert_eq!(
        statuses,
        vec![
            ConnectionStatus::Reconnecting,
            ConnectionStatus::Degraded,
            ConnectionStatus::Connected
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_health_monitor_refreshes_unresponsive_transport() {
    let (coordinator, _backend, hub, _session) = setup();
    coordinator.start().await;
    wait_connected(&coordinator).await;
    let topic = Topic::conversation_list("alice");
    assert_eq!(hub.subscribe_attempts(&topic), 1);

    // First check at 30 s times out at 35 s; the refreshed subscribe hangs
    // until the subscribe timeout
    hub.set_unresponsive(true);
    sleep(Duration::from_secs(40)).await;
    assert_ne!(coordinator.connection_status(), ConnectionStatus::Connected);

    hub.set_unresponsive(false);
    sleep(Duration::from_secs(10)).await;
    assert_eq!(coordinator.connection_status(), ConnectionStatus::Connected);
    assert!(hub.subscribe_attempts(&topic) >= 3);
}

#[tokio::test(start_paused = true)]
async fn test_rapid_switching_leaves_one_subscription() {
    let (coordinator, backend, hub, _session) = setup();
    for id in ["c1", "c2", "c3"] {
        backend.insert_conversation(conversation(id, "alice", "bob"));
    }
    coordinator.start().await;

    let mut selections = Vec::new();
    for id in ["c1", "c2", "c3", "c1", "c2"] {
        let coordinator = coordinator.clone();
        selections.push(tokio::spawn(async move {
            coordinator.select_conversation(id).await
        }));
    }
    let mut loaded = 0;
    for selection in selections {
        if !selection.await.unwrap().unwrap().is_superseded() {
            loaded += 1;
        }
    }
    assert!(loaded >= 1);
    sleep(Duration::from_millis(10)).await;

    let message_topics: Vec<Topic> = hub
        .active_topics()
        .into_iter()
        .filter(|t| t.as_str().starts_with("messages:"))
        .collect();
    assert_eq!(message_topics.len(), 1);
    let owned: Vec<Topic> = coordinator
        .supervisor()
        .topics()
        .into_iter()
        .map(|(topic, _)| topic)
        .filter(|t| t.as_str().starts_with("messages:"))
        .collect();
    assert_eq!(owned, message_topics);
}

#[tokio::test(start_paused = true)]
async fn test_user_change_moves_list_topic() {
    let (coordinator, backend, hub, session) = setup();
    backend.insert_conversation(conversation("c1", "alice", "bob"));
    coordinator.start().await;
    coordinator.list_conversations().await.unwrap();
    assert_eq!(coordinator.conversations().await.len(), 1);

    session.set(Credential::new("bob", "token-b"));
    sleep(Duration::from_millis(10)).await;

    assert_eq!(
        hub.active_topics(),
        vec![Topic::conversation_list("bob")]
    );
    assert!(coordinator.conversations().await.is_empty());

    let list = coordinator.list_conversations().await.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].peer_id, "alice");
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_everything() {
    let (coordinator, backend, hub, _session) = setup();
    backend.insert_conversation(conversation("c1", "alice", "bob"));
    coordinator.start().await;
    coordinator.select_conversation("c1").await.unwrap();
    assert_eq!(hub.active_topics().len(), 2);

    coordinator.shutdown().await;
    assert!(hub.active_topics().is_empty());
}
