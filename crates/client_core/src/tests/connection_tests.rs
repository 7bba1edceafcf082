use super::*;
use crate::{
    credentials::CredentialStore,
    registry::handler,
    test_support::{eventually, ScriptedConnector},
};
use std::sync::atomic::{AtomicUsize, Ordering};

struct Persisted(Credentials);

impl CredentialStore for Persisted {
    fn load(&self) -> Option<Credentials> {
        Some(self.0.clone())
    }
}

fn manager_with(
    connector: Arc<ScriptedConnector>,
    credentials: CredentialCell,
) -> (Arc<ConnectionManager>, Arc<EventRegistry>) {
    let registry = Arc::new(EventRegistry::new());
    let manager = Arc::new(ConnectionManager::new(
        connector,
        Arc::new(credentials),
        Arc::clone(&registry),
        Duration::from_millis(10),
    ));
    (manager, registry)
}

fn manager(connector: Arc<ScriptedConnector>) -> (Arc<ConnectionManager>, Arc<EventRegistry>) {
    manager_with(connector, CredentialCell::without_persistence())
}

fn record_states(manager: &ConnectionManager) -> Arc<Mutex<Vec<ConnectionState>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    manager.observe_state(Arc::new(move |state| {
        sink.lock().expect("states").push(state);
    }));
    seen
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_connection() {
    let (connector, mut servers) = ScriptedConnector::new();
    let (manager, _registry) = manager(Arc::clone(&connector));

    let callers: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.ensure_connection(Some("tok"), Some("u1")) })
        })
        .collect();
    for caller in callers {
        caller.await.expect("caller");
    }

    let _server = servers.recv().await.expect("connection");
    assert!(eventually(|| manager.state() == ConnectionState::Connected).await);
    manager.ensure_connection(Some("tok"), Some("u1"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn lost_link_reconnects_after_delay() {
    let (connector, mut servers) = ScriptedConnector::new();
    let (manager, _registry) = manager(Arc::clone(&connector));
    let states = record_states(&manager);

    manager.ensure_connection(Some("tok"), Some("u1"));
    let first = servers.recv().await.expect("first connection");
    assert!(eventually(|| manager.state() == ConnectionState::Connected).await);

    drop(first);
    let _second = servers.recv().await.expect("second connection");
    assert!(eventually(|| states.lock().expect("states").len() == 4).await);
    assert_eq!(
        *states.lock().expect("states"),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Connected,
        ]
    );
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn events_reach_registered_listeners() {
    let (connector, mut servers) = ScriptedConnector::new();
    let (manager, registry) = manager(connector);
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    registry.add_listener(
        "GroupUpdated",
        handler(move |payload| {
            assert_eq!(payload["groupId"], "g1");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );

    manager.ensure_connection(Some("tok"), Some("u1"));
    let server = servers.recv().await.expect("connection");
    server.push("GroupUpdated", serde_json::json!({ "groupId": "g1" }));
    server.push("SomethingElse", Value::Null);

    assert!(eventually(|| hits.load(Ordering::SeqCst) == 1).await);
}

#[tokio::test]
async fn missing_credentials_never_connect() {
    let (connector, _servers) = ScriptedConnector::new();
    let (manager, _registry) = manager(Arc::clone(&connector));

    manager.ensure_connection(None, Some("u1"));
    manager.ensure_connection(Some("tok"), None);
    manager.ensure_connection(Some("  "), Some("u1"));
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(connector.connects(), 0);
}

#[tokio::test]
async fn signing_out_closes_the_connection() {
    let (connector, mut servers) = ScriptedConnector::new();
    let (manager, _registry) = manager(Arc::clone(&connector));

    manager.ensure_connection(Some("tok"), Some("u1"));
    let mut server = servers.recv().await.expect("connection");
    assert!(eventually(|| manager.state() == ConnectionState::Connected).await);

    manager.ensure_connection(None, None);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(server.invocations.recv().await.is_none());
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn new_credentials_replace_the_connection() {
    let (connector, mut servers) = ScriptedConnector::new();
    let (manager, _registry) = manager(Arc::clone(&connector));

    manager.ensure_connection(Some("tok-a"), Some("u1"));
    let mut first = servers.recv().await.expect("first");
    manager.ensure_connection(Some("tok-b"), Some("u2"));
    let _second = servers.recv().await.expect("second");

    assert!(first.invocations.recv().await.is_none());
    assert!(eventually(|| manager.state() == ConnectionState::Connected).await);
    assert_eq!(connector.tokens(), vec!["tok-a", "tok-b"]);
}

#[tokio::test]
async fn rejected_token_falls_back_to_persisted_one() {
    let (connector, mut servers) = ScriptedConnector::new();
    connector.fail_next(HubConnectError::Unauthorized);
    let persisted = Credentials::from_parts(Some("fresh"), Some("u1")).expect("credentials");
    let (manager, _registry) = manager_with(
        Arc::clone(&connector),
        CredentialCell::new(Arc::new(Persisted(persisted))),
    );

    manager.ensure_connection(Some("stale"), Some("u1"));
    let _server = servers.recv().await.expect("reconnected");

    assert!(eventually(|| manager.state() == ConnectionState::Connected).await);
    assert_eq!(connector.tokens(), vec!["stale", "fresh"]);
}

#[tokio::test]
async fn remounting_with_a_rejected_token_keeps_the_fallback_connection() {
    let (connector, mut servers) = ScriptedConnector::new();
    connector.fail_next(HubConnectError::Unauthorized);
    let persisted = Credentials::from_parts(Some("fresh"), Some("u1")).expect("credentials");
    let (manager, _registry) = manager_with(
        Arc::clone(&connector),
        CredentialCell::new(Arc::new(Persisted(persisted))),
    );
    manager.ensure_connection(Some("stale"), Some("u1"));
    let mut server = servers.recv().await.expect("fallback connection");
    assert!(eventually(|| manager.state() == ConnectionState::Connected).await);

    manager.ensure_connection(Some("stale"), Some("u1"));
    manager.ensure_connection(Some("stale"), Some("u1"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(connector.connects(), 2);
    assert_eq!(connector.tokens(), vec!["stale", "fresh"]);
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(manager.join_group(&GroupId::new("g1")));
    assert!(server.invocations.recv().await.is_some());
}

#[tokio::test]
async fn transport_failures_keep_retrying() {
    let (connector, mut servers) = ScriptedConnector::new();
    connector.fail_next(HubConnectError::Transport("refused".into()));
    connector.fail_next(HubConnectError::Transport("refused".into()));
    let (manager, _registry) = manager(Arc::clone(&connector));
    let states = record_states(&manager);

    manager.ensure_connection(Some("tok"), Some("u1"));
    let _server = servers.recv().await.expect("third attempt");
    assert!(eventually(|| manager.state() == ConnectionState::Connected).await);

    assert_eq!(connector.connects(), 3);
    assert_eq!(
        *states.lock().expect("states"),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Reconnecting,
            ConnectionState::Connected,
        ]
    );
}

#[tokio::test]
async fn invocations_require_a_live_connection() {
    let (connector, mut servers) = ScriptedConnector::new();
    let (manager, _registry) = manager(connector);
    let group = GroupId::new("g1");

    assert!(!manager.join_group(&group));

    manager.ensure_connection(Some("tok"), Some("u1"));
    let mut server = servers.recv().await.expect("connection");
    assert!(eventually(|| manager.state() == ConnectionState::Connected).await);

    assert!(manager.join_group(&group));
    assert!(manager.leave_group(&group));
    assert_eq!(
        server.invocations.recv().await,
        Some(HubMessage::invocation(hub_methods::JOIN_GROUP, vec![json!("g1")]))
    );
    assert_eq!(
        server.invocations.recv().await,
        Some(HubMessage::invocation(hub_methods::LEAVE_GROUP, vec![json!("g1")]))
    );
}

#[tokio::test]
async fn panicking_observer_does_not_block_others() {
    let (connector, _servers) = ScriptedConnector::new();
    let (manager, _registry) = manager(connector);
    manager.observe_state(Arc::new(|_| panic!("observer bug")));
    let states = record_states(&manager);
    let mut watched = manager.watch_state();

    manager.ensure_connection(Some("tok"), Some("u1"));

    assert_eq!(states.lock().expect("states")[0], ConnectionState::Connecting);
    assert!(watched.has_changed().expect("sender alive"));
    assert_eq!(*watched.borrow_and_update(), ConnectionState::Connecting);
}
