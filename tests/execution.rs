//! End-to-end command execution against an in-memory server.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{Behavior, MockServer};
use lodestar::prelude::*;
use lodestar::{
    CommandFailedEvent, CommandListener, CommandStartedEvent, CommandSucceededEvent, ServerDescription,
    ServerRole, StaticTopology, WireProtocol,
};
use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};

fn address() -> ServerAddress {
    ServerAddress::new("mock", 27017)
}

fn client_with(mock: &MockServer, config: ClientConfig) -> Client {
    Client::builder()
        .config(config)
        .connector(Arc::new(mock.clone()))
        .build()
        .unwrap()
}

fn direct_config() -> lodestar::ClientConfigBuilder {
    ClientConfig::builder()
        .host(address())
        .server_selection_timeout(Duration::from_millis(200))
}

#[tokio::test]
async fn test_ping_end_to_end() {
    let mock = MockServer::ok();
    let client = client_with(&mock, direct_config().build().unwrap());

    client.ping().await.unwrap();

    let seen = mock.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].op_code, 2013);
    assert_eq!(seen[0].command, doc! { "ping" => 1, "$db" => "admin" });

    let status = client.pool_status(&address()).unwrap();
    assert_eq!(status.idle, 1);
    assert_eq!(status.in_use, 0);
    assert_eq!(status.total_created, 1);
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct BuildInfo {
    version: String,
    ok: f64,
}

#[tokio::test]
async fn test_typed_result_uses_derived_serializer() {
    let mock = MockServer::new(|_, cmd| {
        assert_eq!(cmd.first_key(), Some("buildInfo"));
        Behavior::Reply(doc! { "version" => "7.0.2", "ok" => 1.0 })
    });
    let client = client_with(&mock, direct_config().build().unwrap());
    assert!(!client.registry().contains::<BuildInfo>());

    let operation = CommandOperation::<BuildInfo>::command("admin", doc! { "buildInfo" => 1 });
    let info = client.execute(&operation).await.unwrap();
    assert_eq!(
        info,
        BuildInfo {
            version: "7.0.2".into(),
            ok: 1.0
        }
    );
    assert!(client.registry().contains::<BuildInfo>());
}

#[tokio::test]
async fn test_response_to_mismatch_discards_channel() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mock = {
        let calls = Arc::clone(&calls);
        MockServer::new(move |_, _| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Behavior::WrongResponseTo(doc! { "ok" => 1.0 })
            } else {
                Behavior::Reply(doc! { "ok" => 1.0 })
            }
        })
    };
    let client = client_with(&mock, direct_config().build().unwrap());

    let err = client.ping().await.unwrap_err();
    assert!(matches!(err, DriverError::Protocol(_)));
    let status = client.pool_status(&address()).unwrap();
    assert_eq!(status.idle, 0);
    assert_eq!(status.in_use, 0);

    client.ping().await.unwrap();
    assert_eq!(mock.connects(), 2);
}

#[tokio::test]
async fn test_command_error_keeps_channel() {
    let mock = MockServer::new(|_, _| {
        Behavior::Reply(doc! {
            "ok" => 0.0,
            "errmsg" => "no such command: 'frobnicate'",
            "code" => 59,
            "codeName" => "CommandNotFound",
        })
    });
    let client = client_with(&mock, direct_config().build().unwrap());

    let err = client
        .run_command("admin", doc! { "frobnicate" => 1 })
        .await
        .unwrap_err();
    match &err {
        DriverError::Command {
            code,
            code_name,
            reply,
            ..
        } => {
            assert_eq!(*code, 59);
            assert_eq!(code_name, "CommandNotFound");
            assert_eq!(reply.get_str("errmsg"), Some("no such command: 'frobnicate'"));
        }
        other => panic!("expected command error, got {:?}", other),
    }

    let status = client.pool_status(&address()).unwrap();
    assert_eq!(status.idle, 1);
    assert_eq!(status.total_created, 1);
}

#[tokio::test]
async fn test_operation_timeout_discards_channel() {
    let mock = MockServer::new(|_, _| Behavior::Hang);
    let client = client_with(&mock, direct_config().build().unwrap());

    let operation = CommandOperation::<CommandResult>::command("admin", doc! { "sleep" => 1 })
        .with_timeout(Duration::from_millis(50));
    let err = client.execute(&operation).await.unwrap_err();
    assert!(err.is_timeout());

    let status = client.pool_status(&address()).unwrap();
    assert_eq!(status.idle, 0);
    assert_eq!(status.in_use, 0);
}

#[tokio::test]
async fn test_socket_timeout_discards_channel() {
    let mock = MockServer::new(|_, _| Behavior::Hang);
    let config = direct_config()
        .socket_timeout(Duration::from_millis(30))
        .build()
        .unwrap();
    let client = client_with(&mock, config);

    let err = client.ping().await.unwrap_err();
    assert!(matches!(err, DriverError::Timeout { what: "socket", .. }));
    assert_eq!(client.pool_status(&address()).unwrap().idle, 0);
}

#[tokio::test]
async fn test_legacy_query_exchange() {
    let mock = MockServer::new(|_, cmd| {
        if cmd.contains_key("bad") {
            Behavior::QueryFailure(doc! { "$err" => "bad query", "code" => 2 })
        } else {
            Behavior::Reply(doc! { "ismaster" => true, "ok" => 1 })
        }
    });
    let config = direct_config()
        .wire_protocol(WireProtocol::LegacyQuery)
        .build()
        .unwrap();
    let client = client_with(&mock, config);

    let reply = client
        .run_command_with("admin", doc! { "isMaster" => 1 }, ReadPreference::primary_preferred())
        .await
        .unwrap();
    assert!(reply.ok());
    assert_eq!(reply.document().get_bool("ismaster"), Some(true));

    let seen = mock.seen();
    assert_eq!(seen[0].op_code, 2004);
    assert_eq!(seen[0].namespace.as_deref(), Some("admin.$cmd"));
    assert_eq!(seen[0].flags & 4, 4);
    assert_eq!(seen[0].command, doc! { "isMaster" => 1 });

    let err = client
        .run_command("admin", doc! { "bad" => 1 })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(2));
    assert_eq!(mock.seen()[1].flags & 4, 0);
    assert_eq!(client.pool_status(&address()).unwrap().total_created, 1);
}

fn replica_set() -> TopologySnapshot {
    TopologySnapshot::new(vec![
        ServerDescription::new(ServerAddress::new("primary", 1), ServerRole::Primary)
            .with_round_trip_time(Duration::from_millis(2)),
        ServerDescription::new(ServerAddress::new("secondary", 2), ServerRole::Secondary)
            .with_round_trip_time(Duration::from_millis(3))
            .with_tags(TagSet::new().with("dc", "east")),
        ServerDescription::new(ServerAddress::new("arbiter", 3), ServerRole::Arbiter),
    ])
}

#[tokio::test]
async fn test_read_preference_routes_to_secondary() {
    let mock = MockServer::ok();
    let client = Client::builder()
        .topology(Arc::new(StaticTopology::new(replica_set())))
        .connector(Arc::new(mock.clone()))
        .build()
        .unwrap();

    client.ping().await.unwrap();
    let pref = ReadPreference::secondary().with_tag_sets(vec![TagSet::new().with("dc", "east")]);
    client
        .run_command_with("app", doc! { "count" => "users" }, pref)
        .await
        .unwrap();

    let seen = mock.seen();
    assert_eq!(seen[0].address.host, "primary");
    assert!(!seen[0].command.contains_key("$readPreference"));
    assert_eq!(seen[1].address.host, "secondary");
    assert_eq!(
        seen[1].command.get_document("$readPreference"),
        Some(&doc! { "mode" => "secondary", "tags" => vec![Bson::Document(doc! { "dc" => "east" })] })
    );
}

#[tokio::test]
async fn test_selection_waits_for_topology_change() {
    let mock = MockServer::ok();
    let watch = Arc::new(TopologyWatch::new(TopologySnapshot::new(vec![])));
    let config = ClientConfig::builder()
        .server_selection_timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let client = Client::builder()
        .config(config)
        .topology(watch.clone())
        .connector(Arc::new(mock.clone()))
        .build()
        .unwrap();

    let publisher = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        watch.publish(replica_set());
    });
    client.ping().await.unwrap();
    publisher.await.unwrap();
    assert_eq!(mock.seen()[0].address.host, "primary");
}

#[tokio::test]
async fn test_concurrent_commands_respect_pool_size() {
    let mock = MockServer::ok();
    let config = direct_config()
        .pool(PoolOptions::new().max_pool_size(2))
        .build()
        .unwrap();
    let client = client_with(&mock, config);

    let pings = (0..16).map(|_| {
        let client = client.clone();
        async move { client.ping().await }
    });
    for result in futures::future::join_all(pings).await {
        result.unwrap();
    }

    assert!(mock.connects() <= 2);
    let status = client.pool_status(&address()).unwrap();
    assert_eq!(status.in_use, 0);
    assert!(status.idle <= 2);
}

#[derive(Debug, Default)]
struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl CommandListener for RecordingListener {
    fn started(&self, event: &CommandStartedEvent<'_>) {
        self.events
            .lock()
            .unwrap()
            .push(format!("started {} on {}", event.command_name, event.address));
    }

    fn succeeded(&self, event: &CommandSucceededEvent<'_>) {
        self.events
            .lock()
            .unwrap()
            .push(format!("succeeded {}", event.command_name));
    }

    fn failed(&self, event: &CommandFailedEvent<'_>) {
        self.events.lock().unwrap().push(format!(
            "failed {} code={:?}",
            event.command_name,
            event.error.code()
        ));
    }
}

#[tokio::test]
async fn test_listener_sees_each_exchange() {
    let mock = MockServer::new(|_, cmd| {
        if cmd.first_key() == Some("ping") {
            Behavior::Reply(doc! { "ok" => 1.0 })
        } else {
            Behavior::Reply(doc! { "ok" => 0.0, "code" => 59, "errmsg" => "nope" })
        }
    });
    let listener = Arc::new(RecordingListener::default());
    let client = Client::builder()
        .config(direct_config().build().unwrap())
        .connector(Arc::new(mock))
        .listener(listener.clone())
        .build()
        .unwrap();

    client.ping().await.unwrap();
    client
        .run_command("admin", doc! { "frobnicate" => 1 })
        .await
        .unwrap_err();

    assert_eq!(
        *listener.events.lock().unwrap(),
        vec![
            "started ping on mock:27017".to_string(),
            "succeeded ping".to_string(),
            "started frobnicate on mock:27017".to_string(),
            "failed frobnicate code=Some(59)".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_listener_sees_failure_when_operation_times_out() {
    let mock = MockServer::new(|_, _| Behavior::Hang);
    let listener = Arc::new(RecordingListener::default());
    let client = Client::builder()
        .config(direct_config().build().unwrap())
        .connector(Arc::new(mock))
        .listener(listener.clone())
        .build()
        .unwrap();

    let operation = CommandOperation::<CommandResult>::command("admin", doc! { "sleep" => 1 })
        .with_timeout(Duration::from_millis(50));
    let err = client.execute(&operation).await.unwrap_err();
    assert!(matches!(err, DriverError::Timeout { what: "operation", .. }));
    assert!(!err.is_retryable_by_caller());

    assert_eq!(
        *listener.events.lock().unwrap(),
        vec![
            "started sleep on mock:27017".to_string(),
            "failed sleep code=None".to_string(),
        ]
    );
    let status = client.pool_status(&address()).unwrap();
    assert_eq!(status.idle, 0);
    assert_eq!(status.in_use, 0);
}

#[tokio::test]
async fn test_operation_timeout_bounds_selection() {
    let mock = MockServer::ok();
    let listener = Arc::new(RecordingListener::default());
    let config = ClientConfig::builder()
        .server_selection_timeout(Duration::from_secs(30))
        .build()
        .unwrap();
    let client = Client::builder()
        .config(config)
        .topology(Arc::new(TopologyWatch::new(TopologySnapshot::new(vec![]))))
        .connector(Arc::new(mock.clone()))
        .listener(listener.clone())
        .build()
        .unwrap();

    let operation = CommandOperation::<CommandResult>::command("admin", doc! { "ping" => 1 })
        .with_timeout(Duration::from_millis(30));
    let err = client.execute(&operation).await.unwrap_err();
    assert!(matches!(err, DriverError::Timeout { what: "operation", .. }));
    assert!(listener.events.lock().unwrap().is_empty());
    assert_eq!(mock.connects(), 0);
}

#[tokio::test]
async fn test_missing_database_is_configuration_error() {
    let mock = MockServer::ok();
    let client = client_with(&mock, direct_config().build().unwrap());
    let operation = CommandOperation::<CommandResult>::new().with_command(doc! { "ping" => 1 });
    let err = client.execute(&operation).await.unwrap_err();
    assert!(matches!(err, DriverError::Configuration(_)));
    assert_eq!(mock.connects(), 0);
}
