//! End-to-end tests against a real `buxtond` event loop, driven through
//! `libbuxton` over a temp-directory UNIX socket.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use buxton_core::model::{Key, Label, Layer, LayerKind, Value};
use buxton_services::memory::MemoryBackend;
use buxton_services::{AccessRules, BackendModule, BackendRegistry, Resolver};
use buxtond::client::ClientTable;
use libbuxton::{BuxtonClient, ClientError};

fn layer(name: &str, kind: LayerKind, priority: u32) -> Layer {
    Layer {
        name: name.to_string(),
        kind,
        backend_id: "memory".to_string(),
        priority,
        description: String::new(),
        owning_uid: None,
    }
}

/// Spawns a real `buxtond` event loop against a temp-dir socket, with the
/// root-privilege check on system layers disabled — invariant 4 is already
/// covered directly against `Resolver` in `buxton-services`' unit tests,
/// and a real connecting test process has no control over its own uid.
async fn start_daemon(layers: Vec<Layer>) -> (tempfile::TempDir, PathBuf, tokio::task::JoinHandle<()>) {
    unsafe {
        std::env::set_var(buxton_core::ROOT_CHECK_ENV, "0");
    }

    let mut registry = BackendRegistry::new();
    registry.register(
        "memory",
        Box::new(|| Ok(Arc::new(MemoryBackend::new()) as Arc<dyn BackendModule>)),
    );
    let resolver = Arc::new(Resolver::new(layers, registry, AccessRules::empty()));
    let clients = Arc::new(ClientTable::new());

    let tmp = tempfile::tempdir().unwrap();
    let socket_path = tmp.path().join("buxton.sock");
    let run_path = socket_path.clone();
    let handle = tokio::spawn(async move {
        let _ = buxtond::server::run(&run_path, resolver, clients).await;
    });

    // Give the listener a moment to bind before clients connect.
    tokio::time::sleep(Duration::from_millis(50)).await;
    (tmp, socket_path, handle)
}

#[tokio::test]
async fn set_then_get_round_trips_over_the_wire() {
    let (_tmp, socket_path, daemon) = start_daemon(vec![layer("base", LayerKind::System, 10)]).await;
    let client = BuxtonClient::open(&socket_path).await.unwrap();

    let group_key = Key::new(Some("base".into()), "net".into(), None).unwrap();
    client.create_group(&group_key).await.unwrap();
    let key = Key::new(Some("base".into()), "net".into(), Some("mtu".into())).unwrap();
    client.set(&key, Value::Int32(1500)).await.unwrap();

    let (value, label) = client.get(&key).await.unwrap();
    assert_eq!(value, Value::Int32(1500));
    assert_eq!(label.as_str(), "_");

    daemon.abort();
}

#[tokio::test]
async fn cross_layer_get_prefers_the_higher_priority_layer() {
    let (_tmp, socket_path, daemon) = start_daemon(vec![
        layer("low", LayerKind::System, 1),
        layer("high", LayerKind::System, 100),
    ])
    .await;
    let client = BuxtonClient::open(&socket_path).await.unwrap();

    let low_group = Key::new(Some("low".into()), "net".into(), None).unwrap();
    let high_group = Key::new(Some("high".into()), "net".into(), None).unwrap();
    client.create_group(&low_group).await.unwrap();
    client.create_group(&high_group).await.unwrap();
    let low_key = Key::new(Some("low".into()), "net".into(), Some("mtu".into())).unwrap();
    let high_key = Key::new(Some("high".into()), "net".into(), Some("mtu".into())).unwrap();
    client.set(&low_key, Value::Int32(1)).await.unwrap();
    client.set(&high_key, Value::Int32(2)).await.unwrap();

    let lookup = Key::new(None, "net".into(), Some("mtu".into())).unwrap();
    let (value, _) = client.get(&lookup).await.unwrap();
    assert_eq!(value, Value::Int32(2));

    daemon.abort();
}

#[tokio::test]
async fn unset_then_get_reports_not_found() {
    let (_tmp, socket_path, daemon) = start_daemon(vec![layer("base", LayerKind::System, 10)]).await;
    let client = BuxtonClient::open(&socket_path).await.unwrap();

    let group_key = Key::new(Some("base".into()), "net".into(), None).unwrap();
    client.create_group(&group_key).await.unwrap();
    let key = Key::new(Some("base".into()), "net".into(), Some("mtu".into())).unwrap();
    client.set(&key, Value::Int32(1500)).await.unwrap();
    client.unset(&key).await.unwrap();

    let err = client.get(&key).await.unwrap_err();
    assert!(matches!(err, ClientError::Status(_)));

    daemon.abort();
}

#[tokio::test]
async fn create_group_then_remove_group_clears_children() {
    let (_tmp, socket_path, daemon) = start_daemon(vec![layer("base", LayerKind::System, 10)]).await;
    let client = BuxtonClient::open(&socket_path).await.unwrap();

    let group_key = Key::new(Some("base".into()), "net".into(), None).unwrap();
    let child_key = Key::new(Some("base".into()), "net".into(), Some("mtu".into())).unwrap();

    client.create_group(&group_key).await.unwrap();
    assert!(matches!(
        client.create_group(&group_key).await.unwrap_err(),
        ClientError::Status(_)
    ));

    client.set(&child_key, Value::Int32(1500)).await.unwrap();
    client.remove_group(&group_key).await.unwrap();

    assert!(client.get(&child_key).await.is_err());

    daemon.abort();
}

#[tokio::test]
async fn set_label_changes_the_stored_label() {
    let (_tmp, socket_path, daemon) = start_daemon(vec![layer("base", LayerKind::System, 10)]).await;
    let client = BuxtonClient::open(&socket_path).await.unwrap();

    let group_key = Key::new(Some("base".into()), "net".into(), None).unwrap();
    client.create_group(&group_key).await.unwrap();
    let key = Key::new(Some("base".into()), "net".into(), Some("mtu".into())).unwrap();
    client.set(&key, Value::Int32(1500)).await.unwrap();
    client.set_label(&key, &Label::new("app.net").unwrap()).await.unwrap();

    let (_, label) = client.get(&key).await.unwrap();
    assert_eq!(label.as_str(), "app.net");

    daemon.abort();
}

#[tokio::test]
async fn list_keys_reports_every_stored_entry() {
    let (_tmp, socket_path, daemon) = start_daemon(vec![layer("base", LayerKind::System, 10)]).await;
    let client = BuxtonClient::open(&socket_path).await.unwrap();

    let group_key = Key::new(Some("base".into()), "net".into(), None).unwrap();
    client.create_group(&group_key).await.unwrap();
    let mtu = Key::new(Some("base".into()), "net".into(), Some("mtu".into())).unwrap();
    let host = Key::new(Some("base".into()), "net".into(), Some("hostname".into())).unwrap();
    client.set(&mtu, Value::Int32(1500)).await.unwrap();
    client.set(&host, Value::String("box".into())).await.unwrap();

    let mut keys = client.list("base").await.unwrap();
    keys.sort();
    assert_eq!(
        keys,
        vec!["net".to_string(), "net/hostname".to_string(), "net/mtu".to_string()]
    );

    daemon.abort();
}

#[tokio::test]
async fn subscriber_receives_changed_then_stops_after_unnotify() {
    let (_tmp, socket_path, daemon) = start_daemon(vec![layer("base", LayerKind::System, 10)]).await;
    let client = BuxtonClient::open(&socket_path).await.unwrap();

    let group_key = Key::new(Some("base".into()), "net".into(), None).unwrap();
    client.create_group(&group_key).await.unwrap();
    let key = Key::new(Some("base".into()), "net".into(), Some("mtu".into())).unwrap();
    let (subscription_id, mut events) = client.notify(&key).await.unwrap();

    client.set(&key, Value::Int32(1500)).await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("changed event within timeout")
        .expect("channel open");
    assert_eq!(event.group, "net");
    assert_eq!(event.name.as_deref(), Some("mtu"));
    assert_eq!(event.value, Some(Value::Int32(1500)));

    client.unnotify(subscription_id).await.unwrap();
    client.set(&key, Value::Int32(9000)).await.unwrap();
    let result = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
    assert!(result.is_err(), "no further events expected after unnotify");

    daemon.abort();
}

#[tokio::test]
async fn group_subscriber_sees_child_key_mutations() {
    let (_tmp, socket_path, daemon) = start_daemon(vec![layer("base", LayerKind::System, 10)]).await;
    let client = BuxtonClient::open(&socket_path).await.unwrap();

    let group_key = Key::new(Some("base".into()), "net".into(), None).unwrap();
    let child_key = Key::new(Some("base".into()), "net".into(), Some("mtu".into())).unwrap();
    client.create_group(&group_key).await.unwrap();
    let (_id, mut events) = client.notify(&group_key).await.unwrap();

    client.set(&child_key, Value::Int32(1500)).await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("changed event within timeout")
        .expect("channel open");
    assert_eq!(event.name.as_deref(), Some("mtu"));

    daemon.abort();
}
