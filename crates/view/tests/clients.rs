use std::time::Duration;

use advisor_core::{MatchCriteria, Object, ObjectKey, ObjectKind, StoreError, WatchEventType};
use advisor_view::{ClientMode, PatchKind, View, ViewConfig, WatchOptions};
use k8s_openapi::api::core::v1::Binding;
use serde_json::json;

fn pod(name: &str) -> Object {
    Object::from_value(
        ObjectKind::Pod,
        json!({ "metadata": { "name": name, "namespace": "ns" }, "spec": { "containers": [{ "name": "c" }] } }),
    )
    .unwrap()
}

async fn exercise(mode: ClientMode) {
    let view = View::new("t", ViewConfig::default());
    let client = view.client(mode);
    assert_eq!(client.mode(), mode);
    assert_eq!(client.view_name(), "t");

    let created = client.create(pod("a")).await.unwrap();
    assert_eq!(created.resource_version(), 1);
    let key = ObjectKey::new("ns", "a");
    assert_eq!(client.get(ObjectKind::Pod, &key).await.unwrap(), created);

    let err = client.create(pod("a")).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists { .. }), "{:?}: {}", mode, err);

    let patched = client
        .patch(ObjectKind::Pod, &key, PatchKind::Merge, &json!({ "metadata": { "labels": { "app": "web" } } }))
        .await
        .unwrap();
    assert_eq!(patched.label("app"), Some("web"));

    let status = client
        .patch_status(ObjectKind::Pod, &key, PatchKind::Merge, &json!({ "status": { "phase": "Pending" } }))
        .await
        .unwrap();
    assert_eq!(status.as_pod().and_then(|p| p.status.as_ref()).and_then(|s| s.phase.as_deref()), Some("Pending"));

    // Stale resourceVersion.
    let err = client.update(created.clone()).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)), "{:?}: {}", mode, err);

    let binding: Binding = serde_json::from_value(json!({
        "metadata": { "name": "a", "namespace": "ns" },
        "target": { "kind": "Node", "name": "n1" }
    }))
    .unwrap();
    client.bind(&binding).await.unwrap();
    let bound = client.get(ObjectKind::Pod, &key).await.unwrap();
    assert_eq!(bound.as_pod().and_then(|p| p.spec.as_ref()).and_then(|s| s.node_name.as_deref()), Some("n1"));

    let list = client.list(ObjectKind::Pod, &MatchCriteria::in_namespace("ns")).await.unwrap();
    assert_eq!(list.items.len(), 1);
    assert_eq!(list.resource_version, bound.resource_version());

    client.delete(ObjectKind::Pod, &key).await.unwrap();
    assert!(client.get(ObjectKind::Pod, &key).await.unwrap_err().is_not_found());
    assert!(client.delete(ObjectKind::Pod, &key).await.unwrap_err().is_not_found());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn in_process_client_round_trip() {
    exercise(ClientMode::InProcess).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wire_client_round_trip() {
    exercise(ClientMode::Wire).await;
}

async fn watch_follows(mode: ClientMode) {
    let view = View::new("t", ViewConfig::default());
    let client = view.client(mode);
    client.create(pod("a")).await.unwrap();

    let mut stream = client.watch(ObjectKind::Pod, WatchOptions::default()).await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(2), stream.next()).await.unwrap().unwrap();
    assert_eq!(first.event_type, WatchEventType::Added);
    assert_eq!(first.object.key().name, "a");

    client.delete(ObjectKind::Pod, &ObjectKey::new("ns", "a")).await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(2), stream.next()).await.unwrap().unwrap();
    assert_eq!(second.event_type, WatchEventType::Deleted);
    assert!(second.object.meta().deletion_timestamp.is_some());

    stream.guard.cancel();
    let end = tokio::time::timeout(Duration::from_secs(2), stream.next()).await.unwrap();
    assert!(end.is_none(), "stream must close after cancel");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn in_process_watch_stream() {
    watch_follows(ClientMode::InProcess).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wire_watch_stream() {
    watch_follows(ClientMode::Wire).await;
}
