use std::sync::Arc;

use advisor_core::{MatchCriteria, Object, ObjectKey, ObjectKind};
use advisor_view::{View, ViewAccess, ViewConfig};
use serde_json::json;

fn node(name: &str) -> Object {
    Object::from_value(ObjectKind::Node, json!({ "metadata": { "name": name } })).unwrap()
}

fn pod(name: &str) -> Object {
    Object::from_value(ObjectKind::Pod, json!({ "metadata": { "name": name, "namespace": "ns" } })).unwrap()
}

async fn count(view: &View, kind: ObjectKind) -> usize {
    view.list_objects(kind, &MatchCriteria::all()).await.items.len()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sandbox_is_a_point_in_time_copy() {
    let access = ViewAccess::new("base", ViewConfig::default());
    let base = access.base_view();
    base.create_object(node("n1")).await.unwrap();
    base.create_object(pod("p1")).await.unwrap();

    let sb = access.sandbox_over("sb-1", &base).await.unwrap();
    assert_eq!(count(&sb, ObjectKind::Node).await, 1);
    assert_eq!(count(&sb, ObjectKind::Pod).await, 1);
    // Versions continue from the delegate's counter.
    assert_eq!(sb.store(ObjectKind::Node).version().await, base.store(ObjectKind::Node).version().await);

    base.create_object(node("n2")).await.unwrap();
    sb.delete_object(ObjectKind::Pod, &ObjectKey::new("ns", "p1")).await.unwrap();
    assert_eq!(count(&sb, ObjectKind::Node).await, 1);
    assert_eq!(count(&base, ObjectKind::Pod).await, 1);
    assert_eq!(count(&base, ObjectKind::Node).await, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sandbox_and_delegate_stay_isolated_under_concurrent_writes() {
    let access = ViewAccess::new("base", ViewConfig::default());
    let base = access.base_view();
    for i in 0..10 {
        base.create_object(node(&format!("seed-{}", i))).await.unwrap();
    }
    let sb = access.sandbox_over("sb", &base).await.unwrap();

    let b = Arc::clone(&base);
    let s = Arc::clone(&sb);
    let writer_base = tokio::spawn(async move {
        for i in 0..50 {
            b.create_object(node(&format!("base-{}", i))).await.unwrap();
        }
    });
    let writer_sb = tokio::spawn(async move {
        for i in 0..30 {
            s.create_object(node(&format!("sb-{}", i))).await.unwrap();
        }
        s.delete_object(ObjectKind::Node, &ObjectKey::cluster("seed-0")).await.unwrap();
    });
    writer_base.await.unwrap();
    writer_sb.await.unwrap();

    assert_eq!(count(&base, ObjectKind::Node).await, 60);
    assert_eq!(count(&sb, ObjectKind::Node).await, 39);
    assert!(base.get_object(ObjectKind::Node, &ObjectKey::cluster("seed-0")).await.is_ok());
    assert!(base.get_object(ObjectKind::Node, &ObjectKey::cluster("sb-0")).await.unwrap_err().is_not_found());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_requests_for_one_name_share_a_view() {
    let access = Arc::new(ViewAccess::new("base", ViewConfig::default()));
    let base = access.base_view();
    base.create_object(node("n1")).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let access = Arc::clone(&access);
        let base = Arc::clone(&base);
        tasks.push(tokio::spawn(async move { access.sandbox_over("shared", &base).await.unwrap() }));
    }
    let mut views = Vec::new();
    for t in tasks {
        views.push(t.await.unwrap());
    }
    assert!(views.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(access.sandbox_count(), 1);

    assert!(access.discard("shared"));
    assert!(access.cached("shared").is_none());
    let fresh = access.sandbox_over("shared", &base).await.unwrap();
    assert!(!Arc::ptr_eq(&fresh, &views[0]));
}

#[tokio::test]
async fn sandboxes_can_stack_and_be_discarded_by_prefix() {
    let access = ViewAccess::new("base", ViewConfig::default());
    let base = access.base_view();
    base.create_object(node("n1")).await.unwrap();
    let first = access.sandbox_over("req-1/pass-1/a", &base).await.unwrap();
    first.create_object(node("won")).await.unwrap();
    let second = access.sandbox_over("req-1/pass-2/a", &first).await.unwrap();
    assert_eq!(count(&second, ObjectKind::Node).await, 2);
    access.sandbox_over("req-2/pass-1/a", &base).await.unwrap();

    assert_eq!(access.discard_prefixed("req-1/"), 2);
    assert_eq!(access.sandbox_count(), 1);
}
