use std::sync::Arc;
use std::time::Duration;

use advisor_api::{AdvisorApi, AdvisorError, InProcApi};
use advisor_scheduler::FirstFitLauncher;
use advisor_sim::{ClusterSnapshot, ScalingAdviceRequest, ScalingConstraint, SimConfig};
use serde_json::json;

fn snapshot() -> ClusterSnapshot {
    serde_json::from_value(json!({
        "nodes": [{ "metadata": { "name": "n1" }, "status": { "allocatable": { "cpu": "1", "memory": "2Gi" } } }],
        "pods": [
            { "metadata": { "name": "bound", "namespace": "default" }, "spec": { "nodeName": "n1", "containers": [{ "name": "c" }] } },
            { "metadata": { "name": "web-1", "namespace": "shop" },
              "spec": { "containers": [{ "name": "c", "resources": { "requests": { "cpu": "2" } } }] } },
            { "metadata": { "name": "web-0", "namespace": "shop" },
              "spec": { "containers": [{ "name": "c", "resources": { "requests": { "cpu": "2" } } }] } }
        ]
    }))
    .unwrap()
}

fn constraint() -> ScalingConstraint {
    serde_json::from_value(json!({
        "nodePools": [{
            "name": "general",
            "region": "eu-west-1",
            "zones": ["a"],
            "nodeTemplates": [{ "name": "std", "instanceType": "m5.xlarge", "capacity": { "cpu": "4", "memory": "16Gi" } }]
        }]
    }))
    .unwrap()
}

fn api() -> InProcApi {
    let cfg = SimConfig { poll_interval: Duration::from_millis(10), max_unchanged_polls: 10, ..SimConfig::default() };
    InProcApi::new(Arc::new(FirstFitLauncher), cfg)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn inspect_counts_objects_and_pending_pods() {
    let summary = api().inspect(snapshot()).await.unwrap();
    let pods = summary.kinds.iter().find(|k| k.kind == "Pod").unwrap();
    let nodes = summary.kinds.iter().find(|k| k.kind == "Node").unwrap();
    assert_eq!((pods.objects, nodes.objects), (3, 1));
    assert_eq!(pods.resource_version, 3);
    assert_eq!(summary.unscheduled, vec!["shop/web-0", "shop/web-1"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plan_assigns_ids_and_streams_advice() {
    let req = ScalingAdviceRequest {
        id: String::new(),
        correlation_id: String::new(),
        constraint: constraint(),
        snapshot: snapshot(),
        mode: Default::default(),
        scoring: Default::default(),
        timeout: None,
    };
    let mut stream = api().plan(req).await.unwrap();
    let resp = tokio::time::timeout(Duration::from_secs(10), stream.rx.recv()).await.unwrap().unwrap().unwrap();
    assert!(uuid_like(&resp.request_id), "{}", resp.request_id);
    assert_eq!(resp.correlation_id, resp.request_id);
    assert_eq!(resp.plan.items.len(), 1);
    assert_eq!(resp.plan.items[0].delta, 1);
    assert!(tokio::time::timeout(Duration::from_secs(10), stream.rx.recv()).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plan_errors_map_to_api_categories() {
    let req = ScalingAdviceRequest {
        id: "bad".into(),
        correlation_id: String::new(),
        constraint: ScalingConstraint::default(),
        snapshot: snapshot(),
        mode: Default::default(),
        scoring: Default::default(),
        timeout: None,
    };
    let mut stream = api().plan(req).await.unwrap();
    let item = tokio::time::timeout(Duration::from_secs(5), stream.rx.recv()).await.unwrap().unwrap();
    assert!(matches!(item, Err(AdvisorError::Validation(_))), "{:?}", item);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_ends_the_stream_with_a_cancelled_error() {
    let req = ScalingAdviceRequest {
        id: "stop".into(),
        correlation_id: String::new(),
        constraint: constraint(),
        snapshot: snapshot(),
        mode: Default::default(),
        scoring: Default::default(),
        timeout: None,
    };
    let stream = api().plan(req).await.unwrap();
    let token = stream.cancel.token();
    let mut rx = stream.rx;
    stream.cancel.cancel();
    assert!(token.is_cancelled());
    let items = tokio::time::timeout(Duration::from_secs(5), async {
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    })
    .await
    .expect("stream did not close after cancel");
    assert_eq!(items.iter().filter(|i| i.is_err()).count(), 1, "{:?}", items);
    assert!(matches!(items.last(), Some(Err(AdvisorError::Cancelled(_)))), "{:?}", items);
}

fn uuid_like(s: &str) -> bool {
    s.len() == 36 && s.chars().filter(|c| *c == '-').count() == 4
}
