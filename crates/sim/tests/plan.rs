use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use advisor_core::ObjectKey;
use advisor_scheduler::{FirstFitLauncher, LaunchParams, SchedulerError, SchedulerHandle, SchedulerLauncher};
use advisor_sim::{
    create_simulation_groups, AdviceGenerationMode, ClusterSnapshot, NodePool, PlanStream, ScalingAdviceRequest,
    ScalingAdviceResponse, ScalingConstraint, ScoringStrategy, SimConfig, SimGroupKey, SimResult, SimulationArgs,
    Simulator, StaticPricing,
};
use k8s_openapi::api::core::v1::{Node, Pod};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn pool(name: &str, priority: i32, quota: Option<u32>, templates: serde_json::Value) -> NodePool {
    serde_json::from_value(json!({
        "name": name,
        "priority": priority,
        "region": "eu-west-1",
        "zones": ["a"],
        "quota": quota,
        "nodeTemplates": templates,
    }))
    .unwrap()
}

fn template(name: &str, priority: i32, instance_type: &str, cpu: &str) -> serde_json::Value {
    json!({ "name": name, "priority": priority, "instanceType": instance_type, "capacity": { "cpu": cpu, "memory": "8Gi" } })
}

fn pod(name: &str, cpu: &str) -> Pod {
    serde_json::from_value(json!({
        "metadata": { "name": name, "namespace": "default" },
        "spec": { "containers": [{ "name": "c", "resources": { "requests": { "cpu": cpu, "memory": "256Mi" } } }] }
    }))
    .unwrap()
}

fn request(id: &str, pools: Vec<NodePool>, nodes: Vec<Node>, pods: Vec<Pod>, mode: AdviceGenerationMode) -> ScalingAdviceRequest {
    ScalingAdviceRequest {
        id: id.into(),
        correlation_id: format!("{}-corr", id),
        constraint: ScalingConstraint { node_pools: pools },
        snapshot: ClusterSnapshot { nodes, pods, ..ClusterSnapshot::default() },
        mode,
        scoring: ScoringStrategy::LeastWaste,
        timeout: None,
    }
}

fn config() -> SimConfig {
    SimConfig { poll_interval: Duration::from_millis(10), max_unchanged_polls: 10, ..SimConfig::default() }
}

async fn drain(mut rx: PlanStream) -> Vec<SimResult<ScalingAdviceResponse>> {
    let mut out = Vec::new();
    while let Some(item) = tokio::time::timeout(Duration::from_secs(20), rx.recv()).await.expect("plan stream stalled") {
        out.push(item);
    }
    out
}

/// Counts launches and delegates to first-fit.
#[derive(Default)]
struct CountingLauncher {
    launches: AtomicUsize,
}

#[async_trait::async_trait]
impl SchedulerLauncher for CountingLauncher {
    async fn launch(&self, cancel: &CancellationToken, params: LaunchParams) -> Result<SchedulerHandle, SchedulerError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        FirstFitLauncher.launch(cancel, params).await
    }
}

/// A scheduler that never binds anything.
struct IdleLauncher;

#[async_trait::async_trait]
impl SchedulerLauncher for IdleLauncher {
    async fn launch(&self, cancel: &CancellationToken, params: LaunchParams) -> Result<SchedulerHandle, SchedulerError> {
        let token = cancel.child_token();
        let wait = token.clone();
        let task = tokio::spawn(async move { wait.cancelled().await });
        Ok(SchedulerHandle::new(&params.name, token, task))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_pod_single_node() {
    let req = request(
        "one",
        vec![pool("general", 1, None, json!([template("std", 0, "m5.large", "2")]))],
        vec![],
        vec![pod("web-0", "500m")],
        AdviceGenerationMode::Incremental,
    );
    let out = drain(Simulator::new(Arc::new(FirstFitLauncher), config()).plan(req, CancellationToken::new())).await;
    assert_eq!(out.len(), 1);
    let resp = out[0].as_ref().unwrap();
    assert_eq!(resp.request_id, "one");
    assert_eq!(resp.correlation_id, "one-corr");
    assert_eq!(resp.plan.items.len(), 1);
    let item = &resp.plan.items[0];
    assert_eq!(item.placement.node_pool_name, "general");
    assert_eq!(item.placement.node_template_name, "std");
    assert_eq!(item.placement.zone, "a");
    assert_eq!((item.current_replicas, item.delta), (0, 1));
    assert!(resp.plan.unsatisfied_pods.is_empty());
    assert_eq!(resp.diagnostics[0].passes, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn demand_beyond_one_node_takes_several_passes() {
    // Only one 1500m pod fits a 2-core node.
    let pods = (0..3).map(|i| pod(&format!("batch-{}", i), "1500m")).collect();
    let req = request(
        "many",
        vec![pool("general", 1, None, json!([template("std", 0, "m5.large", "2")]))],
        vec![],
        pods,
        AdviceGenerationMode::AllAtOnce,
    );
    let out = drain(Simulator::new(Arc::new(FirstFitLauncher), config()).plan(req, CancellationToken::new())).await;
    assert_eq!(out.len(), 1);
    let resp = out[0].as_ref().unwrap();
    assert_eq!(resp.plan.items.len(), 1);
    assert_eq!(resp.plan.items[0].delta, 3);
    assert!(resp.plan.unsatisfied_pods.is_empty());
    assert_eq!(resp.diagnostics[0].passes, 3);
    assert_eq!(resp.diagnostics[0].winners, vec!["general_std_a"; 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nothing_pending_fails_validation_without_simulating() {
    let mut bound = pod("bound", "100m");
    if let Some(spec) = bound.spec.as_mut() {
        spec.node_name = Some("existing".into());
    }
    let req = request(
        "idle",
        vec![pool("general", 1, None, json!([template("std", 0, "m5.large", "2")]))],
        vec![],
        vec![bound],
        AdviceGenerationMode::Incremental,
    );
    let launcher = Arc::new(CountingLauncher::default());
    let out = drain(Simulator::new(launcher.clone(), config()).plan(req, CancellationToken::new())).await;
    assert_eq!(out.len(), 1);
    let err = out[0].as_ref().unwrap_err();
    assert_eq!(err.category(), "validation");
    assert!(err.to_string().contains("idle"), "{}", err);
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pods_that_fit_nowhere_yield_no_advice() {
    let req = request(
        "huge",
        vec![pool("general", 1, None, json!([template("std", 0, "m5.large", "2")]))],
        vec![],
        vec![pod("huge", "16")],
        AdviceGenerationMode::Incremental,
    );
    let out = drain(Simulator::new(Arc::new(FirstFitLauncher), config()).plan(req, CancellationToken::new())).await;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].as_ref().unwrap_err().category(), "no_scaling_advice");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leftover_pods_are_reported_unsatisfied() {
    let req = request(
        "mixed",
        vec![pool("general", 1, None, json!([template("std", 0, "m5.large", "2")]))],
        vec![],
        vec![pod("small", "500m"), pod("huge", "16")],
        AdviceGenerationMode::AllAtOnce,
    );
    let out = drain(Simulator::new(Arc::new(FirstFitLauncher), config()).plan(req, CancellationToken::new())).await;
    let resp = out[0].as_ref().unwrap();
    assert_eq!(resp.plan.items[0].delta, 1);
    assert_eq!(resp.plan.unsatisfied_pods, vec![ObjectKey::new("default", "huge")]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_mid_group_ends_the_stream_promptly() {
    let cfg = SimConfig { poll_interval: Duration::from_millis(10), max_unchanged_polls: 10_000, ..SimConfig::default() };
    let req = request(
        "stuck",
        vec![pool("general", 1, None, json!([template("std", 0, "m5.large", "2"), template("big", 0, "m5.xlarge", "4")]))],
        vec![],
        vec![pod("web-0", "500m")],
        AdviceGenerationMode::Incremental,
    );
    let cancel = CancellationToken::new();
    let mut rx = Simulator::new(Arc::new(IdleLauncher), cfg).plan(req, cancel.clone());
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.expect("no prompt termination");
    assert_eq!(first.unwrap().unwrap_err().category(), "cancelled");
    assert!(tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_timeout_surfaces_as_timeout() {
    let cfg = SimConfig { poll_interval: Duration::from_millis(10), max_unchanged_polls: 10_000, ..SimConfig::default() };
    let mut req = request(
        "slow",
        vec![pool("general", 1, None, json!([template("std", 0, "m5.large", "2")]))],
        vec![],
        vec![pod("web-0", "500m")],
        AdviceGenerationMode::Incremental,
    );
    req.timeout = Some(Duration::from_millis(150));
    let out = drain(Simulator::new(Arc::new(IdleLauncher), cfg).plan(req, CancellationToken::new())).await;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].as_ref().unwrap_err().category(), "timeout");
}

#[test]
fn groups_run_in_priority_order() {
    let constraint = ScalingConstraint {
        node_pools: vec![
            pool("late", 2, None, json!([template("b", 1, "m5.large", "2"), template("a", 0, "m5.large", "2")])),
            pool("early", 1, None, json!([template("x", 5, "m5.large", "2")])),
            pool("tied", 2, None, json!([template("c", 0, "c5.large", "2")])),
        ],
    };
    let args = SimulationArgs {
        launcher: Arc::new(FirstFitLauncher),
        run_counter: Arc::default(),
        poll_interval: Duration::from_millis(10),
        max_unchanged_polls: 3,
    };
    let groups = create_simulation_groups(&constraint, &args);
    let keys: Vec<SimGroupKey> = groups.iter().map(|g| g.key()).collect();
    assert_eq!(
        keys,
        vec![
            SimGroupKey { pool_priority: 1, template_priority: 5 },
            SimGroupKey { pool_priority: 2, template_priority: 0 },
            SimGroupKey { pool_priority: 2, template_priority: 1 },
        ]
    );
    let mut names: Vec<&str> = groups[1].simulations().iter().map(|s| s.name()).collect();
    names.sort();
    assert_eq!(names, vec!["late_a_a", "tied_c_a"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn higher_precedence_pool_wins_first() {
    let req = request(
        "order",
        vec![
            pool("spot", 2, None, json!([template("std", 0, "m5.large", "2")])),
            pool("reserved", 1, None, json!([template("std", 0, "m5.large", "2")])),
        ],
        vec![],
        vec![pod("web-0", "500m")],
        AdviceGenerationMode::AllAtOnce,
    );
    let out = drain(Simulator::new(Arc::new(FirstFitLauncher), config()).plan(req, CancellationToken::new())).await;
    let resp = out[0].as_ref().unwrap();
    assert_eq!(resp.plan.items.len(), 1);
    assert_eq!(resp.plan.items[0].placement.node_pool_name, "reserved");
    assert_eq!(resp.diagnostics.len(), 1);
}

fn existing_node(name: &str, pool: &str) -> Node {
    serde_json::from_value(json!({
        "metadata": {
            "name": name,
            "labels": {
                "node.advisor.io/pool": pool,
                "node.advisor.io/template": "std",
                "node.kubernetes.io/instance-type": "m5.large",
                "topology.kubernetes.io/region": "eu-west-1",
                "topology.kubernetes.io/zone": "a"
            }
        },
        "status": { "allocatable": { "cpu": "100m", "memory": "1Gi", "pods": "110" } }
    }))
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pool_quota_caps_winners_and_spills_to_next_group() {
    let pods = (0..3).map(|i| pod(&format!("job-{}", i), "1500m")).collect();
    let req = request(
        "quota",
        vec![
            pool("capped", 1, Some(2), json!([template("std", 0, "m5.large", "2")])),
            pool("overflow", 2, None, json!([template("std", 0, "m5.large", "2")])),
        ],
        vec![existing_node("capped-0", "capped")],
        pods,
        AdviceGenerationMode::AllAtOnce,
    );
    let out = drain(Simulator::new(Arc::new(FirstFitLauncher), config()).plan(req, CancellationToken::new())).await;
    assert_eq!(out.len(), 1);
    let resp = out[0].as_ref().unwrap();
    let items: Vec<(&str, i32, i32)> = resp
        .plan
        .items
        .iter()
        .map(|i| (i.placement.node_pool_name.as_str(), i.current_replicas, i.delta))
        .collect();
    assert_eq!(items, vec![("capped", 1, 1), ("overflow", 0, 2)]);
    assert_eq!(resp.diagnostics[0].winners.len(), 1);
    assert_eq!(resp.diagnostics[0].skipped_at_quota, vec!["capped_std_a".to_string()]);
    assert!(resp.plan.unsatisfied_pods.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn incremental_mode_emits_a_fragment_per_group() {
    let pods = vec![pod("job-0", "1500m"), pod("job-1", "1500m")];
    let pools = vec![
        pool("first", 1, Some(1), json!([template("std", 0, "m5.large", "2")])),
        pool("second", 2, None, json!([template("std", 0, "m5.large", "2")])),
    ];

    let req = request("inc", pools.clone(), vec![], pods.clone(), AdviceGenerationMode::Incremental);
    let out = drain(Simulator::new(Arc::new(FirstFitLauncher), config()).plan(req, CancellationToken::new())).await;
    assert_eq!(out.len(), 2);
    let first = out[0].as_ref().unwrap();
    let second = out[1].as_ref().unwrap();
    assert_eq!(first.plan.items.len(), 1);
    assert_eq!(first.plan.items[0].placement.node_pool_name, "first");
    assert_eq!(first.plan.unsatisfied_pods.len(), 1);
    assert_eq!(second.plan.items.len(), 1);
    assert_eq!(second.plan.items[0].placement.node_pool_name, "second");
    assert!(second.plan.unsatisfied_pods.is_empty());
    assert_eq!(second.diagnostics.len(), 2);

    let req = request("all", pools, vec![], pods, AdviceGenerationMode::AllAtOnce);
    let out = drain(Simulator::new(Arc::new(FirstFitLauncher), config()).plan(req, CancellationToken::new())).await;
    assert_eq!(out.len(), 1);
    let resp = out[0].as_ref().unwrap();
    assert_eq!(resp.plan.items.len(), 2);
    assert!(resp.plan.unsatisfied_pods.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scoring_strategy_changes_the_winner() {
    let pools = vec![pool(
        "general",
        1,
        None,
        json!([template("small", 0, "m5.large", "2"), template("large", 0, "m5.2xlarge", "8")]),
    )];
    let pods = vec![pod("web-0", "500m")];

    let req = request("waste", pools.clone(), vec![], pods.clone(), AdviceGenerationMode::AllAtOnce);
    let out = drain(Simulator::new(Arc::new(FirstFitLauncher), config()).plan(req, CancellationToken::new())).await;
    assert_eq!(out[0].as_ref().unwrap().plan.items[0].placement.node_template_name, "small");

    let pricing = StaticPricing::from_json(
        r#"[{"region":"eu-west-1","instanceType":"m5.large","hourlyPrice":0.10},
            {"region":"eu-west-1","instanceType":"m5.2xlarge","hourlyPrice":0.05}]"#,
    )
    .unwrap();
    let mut req = request("cost", pools, vec![], pods, AdviceGenerationMode::AllAtOnce);
    req.scoring = ScoringStrategy::LeastCost;
    let sim = Simulator::new(Arc::new(FirstFitLauncher), config()).with_pricing(Arc::new(pricing));
    let out = drain(sim.plan(req, CancellationToken::new())).await;
    assert_eq!(out[0].as_ref().unwrap().plan.items[0].placement.node_template_name, "large");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn least_cost_without_pricing_is_rejected() {
    let mut req = request(
        "nopricing",
        vec![pool("general", 1, None, json!([template("std", 0, "m5.large", "2")]))],
        vec![],
        vec![pod("web-0", "500m")],
        AdviceGenerationMode::AllAtOnce,
    );
    req.scoring = ScoringStrategy::LeastCost;
    let out = drain(Simulator::new(Arc::new(FirstFitLauncher), config()).plan(req, CancellationToken::new())).await;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].as_ref().unwrap_err().category(), "validation");
}

/// Never binds; records how many instances run at the same time.
#[derive(Default)]
struct PeakLauncher {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl SchedulerLauncher for PeakLauncher {
    async fn launch(&self, cancel: &CancellationToken, params: LaunchParams) -> Result<SchedulerHandle, SchedulerError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let token = cancel.child_token();
        let wait = token.clone();
        let active = Arc::clone(&self.active);
        let task = tokio::spawn(async move {
            wait.cancelled().await;
            active.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(SchedulerHandle::new(&params.name, token, task))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduler_bound_holds_across_concurrent_requests() {
    let launcher = Arc::new(PeakLauncher::default());
    let cfg = SimConfig { max_parallel_simulations: 1, ..config() };
    let sim = Simulator::new(launcher.clone(), cfg);
    let req = |id: &str| {
        request(
            id,
            vec![pool("general", 1, None, json!([template("std", 0, "m5.large", "2"), template("big", 0, "m5.xlarge", "4")]))],
            vec![],
            vec![pod("web-0", "500m")],
            AdviceGenerationMode::AllAtOnce,
        )
    };
    let (a, b) = tokio::join!(
        drain(sim.plan(req("left"), CancellationToken::new())),
        drain(sim.plan(req("right"), CancellationToken::new()))
    );
    for out in [a, b] {
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref().unwrap_err().category(), "no_scaling_advice");
    }
    assert_eq!(launcher.peak.load(Ordering::SeqCst), 1);
    assert_eq!(launcher.active.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminating_pods_alone_fail_validation() {
    let mut leaving = pod("leaving", "100m");
    leaving.metadata.deletion_timestamp = serde_json::from_value(json!("2024-01-01T00:00:00Z")).unwrap();
    let req = request(
        "draining",
        vec![pool("general", 1, None, json!([template("std", 0, "m5.large", "2")]))],
        vec![],
        vec![leaving],
        AdviceGenerationMode::Incremental,
    );
    let launcher = Arc::new(CountingLauncher::default());
    let out = drain(Simulator::new(launcher.clone(), config()).plan(req, CancellationToken::new())).await;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].as_ref().unwrap_err().category(), "validation");
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
}
