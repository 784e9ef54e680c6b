//! One what-if run: add a candidate node to a sandbox view, let the embedded
//! scheduler place pending pods, and record where they landed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeSpec, NodeStatus, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use metrics::{counter, histogram};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use advisor_core::{labels, Object, ObjectKey, ObjectKind};
use advisor_scheduler::{LaunchParams, SchedulerLauncher};
use advisor_view::{assigned_node, ClientMode, RecordedEvent, View, REASON_BINDING, REASON_SCHEDULED};

use crate::error::{SimError, SimResult};
use crate::types::{
    NodePlacement, NodePodAssignment, NodePool, NodeResourceInfo, NodeTemplate, PodResourceInfo, SimGroupKey,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SimulationState {
    #[default]
    Pending,
    Running,
    Success,
    Failure,
}

/// Progress of a simulation, readable from other tasks while it runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimulationStatus {
    pub state: SimulationState,
    pub unscheduled: usize,
    pub assigned: usize,
    pub events: usize,
    pub unchanged_polls: u32,
}

/// Inputs shared by every simulation of one plan request.
#[derive(Clone)]
pub struct SimulationArgs {
    pub launcher: Arc<dyn SchedulerLauncher>,
    /// Source of the numeric suffix in candidate node names.
    pub run_counter: Arc<AtomicU64>,
    pub poll_interval: Duration,
    pub max_unchanged_polls: u32,
}

#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub name: String,
    pub key: SimGroupKey,
    pub placement: NodePlacement,
    pub node: NodeResourceInfo,
    /// Pods the scheduler put on the candidate node.
    pub node_pods: Vec<PodResourceInfo>,
    /// Pods placed on any other node of the view during the run.
    pub other_assignments: Vec<NodePodAssignment>,
    pub leftover: Vec<PodResourceInfo>,
    pub view: Arc<View>,
}

#[derive(Default)]
struct RunState {
    unscheduled: BTreeMap<ObjectKey, PodResourceInfo>,
    assignments: BTreeMap<String, Vec<PodResourceInfo>>,
    events: usize,
    unchanged: u32,
    last_event_version: u64,
}

pub struct Simulation {
    name: String,
    pool: Arc<NodePool>,
    template: NodeTemplate,
    zone: String,
    args: SimulationArgs,
    state: SimulationState,
    run: RunState,
    result: Option<SimulationResult>,
    error: Option<SimError>,
    status: Arc<ArcSwap<SimulationStatus>>,
}

impl Simulation {
    pub fn new(pool: Arc<NodePool>, template: &NodeTemplate, zone: &str, args: SimulationArgs) -> Self {
        Self {
            name: format!("{}_{}_{}", pool.name, template.name, zone),
            pool,
            template: template.clone(),
            zone: zone.to_string(),
            args,
            state: SimulationState::Pending,
            run: RunState::default(),
            result: None,
            error: None,
            status: Arc::new(ArcSwap::from_pointee(SimulationStatus::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &NodePool {
        &self.pool
    }

    pub fn template(&self) -> &NodeTemplate {
        &self.template
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn key(&self) -> SimGroupKey {
        SimGroupKey { pool_priority: self.pool.priority, template_priority: self.template.priority }
    }

    pub fn placement(&self) -> NodePlacement {
        NodePlacement {
            node_pool_name: self.pool.name.clone(),
            node_template_name: self.template.name.clone(),
            instance_type: self.template.instance_type.clone(),
            region: self.pool.region.clone(),
            zone: self.zone.clone(),
        }
    }

    pub fn state(&self) -> SimulationState {
        self.state
    }

    /// Latest published progress.
    pub fn status(&self) -> Arc<SimulationStatus> {
        self.status.load_full()
    }

    /// Handle through which another task can follow progress during `run`.
    pub fn status_handle(&self) -> Arc<ArcSwap<SimulationStatus>> {
        Arc::clone(&self.status)
    }

    fn publish(&self) {
        self.status.store(Arc::new(SimulationStatus {
            state: self.state,
            unscheduled: self.run.unscheduled.len(),
            assigned: self.run.assignments.values().map(Vec::len).sum(),
            events: self.run.events,
            unchanged_polls: self.run.unchanged,
        }));
    }

    /// Back to `Pending` with all run state cleared.
    pub fn reset(&mut self) {
        self.state = SimulationState::Pending;
        self.run = RunState::default();
        self.result = None;
        self.error = None;
        self.publish();
    }

    /// Outcome of the last run.
    pub fn result(&self) -> SimResult<SimulationResult> {
        match self.state {
            SimulationState::Success => self
                .result
                .clone()
                .ok_or_else(|| SimError::Internal(format!("simulation {} succeeded without a result", self.name))),
            SimulationState::Failure => Err(self
                .error
                .clone()
                .unwrap_or_else(|| SimError::Internal(format!("simulation {} failed without an error", self.name)))),
            _ => Err(SimError::Internal(format!("simulation {} has not finished", self.name))),
        }
    }

    pub async fn run(&mut self, ctx: &CancellationToken, view: Arc<View>) -> SimResult<()> {
        if self.state != SimulationState::Pending {
            return Err(SimError::Internal(format!("simulation {} already ran; reset it first", self.name)));
        }
        let t0 = Instant::now();
        self.state = SimulationState::Running;
        self.publish();
        let outcome = self.execute(ctx, &view).await;
        let label = match &outcome {
            Ok(result) => {
                self.state = SimulationState::Success;
                info!(
                    simulation = %self.name,
                    view = %view.name(),
                    on_node = result.node_pods.len(),
                    leftover = result.leftover.len(),
                    took_ms = %t0.elapsed().as_millis(),
                    "sim: run finished"
                );
                self.result = Some(result.clone());
                "success"
            }
            Err(e) => {
                self.state = SimulationState::Failure;
                debug!(simulation = %self.name, error = %e, "sim: run failed");
                self.error = Some(e.clone());
                "failure"
            }
        };
        counter!("sim_runs_total", 1u64, "outcome" => label);
        histogram!("sim_run_ms", t0.elapsed().as_secs_f64() * 1000.0);
        self.publish();
        outcome.map(|_| ())
    }

    async fn execute(&mut self, ctx: &CancellationToken, view: &Arc<View>) -> SimResult<SimulationResult> {
        let ctx_name = format!("simulation {}", self.name);
        let pods = view.unscheduled_pods().await.map_err(|e| SimError::store(&ctx_name, e))?;
        if pods.is_empty() {
            return Err(SimError::NoUnscheduledPods(format!("{} in view {}", ctx_name, view.name())));
        }
        for pod in pods.iter() {
            let info = PodResourceInfo::from_pod(pod)?;
            self.run.unscheduled.insert(info.key.clone(), info);
        }
        self.run.last_event_version = view.event_sink().version().await;

        let (node, info) = self.candidate_node()?;
        view.create_object(Object::Node(node)).await.map_err(|e| SimError::store(&ctx_name, e))?;
        debug!(simulation = %self.name, node = %info.name, pending = self.run.unscheduled.len(), "sim: candidate node added");

        let handle = self
            .args
            .launcher
            .launch(ctx, LaunchParams { name: self.name.clone(), client: view.client(ClientMode::InProcess) })
            .await
            .map_err(|e| SimError::scheduler(&ctx_name, e))?;
        let tracked = self.track_until_stabilized(ctx, view).await;
        handle.close().await;
        tracked?;
        Ok(self.build_result(view, info))
    }

    /// Poll the view's events until every tracked pod is placed or
    /// `max_unchanged_polls` consecutive polls bring no new placement.
    async fn track_until_stabilized(&mut self, ctx: &CancellationToken, view: &View) -> SimResult<()> {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    return Err(SimError::Cancelled(format!("simulation {} while tracking", self.name)));
                }
                _ = tokio::time::sleep(self.args.poll_interval) => {}
            }
            let (events, _) = view
                .event_sink()
                .list_after(self.run.last_event_version)
                .await
                .map_err(|e| SimError::store(format!("simulation {}", self.name), e))?;
            let mut changed = false;
            for ev in events {
                self.run.last_event_version = ev.resource_version;
                self.run.events += 1;
                match ev.reason.as_str() {
                    REASON_SCHEDULED | REASON_BINDING => changed |= self.observe_placement(view, &ev).await?,
                    other => debug!(simulation = %self.name, reason = other, note = %ev.note, "sim: event"),
                }
            }
            if changed {
                self.run.unchanged = 0;
            } else {
                self.run.unchanged += 1;
            }
            self.publish();
            if self.run.unscheduled.is_empty() {
                debug!(simulation = %self.name, events = self.run.events, "sim: every pod placed");
                return Ok(());
            }
            if self.run.unchanged >= self.args.max_unchanged_polls {
                debug!(simulation = %self.name, events = self.run.events, left = self.run.unscheduled.len(), "sim: stabilized");
                return Ok(());
            }
        }
    }

    async fn observe_placement(&mut self, view: &View, ev: &RecordedEvent) -> SimResult<bool> {
        let key = ObjectKey::new(
            ev.regarding.namespace.as_deref().unwrap_or("default"),
            ev.regarding.name.as_deref().unwrap_or(""),
        );
        if !self.run.unscheduled.contains_key(&key) {
            return Ok(false);
        }
        let node = match ev.related.as_ref().and_then(|r| r.name.clone()) {
            Some(n) => n,
            None => {
                let pod: Pod = view
                    .get_object(ObjectKind::Pod, &key)
                    .await
                    .and_then(Pod::try_from)
                    .map_err(|e| SimError::store(format!("simulation {}", self.name), e))?;
                match assigned_node(&pod) {
                    Some(n) => n.to_string(),
                    None => return Ok(false),
                }
            }
        };
        if let Some(info) = self.run.unscheduled.remove(&key) {
            self.run.assignments.entry(node).or_default().push(info);
        }
        Ok(true)
    }

    fn candidate_node(&self) -> SimResult<(Node, NodeResourceInfo)> {
        let n = self.args.run_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let name = node_name(&format!("{}-{}-{}-{}", self.pool.name, self.template.name, self.zone, n));
        let capacity = self.template.capacity()?;
        let allocatable = self.template.allocatable()?;

        let mut node_labels = self.pool.labels.clone();
        node_labels.extend(self.template.labels.clone());
        for (k, v) in [
            (labels::NODE_POOL, self.pool.name.as_str()),
            (labels::NODE_TEMPLATE, self.template.name.as_str()),
            (labels::INSTANCE_TYPE, self.template.instance_type.as_str()),
            (labels::REGION, self.pool.region.as_str()),
            (labels::ZONE, self.zone.as_str()),
            (labels::HOSTNAME, name.as_str()),
            (labels::ARCH, self.template.architecture.as_str()),
            (labels::SIMULATION, "true"),
        ] {
            node_labels.insert(k.to_string(), v.to_string());
        }

        let node = Node {
            metadata: ObjectMeta { name: Some(name.clone()), labels: Some(node_labels), ..ObjectMeta::default() },
            spec: Some(NodeSpec {
                taints: Some(self.pool.taints.clone()).filter(|t| !t.is_empty()),
                ..NodeSpec::default()
            }),
            status: Some(NodeStatus {
                capacity: Some(capacity.to_list()),
                allocatable: Some(allocatable.to_list()),
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".into(),
                    status: "True".into(),
                    ..NodeCondition::default()
                }]),
                ..NodeStatus::default()
            }),
        };
        Ok((node, NodeResourceInfo { name, capacity, allocatable }))
    }

    fn build_result(&self, view: &Arc<View>, node: NodeResourceInfo) -> SimulationResult {
        let node_pods = self.run.assignments.get(&node.name).cloned().unwrap_or_default();
        let other_assignments = self
            .run
            .assignments
            .iter()
            .filter(|(n, _)| **n != node.name)
            .map(|(n, pods)| NodePodAssignment { node_name: n.clone(), pods: pods.clone() })
            .collect();
        SimulationResult {
            name: self.name.clone(),
            key: self.key(),
            placement: self.placement(),
            node,
            node_pods,
            other_assignments,
            leftover: self.run.unscheduled.values().cloned().collect(),
            view: Arc::clone(view),
        }
    }
}

// Lowercase DNS-label-ish name: anything outside [a-z0-9.-] becomes '-'.
fn node_name(raw: &str) -> String {
    raw.chars()
        .map(|c| c.to_ascii_lowercase())
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect()
}
