//! Reference scheduler: binds pending pods to the first node, by name, that
//! has room, tolerates nothing it shouldn't and matches the node selector.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Binding, Node, ObjectReference, Pod, Taint, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use advisor_core::resources::PODS;
use advisor_core::{pod_requests, MatchCriteria, Object, ObjectKey, ObjectKind, ResourceVector, StoreError, StoreResult};
use advisor_view::{
    assigned_node, EventRecord, ViewClient, WatchOptions, WatchStream, REASON_FAILED_SCHEDULING, REASON_SCHEDULED,
    TYPE_NORMAL, TYPE_WARNING,
};

use crate::{LaunchParams, SchedulerError, SchedulerHandle, SchedulerLauncher};

const CONTROLLER: &str = "first-fit-scheduler";

// Kubelet default pod slots, in milli-units, for nodes that do not report `pods`.
const DEFAULT_MAX_PODS: i64 = 110_000;

#[derive(Debug, Clone, Copy, Default)]
pub struct FirstFitLauncher;

#[async_trait::async_trait]
impl SchedulerLauncher for FirstFitLauncher {
    async fn launch(&self, cancel: &CancellationToken, params: LaunchParams) -> Result<SchedulerHandle, SchedulerError> {
        if cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled(format!("launching {}", params.name)));
        }
        // Open both watches before returning so no change after launch is missed.
        let pods = params.client.watch(ObjectKind::Pod, WatchOptions::default()).await?;
        let nodes = params.client.watch(ObjectKind::Node, WatchOptions::default()).await?;
        let token = cancel.child_token();
        let mut sched = FirstFit { name: params.name.clone(), client: params.client, reported: FxHashMap::default() };
        let run_token = token.clone();
        let task = tokio::spawn(async move {
            info!(scheduler = %sched.name, "scheduler: started");
            match sched.run(pods, nodes, run_token).await {
                Ok(()) => debug!(scheduler = %sched.name, "scheduler: stopped"),
                Err(e) => warn!(scheduler = %sched.name, error = %e, "scheduler: stopped on error"),
            }
        });
        Ok(SchedulerHandle::new(&params.name, token, task))
    }
}

struct FirstFit {
    name: String,
    client: Arc<dyn ViewClient>,
    // Pods already reported unschedulable, with the node count at that time.
    reported: FxHashMap<ObjectKey, usize>,
}

impl FirstFit {
    async fn run(&mut self, mut pods: WatchStream, mut nodes: WatchStream, cancel: CancellationToken) -> StoreResult<()> {
        let mut dirty = true;
        loop {
            if dirty {
                self.schedule_pending(&cancel).await?;
                dirty = false;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                ev = pods.next() => match ev {
                    Some(_) => dirty = true,
                    None => return Ok(()),
                },
                ev = nodes.next() => match ev {
                    Some(_) => dirty = true,
                    None => return Ok(()),
                },
            }
            // Coalesce bursts into one scheduling round.
            while pods.events.try_recv().is_ok() || nodes.events.try_recv().is_ok() {}
        }
    }

    async fn schedule_pending(&mut self, cancel: &CancellationToken) -> StoreResult<()> {
        let nodes: Vec<Node> = self
            .client
            .list(ObjectKind::Node, &MatchCriteria::all())
            .await?
            .items
            .into_iter()
            .map(Node::try_from)
            .collect::<StoreResult<_>>()?;
        let all_pods: Vec<Pod> = self
            .client
            .list(ObjectKind::Pod, &MatchCriteria::all())
            .await?
            .items
            .into_iter()
            .map(Pod::try_from)
            .collect::<StoreResult<_>>()?;

        let mut free: BTreeMap<String, ResourceVector> = BTreeMap::new();
        for node in nodes.iter().filter(|n| schedulable(n)) {
            let status = node.status.as_ref();
            let alloc = status.and_then(|s| s.allocatable.as_ref()).or_else(|| status.and_then(|s| s.capacity.as_ref()));
            let mut room = ResourceVector::from_list(alloc)?;
            if !room.0.contains_key(PODS) {
                room = room.with(PODS, DEFAULT_MAX_PODS);
            }
            free.insert(node.metadata.name.clone().unwrap_or_default(), room);
        }
        let mut pending = Vec::new();
        for pod in all_pods.iter() {
            if terminal(pod) {
                continue;
            }
            match assigned_node(pod) {
                Some(node) => {
                    if let Some(room) = free.get_mut(node) {
                        *room = room.saturating_sub(&pod_requests(pod)?);
                    }
                }
                None if pod.metadata.deletion_timestamp.is_none() => pending.push(pod),
                None => {}
            }
        }
        pending.sort_by(|a, b| {
            let pa = a.spec.as_ref().and_then(|s| s.priority).unwrap_or(0);
            let pb = b.spec.as_ref().and_then(|s| s.priority).unwrap_or(0);
            pb.cmp(&pa).then_with(|| key_of(a).cmp(&key_of(b)))
        });

        for pod in pending {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let req = pod_requests(pod)?;
            let chosen = nodes
                .iter()
                .filter_map(|n| n.metadata.name.as_deref().map(|name| (name, n)))
                .find(|(name, node)| {
                    free.get(*name).map(|room| req.fits_within(room)).unwrap_or(false) && feasible(pod, node)
                })
                .map(|(name, _)| name.to_string());
            let key = key_of(pod);
            match chosen {
                Some(node) => match self.bind(pod, &node).await {
                    Ok(()) => {
                        if let Some(room) = free.get_mut(&node) {
                            *room = room.saturating_sub(&req);
                        }
                        self.reported.remove(&key);
                        metrics::counter!("scheduler_bindings_total", 1u64);
                    }
                    Err(StoreError::Conflict(_)) | Err(StoreError::NotFound { .. }) => {
                        debug!(scheduler = %self.name, pod = %key, "scheduler: pod changed underneath; skipping");
                    }
                    Err(e) => return Err(e),
                },
                None => self.report_unschedulable(pod, &key, nodes.len()).await?,
            }
        }
        Ok(())
    }

    async fn bind(&self, pod: &Pod, node: &str) -> StoreResult<()> {
        let binding = Binding {
            metadata: ObjectMeta {
                name: pod.metadata.name.clone(),
                namespace: pod.metadata.namespace.clone(),
                ..ObjectMeta::default()
            },
            target: node_ref(node),
        };
        self.client.bind(&binding).await?;
        let key = key_of(pod);
        self.client
            .record_event(EventRecord {
                regarding: EventRecord::reference(&Object::Pod(pod.clone())),
                related: Some(node_ref(node)),
                reason: REASON_SCHEDULED.into(),
                action: "Scheduling".into(),
                note: format!("Successfully assigned {} to {}", key, node),
                event_type: TYPE_NORMAL.into(),
                reporting_controller: CONTROLLER.into(),
            })
            .await?;
        debug!(scheduler = %self.name, pod = %key, node, "scheduler: bound");
        Ok(())
    }

    async fn report_unschedulable(&mut self, pod: &Pod, key: &ObjectKey, node_count: usize) -> StoreResult<()> {
        if self.reported.get(key) == Some(&node_count) {
            return Ok(());
        }
        self.reported.insert(key.clone(), node_count);
        self.client
            .record_event(EventRecord {
                regarding: EventRecord::reference(&Object::Pod(pod.clone())),
                related: None,
                reason: REASON_FAILED_SCHEDULING.into(),
                action: "Scheduling".into(),
                note: format!("0/{} nodes are available for {}", node_count, key),
                event_type: TYPE_WARNING.into(),
                reporting_controller: CONTROLLER.into(),
            })
            .await
    }
}

fn key_of(pod: &Pod) -> ObjectKey {
    ObjectKey::new(pod.metadata.namespace.as_deref().unwrap_or(""), pod.metadata.name.as_deref().unwrap_or(""))
}

fn node_ref(node: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some(ObjectKind::Node.api_version().into()),
        kind: Some(ObjectKind::Node.kind_name().into()),
        name: Some(node.to_string()),
        ..ObjectReference::default()
    }
}

fn terminal(pod: &Pod) -> bool {
    matches!(pod.status.as_ref().and_then(|s| s.phase.as_deref()), Some("Succeeded") | Some("Failed"))
}

fn schedulable(node: &Node) -> bool {
    node.metadata.deletion_timestamp.is_none()
        && !node.spec.as_ref().and_then(|s| s.unschedulable).unwrap_or(false)
}

/// Taints and node selector admit the pod.
pub(crate) fn feasible(pod: &Pod, node: &Node) -> bool {
    let spec = pod.spec.as_ref();
    let tolerations: &[Toleration] = spec.and_then(|s| s.tolerations.as_deref()).unwrap_or(&[]);
    let taints: &[Taint] = node.spec.as_ref().and_then(|s| s.taints.as_deref()).unwrap_or(&[]);
    let taints_ok = taints
        .iter()
        .filter(|t| t.effect == "NoSchedule" || t.effect == "NoExecute")
        .all(|t| tolerations.iter().any(|tol| tolerates(tol, t)));
    let labels = node.metadata.labels.as_ref();
    let selector_ok = spec
        .and_then(|s| s.node_selector.as_ref())
        .map(|sel| sel.iter().all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v)))
        .unwrap_or(true);
    taints_ok && selector_ok
}

fn tolerates(tol: &Toleration, taint: &Taint) -> bool {
    let effect_ok = tol.effect.as_deref().map(|e| e.is_empty() || e == taint.effect).unwrap_or(true);
    let exists = tol.operator.as_deref() == Some("Exists");
    let key_ok = match tol.key.as_deref() {
        None | Some("") => exists,
        Some(k) => k == taint.key,
    };
    let value_ok = exists || tol.value.as_deref().unwrap_or("") == taint.value.as_deref().unwrap_or("");
    effect_ok && key_ok && value_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(taints: serde_json::Value, labels: serde_json::Value) -> Node {
        serde_json::from_value(json!({ "metadata": { "name": "n", "labels": labels }, "spec": { "taints": taints } })).unwrap()
    }

    fn pod(spec: serde_json::Value) -> Pod {
        serde_json::from_value(json!({ "metadata": { "name": "p" }, "spec": spec })).unwrap()
    }

    #[test]
    fn no_schedule_taint_needs_toleration() {
        let n = node(json!([{ "key": "gpu", "value": "true", "effect": "NoSchedule" }]), json!({}));
        assert!(!feasible(&pod(json!({ "containers": [] })), &n));
        let tolerant = pod(json!({ "containers": [], "tolerations": [{ "key": "gpu", "operator": "Equal", "value": "true" }] }));
        assert!(feasible(&tolerant, &n));
        let wildcard = pod(json!({ "containers": [], "tolerations": [{ "operator": "Exists" }] }));
        assert!(feasible(&wildcard, &n));
    }

    #[test]
    fn prefer_no_schedule_is_ignored() {
        let n = node(json!([{ "key": "spot", "effect": "PreferNoSchedule" }]), json!({}));
        assert!(feasible(&pod(json!({ "containers": [] })), &n));
    }

    #[test]
    fn node_selector_must_match_labels() {
        let n = node(json!([]), json!({ "zone": "a" }));
        assert!(feasible(&pod(json!({ "containers": [], "nodeSelector": { "zone": "a" } })), &n));
        assert!(!feasible(&pod(json!({ "containers": [], "nodeSelector": { "zone": "b" } })), &n));
    }
}
