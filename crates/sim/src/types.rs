//! Planner request/response model.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, Pod, Taint};
use k8s_openapi::api::node::v1::RuntimeClass;
use k8s_openapi::api::scheduling::v1::PriorityClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};

use advisor_core::resources::{parse_quantity_milli, CPU, MEMORY, PODS};
use advisor_core::{labels, pod_requests, Object, ObjectKey, ResourceVector};
use advisor_view::awaits_scheduling;

use crate::error::{SimError, SimResult};

/// Pod slots of a node whose capacity does not say otherwise, in milli-units.
pub const DEFAULT_MAX_PODS: i64 = 110_000;

fn default_arch() -> String {
    "amd64".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTemplate {
    pub name: String,
    /// Lower runs earlier within a pool.
    #[serde(default)]
    pub priority: i32,
    pub instance_type: String,
    #[serde(default = "default_arch")]
    pub architecture: String,
    pub capacity: BTreeMap<String, Quantity>,
    #[serde(default)]
    pub kube_reserved: BTreeMap<String, Quantity>,
    #[serde(default)]
    pub system_reserved: BTreeMap<String, Quantity>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl NodeTemplate {
    /// Declared capacity; a template that does not declare `pods` gets the
    /// kubelet default of 110.
    pub fn capacity(&self) -> SimResult<ResourceVector> {
        let cap = ResourceVector::from_list(Some(&self.capacity))
            .map_err(|e| SimError::Validation(format!("template {} capacity: {}", self.name, e)))?;
        if cap.0.contains_key(PODS) {
            Ok(cap)
        } else {
            Ok(cap.with(PODS, DEFAULT_MAX_PODS))
        }
    }

    /// Capacity minus kube and system reservations.
    pub fn allocatable(&self) -> SimResult<ResourceVector> {
        let reserved = |list: &BTreeMap<String, Quantity>| {
            ResourceVector::from_list(Some(list))
                .map_err(|e| SimError::Validation(format!("template {} reservation: {}", self.name, e)))
        };
        Ok(self.capacity()?.saturating_sub(&reserved(&self.kube_reserved)?).saturating_sub(&reserved(&self.system_reserved)?))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePool {
    pub name: String,
    /// Lower is tried first.
    #[serde(default)]
    pub priority: i32,
    pub region: String,
    pub zones: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    /// Maximum number of nodes in the pool, existing ones included.
    #[serde(default)]
    pub quota: Option<u32>,
    pub node_templates: Vec<NodeTemplate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingConstraint {
    pub node_pools: Vec<NodePool>,
}

impl ScalingConstraint {
    pub fn validate(&self) -> SimResult<()> {
        if self.node_pools.is_empty() {
            return Err(SimError::Validation("constraint names no node pools".into()));
        }
        let mut pools = BTreeSet::new();
        for pool in self.node_pools.iter() {
            if pool.name.is_empty() {
                return Err(SimError::Validation("node pool without a name".into()));
            }
            if !pools.insert(pool.name.as_str()) {
                return Err(SimError::Validation(format!("duplicate node pool {}", pool.name)));
            }
            if pool.zones.is_empty() {
                return Err(SimError::Validation(format!("node pool {} has no zones", pool.name)));
            }
            if pool.node_templates.is_empty() {
                return Err(SimError::Validation(format!("node pool {} has no node templates", pool.name)));
            }
            let mut templates = BTreeSet::new();
            for t in pool.node_templates.iter() {
                if !templates.insert(t.name.as_str()) {
                    return Err(SimError::Validation(format!("duplicate template {} in pool {}", t.name, pool.name)));
                }
                if t.instance_type.is_empty() {
                    return Err(SimError::Validation(format!("template {} has no instance type", t.name)));
                }
                if !t.capacity.contains_key(CPU) || !t.capacity.contains_key(MEMORY) {
                    return Err(SimError::Validation(format!("template {} must declare cpu and memory capacity", t.name)));
                }
                t.allocatable()?;
            }
        }
        Ok(())
    }
}

/// Cluster state a plan is computed against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub pods: Vec<Pod>,
    #[serde(default)]
    pub priority_classes: Vec<PriorityClass>,
    #[serde(default)]
    pub runtime_classes: Vec<RuntimeClass>,
}

impl ClusterSnapshot {
    /// Objects to load into a base view, cluster-scoped kinds first.
    pub fn to_objects(&self) -> Vec<Object> {
        let mut out = Vec::with_capacity(
            self.nodes.len() + self.pods.len() + self.priority_classes.len() + self.runtime_classes.len(),
        );
        out.extend(self.priority_classes.iter().cloned().map(Object::from));
        out.extend(self.runtime_classes.iter().cloned().map(Object::from));
        out.extend(self.nodes.iter().cloned().map(Object::from));
        out.extend(self.pods.iter().cloned().map(Object::from));
        out
    }

    pub fn unscheduled_pods(&self) -> impl Iterator<Item = &Pod> {
        self.pods.iter().filter(|p| awaits_scheduling(p))
    }

    /// Existing node count per placement, from the well-known node labels.
    /// Nodes without pool and template labels are not counted.
    pub fn existing_node_counts(&self) -> BTreeMap<NodePlacement, i32> {
        let mut out = BTreeMap::new();
        for node in self.nodes.iter() {
            if let Some(p) = NodePlacement::from_labels(node.metadata.labels.as_ref()) {
                *out.entry(p).or_insert(0) += 1;
            }
        }
        out
    }
}

/// Where a node goes: pool, template, instance type, region and zone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePlacement {
    pub node_pool_name: String,
    pub node_template_name: String,
    pub instance_type: String,
    pub region: String,
    pub zone: String,
}

impl NodePlacement {
    pub fn from_labels(l: Option<&BTreeMap<String, String>>) -> Option<Self> {
        let l = l?;
        let get = |k: &str| l.get(k).cloned().unwrap_or_default();
        Some(Self {
            node_pool_name: l.get(labels::NODE_POOL)?.clone(),
            node_template_name: l.get(labels::NODE_TEMPLATE)?.clone(),
            instance_type: get(labels::INSTANCE_TYPE),
            region: get(labels::REGION),
            zone: get(labels::ZONE),
        })
    }
}

impl std::fmt::Display for NodePlacement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}/{}", self.node_pool_name, self.node_template_name, self.instance_type, self.zone)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodResourceInfo {
    pub key: ObjectKey,
    pub requests: ResourceVector,
}

impl PodResourceInfo {
    pub fn from_pod(pod: &Pod) -> SimResult<Self> {
        let key = ObjectKey::new(
            pod.metadata.namespace.as_deref().unwrap_or("default"),
            pod.metadata.name.as_deref().unwrap_or(""),
        );
        let requests = pod_requests(pod).map_err(|e| SimError::store(format!("pod {}", key), e))?;
        Ok(Self { key, requests })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResourceInfo {
    pub name: String,
    pub capacity: ResourceVector,
    pub allocatable: ResourceVector,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePodAssignment {
    pub node_name: String,
    pub pods: Vec<PodResourceInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdviceGenerationMode {
    /// Emit a plan fragment after every group.
    #[default]
    Incremental,
    /// Emit one plan once every group ran.
    AllAtOnce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScoringStrategy {
    #[default]
    LeastWaste,
    LeastCost,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingAdviceRequest {
    pub id: String,
    #[serde(default)]
    pub correlation_id: String,
    pub constraint: ScalingConstraint,
    pub snapshot: ClusterSnapshot,
    #[serde(default)]
    pub mode: AdviceGenerationMode,
    #[serde(default)]
    pub scoring: ScoringStrategy,
    /// Overrides the configured plan timeout.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "secs")]
    pub timeout: Option<Duration>,
}

impl ScalingAdviceRequest {
    pub fn validate(&self) -> SimResult<()> {
        if self.id.is_empty() {
            return Err(SimError::Validation("request id is empty".into()));
        }
        self.constraint.validate()?;
        for pod in self.snapshot.pods.iter() {
            if pod.metadata.name.as_deref().unwrap_or("").is_empty() {
                return Err(SimError::Validation("snapshot pod without a name".into()));
            }
        }
        for node in self.snapshot.nodes.iter() {
            if node.metadata.name.as_deref().unwrap_or("").is_empty() {
                return Err(SimError::Validation("snapshot node without a name".into()));
            }
            let status = node.status.as_ref();
            for list in [status.and_then(|s| s.capacity.as_ref()), status.and_then(|s| s.allocatable.as_ref())]
                .into_iter()
                .flatten()
            {
                for q in list.values() {
                    parse_quantity_milli(&q.0).map_err(|e| {
                        SimError::Validation(format!("node {:?}: {}", node.metadata.name, e))
                    })?;
                }
            }
        }
        if self.snapshot.unscheduled_pods().next().is_none() {
            return Err(SimError::Validation(format!("request {}: snapshot has no unscheduled pods", self.id)));
        }
        Ok(())
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        Ok(secs.filter(|s| s.is_finite() && *s > 0.0).map(Duration::from_secs_f64))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleOutItem {
    pub placement: NodePlacement,
    pub current_replicas: i32,
    pub delta: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleOutPlan {
    pub items: Vec<ScaleOutItem>,
    pub unsatisfied_pods: Vec<ObjectKey>,
}

/// Partition key of a simulation group. Groups run in ascending order,
/// pool priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimGroupKey {
    pub pool_priority: i32,
    pub template_priority: i32,
}

impl std::fmt::Display for SimGroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.pool_priority, self.template_priority)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupDiagnostics {
    pub key: SimGroupKey,
    pub passes: usize,
    /// Winning simulation per pass, in pass order.
    pub winners: Vec<String>,
    pub skipped_at_quota: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingAdviceResponse {
    pub request_id: String,
    pub correlation_id: String,
    pub plan: ScaleOutPlan,
    pub diagnostics: Vec<GroupDiagnostics>,
}
