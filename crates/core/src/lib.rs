//! Scaling advisor core types: object model, keys, selectors, errors.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod error;
pub mod kind;
pub mod resources;
pub mod selector;

pub use error::{StoreError, StoreResult};
pub use kind::{Object, ObjectKind, ObjectList};
pub use resources::{pod_requests, ResourceVector};
pub use selector::{LabelSelector, MatchCriteria};

pub mod prelude {
    pub use super::{
        LabelSelector, MatchCriteria, Object, ObjectKey, ObjectKind, ObjectList, ResourceVector, StoreError,
        StoreResult, WatchEvent, WatchEventType,
    };
}

/// Well-known node labels used to derive placements and to stamp simulated nodes.
pub mod labels {
    pub const NODE_POOL: &str = "node.advisor.io/pool";
    pub const NODE_TEMPLATE: &str = "node.advisor.io/template";
    pub const SIMULATION: &str = "node.advisor.io/simulation";
    pub const INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";
    pub const REGION: &str = "topology.kubernetes.io/region";
    pub const ZONE: &str = "topology.kubernetes.io/zone";
    pub const HOSTNAME: &str = "kubernetes.io/hostname";
    pub const ARCH: &str = "kubernetes.io/arch";
}

/// `(namespace, name)` identity of an object within one store.
/// Cluster-scoped objects carry an empty namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self { namespace: namespace.to_string(), name: name.to_string() }
    }

    pub fn cluster(name: &str) -> Self {
        Self::new("", name)
    }

    /// Parse `ns/name` or a bare cluster-scoped `name`.
    pub fn parse(s: &str) -> Self {
        match s.split_once('/') {
            Some((ns, name)) => Self::new(ns, name),
            None => Self::cluster(s),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// Change notification broadcast by a store after a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub object: Object,
}

impl WatchEvent {
    pub fn resource_version(&self) -> u64 {
        self.object.resource_version()
    }
}
