//! A view: one versioned store per kind behind a uniform object API.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use k8s_openapi::api::core::v1::{Binding, ObjectReference, Pod, PodCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use advisor_core::{MatchCriteria, Object, ObjectKey, ObjectKind, ObjectList, StoreError, StoreResult, WatchEvent};
use advisor_store::{VersionedStore, WatchOptions};

use crate::client::{ClientMode, InProcClient, ViewClient, WireClient};
use crate::config::ViewConfig;
use crate::events::{EventRecord, EventSink, REASON_BINDING, TYPE_NORMAL};
use crate::patch::{apply_patch, apply_status_patch, check_identity, PatchKind};

const REPORTING_CONTROLLER: &str = "advisor-view";

/// Object count and version of one store, for summaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStat {
    pub kind: ObjectKind,
    pub objects: usize,
    pub version: u64,
}

pub struct View {
    name: String,
    cfg: ViewConfig,
    // Indexed by `ObjectKind as usize`; built from `ObjectKind::ALL` in declaration order.
    stores: Vec<VersionedStore>,
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View").field("name", &self.name).finish_non_exhaustive()
    }
}

impl View {
    /// Create an empty view. Must run inside a Tokio runtime.
    pub fn new(name: &str, cfg: ViewConfig) -> Arc<Self> {
        let stores = ObjectKind::ALL.iter().map(|k| VersionedStore::new(*k, cfg.store.clone())).collect();
        Arc::new(Self { name: name.to_string(), cfg, stores })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ViewConfig {
        &self.cfg
    }

    pub fn store(&self, kind: ObjectKind) -> &VersionedStore {
        &self.stores[kind as usize]
    }

    /// Client bound to this view over the requested transport.
    pub fn client(self: &Arc<Self>, mode: ClientMode) -> Arc<dyn ViewClient> {
        match mode {
            ClientMode::InProcess => Arc::new(InProcClient::new(Arc::clone(self))),
            ClientMode::Wire => Arc::new(WireClient::new(Arc::clone(self))),
        }
    }

    pub fn event_sink(&self) -> EventSink<'_> {
        EventSink::new(self.store(ObjectKind::Event))
    }

    pub async fn create_object(&self, mut obj: Object) -> StoreResult<Object> {
        default_metadata(&mut obj)?;
        let stored = self.store(obj.kind()).create(obj).await?;
        debug!(view = %self.name, kind = stored.kind().kind_name(), key = %stored.key(), "view: created");
        Ok(stored)
    }

    pub async fn get_object(&self, kind: ObjectKind, key: &ObjectKey) -> StoreResult<Object> {
        self.store(kind).get(&scoped_key(kind, key)).await
    }

    pub async fn list_objects(&self, kind: ObjectKind, criteria: &MatchCriteria) -> ObjectList {
        self.store(kind).list(criteria).await
    }

    pub async fn update_object(&self, obj: Object) -> StoreResult<Object> {
        self.store(obj.kind()).update(obj).await
    }

    pub async fn patch_object(
        &self,
        kind: ObjectKind,
        key: &ObjectKey,
        patch_kind: PatchKind,
        patch: &Json,
    ) -> StoreResult<Object> {
        self.patch_with(kind, key, |cur| apply_patch(patch_kind, cur, patch)).await
    }

    /// Like [`View::patch_object`] but only the `status` stanza of `patch` is applied.
    pub async fn patch_object_status(
        &self,
        kind: ObjectKind,
        key: &ObjectKey,
        patch_kind: PatchKind,
        patch: &Json,
    ) -> StoreResult<Object> {
        self.patch_with(kind, key, |cur| apply_status_patch(patch_kind, cur, patch)).await
    }

    async fn patch_with<F>(&self, kind: ObjectKind, key: &ObjectKey, f: F) -> StoreResult<Object>
    where
        F: FnOnce(&Json) -> StoreResult<Json>,
    {
        let current = self.get_object(kind, key).await?;
        let before = current.to_value()?;
        let after = f(&before)?;
        check_identity(&before, &after)?;
        let patched = Object::from_value(kind, after).map_err(|e| match e {
            StoreError::Validation(msg) => StoreError::BadPatch(msg),
            other => other,
        })?;
        self.update_object(patched).await
    }

    pub async fn delete_object(&self, kind: ObjectKind, key: &ObjectKey) -> StoreResult<Object> {
        self.store(kind).delete(&scoped_key(kind, key)).await
    }

    pub async fn delete_objects(&self, kind: ObjectKind, criteria: &MatchCriteria) -> StoreResult<usize> {
        self.store(kind).delete_objects(criteria).await
    }

    pub async fn watch_objects<F, Fut>(
        &self,
        kind: ObjectKind,
        opts: WatchOptions,
        cancel: &CancellationToken,
        on_event: F,
    ) -> StoreResult<()>
    where
        F: FnMut(WatchEvent) -> Fut,
        Fut: Future<Output = StoreResult<()>>,
    {
        self.store(kind).watch(opts, cancel, on_event).await
    }

    /// Assign a pending pod to the node named by `binding.target`, then record
    /// a `Binding` event about it.
    pub async fn update_pod_node_binding(&self, binding: &Binding) -> StoreResult<Pod> {
        let key = ObjectKey::new(
            binding.metadata.namespace.as_deref().unwrap_or("default"),
            binding.metadata.name.as_deref().unwrap_or(""),
        );
        let node = binding
            .target
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| StoreError::Validation(format!("binding for {} names no target node", key)))?;
        let mut pod: Pod = self.get_object(ObjectKind::Pod, &key).await?.try_into()?;
        if let Some(current) = assigned_node(&pod) {
            return Err(StoreError::Conflict(format!("pod {} is already assigned to {}", key, current)));
        }
        pod.spec.get_or_insert_with(Default::default).node_name = Some(node.clone());
        let status = pod.status.get_or_insert_with(Default::default);
        let conditions = status.conditions.get_or_insert_with(Vec::new);
        conditions.retain(|c| c.type_ != "PodScheduled");
        conditions.push(PodCondition {
            type_: "PodScheduled".into(),
            status: "True".into(),
            last_transition_time: Some(Time(Utc::now())),
            ..PodCondition::default()
        });
        let stored = self.update_object(Object::Pod(pod)).await?;
        self.event_sink()
            .record(EventRecord {
                regarding: EventRecord::reference(&stored),
                related: Some(ObjectReference {
                    api_version: Some(ObjectKind::Node.api_version().into()),
                    kind: Some(ObjectKind::Node.kind_name().into()),
                    name: Some(node.clone()),
                    ..ObjectReference::default()
                }),
                reason: REASON_BINDING.into(),
                action: "Binding".into(),
                note: format!("Successfully assigned {} to {}", key, node),
                event_type: TYPE_NORMAL.into(),
                reporting_controller: REPORTING_CONTROLLER.into(),
            })
            .await?;
        debug!(view = %self.name, pod = %key, node = %node, "view: pod bound");
        stored.try_into()
    }

    /// Pods with no node assignment that are not finished or being deleted.
    pub async fn unscheduled_pods(&self) -> StoreResult<Vec<Pod>> {
        let list = self.list_objects(ObjectKind::Pod, &MatchCriteria::all()).await;
        let mut out = Vec::new();
        for obj in list.items {
            let pod: Pod = obj.try_into()?;
            if awaits_scheduling(&pod) {
                out.push(pod);
            }
        }
        Ok(out)
    }

    /// Empty every store and restart their version counters.
    pub async fn reset(&self) {
        for store in self.stores.iter() {
            store.reset().await;
        }
        info!(view = %self.name, "view: reset");
    }

    /// Reset, then create every object in order.
    pub async fn load_objects(&self, objects: Vec<Object>) -> StoreResult<usize> {
        let t0 = Instant::now();
        self.reset().await;
        let n = objects.len();
        for obj in objects {
            self.create_object(obj).await?;
        }
        info!(view = %self.name, objects = n, took_ms = %t0.elapsed().as_millis(), "view: loaded");
        Ok(n)
    }

    /// Replace this view's content with a point-in-time copy of `delegate`.
    /// Read locks on every delegate store are held together while copying.
    pub(crate) async fn seed_from(&self, delegate: &View) -> StoreResult<usize> {
        let mut guards = Vec::with_capacity(ObjectKind::ALL.len());
        for kind in ObjectKind::ALL {
            guards.push(delegate.store(*kind).read().await);
        }
        let copies: Vec<(Vec<Object>, u64)> =
            guards.iter().map(|g| (g.objects().cloned().collect(), g.version())).collect();
        drop(guards);
        let mut total = 0;
        for (kind, (objects, version)) in ObjectKind::ALL.iter().zip(copies) {
            total += objects.len();
            self.store(*kind).seed(objects, version).await?;
        }
        Ok(total)
    }

    pub async fn stats(&self) -> Vec<StoreStat> {
        let mut out = Vec::with_capacity(self.stores.len());
        for store in self.stores.iter() {
            out.push(StoreStat { kind: store.kind(), objects: store.len().await, version: store.version().await });
        }
        out
    }
}

/// Node name a pod is bound to, if any.
pub fn assigned_node(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref().and_then(|s| s.node_name.as_deref()).filter(|n| !n.is_empty())
}

/// Unbound, not finished and not being deleted.
pub fn awaits_scheduling(pod: &Pod) -> bool {
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or("");
    assigned_node(pod).is_none()
        && pod.metadata.deletion_timestamp.is_none()
        && phase != "Succeeded"
        && phase != "Failed"
}

fn scoped_key(kind: ObjectKind, key: &ObjectKey) -> ObjectKey {
    if kind.namespaced() {
        key.clone()
    } else {
        ObjectKey::cluster(&key.name)
    }
}

fn default_metadata(obj: &mut Object) -> StoreResult<()> {
    let kind = obj.kind();
    let meta = obj.meta_mut();
    if meta.name.as_deref().unwrap_or("").is_empty() {
        match meta.generate_name.as_deref().filter(|p| !p.is_empty()) {
            Some(prefix) => {
                let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(5).collect();
                meta.name = Some(format!("{}{}", prefix, suffix));
            }
            None => {
                return Err(StoreError::Validation(format!(
                    "{} needs metadata.name or metadata.generateName",
                    kind.kind_name()
                )))
            }
        }
    }
    if kind.namespaced() {
        if meta.namespace.as_deref().unwrap_or("").is_empty() {
            meta.namespace = Some("default".into());
        }
    } else {
        meta.namespace = None;
    }
    if meta.uid.is_none() {
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
    }
    if meta.creation_timestamp.is_none() {
        meta.creation_timestamp = Some(Time(Utc::now()));
    }
    Ok(())
}
