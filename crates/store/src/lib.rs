//! Versioned in-RAM store: one resource kind, monotonic resource versions,
//! ordered change broadcast and filtered watches.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Instant;

use advisor_core::{
    LabelSelector, MatchCriteria, Object, ObjectKey, ObjectKind, ObjectList, StoreError, StoreResult, WatchEvent,
    WatchEventType,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use metrics::{counter, histogram};
use tokio::sync::{broadcast, RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod config;
mod queue;

pub use config::{QueuePolicy, StoreConfig};
pub use queue::EventQueue;
use queue::Broadcaster;

/// Filter and starting point for [`VersionedStore::watch`].
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Only events with a resource version strictly greater than this are delivered.
    pub start_version: u64,
    pub namespace: Option<String>,
    pub labels: LabelSelector,
}

impl WatchOptions {
    fn criteria(&self) -> MatchCriteria {
        MatchCriteria { namespace: self.namespace.clone(), names: None, labels: self.labels.clone() }
    }
}

#[derive(Debug, Clone, Copy)]
enum PutMode {
    Upsert,
    Create,
    Replace,
}

struct StoreState {
    objects: BTreeMap<ObjectKey, Object>,
    version: u64,
    broadcaster: Broadcaster,
}

/// Consistent read view over one store, held while a view seeds a sandbox.
pub struct StoreReadGuard<'a>(RwLockReadGuard<'a, StoreState>);

impl StoreReadGuard<'_> {
    pub fn version(&self) -> u64 {
        self.0.version
    }

    pub fn objects(&self) -> impl Iterator<Item = &Object> {
        self.0.objects.values()
    }
}

/// In-memory collection for exactly one kind.
pub struct VersionedStore {
    kind: ObjectKind,
    cfg: StoreConfig,
    state: RwLock<StoreState>,
}

impl VersionedStore {
    /// Create an empty store. Spawns the dispatch task, so this must run inside a Tokio runtime.
    pub fn new(kind: ObjectKind, cfg: StoreConfig) -> Self {
        let broadcaster = Broadcaster::spawn(cfg.queue_cap, cfg.policy, kind.kind_name());
        Self { kind, cfg, state: RwLock::new(StoreState { objects: BTreeMap::new(), version: 0, broadcaster }) }
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn config(&self) -> &StoreConfig {
        &self.cfg
    }

    /// Current store-wide resource version.
    pub async fn version(&self) -> u64 {
        self.state.read().await.version
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.objects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn read(&self) -> StoreReadGuard<'_> {
        StoreReadGuard(self.state.read().await)
    }

    fn check_kind(&self, obj: &Object) -> StoreResult<()> {
        if obj.kind() != self.kind {
            return Err(StoreError::TypeMismatch { expected: self.kind, actual: obj.kind() });
        }
        Ok(())
    }

    fn key_for(&self, obj: &Object) -> StoreResult<ObjectKey> {
        let key = obj.key();
        if key.name.is_empty() {
            return Err(StoreError::Internal(format!("cannot key {} without metadata.name", self.kind.kind_name())));
        }
        Ok(key)
    }

    /// Insert or replace, assigning the next version, and broadcast `Added`.
    pub async fn add(&self, obj: Object) -> StoreResult<Object> {
        self.put(obj, PutMode::Upsert).await
    }

    /// Insert a record that must not exist yet.
    pub async fn create(&self, obj: Object) -> StoreResult<Object> {
        self.put(obj, PutMode::Create).await
    }

    /// Replace an existing record, assigning the next version, and broadcast
    /// `Modified`. A non-empty `resourceVersion` on `obj` must match the stored one.
    pub async fn update(&self, obj: Object) -> StoreResult<Object> {
        self.put(obj, PutMode::Replace).await
    }

    async fn put(&self, mut obj: Object, mode: PutMode) -> StoreResult<Object> {
        self.check_kind(&obj)?;
        let key = self.key_for(&obj)?;
        let mut st = self.state.write().await;
        let event_type = match (mode, st.objects.get(&key)) {
            (PutMode::Create, Some(_)) => return Err(StoreError::AlreadyExists { kind: self.kind, key }),
            (PutMode::Replace, None) => return Err(StoreError::not_found(self.kind, &key)),
            (PutMode::Replace, Some(cur)) => {
                let expected = obj.meta().resource_version.as_deref().unwrap_or("");
                if !expected.is_empty() && expected != cur.resource_version().to_string() {
                    return Err(StoreError::Conflict(format!(
                        "{} {} has resourceVersion {}, update carried {}",
                        self.kind.kind_name(),
                        key,
                        cur.resource_version(),
                        expected
                    )));
                }
                WatchEventType::Modified
            }
            (PutMode::Upsert, Some(_)) => WatchEventType::Modified,
            (_, None) => WatchEventType::Added,
        };
        st.version += 1;
        let version = st.version;
        obj.set_resource_version(version);
        st.objects.insert(key.clone(), obj.clone());
        // Enqueue under the write lock so broadcast order equals mutation order.
        st.broadcaster.queue.push(WatchEvent { event_type, object: obj.clone() }).await;
        drop(st);
        counter!("store_mutations_total", 1u64, "kind" => self.kind.kind_name());
        debug!(kind = self.kind.kind_name(), key = %key, version, event = ?event_type, "store: put");
        Ok(obj)
    }

    pub async fn get(&self, key: &ObjectKey) -> StoreResult<Object> {
        self.state
            .read()
            .await
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(self.kind, key))
    }

    /// Remove a record, stamp its deletion time and broadcast `Deleted`.
    pub async fn delete(&self, key: &ObjectKey) -> StoreResult<Object> {
        let mut st = self.state.write().await;
        let mut obj = st.objects.remove(key).ok_or_else(|| StoreError::not_found(self.kind, key))?;
        st.version += 1;
        let version = st.version;
        obj.set_resource_version(version);
        obj.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
        st.broadcaster.queue.push(WatchEvent { event_type: WatchEventType::Deleted, object: obj.clone() }).await;
        drop(st);
        counter!("store_mutations_total", 1u64, "kind" => self.kind.kind_name());
        debug!(kind = self.kind.kind_name(), key = %key, version, "store: delete");
        Ok(obj)
    }

    pub async fn list(&self, criteria: &MatchCriteria) -> ObjectList {
        let st = self.state.read().await;
        let items = st.objects.values().filter(|o| criteria.matches(o)).cloned().collect();
        ObjectList { kind: self.kind, resource_version: st.version, items }
    }

    /// Delete every matching record; records removed concurrently are skipped.
    pub async fn delete_objects(&self, criteria: &MatchCriteria) -> StoreResult<usize> {
        let keys: Vec<ObjectKey> = {
            let st = self.state.read().await;
            st.objects.iter().filter(|(_, o)| criteria.matches(o)).map(|(k, _)| k.clone()).collect()
        };
        let mut deleted = 0usize;
        for key in keys.iter() {
            match self.delete(key).await {
                Ok(_) => deleted += 1,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }

    /// Replace the whole content with `objects` and continue versioning from
    /// `version`. Emits no events; used to seed fresh sandbox stores.
    pub async fn seed(&self, objects: Vec<Object>, version: u64) -> StoreResult<()> {
        let mut map = BTreeMap::new();
        for obj in objects {
            self.check_kind(&obj)?;
            map.insert(self.key_for(&obj)?, obj);
        }
        let mut st = self.state.write().await;
        st.objects = map;
        st.version = version;
        Ok(())
    }

    /// Discard every record and restart the version counter. Running watches end.
    pub async fn reset(&self) {
        let mut st = self.state.write().await;
        let dropped = st.objects.len();
        st.objects.clear();
        st.version = 0;
        st.broadcaster = Broadcaster::spawn(self.cfg.queue_cap, self.cfg.policy, self.kind.kind_name());
        drop(st);
        info!(kind = self.kind.kind_name(), dropped, "store: reset");
    }

    /// Blocking watch. Replays stored records newer than `opts.start_version`
    /// as `Added`, then follows live events until the broadcaster closes, the
    /// watch timeout elapses or `cancel` fires. None of those is an error; an
    /// error from `on_event` ends the watch and is returned.
    pub async fn watch<F, Fut>(&self, opts: WatchOptions, cancel: &CancellationToken, mut on_event: F) -> StoreResult<()>
    where
        F: FnMut(WatchEvent) -> Fut,
        Fut: Future<Output = StoreResult<()>>,
    {
        let t0 = Instant::now();
        let criteria = opts.criteria();
        let (mut catch_up, mut rx, high) = {
            let st = self.state.read().await;
            let catch_up: Vec<Object> = st
                .objects
                .values()
                .filter(|o| o.resource_version() > opts.start_version && criteria.matches(o))
                .cloned()
                .collect();
            // Subscribing under the read lock: everything newer than `st.version`
            // is enqueued after this point and will reach `rx`.
            (catch_up, st.broadcaster.subscribe(), st.version)
        };
        catch_up.sort_by_key(|o| o.resource_version());
        let floor = opts.start_version.max(high);
        let mut delivered = 0usize;
        for object in catch_up {
            if cancel.is_cancelled() {
                return Ok(());
            }
            on_event(WatchEvent { event_type: WatchEventType::Added, object }).await?;
            delivered += 1;
        }

        let deadline = tokio::time::sleep(self.cfg.watch_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(kind = self.kind.kind_name(), delivered, "store: watch cancelled");
                    break;
                }
                _ = &mut deadline => {
                    debug!(kind = self.kind.kind_name(), delivered, "store: watch timeout");
                    break;
                }
                recv = rx.recv() => match recv {
                    Ok(ev) => {
                        if ev.resource_version() <= floor || !criteria.matches(&ev.object) {
                            continue;
                        }
                        on_event(ev).await?;
                        delivered += 1;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        counter!("store_watch_lagged_total", n);
                        warn!(kind = self.kind.kind_name(), skipped = n, "store: watcher lagged; events skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(kind = self.kind.kind_name(), delivered, "store: broadcaster closed");
                        break;
                    }
                }
            }
        }
        histogram!("store_watch_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }
}
