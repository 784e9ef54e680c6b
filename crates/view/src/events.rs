//! Structured event recorder backed by a view's `Event` store.

use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::api::events::v1::Event;
use serde::{Deserialize, Serialize};
use tracing::debug;

use advisor_core::{MatchCriteria, Object, ObjectKind, StoreError, StoreResult};
use advisor_store::VersionedStore;

pub const REASON_SCHEDULED: &str = "Scheduled";
pub const REASON_BINDING: &str = "Binding";
pub const REASON_FAILED_SCHEDULING: &str = "FailedScheduling";

pub const TYPE_NORMAL: &str = "Normal";
pub const TYPE_WARNING: &str = "Warning";

/// What a component reports about one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub regarding: ObjectReference,
    /// Secondary object, e.g. the node a pod was bound to.
    pub related: Option<ObjectReference>,
    pub reason: String,
    pub action: String,
    pub note: String,
    pub event_type: String,
    pub reporting_controller: String,
}

impl EventRecord {
    /// Reference to `obj` suitable for `regarding`.
    pub fn reference(obj: &Object) -> ObjectReference {
        let meta = obj.meta();
        ObjectReference {
            api_version: Some(obj.kind().api_version().to_string()),
            kind: Some(obj.kind().kind_name().to_string()),
            name: meta.name.clone(),
            namespace: meta.namespace.clone(),
            uid: meta.uid.clone(),
            resource_version: meta.resource_version.clone(),
            ..ObjectReference::default()
        }
    }
}

/// An event as read back: its store version plus the fields trackers act on.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub resource_version: u64,
    pub reason: String,
    pub note: String,
    pub regarding: ObjectReference,
    pub related: Option<ObjectReference>,
    pub event: Event,
}

impl RecordedEvent {
    fn from_object(obj: Object) -> StoreResult<Self> {
        let resource_version = obj.resource_version();
        let event: Event = obj.try_into()?;
        Ok(Self {
            resource_version,
            reason: event.reason.clone().unwrap_or_default(),
            note: event.note.clone().unwrap_or_default(),
            regarding: event.regarding.clone().unwrap_or_default(),
            related: event.related.clone(),
            event,
        })
    }
}

/// Recorder over one view's event store. Cheap to create; borrows the store.
pub struct EventSink<'a> {
    store: &'a VersionedStore,
}

impl<'a> EventSink<'a> {
    pub(crate) fn new(store: &'a VersionedStore) -> Self {
        Self { store }
    }

    pub async fn record(&self, rec: EventRecord) -> StoreResult<RecordedEvent> {
        let namespace = rec.regarding.namespace.clone().filter(|s| !s.is_empty()).unwrap_or_else(|| "default".into());
        let target = rec.regarding.name.clone().unwrap_or_default();
        let name = format!("{}.{}", target, uuid::Uuid::new_v4().simple());
        let raw = serde_json::json!({
            "apiVersion": ObjectKind::Event.api_version(),
            "kind": ObjectKind::Event.kind_name(),
            "metadata": {
                "name": name,
                "namespace": namespace,
                "uid": uuid::Uuid::new_v4().to_string(),
                "creationTimestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            },
            "eventTime": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            "reason": rec.reason,
            "action": rec.action,
            "note": rec.note,
            "type": rec.event_type,
            "reportingController": rec.reporting_controller,
            "reportingInstance": rec.reporting_controller,
            "regarding": serde_json::to_value(&rec.regarding)
                .map_err(|e| StoreError::Internal(format!("encoding event reference: {}", e)))?,
        });
        let mut raw = raw;
        if let Some(related) = rec.related.as_ref() {
            raw["related"] = serde_json::to_value(related)
                .map_err(|e| StoreError::Internal(format!("encoding event reference: {}", e)))?;
        }
        let obj = Object::from_value(ObjectKind::Event, raw)?;
        let stored = self.store.create(obj).await?;
        debug!(reason = %rec.reason, target = %target, version = stored.resource_version(), "events: recorded");
        RecordedEvent::from_object(stored)
    }

    /// Events with a resource version greater than `after`, oldest first,
    /// together with the current store version.
    pub async fn list_after(&self, after: u64) -> StoreResult<(Vec<RecordedEvent>, u64)> {
        let list = self.store.list(&MatchCriteria::all()).await;
        let mut items: Vec<Object> = list.items.into_iter().filter(|o| o.resource_version() > after).collect();
        items.sort_by_key(|o| o.resource_version());
        let events = items.into_iter().map(RecordedEvent::from_object).collect::<StoreResult<Vec<_>>>()?;
        Ok((events, list.resource_version))
    }

    pub async fn version(&self) -> u64 {
        self.store.version().await
    }

    /// Drop every recorded event. The version counter keeps counting.
    pub async fn reset(&self) -> StoreResult<usize> {
        self.store.delete_objects(&MatchCriteria::all()).await
    }
}
