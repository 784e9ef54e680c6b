//! Closed set of resource kinds held by a view.
//!
//! Every kind maps to a concrete `k8s-openapi` type. The `object_kinds!` macro
//! generates the kind enum, the `Object` tagged union and the per-kind typed
//! (de)serialization so that no code path needs to look types up at runtime.

use k8s_openapi::api::core::v1::{Namespace, Node, PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::events::v1::Event;
use k8s_openapi::api::node::v1::RuntimeClass;
use k8s_openapi::api::scheduling::v1::PriorityClass;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::{StoreError, StoreResult};
use crate::ObjectKey;

macro_rules! object_kinds {
    ($( $variant:ident => $ty:ty, namespaced: $ns:literal; )+) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum ObjectKind { $($variant),+ }

        impl ObjectKind {
            /// All supported kinds, in the order views lock their stores.
            pub const ALL: &'static [ObjectKind] = &[$(ObjectKind::$variant),+];

            pub fn kind_name(self) -> &'static str {
                match self { $(ObjectKind::$variant => <$ty as k8s_openapi::Resource>::KIND),+ }
            }

            pub fn api_version(self) -> &'static str {
                match self { $(ObjectKind::$variant => <$ty as k8s_openapi::Resource>::API_VERSION),+ }
            }

            /// Plural resource name used in URL paths (`pods`, `nodes`, ...).
            pub fn plural(self) -> &'static str {
                match self { $(ObjectKind::$variant => <$ty as k8s_openapi::Resource>::URL_PATH_SEGMENT),+ }
            }

            pub fn namespaced(self) -> bool {
                match self { $(ObjectKind::$variant => $ns),+ }
            }
        }

        /// A stored object of one of the supported kinds.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Object { $($variant($ty)),+ }

        impl Object {
            pub fn kind(&self) -> ObjectKind {
                match self { $(Object::$variant(_) => ObjectKind::$variant),+ }
            }

            pub fn meta(&self) -> &ObjectMeta {
                match self { $(Object::$variant(o) => Resource::meta(o)),+ }
            }

            pub fn meta_mut(&mut self) -> &mut ObjectMeta {
                match self { $(Object::$variant(o) => Resource::meta_mut(o)),+ }
            }

            /// Decode a raw JSON document as `kind`. A document declaring a
            /// different `kind` is a type mismatch; missing type meta is filled in.
            pub fn from_value(kind: ObjectKind, mut raw: Json) -> StoreResult<Self> {
                ensure_type_meta(kind, &mut raw)?;
                match kind {
                    $(ObjectKind::$variant => serde_json::from_value::<$ty>(raw)
                        .map(Object::$variant)
                        .map_err(|e| StoreError::Validation(format!("decoding {}: {}", kind.kind_name(), e))),)+
                }
            }

            pub fn to_value(&self) -> StoreResult<Json> {
                let res = match self { $(Object::$variant(o) => serde_json::to_value(o)),+ };
                res.map_err(|e| StoreError::Internal(format!("encoding {}: {}", self.kind().kind_name(), e)))
            }
        }

        $(
            impl From<$ty> for Object {
                fn from(o: $ty) -> Self { Object::$variant(o) }
            }

            impl TryFrom<Object> for $ty {
                type Error = StoreError;

                fn try_from(o: Object) -> StoreResult<Self> {
                    match o {
                        Object::$variant(v) => Ok(v),
                        other => Err(StoreError::TypeMismatch { expected: ObjectKind::$variant, actual: other.kind() }),
                    }
                }
            }
        )+
    };
}

object_kinds! {
    Namespace => Namespace, namespaced: false;
    Node => Node, namespaced: false;
    Pod => Pod, namespaced: true;
    PriorityClass => PriorityClass, namespaced: false;
    RuntimeClass => RuntimeClass, namespaced: false;
    PersistentVolume => PersistentVolume, namespaced: false;
    PersistentVolumeClaim => PersistentVolumeClaim, namespaced: true;
    StorageClass => StorageClass, namespaced: false;
    Event => Event, namespaced: true;
}

impl ObjectKind {
    /// Kind name of the typed list wrapper, e.g. `PodList`.
    pub fn list_kind_name(self) -> String {
        format!("{}List", self.kind_name())
    }

    /// Resolve a kind from its kind name (`Pod`) or plural resource (`pods`).
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.kind_name().eq_ignore_ascii_case(s) || k.plural() == s)
    }
}

fn ensure_type_meta(kind: ObjectKind, raw: &mut Json) -> StoreResult<()> {
    let obj = raw
        .as_object_mut()
        .ok_or_else(|| StoreError::Validation(format!("{} document is not a JSON object", kind.kind_name())))?;
    match obj.get("kind").and_then(|v| v.as_str()) {
        Some(k) if k != kind.kind_name() => {
            let actual = ObjectKind::parse(k)
                .ok_or_else(|| StoreError::Validation(format!("unknown kind {}", k)))?;
            return Err(StoreError::TypeMismatch { expected: kind, actual });
        }
        Some(_) => {}
        None => {
            obj.insert("kind".into(), Json::String(kind.kind_name().to_string()));
        }
    }
    if !obj.contains_key("apiVersion") {
        obj.insert("apiVersion".into(), Json::String(kind.api_version().to_string()));
    }
    Ok(())
}

impl Object {
    pub fn key(&self) -> ObjectKey {
        let meta = self.meta();
        ObjectKey::new(
            meta.namespace.as_deref().unwrap_or(""),
            meta.name.as_deref().unwrap_or(""),
        )
    }

    /// Store-assigned version, 0 when unset or unparsable.
    pub fn resource_version(&self) -> u64 {
        self.meta()
            .resource_version
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    pub fn set_resource_version(&mut self, v: u64) {
        self.meta_mut().resource_version = Some(v.to_string());
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.meta().labels.as_ref().and_then(|l| l.get(key)).map(|s| s.as_str())
    }

    pub fn as_pod(&self) -> Option<&Pod> {
        match self {
            Object::Pod(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Object::Node(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_event(&self) -> Option<&Event> {
        match self {
            Object::Event(e) => Some(e),
            _ => None,
        }
    }
}

/// A typed list of one kind, tagged with the store-wide version at read time.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectList {
    pub kind: ObjectKind,
    pub resource_version: u64,
    pub items: Vec<Object>,
}

impl ObjectList {
    /// Render as the `<Kind>List` JSON document clients expect.
    pub fn to_value(&self) -> StoreResult<Json> {
        let items = self.items.iter().map(Object::to_value).collect::<StoreResult<Vec<_>>>()?;
        Ok(serde_json::json!({
            "apiVersion": self.kind.api_version(),
            "kind": self.kind.list_kind_name(),
            "metadata": { "resourceVersion": self.resource_version.to_string() },
            "items": items,
        }))
    }

    pub fn from_value(kind: ObjectKind, raw: Json) -> StoreResult<Self> {
        let list_kind = raw.get("kind").and_then(|v| v.as_str()).unwrap_or_default();
        if list_kind != kind.list_kind_name() {
            return Err(StoreError::Validation(format!(
                "expected {}, got {:?}",
                kind.list_kind_name(),
                list_kind
            )));
        }
        let resource_version = raw
            .get("metadata")
            .and_then(|m| m.get("resourceVersion"))
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let items = match raw.get("items") {
            Some(Json::Array(arr)) => arr
                .iter()
                .cloned()
                .map(|v| Object::from_value(kind, v))
                .collect::<StoreResult<Vec<_>>>()?,
            _ => Vec::new(),
        };
        Ok(Self { kind, resource_version, items })
    }
}
