//! Client facades over a view: an in-process short circuit and a wire
//! transport that round-trips every request and response through JSON.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Binding;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use advisor_core::{MatchCriteria, Object, ObjectKey, ObjectKind, ObjectList, StoreError, StoreResult, WatchEvent};
use advisor_store::WatchOptions;

use crate::events::EventRecord;
use crate::patch::PatchKind;
use crate::view::View;
use crate::wire;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientMode {
    #[default]
    InProcess,
    Wire,
}

impl std::str::FromStr for ClientMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in-process" | "inprocess" => Ok(Self::InProcess),
            "wire" => Ok(Self::Wire),
            other => Err(format!("unknown client mode: {} (expect in-process|wire)", other)),
        }
    }
}

/// Cancels the underlying watch when dropped.
#[derive(Debug)]
pub struct WatchGuard(CancellationToken);

impl WatchGuard {
    pub fn cancel(&self) {
        self.0.cancel();
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Events of one client watch. The channel closes when the watch ends.
#[derive(Debug)]
pub struct WatchStream {
    pub events: mpsc::Receiver<WatchEvent>,
    pub guard: WatchGuard,
}

impl WatchStream {
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }
}

#[async_trait::async_trait]
pub trait ViewClient: Send + Sync {
    fn view_name(&self) -> &str;
    fn mode(&self) -> ClientMode;
    async fn create(&self, obj: Object) -> StoreResult<Object>;
    async fn get(&self, kind: ObjectKind, key: &ObjectKey) -> StoreResult<Object>;
    async fn list(&self, kind: ObjectKind, criteria: &MatchCriteria) -> StoreResult<ObjectList>;
    async fn update(&self, obj: Object) -> StoreResult<Object>;
    async fn patch(&self, kind: ObjectKind, key: &ObjectKey, patch_kind: PatchKind, patch: &Json) -> StoreResult<Object>;
    async fn patch_status(
        &self,
        kind: ObjectKind,
        key: &ObjectKey,
        patch_kind: PatchKind,
        patch: &Json,
    ) -> StoreResult<Object>;
    async fn delete(&self, kind: ObjectKind, key: &ObjectKey) -> StoreResult<()>;
    async fn watch(&self, kind: ObjectKind, opts: WatchOptions) -> StoreResult<WatchStream>;
    async fn bind(&self, binding: &Binding) -> StoreResult<()>;
    async fn record_event(&self, rec: EventRecord) -> StoreResult<()>;
}

// Runs `view.watch_objects` on a task, handing each event to `forward`.
fn spawn_watch<F, Fut>(view: Arc<View>, kind: ObjectKind, opts: WatchOptions, token: CancellationToken, forward: F)
where
    F: FnMut(WatchEvent) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = StoreResult<()>> + Send,
{
    tokio::spawn(async move {
        match view.watch_objects(kind, opts, &token, forward).await {
            Ok(()) => debug!(view = %view.name(), kind = kind.kind_name(), "client: watch ended"),
            Err(StoreError::WatchClosed(_)) => debug!(view = %view.name(), kind = kind.kind_name(), "client: watcher went away"),
            Err(e) => warn!(view = %view.name(), kind = kind.kind_name(), error = %e, "client: watch failed"),
        }
    });
}

/// Calls the view directly.
pub struct InProcClient {
    view: Arc<View>,
}

impl InProcClient {
    pub fn new(view: Arc<View>) -> Self {
        Self { view }
    }
}

#[async_trait::async_trait]
impl ViewClient for InProcClient {
    fn view_name(&self) -> &str {
        self.view.name()
    }

    fn mode(&self) -> ClientMode {
        ClientMode::InProcess
    }

    async fn create(&self, obj: Object) -> StoreResult<Object> {
        self.view.create_object(obj).await
    }

    async fn get(&self, kind: ObjectKind, key: &ObjectKey) -> StoreResult<Object> {
        self.view.get_object(kind, key).await
    }

    async fn list(&self, kind: ObjectKind, criteria: &MatchCriteria) -> StoreResult<ObjectList> {
        Ok(self.view.list_objects(kind, criteria).await)
    }

    async fn update(&self, obj: Object) -> StoreResult<Object> {
        self.view.update_object(obj).await
    }

    async fn patch(&self, kind: ObjectKind, key: &ObjectKey, patch_kind: PatchKind, patch: &Json) -> StoreResult<Object> {
        self.view.patch_object(kind, key, patch_kind, patch).await
    }

    async fn patch_status(
        &self,
        kind: ObjectKind,
        key: &ObjectKey,
        patch_kind: PatchKind,
        patch: &Json,
    ) -> StoreResult<Object> {
        self.view.patch_object_status(kind, key, patch_kind, patch).await
    }

    async fn delete(&self, kind: ObjectKind, key: &ObjectKey) -> StoreResult<()> {
        self.view.delete_object(kind, key).await.map(|_| ())
    }

    async fn watch(&self, kind: ObjectKind, opts: WatchOptions) -> StoreResult<WatchStream> {
        let (tx, rx) = mpsc::channel(self.view.config().client_buffer);
        let token = CancellationToken::new();
        spawn_watch(Arc::clone(&self.view), kind, opts, token.clone(), move |ev| {
            let tx = tx.clone();
            async move { tx.send(ev).await.map_err(|_| StoreError::WatchClosed("receiver dropped".into())) }
        });
        Ok(WatchStream { events: rx, guard: WatchGuard(token) })
    }

    async fn bind(&self, binding: &Binding) -> StoreResult<()> {
        self.view.update_pod_node_binding(binding).await.map(|_| ())
    }

    async fn record_event(&self, rec: EventRecord) -> StoreResult<()> {
        self.view.event_sink().record(rec).await.map(|_| ())
    }
}

/// Serializes requests and responses as JSON bodies and streams watches as
/// newline-delimited JSON, the way a remote client would see the view.
pub struct WireClient {
    view: Arc<View>,
}

type Reply = Result<Vec<u8>, Vec<u8>>;

fn reply<T>(res: StoreResult<T>, encode: impl FnOnce(&T) -> StoreResult<Vec<u8>>) -> Reply {
    match res.and_then(|v| encode(&v)) {
        Ok(body) => Ok(body),
        Err(e) => Err(wire::encode_status(&e)),
    }
}

fn read_object(kind: ObjectKind, r: Reply) -> StoreResult<Object> {
    match r {
        Ok(body) => wire::decode_object(kind, &body),
        Err(body) => Err(wire::decode_status(&body)),
    }
}

fn read_empty(r: Reply) -> StoreResult<()> {
    r.map(|_| ()).map_err(|body| wire::decode_status(&body))
}

fn json_body(v: &Json) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(v).map_err(|e| StoreError::Internal(format!("wire encode: {}", e)))
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(body).map_err(|e| StoreError::Validation(format!("wire decode: {}", e)))
}

fn empty<T>(_: &T) -> StoreResult<Vec<u8>> {
    Ok(Vec::new())
}

impl WireClient {
    pub fn new(view: Arc<View>) -> Self {
        Self { view }
    }

    async fn serve_object(&self, kind: ObjectKind, body: Vec<u8>, op: WriteOp) -> Reply {
        let obj = match wire::decode_object(kind, &body) {
            Ok(o) => o,
            Err(e) => return Err(wire::encode_status(&e)),
        };
        let res = match op {
            WriteOp::Create => self.view.create_object(obj).await,
            WriteOp::Update => self.view.update_object(obj).await,
        };
        reply(res, wire::encode_object)
    }

    async fn serve_patch(&self, kind: ObjectKind, key: &ObjectKey, patch_kind: PatchKind, body: Vec<u8>, status: bool) -> Reply {
        let patch: Json = match parse_body(&body) {
            Ok(p) => p,
            Err(e) => return Err(wire::encode_status(&e)),
        };
        let res = if status {
            self.view.patch_object_status(kind, key, patch_kind, &patch).await
        } else {
            self.view.patch_object(kind, key, patch_kind, &patch).await
        };
        reply(res, wire::encode_object)
    }
}

#[derive(Clone, Copy)]
enum WriteOp {
    Create,
    Update,
}

#[async_trait::async_trait]
impl ViewClient for WireClient {
    fn view_name(&self) -> &str {
        self.view.name()
    }

    fn mode(&self) -> ClientMode {
        ClientMode::Wire
    }

    async fn create(&self, obj: Object) -> StoreResult<Object> {
        let kind = obj.kind();
        let body = wire::encode_object(&obj)?;
        read_object(kind, self.serve_object(kind, body, WriteOp::Create).await)
    }

    async fn get(&self, kind: ObjectKind, key: &ObjectKey) -> StoreResult<Object> {
        read_object(kind, reply(self.view.get_object(kind, key).await, wire::encode_object))
    }

    async fn list(&self, kind: ObjectKind, criteria: &MatchCriteria) -> StoreResult<ObjectList> {
        let list = self.view.list_objects(kind, criteria).await;
        match reply(Ok(list), wire::encode_list) {
            Ok(body) => wire::decode_list(kind, &body),
            Err(body) => Err(wire::decode_status(&body)),
        }
    }

    async fn update(&self, obj: Object) -> StoreResult<Object> {
        let kind = obj.kind();
        let body = wire::encode_object(&obj)?;
        read_object(kind, self.serve_object(kind, body, WriteOp::Update).await)
    }

    async fn patch(&self, kind: ObjectKind, key: &ObjectKey, patch_kind: PatchKind, patch: &Json) -> StoreResult<Object> {
        let body = json_body(patch)?;
        read_object(kind, self.serve_patch(kind, key, patch_kind, body, false).await)
    }

    async fn patch_status(
        &self,
        kind: ObjectKind,
        key: &ObjectKey,
        patch_kind: PatchKind,
        patch: &Json,
    ) -> StoreResult<Object> {
        let body = json_body(patch)?;
        read_object(kind, self.serve_patch(kind, key, patch_kind, body, true).await)
    }

    async fn delete(&self, kind: ObjectKind, key: &ObjectKey) -> StoreResult<()> {
        read_empty(reply(self.view.delete_object(kind, key).await, empty))
    }

    async fn watch(&self, kind: ObjectKind, opts: WatchOptions) -> StoreResult<WatchStream> {
        let cap = self.view.config().client_buffer;
        let (line_tx, mut line_rx) = mpsc::channel::<Vec<u8>>(cap);
        let (tx, rx) = mpsc::channel(cap);
        let token = CancellationToken::new();
        spawn_watch(Arc::clone(&self.view), kind, opts, token.clone(), move |ev| {
            let line_tx = line_tx.clone();
            async move {
                let line = wire::encode_event(&ev)?;
                line_tx.send(line).await.map_err(|_| StoreError::WatchClosed("stream reader dropped".into()))
            }
        });
        let reader_token = token.clone();
        tokio::spawn(async move {
            let mut decoder = wire::LineDecoder::default();
            while let Some(chunk) = line_rx.recv().await {
                for line in decoder.push(&chunk) {
                    match wire::decode_event(kind, &line) {
                        Ok(ev) => {
                            if tx.send(ev).await.is_err() {
                                reader_token.cancel();
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(kind = kind.kind_name(), error = %e, "client: undecodable watch line");
                            reader_token.cancel();
                            return;
                        }
                    }
                }
            }
        });
        Ok(WatchStream { events: rx, guard: WatchGuard(token) })
    }

    async fn bind(&self, binding: &Binding) -> StoreResult<()> {
        let body = serde_json::to_vec(binding).map_err(|e| StoreError::Internal(format!("wire encode: {}", e)))?;
        let binding: Binding = parse_body(&body)?;
        read_empty(reply(self.view.update_pod_node_binding(&binding).await, empty))
    }

    async fn record_event(&self, rec: EventRecord) -> StoreResult<()> {
        let body = serde_json::to_vec(&rec).map_err(|e| StoreError::Internal(format!("wire encode: {}", e)))?;
        let rec: EventRecord = parse_body(&body)?;
        read_empty(reply(self.view.event_sink().record(rec).await, empty))
    }
}
