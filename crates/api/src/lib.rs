//! Scaling advisor API façade (in-process).
//!
//! Frontends depend on these traits and types only; the in-process
//! implementation drives the simulator directly.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use advisor_core::ObjectKey;
use advisor_scheduler::SchedulerLauncher;
use advisor_sim::{ClusterSnapshot, ScalingAdviceRequest, ScalingAdviceResponse, SimConfig, SimError, Simulator};
use advisor_view::{View, ViewConfig};

pub use advisor_sim::{PricingAccess, StaticPricing};

/// API errors suitable for transport over RPC later.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum AdvisorError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("no_scaling_advice: {0}")]
    NoScalingAdvice(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl From<SimError> for AdvisorError {
    fn from(e: SimError) -> Self {
        let msg = e.to_string();
        match e.category() {
            "validation" | "bad_patch" | "unprocessable" | "type_mismatch" => AdvisorError::Validation(msg),
            "not_found" => AdvisorError::NotFound(msg),
            "conflict" => AdvisorError::Conflict(msg),
            "cancelled" => AdvisorError::Cancelled(msg),
            "timeout" => AdvisorError::Timeout(msg),
            "no_scaling_advice" | "no_winning_score" | "no_unscheduled_pods" => AdvisorError::NoScalingAdvice(msg),
            _ => AdvisorError::Internal(msg),
        }
    }
}

pub type AdvisorResult<T> = Result<T, AdvisorError>;

/// Per-kind object count of a loaded snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindSummary { pub kind: String, pub objects: usize, pub resource_version: u64 }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub kinds: Vec<KindSummary>,
    /// Pods without a node assignment, `namespace/name`.
    pub unscheduled: Vec<String>,
}

/// Scaling advisor API surface.
#[async_trait::async_trait]
pub trait AdvisorApi: Send + Sync {
    /// Start a plan request. A request without an id gets a fresh one. The
    /// stream ends after the last plan or after a single error.
    async fn plan(&self, req: ScalingAdviceRequest) -> AdvisorResult<StreamHandle<AdvisorResult<ScalingAdviceResponse>>>;

    /// Load a snapshot into a scratch view and summarise it.
    async fn inspect(&self, snapshot: ClusterSnapshot) -> AdvisorResult<SnapshotSummary>;
}

/// Stops the background work behind a stream. The stream stays open until
/// the work has reported its terminal `cancelled` error.
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn cancel(self) {
        self.token.cancel();
    }

    /// Token that fires when the stream is cancelled.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

pub struct StreamHandle<T> { pub rx: mpsc::Receiver<T>, pub cancel: CancelHandle }

// ----------------- In-process implementation -----------------

/// In-process implementation driving a [`Simulator`] directly.
pub struct InProcApi {
    simulator: Simulator,
    view_cfg: ViewConfig,
}

impl InProcApi {
    pub fn new(launcher: Arc<dyn SchedulerLauncher>, cfg: SimConfig) -> Self {
        let view_cfg = cfg.view.clone();
        Self { simulator: Simulator::new(launcher, cfg), view_cfg }
    }

    pub fn with_pricing(mut self, pricing: Arc<dyn PricingAccess>) -> Self {
        self.simulator = self.simulator.with_pricing(pricing);
        self
    }
}

#[async_trait::async_trait]
impl AdvisorApi for InProcApi {
    async fn plan(&self, mut req: ScalingAdviceRequest) -> AdvisorResult<StreamHandle<AdvisorResult<ScalingAdviceResponse>>> {
        counter!("api_requests_total", 1u64, "op" => "plan");
        if req.id.is_empty() {
            req.id = uuid::Uuid::new_v4().to_string();
        }
        if req.correlation_id.is_empty() {
            req.correlation_id = req.id.clone();
        }
        info!(request = %req.id, correlation = %req.correlation_id, mode = ?req.mode, scoring = ?req.scoring, "api: plan");
        let token = CancellationToken::new();
        let mut inner = self.simulator.plan(req, token.clone());
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut forwarded = 0usize;
            while let Some(item) = inner.recv().await {
                if tx.send(item.map_err(AdvisorError::from)).await.is_err() {
                    break;
                }
                forwarded += 1;
            }
            debug!(forwarded, "api: plan stream closed");
        });
        Ok(StreamHandle { rx, cancel: CancelHandle { token } })
    }

    async fn inspect(&self, snapshot: ClusterSnapshot) -> AdvisorResult<SnapshotSummary> {
        counter!("api_requests_total", 1u64, "op" => "inspect");
        let t0 = Instant::now();
        let view = View::new("inspect", self.view_cfg.clone());
        view.load_objects(snapshot.to_objects())
            .await
            .map_err(|e| AdvisorError::from(SimError::store("loading snapshot", e)))?;
        let kinds = view
            .stats()
            .await
            .into_iter()
            .map(|s| KindSummary { kind: s.kind.kind_name().to_string(), objects: s.objects, resource_version: s.version })
            .collect();
        let mut unscheduled: Vec<String> = view
            .unscheduled_pods()
            .await
            .map_err(|e| AdvisorError::from(SimError::store("listing unscheduled pods", e)))?
            .iter()
            .map(|p| {
                ObjectKey::new(p.metadata.namespace.as_deref().unwrap_or(""), p.metadata.name.as_deref().unwrap_or(""))
                    .to_string()
            })
            .collect();
        unscheduled.sort();
        info!(unscheduled = unscheduled.len(), took_ms = %t0.elapsed().as_millis(), "api: inspect");
        Ok(SnapshotSummary { kinds, unscheduled })
    }
}
