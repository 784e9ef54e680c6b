//! Embedded scheduler contract: launching a scheduler against a view client,
//! a counting bound on concurrent instances and a first-fit reference scheduler.

#![forbid(unsafe_code)]

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use advisor_core::StoreError;
use advisor_view::ViewClient;

mod first_fit;

pub use first_fit::FirstFitLauncher;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("launch: {0}")]
    Launch(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a launcher needs to start one scheduler instance.
#[derive(Clone)]
pub struct LaunchParams {
    /// Instance name, used in logs and events.
    pub name: String,
    pub client: Arc<dyn ViewClient>,
}

/// A running scheduler. Closing or dropping it stops the instance and frees
/// its concurrency slot.
pub struct SchedulerHandle {
    name: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl SchedulerHandle {
    pub fn new(name: &str, cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { name: name.to_string(), cancel, task: Some(task), permit: None }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }

    /// Stop the instance and wait for its task to exit.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::warn!(scheduler = %self.name, "scheduler: task panicked");
                }
            }
        }
        self.permit.take();
        debug!(scheduler = %self.name, "scheduler: closed");
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait::async_trait]
pub trait SchedulerLauncher: Send + Sync {
    /// Start a scheduler bound to `params.client`. Returns as soon as the
    /// instance runs; scheduling proceeds in the background.
    async fn launch(&self, cancel: &CancellationToken, params: LaunchParams) -> Result<SchedulerHandle, SchedulerError>;
}

/// Caps how many instances of `inner` run at once. Launching beyond the
/// bound waits for a running handle to close.
pub struct BoundedLauncher<L> {
    inner: L,
    permits: Arc<Semaphore>,
}

impl<L: SchedulerLauncher> BoundedLauncher<L> {
    pub fn new(inner: L, max_parallel: usize) -> Self {
        Self { inner, permits: Arc::new(Semaphore::new(max_parallel.max(1))) }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait::async_trait]
impl<L: SchedulerLauncher> SchedulerLauncher for BoundedLauncher<L> {
    async fn launch(&self, cancel: &CancellationToken, params: LaunchParams) -> Result<SchedulerHandle, SchedulerError> {
        let name = params.name.clone();
        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(SchedulerError::Cancelled(format!("waiting for a slot for {}", name))),
            p = Arc::clone(&self.permits).acquire_owned() => {
                p.map_err(|_| SchedulerError::Launch("launcher is shut down".into()))?
            }
        };
        let mut handle = self.inner.launch(cancel, params).await?;
        handle.permit = Some(permit);
        metrics::counter!("scheduler_launches_total", 1u64);
        debug!(scheduler = %name, free = self.permits.available_permits(), "scheduler: launched");
        Ok(handle)
    }
}

#[async_trait::async_trait]
impl<L: SchedulerLauncher + ?Sized> SchedulerLauncher for Arc<L> {
    async fn launch(&self, cancel: &CancellationToken, params: LaunchParams) -> Result<SchedulerHandle, SchedulerError> {
        (**self).launch(cancel, params).await
    }
}
