//! Base view plus a registry of named sandbox views seeded from a delegate.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use rustc_hash::FxHashMap;
use tokio::sync::OnceCell;
use tracing::debug;

use advisor_core::StoreResult;

use crate::config::ViewConfig;
use crate::view::View;

type Slot = Arc<OnceCell<Arc<View>>>;

pub struct ViewAccess {
    base: Arc<View>,
    cfg: ViewConfig,
    sandboxes: Mutex<FxHashMap<String, Slot>>,
}

impl ViewAccess {
    /// Must be called inside a Tokio runtime.
    pub fn new(base_name: &str, cfg: ViewConfig) -> Self {
        Self { base: View::new(base_name, cfg.clone()), cfg, sandboxes: Mutex::new(FxHashMap::default()) }
    }

    pub fn base_view(&self) -> Arc<View> {
        Arc::clone(&self.base)
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, FxHashMap<String, Slot>> {
        self.sandboxes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the sandbox called `name`, creating it on first use as a
    /// point-in-time copy of `delegate`. Concurrent callers asking for the
    /// same name all receive the one view that was seeded.
    pub async fn sandbox_over(&self, name: &str, delegate: &Arc<View>) -> StoreResult<Arc<View>> {
        let slot = Arc::clone(self.slots().entry(name.to_string()).or_default());
        let view = slot
            .get_or_try_init(|| async {
                let t0 = Instant::now();
                let view = View::new(name, self.cfg.clone());
                let copied = view.seed_from(delegate).await?;
                debug!(sandbox = name, delegate = %delegate.name(), objects = copied, took_ms = %t0.elapsed().as_millis(), "access: sandbox seeded");
                Ok::<_, advisor_core::StoreError>(view)
            })
            .await?;
        Ok(Arc::clone(view))
    }

    pub fn cached(&self, name: &str) -> Option<Arc<View>> {
        self.slots().get(name).and_then(|s| s.get().cloned())
    }

    /// Forget a sandbox. Holders of the view keep a working copy.
    pub fn discard(&self, name: &str) -> bool {
        self.slots().remove(name).is_some()
    }

    /// Forget every sandbox whose name starts with `prefix`.
    pub fn discard_prefixed(&self, prefix: &str) -> usize {
        let mut slots = self.slots();
        let before = slots.len();
        slots.retain(|k, _| !k.starts_with(prefix));
        before - slots.len()
    }

    pub fn sandbox_count(&self) -> usize {
        self.slots().len()
    }
}
