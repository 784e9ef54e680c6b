//! Bounded per-store event queue and its dispatch task.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use advisor_core::WatchEvent;
use metrics::counter;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, warn};

use crate::config::QueuePolicy;

struct QueueInner {
    items: VecDeque<WatchEvent>,
    closed: bool,
    dropped: u64,
}

/// FIFO of pending change events with fixed capacity. On overflow it either
/// evicts the oldest pending event or makes the producer wait for space.
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    cap: usize,
    policy: QueuePolicy,
    ready: Notify,
    space: Notify,
}

impl EventQueue {
    pub fn with_capacity(cap: usize, policy: QueuePolicy) -> Self {
        Self {
            inner: Mutex::new(QueueInner { items: VecDeque::with_capacity(cap.max(1)), closed: false, dropped: 0 }),
            cap: cap.max(1),
            policy,
            ready: Notify::new(),
            space: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        // A poisoned queue only means a producer panicked mid-push; the deque is still consistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Enqueue one event. Events pushed after `close` are discarded.
    pub async fn push(&self, ev: WatchEvent) {
        loop {
            let notified = {
                let mut g = self.lock();
                if g.closed {
                    return;
                }
                if g.items.len() < self.cap {
                    g.items.push_back(ev);
                    drop(g);
                    self.ready.notify_one();
                    return;
                }
                match self.policy {
                    QueuePolicy::DropOldest => {
                        g.items.pop_front();
                        g.dropped += 1;
                        g.items.push_back(ev);
                        let dropped = g.dropped;
                        drop(g);
                        counter!("store_events_dropped_total", 1u64);
                        warn!(cap = self.cap, dropped, "store: event queue full; dropped oldest event");
                        self.ready.notify_one();
                        return;
                    }
                    QueuePolicy::Block => self.space.notified(),
                }
            };
            notified.await;
        }
    }

    /// Drain all currently queued events. Returns `None` once closed and empty.
    pub async fn drain_ready(&self) -> Option<Vec<WatchEvent>> {
        loop {
            {
                let mut g = self.lock();
                if !g.items.is_empty() {
                    let out: Vec<WatchEvent> = g.items.drain(..).collect();
                    drop(g);
                    self.space.notify_waiters();
                    self.space.notify_one();
                    return Some(out);
                }
                if g.closed {
                    return None;
                }
            }
            self.ready.notified().await;
        }
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_one();
        self.space.notify_waiters();
    }
}

/// Queue plus fan-out channel owned by one store generation. Dropping it
/// closes the queue; the dispatch task flushes what is left and exits, which
/// closes every subscriber.
pub(crate) struct Broadcaster {
    pub(crate) queue: Arc<EventQueue>,
    pub(crate) tx: broadcast::Sender<WatchEvent>,
}

impl Broadcaster {
    /// Must be called from within a Tokio runtime.
    pub(crate) fn spawn(cap: usize, policy: QueuePolicy, kind: &'static str) -> Self {
        let queue = Arc::new(EventQueue::with_capacity(cap, policy));
        let (tx, _rx) = broadcast::channel(cap.max(1));
        let q = Arc::clone(&queue);
        let out = tx.clone();
        tokio::spawn(async move {
            let mut sent = 0u64;
            while let Some(batch) = q.drain_ready().await {
                for ev in batch {
                    // No subscribers is not a failure: nobody is watching this kind.
                    let _ = out.send(ev);
                    sent += 1;
                }
            }
            debug!(kind, sent, "store: dispatch task stopped");
        });
        Self { queue, tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.tx.subscribe()
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.queue.close();
    }
}
