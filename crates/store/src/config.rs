use std::time::Duration;

/// What a full event queue does with the next event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePolicy {
    /// Evict the oldest pending event and log the drop.
    #[default]
    DropOldest,
    /// Make the mutating call wait until the dispatcher frees space.
    Block,
}

impl std::str::FromStr for QueuePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop-oldest" | "drop_oldest" => Ok(Self::DropOldest),
            "block" => Ok(Self::Block),
            other => Err(format!("unknown queue policy: {} (expect drop-oldest|block)", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub queue_cap: usize,
    pub policy: QueuePolicy,
    /// Upper bound on how long a single watch call stays open.
    pub watch_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { queue_cap: 1024, policy: QueuePolicy::DropOldest, watch_timeout: Duration::from_secs(300) }
    }
}

impl StoreConfig {
    /// Defaults overridden by `ADVISOR_QUEUE_CAP`, `ADVISOR_QUEUE_POLICY` and
    /// `ADVISOR_WATCH_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let queue_cap = std::env::var("ADVISOR_QUEUE_CAP")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(d.queue_cap);
        let policy = std::env::var("ADVISOR_QUEUE_POLICY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(d.policy);
        let watch_timeout = std::env::var("ADVISOR_WATCH_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(d.watch_timeout);
        Self { queue_cap, policy, watch_timeout }
    }
}
