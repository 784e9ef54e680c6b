use std::time::Duration;

use advisor_view::ViewConfig;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Delay between event polls while tracking a simulation.
    pub poll_interval: Duration,
    /// Consecutive polls without a new placement after which a run is stable.
    pub max_unchanged_polls: u32,
    /// Bound on concurrently running embedded schedulers.
    pub max_parallel_simulations: usize,
    /// Deadline for a whole plan request unless the request carries its own.
    pub plan_timeout: Duration,
    pub view: ViewConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(20),
            max_unchanged_polls: 3,
            max_parallel_simulations: 8,
            plan_timeout: Duration::from_secs(120),
            view: ViewConfig::default(),
        }
    }
}

impl SimConfig {
    /// Defaults overridden by `ADVISOR_POLL_INTERVAL_MS`, `ADVISOR_MAX_UNCHANGED_POLLS`,
    /// `ADVISOR_MAX_PARALLEL_SIMULATIONS`, `ADVISOR_PLAN_TIMEOUT_SECS` and the view settings.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            poll_interval: env_parse::<u64>("ADVISOR_POLL_INTERVAL_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(d.poll_interval),
            max_unchanged_polls: env_parse::<u32>("ADVISOR_MAX_UNCHANGED_POLLS")
                .filter(|n| *n > 0)
                .unwrap_or(d.max_unchanged_polls),
            max_parallel_simulations: env_parse::<usize>("ADVISOR_MAX_PARALLEL_SIMULATIONS")
                .filter(|n| *n > 0)
                .unwrap_or(d.max_parallel_simulations),
            plan_timeout: env_parse::<u64>("ADVISOR_PLAN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.plan_timeout),
            view: ViewConfig::from_env(),
        }
    }
}
