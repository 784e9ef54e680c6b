use advisor_core::StoreError;
use advisor_scheduler::SchedulerError;

/// Errors raised while planning. Each variant's rendered prefix names its category.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SimError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("no_unscheduled_pods: {0}")]
    NoUnscheduledPods(String),
    #[error("no_winning_score: {0}")]
    NoWinningScore(String),
    #[error("no_scaling_advice: {0}")]
    NoScalingAdvice(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("{context}: {source}")]
    Store {
        context: String,
        #[source]
        source: StoreError,
    },
    #[error("{context}: scheduler {source}")]
    Scheduler {
        context: String,
        #[source]
        source: SchedulerError,
    },
    #[error("internal: {0}")]
    Internal(String),
}

impl SimError {
    pub fn store(context: impl Into<String>, source: StoreError) -> Self {
        Self::Store { context: context.into(), source }
    }

    pub fn scheduler(context: impl Into<String>, source: SchedulerError) -> Self {
        match source {
            SchedulerError::Cancelled(msg) => Self::Cancelled(format!("{}: {}", context.into(), msg)),
            source => Self::Scheduler { context: context.into(), source },
        }
    }

    /// Stable category label, used for metrics and API error mapping.
    pub fn category(&self) -> &'static str {
        match self {
            SimError::Validation(_) => "validation",
            SimError::NoUnscheduledPods(_) => "no_unscheduled_pods",
            SimError::NoWinningScore(_) => "no_winning_score",
            SimError::NoScalingAdvice(_) => "no_scaling_advice",
            SimError::Cancelled(_) => "cancelled",
            SimError::Timeout(_) => "timeout",
            SimError::Store { source, .. } => match source {
                StoreError::Validation(_) => "validation",
                StoreError::NotFound { .. } => "not_found",
                StoreError::AlreadyExists { .. } | StoreError::Conflict(_) => "conflict",
                StoreError::TypeMismatch { .. } => "type_mismatch",
                StoreError::BadPatch(_) => "bad_patch",
                StoreError::Unprocessable(_) => "unprocessable",
                StoreError::WatchClosed(_) | StoreError::Internal(_) => "internal",
            },
            SimError::Scheduler { .. } | SimError::Internal(_) => "internal",
        }
    }

    /// Re-wrap with a caller-side context prefix, keeping the category.
    pub fn context(self, ctx: &str) -> Self {
        match self {
            SimError::Validation(m) => SimError::Validation(format!("{}: {}", ctx, m)),
            SimError::NoUnscheduledPods(m) => SimError::NoUnscheduledPods(format!("{}: {}", ctx, m)),
            SimError::NoWinningScore(m) => SimError::NoWinningScore(format!("{}: {}", ctx, m)),
            SimError::NoScalingAdvice(m) => SimError::NoScalingAdvice(format!("{}: {}", ctx, m)),
            SimError::Cancelled(m) => SimError::Cancelled(format!("{}: {}", ctx, m)),
            SimError::Timeout(m) => SimError::Timeout(format!("{}: {}", ctx, m)),
            SimError::Store { context, source } => SimError::Store { context: format!("{}: {}", ctx, context), source },
            SimError::Scheduler { context, source } => {
                SimError::Scheduler { context: format!("{}: {}", ctx, context), source }
            }
            SimError::Internal(m) => SimError::Internal(format!("{}: {}", ctx, m)),
        }
    }
}

pub type SimResult<T> = Result<T, SimError>;
