//! Error taxonomy.
//!
//! Every fallible operation in the crate returns [`Result`]. Callers of
//! [`ParameterOptimizer::recommend`](crate::ParameterOptimizer::recommend) never see
//! these directly: the recommendation path converts them into a degraded
//! [`Recommendation`](crate::Recommendation) with the baseline already applied.

use uuid::Uuid;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, TuneError>;

/// Coarse error category, used in audit events and for routing fallbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed reward or outcome input. Rejected, never coerced.
    DataQuality,
    /// Missing policy, unsatisfiable constraints, bad config values.
    Configuration,
    /// Compliance budget denial.
    ResourceExhausted,
    /// Deadline passed before a choice could be made.
    Timeout,
    /// Storage, serialization, or background task failures.
    Infrastructure,
}

#[derive(Debug, thiserror::Error)]
pub enum TuneError {
    #[error("reward must be finite, got {value}")]
    InvalidReward { value: f64 },

    #[error("invalid outcome: {0}")]
    InvalidOutcome(String),

    #[error("no policy configured for task type `{task_type}`")]
    NoPolicyConfigured { task_type: String },

    #[error("arm set is empty")]
    EmptyArmSet,

    #[error("quality gate produced an empty safe set for task type `{task_type}`")]
    EmptySafeSet { task_type: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("compliance budget denied {requested:.1} units (headroom {headroom:.1})")]
    BudgetDenied { requested: f64, headroom: f64 },

    #[error("no logged decision for request {request_id}")]
    DecisionNotFound { request_id: Uuid },

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("counterfactual logger is closed")]
    LoggerClosed,

    #[error("background task failed: {0}")]
    Task(String),
}

impl TuneError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TuneError::InvalidReward { .. } | TuneError::InvalidOutcome(_) => ErrorKind::DataQuality,
            TuneError::NoPolicyConfigured { .. }
            | TuneError::EmptyArmSet
            | TuneError::EmptySafeSet { .. }
            | TuneError::Config(_)
            | TuneError::ConfigParse(_) => ErrorKind::Configuration,
            TuneError::BudgetDenied { .. } => ErrorKind::ResourceExhausted,
            TuneError::DeadlineExceeded => ErrorKind::Timeout,
            TuneError::DecisionNotFound { .. }
            | TuneError::Io(_)
            | TuneError::Serde(_)
            | TuneError::LoggerClosed
            | TuneError::Task(_) => ErrorKind::Infrastructure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(
            TuneError::InvalidReward { value: f64::NAN }.kind(),
            ErrorKind::DataQuality
        );
        assert_eq!(
            TuneError::NoPolicyConfigured {
                task_type: "x".into()
            }
            .kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            TuneError::BudgetDenied {
                requested: 1.0,
                headroom: 0.0
            }
            .kind(),
            ErrorKind::ResourceExhausted
        );
        assert_eq!(TuneError::DeadlineExceeded.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn messages_carry_context() {
        let e = TuneError::NoPolicyConfigured {
            task_type: "summarize".into(),
        };
        assert!(e.to_string().contains("summarize"));
    }
}
