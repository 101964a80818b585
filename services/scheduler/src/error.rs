//! Error types for the scheduler core.

use elastic_registry::RegistryError;
use thiserror::Error;

use crate::job_config::ConfigError;

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors surfaced by the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The job record or a named plug-in failed validation.
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// The coordination registry rejected or failed an operation.
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(#[from] RegistryError),

    /// The leader could not produce a valid assignment.
    #[error("sharding failed: {0}")]
    ShardingFailed(String),

    /// A shard failed and the error handler chose to propagate it.
    #[error("job {job_name} failed on shard {item}: {source:#}")]
    JobExecutionFailed {
        job_name: String,
        item: u32,
        #[source]
        source: anyhow::Error,
    },

    /// Local clock differs from the registry clock by more than allowed.
    #[error("clock skew of {skew_secs}s exceeds the allowed {max_secs}s")]
    ClockSkewExceeded { skew_secs: i64, max_secs: i32 },

    /// The scheduler is stopping and refuses new work.
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

impl SchedulerError {
    /// Returns true if the failure came from a lost or suspended session.
    pub fn is_session_failure(&self) -> bool {
        matches!(self, Self::RegistryUnavailable(e) if e.is_transient())
    }
}

impl From<ConfigError> for SchedulerError {
    fn from(e: ConfigError) -> Self {
        Self::ConfigurationInvalid(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_failure_classification() {
        assert!(SchedulerError::from(RegistryError::SessionLost).is_session_failure());
        assert!(!SchedulerError::from(RegistryError::Exists("/a".into())).is_session_failure());
        assert!(!SchedulerError::ShuttingDown.is_session_failure());
    }

    #[test]
    fn test_config_error_converts() {
        let err = SchedulerError::from(ConfigError::InvalidShardingTotalCount(0));
        assert!(matches!(err, SchedulerError::ConfigurationInvalid(_)));
        assert!(err.to_string().contains("shardingTotalCount"));
    }

    #[test]
    fn test_job_failure_display() {
        let err = SchedulerError::JobExecutionFailed {
            job_name: "billing".into(),
            item: 2,
            source: anyhow::anyhow!("boom"),
        };
        assert_eq!(err.to_string(), "job billing failed on shard 2: boom");
    }
}
