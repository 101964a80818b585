//! Configuration for the scheduler host binary.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::job_config::JobConfiguration;
use crate::scheduler::{SchedulerOptions, DEFAULT_NAMESPACE};
use crate::yaml;

/// Host configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Registry namespace the job lives under.
    pub namespace: String,

    /// Path to the YAML job record; the built-in demo job when unset.
    pub job_config_path: Option<String>,

    /// Label published on the instance node.
    pub instance_label: Option<String>,

    /// Grace period for in-flight shards at shutdown, in seconds.
    pub shutdown_grace_secs: u64,

    /// Log filter (trace, debug, info, warn, error or a full directive).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let namespace =
            std::env::var("ELASTIC_NAMESPACE").unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());

        let job_config_path = std::env::var("ELASTIC_JOB_CONFIG").ok();

        let instance_label = std::env::var("ELASTIC_INSTANCE_LABEL").ok();

        let shutdown_grace_secs = std::env::var("ELASTIC_SHUTDOWN_GRACE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let log_level = std::env::var("ELASTIC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            namespace,
            job_config_path,
            instance_label,
            shutdown_grace_secs,
            log_level,
        })
    }

    /// Library options derived from the host settings.
    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            namespace: self.namespace.clone(),
            label: self.instance_label.clone(),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            close_session_on_shutdown: true,
            ..SchedulerOptions::default()
        }
    }

    /// Read the job record named by `ELASTIC_JOB_CONFIG`, if any.
    pub fn load_job(&self) -> Result<Option<JobConfiguration>> {
        let Some(path) = &self.job_config_path else {
            return Ok(None);
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read job configuration {path}"))?;
        let config = yaml::from_yaml(&text)
            .with_context(|| format!("invalid job configuration {path}"))?;
        Ok(Some(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_options_carry_host_settings() {
        let config = Config {
            namespace: "ops".to_string(),
            job_config_path: None,
            instance_label: Some("rack-7".to_string()),
            shutdown_grace_secs: 3,
            log_level: "debug".to_string(),
        };

        let options = config.scheduler_options();
        assert_eq!(options.namespace, "ops");
        assert_eq!(options.label.as_deref(), Some("rack-7"));
        assert_eq!(options.shutdown_grace, Duration::from_secs(3));
        assert!(options.close_session_on_shutdown);
        assert!(config.load_job().unwrap().is_none());
    }

    #[test]
    fn test_load_job_reports_missing_file() {
        let config = Config {
            namespace: DEFAULT_NAMESPACE.to_string(),
            job_config_path: Some("/nonexistent/job.yaml".to_string()),
            instance_label: None,
            shutdown_grace_secs: 10,
            log_level: "info".to_string(),
        };

        let err = config.load_job().unwrap_err();
        assert!(err.to_string().contains("/nonexistent/job.yaml"));
    }
}
