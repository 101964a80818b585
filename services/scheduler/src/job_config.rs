//! The job configuration record.
//!
//! A [`JobConfiguration`] is an immutable value shared by every instance of
//! a job. It is validated once, at ingest, so the rest of the scheduler can
//! rely on its invariants:
//!
//! - the job name is a valid registry path segment
//! - `sharding_total_count > 0`
//! - `failover` implies `monitor_execution`
//! - the cron expression (if any) parses
//! - every shard parameter index is below `sharding_total_count`

use std::collections::BTreeMap;

use elastic_id::{IdError, JobName};
use thiserror::Error;

use crate::schedule::CronSchedule;

/// Validation errors for job records.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid jobName: {0}")]
    InvalidJobName(#[from] IdError),

    #[error("jobName is required")]
    MissingJobName,

    #[error("shardingTotalCount must be positive, got {0}")]
    InvalidShardingTotalCount(i32),

    #[error("failover requires monitorExecution")]
    FailoverRequiresMonitoring,

    #[error("invalid cron expression {cron:?}: {reason}")]
    InvalidCron { cron: String, reason: String },

    #[error("invalid shardingItemParameters {value:?}: {reason}")]
    InvalidItemParameters { value: String, reason: String },

    #[error("shardingItemParameters index {item} is not below shardingTotalCount {total}")]
    ItemOutOfRange { item: u32, total: u32 },

    #[error("invalid job record YAML: {0}")]
    Yaml(String),
}

// =============================================================================
// JobConfiguration
// =============================================================================

/// Validated job definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfiguration {
    job_name: JobName,
    cron: Option<String>,
    sharding_total_count: u32,
    sharding_item_parameters: Option<String>,
    item_parameters: BTreeMap<u32, String>,
    job_parameter: Option<String>,
    monitor_execution: bool,
    failover: bool,
    misfire: bool,
    disabled: bool,
    overwrite: bool,
    max_time_diff_seconds: i32,
    reconcile_interval_minutes: i32,
    job_sharding_strategy_type: Option<String>,
    job_executor_service_handler_type: Option<String>,
    job_error_handler_type: Option<String>,
    description: Option<String>,
    props: BTreeMap<String, String>,
}

impl JobConfiguration {
    /// Start building a configuration with the builder defaults.
    pub fn builder(job_name: impl Into<String>, sharding_total_count: i32) -> JobConfigurationBuilder {
        JobConfigurationBuilder::new(job_name.into(), sharding_total_count)
    }

    /// A builder pre-populated with this configuration's values.
    pub fn to_builder(&self) -> JobConfigurationBuilder {
        JobConfigurationBuilder {
            job_name: self.job_name.to_string(),
            cron: self.cron.clone(),
            sharding_total_count: self.sharding_total_count as i32,
            sharding_item_parameters: self.sharding_item_parameters.clone(),
            job_parameter: self.job_parameter.clone(),
            monitor_execution: self.monitor_execution,
            failover: self.failover,
            misfire: self.misfire,
            disabled: self.disabled,
            overwrite: self.overwrite,
            max_time_diff_seconds: self.max_time_diff_seconds,
            reconcile_interval_minutes: self.reconcile_interval_minutes,
            job_sharding_strategy_type: self.job_sharding_strategy_type.clone(),
            job_executor_service_handler_type: self.job_executor_service_handler_type.clone(),
            job_error_handler_type: self.job_error_handler_type.clone(),
            description: self.description.clone(),
            props: self.props.clone(),
        }
    }

    pub fn job_name(&self) -> &JobName {
        &self.job_name
    }

    pub fn cron(&self) -> Option<&str> {
        self.cron.as_deref()
    }

    /// Parsed cron schedule, if the job is cron-driven.
    pub fn schedule(&self) -> Option<CronSchedule> {
        // Validated at build time.
        self.cron.as_deref().and_then(|c| CronSchedule::parse(c).ok())
    }

    pub fn sharding_total_count(&self) -> u32 {
        self.sharding_total_count
    }

    /// The raw `shardingItemParameters` string.
    pub fn sharding_item_parameters(&self) -> Option<&str> {
        self.sharding_item_parameters.as_deref()
    }

    /// Parameter attached to one shard.
    pub fn item_parameter(&self, item: u32) -> Option<&str> {
        self.item_parameters.get(&item).map(String::as_str)
    }

    pub fn job_parameter(&self) -> Option<&str> {
        self.job_parameter.as_deref()
    }

    pub fn monitor_execution(&self) -> bool {
        self.monitor_execution
    }

    pub fn failover(&self) -> bool {
        self.failover
    }

    /// Failover is only effective while executions are monitored.
    pub fn is_failover_enabled(&self) -> bool {
        self.failover && self.monitor_execution
    }

    pub fn misfire(&self) -> bool {
        self.misfire
    }

    pub fn disabled(&self) -> bool {
        self.disabled
    }

    pub fn overwrite(&self) -> bool {
        self.overwrite
    }

    pub fn max_time_diff_seconds(&self) -> i32 {
        self.max_time_diff_seconds
    }

    pub fn reconcile_interval_minutes(&self) -> i32 {
        self.reconcile_interval_minutes
    }

    pub fn job_sharding_strategy_type(&self) -> Option<&str> {
        self.job_sharding_strategy_type.as_deref()
    }

    pub fn job_executor_service_handler_type(&self) -> Option<&str> {
        self.job_executor_service_handler_type.as_deref()
    }

    pub fn job_error_handler_type(&self) -> Option<&str> {
        self.job_error_handler_type.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn props(&self) -> &BTreeMap<String, String> {
        &self.props
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Consuming builder for [`JobConfiguration`].
#[derive(Debug, Clone)]
pub struct JobConfigurationBuilder {
    job_name: String,
    cron: Option<String>,
    sharding_total_count: i32,
    sharding_item_parameters: Option<String>,
    job_parameter: Option<String>,
    monitor_execution: bool,
    failover: bool,
    misfire: bool,
    disabled: bool,
    overwrite: bool,
    max_time_diff_seconds: i32,
    reconcile_interval_minutes: i32,
    job_sharding_strategy_type: Option<String>,
    job_executor_service_handler_type: Option<String>,
    job_error_handler_type: Option<String>,
    description: Option<String>,
    props: BTreeMap<String, String>,
}

impl JobConfigurationBuilder {
    fn new(job_name: String, sharding_total_count: i32) -> Self {
        Self {
            job_name,
            cron: None,
            sharding_total_count,
            sharding_item_parameters: None,
            job_parameter: None,
            monitor_execution: true,
            failover: false,
            misfire: true,
            disabled: false,
            overwrite: false,
            max_time_diff_seconds: -1,
            reconcile_interval_minutes: 10,
            job_sharding_strategy_type: None,
            job_executor_service_handler_type: None,
            job_error_handler_type: None,
            description: None,
            props: BTreeMap::new(),
        }
    }

    pub fn cron(mut self, cron: impl Into<String>) -> Self {
        self.cron = Some(cron.into());
        self
    }

    /// Remove the cron expression (the job then only fires on demand).
    pub fn no_cron(mut self) -> Self {
        self.cron = None;
        self
    }

    pub fn sharding_total_count(mut self, count: i32) -> Self {
        self.sharding_total_count = count;
        self
    }

    pub fn sharding_item_parameters(mut self, parameters: impl Into<String>) -> Self {
        self.sharding_item_parameters = Some(parameters.into());
        self
    }

    pub fn job_parameter(mut self, parameter: impl Into<String>) -> Self {
        self.job_parameter = Some(parameter.into());
        self
    }

    pub fn monitor_execution(mut self, enabled: bool) -> Self {
        self.monitor_execution = enabled;
        self
    }

    pub fn failover(mut self, enabled: bool) -> Self {
        self.failover = enabled;
        self
    }

    pub fn misfire(mut self, enabled: bool) -> Self {
        self.misfire = enabled;
        self
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn max_time_diff_seconds(mut self, seconds: i32) -> Self {
        self.max_time_diff_seconds = seconds;
        self
    }

    pub fn reconcile_interval_minutes(mut self, minutes: i32) -> Self {
        self.reconcile_interval_minutes = minutes;
        self
    }

    pub fn job_sharding_strategy_type(mut self, name: impl Into<String>) -> Self {
        self.job_sharding_strategy_type = Some(name.into());
        self
    }

    pub fn job_executor_service_handler_type(mut self, name: impl Into<String>) -> Self {
        self.job_executor_service_handler_type = Some(name.into());
        self
    }

    pub fn job_error_handler_type(mut self, name: impl Into<String>) -> Self {
        self.job_error_handler_type = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn set_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    /// Validate and produce the record.
    pub fn build(self) -> Result<JobConfiguration, ConfigError> {
        let job_name = JobName::parse(&self.job_name)?;

        if self.sharding_total_count <= 0 {
            return Err(ConfigError::InvalidShardingTotalCount(
                self.sharding_total_count,
            ));
        }
        let total = self.sharding_total_count as u32;

        if self.failover && !self.monitor_execution {
            return Err(ConfigError::FailoverRequiresMonitoring);
        }

        if let Some(cron) = &self.cron {
            CronSchedule::parse(cron)?;
        }

        let item_parameters = match &self.sharding_item_parameters {
            Some(raw) => parse_item_parameters(raw)?,
            None => BTreeMap::new(),
        };
        if let Some((&item, _)) = item_parameters.range(total..).next() {
            return Err(ConfigError::ItemOutOfRange { item, total });
        }

        Ok(JobConfiguration {
            job_name,
            cron: self.cron,
            sharding_total_count: total,
            sharding_item_parameters: self.sharding_item_parameters,
            item_parameters,
            job_parameter: self.job_parameter,
            monitor_execution: self.monitor_execution,
            failover: self.failover,
            misfire: self.misfire,
            disabled: self.disabled,
            overwrite: self.overwrite,
            max_time_diff_seconds: self.max_time_diff_seconds,
            reconcile_interval_minutes: self.reconcile_interval_minutes,
            job_sharding_strategy_type: self.job_sharding_strategy_type,
            job_executor_service_handler_type: self.job_executor_service_handler_type,
            job_error_handler_type: self.job_error_handler_type,
            description: self.description,
            props: self.props,
        })
    }
}

/// Parse `INDEX=VALUE` pairs separated by commas.
///
/// An empty (or blank) string means no parameters. Whitespace around the
/// index and the value is trimmed. A repeated index keeps the last value.
pub fn parse_item_parameters(value: &str) -> Result<BTreeMap<u32, String>, ConfigError> {
    let mut result = BTreeMap::new();
    if value.trim().is_empty() {
        return Ok(result);
    }

    let invalid = |reason: String| ConfigError::InvalidItemParameters {
        value: value.to_string(),
        reason,
    };

    for entry in value.split(',') {
        let (index, param) = entry
            .split_once('=')
            .ok_or_else(|| invalid(format!("entry {entry:?} has no '='")))?;
        let index: u32 = index
            .trim()
            .parse()
            .map_err(|_| invalid(format!("index {:?} is not a shard number", index.trim())))?;
        result.insert(index, param.trim().to_string());
    }

    Ok(result)
}
