//! YAML form of the job record.
//!
//! [`YamlJobConfiguration`] is the unvalidated wire shape: keys are emitted
//! in alphabetical order, absent strings and an empty `props` are omitted,
//! and booleans and integers are always written. Missing keys unmarshal to
//! zero values (`false`, `0`, absent).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::job_config::{ConfigError, JobConfiguration};

/// The job record as it appears in YAML.
///
/// Fields are declared alphabetically; serialization order follows
/// declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct YamlJobConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub disabled: bool,

    pub failover: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_error_handler_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_executor_service_handler_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_parameter: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_sharding_strategy_type: Option<String>,

    pub max_time_diff_seconds: i32,

    pub misfire: bool,

    pub monitor_execution: bool,

    pub overwrite: bool,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub props: BTreeMap<String, String>,

    pub reconcile_interval_minutes: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sharding_item_parameters: Option<String>,

    pub sharding_total_count: i32,
}

impl YamlJobConfiguration {
    /// Serialize to YAML.
    pub fn marshal(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::Yaml(e.to_string()))
    }

    /// Deserialize from YAML.
    pub fn unmarshal(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Yaml(e.to_string()))
    }

    /// Validate into a [`JobConfiguration`].
    pub fn to_job_configuration(&self) -> Result<JobConfiguration, ConfigError> {
        let job_name = self.job_name.clone().ok_or(ConfigError::MissingJobName)?;
        let mut builder = JobConfiguration::builder(job_name, self.sharding_total_count)
            .monitor_execution(self.monitor_execution)
            .failover(self.failover)
            .misfire(self.misfire)
            .disabled(self.disabled)
            .overwrite(self.overwrite)
            .max_time_diff_seconds(self.max_time_diff_seconds)
            .reconcile_interval_minutes(self.reconcile_interval_minutes);

        if let Some(cron) = &self.cron {
            builder = builder.cron(cron);
        }
        if let Some(parameters) = &self.sharding_item_parameters {
            builder = builder.sharding_item_parameters(parameters);
        }
        if let Some(parameter) = &self.job_parameter {
            builder = builder.job_parameter(parameter);
        }
        if let Some(name) = &self.job_sharding_strategy_type {
            builder = builder.job_sharding_strategy_type(name);
        }
        if let Some(name) = &self.job_executor_service_handler_type {
            builder = builder.job_executor_service_handler_type(name);
        }
        if let Some(name) = &self.job_error_handler_type {
            builder = builder.job_error_handler_type(name);
        }
        if let Some(description) = &self.description {
            builder = builder.description(description);
        }
        for (key, value) in &self.props {
            builder = builder.set_property(key, value);
        }

        builder.build()
    }
}

impl From<&JobConfiguration> for YamlJobConfiguration {
    fn from(config: &JobConfiguration) -> Self {
        Self {
            cron: config.cron().map(str::to_string),
            description: config.description().map(str::to_string),
            disabled: config.disabled(),
            failover: config.failover(),
            job_error_handler_type: config.job_error_handler_type().map(str::to_string),
            job_executor_service_handler_type: config
                .job_executor_service_handler_type()
                .map(str::to_string),
            job_name: Some(config.job_name().to_string()),
            job_parameter: config.job_parameter().map(str::to_string),
            job_sharding_strategy_type: config.job_sharding_strategy_type().map(str::to_string),
            max_time_diff_seconds: config.max_time_diff_seconds(),
            misfire: config.misfire(),
            monitor_execution: config.monitor_execution(),
            overwrite: config.overwrite(),
            props: config.props().clone(),
            reconcile_interval_minutes: config.reconcile_interval_minutes(),
            sharding_item_parameters: config.sharding_item_parameters().map(str::to_string),
            sharding_total_count: config.sharding_total_count() as i32,
        }
    }
}

impl TryFrom<YamlJobConfiguration> for JobConfiguration {
    type Error = ConfigError;

    fn try_from(yaml: YamlJobConfiguration) -> Result<Self, Self::Error> {
        yaml.to_job_configuration()
    }
}

/// Encode a job record as YAML.
pub fn to_yaml(config: &JobConfiguration) -> Result<String, ConfigError> {
    YamlJobConfiguration::from(config).marshal()
}

/// Decode and validate a job record from YAML.
pub fn from_yaml(yaml: &str) -> Result<JobConfiguration, ConfigError> {
    YamlJobConfiguration::unmarshal(yaml)?.to_job_configuration()
}
