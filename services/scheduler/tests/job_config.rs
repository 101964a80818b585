//! Job record fixtures and startup validation.

mod common;

use std::sync::Arc;

use common::{layout, options, start, wait_until};
use elastic_registry::{MemoryRegistry, RegistryClient};
use elastic_scheduler::yaml::{self, YamlJobConfiguration};
use elastic_scheduler::{ConfigError, JobConfiguration, JobScheduler, SchedulerError};
use rstest::rstest;

const COMPLETE_YAML: &str = "\
cron: 0/1 * * * * ?
description: Job description
disabled: false
failover: false
jobErrorHandlerType: IGNORE
jobExecutorServiceHandlerType: CPU
jobName: test_job
jobParameter: param
jobShardingStrategyType: AVG_ALLOCATION
maxTimeDiffSeconds: 0
misfire: false
monitorExecution: false
overwrite: false
props:
  key: value
reconcileIntervalMinutes: 0
shardingItemParameters: 0=A,1=B,2=C
shardingTotalCount: 3
";

const MINIMAL_YAML: &str = "\
cron: 0/1 * * * * ?
disabled: false
failover: false
jobName: test_job
maxTimeDiffSeconds: 0
misfire: false
monitorExecution: false
overwrite: false
reconcileIntervalMinutes: 0
shardingTotalCount: 3
";

fn complete() -> YamlJobConfiguration {
    YamlJobConfiguration {
        job_name: Some("test_job".to_string()),
        cron: Some("0/1 * * * * ?".to_string()),
        sharding_total_count: 3,
        sharding_item_parameters: Some("0=A,1=B,2=C".to_string()),
        job_parameter: Some("param".to_string()),
        job_sharding_strategy_type: Some("AVG_ALLOCATION".to_string()),
        job_executor_service_handler_type: Some("CPU".to_string()),
        job_error_handler_type: Some("IGNORE".to_string()),
        description: Some("Job description".to_string()),
        props: [("key".to_string(), "value".to_string())].into(),
        ..Default::default()
    }
}

#[test]
fn test_marshal_complete_record() {
    assert_eq!(complete().marshal().unwrap(), COMPLETE_YAML);
}

#[test]
fn test_marshal_minimal_record() {
    let minimal = YamlJobConfiguration {
        job_name: Some("test_job".to_string()),
        cron: Some("0/1 * * * * ?".to_string()),
        sharding_total_count: 3,
        ..Default::default()
    };
    assert_eq!(minimal.marshal().unwrap(), MINIMAL_YAML);
}

#[test]
fn test_unmarshal_complete_record() {
    let parsed = YamlJobConfiguration::unmarshal(COMPLETE_YAML).unwrap();
    assert_eq!(parsed, complete());

    let config = parsed.to_job_configuration().unwrap();
    assert_eq!(config.job_name().as_str(), "test_job");
    assert_eq!(config.item_parameter(1), Some("B"));
    assert_eq!(config.job_error_handler_type(), Some("IGNORE"));
    assert_eq!(config.props().get("key").map(String::as_str), Some("value"));
}

#[test]
fn test_unmarshal_minimal_record_yields_zero_values() {
    let parsed = YamlJobConfiguration::unmarshal(MINIMAL_YAML).unwrap();
    assert!(parsed.sharding_item_parameters.is_none());
    assert!(parsed.job_parameter.is_none());
    assert!(parsed.description.is_none());
    assert!(parsed.props.is_empty());
    assert!(!parsed.monitor_execution && !parsed.failover && !parsed.misfire && !parsed.disabled);
    assert_eq!(parsed.marshal().unwrap(), MINIMAL_YAML);
}

fn all_flags() -> YamlJobConfiguration {
    YamlJobConfiguration {
        monitor_execution: true,
        failover: true,
        misfire: true,
        disabled: true,
        overwrite: true,
        max_time_diff_seconds: 60,
        reconcile_interval_minutes: 5,
        ..complete()
    }
}

#[test]
fn test_all_flags_record_to_configuration() {
    let config = all_flags().to_job_configuration().unwrap();
    assert_eq!(config.job_name().as_str(), "test_job");
    assert_eq!(config.cron(), Some("0/1 * * * * ?"));
    assert_eq!(config.sharding_total_count(), 3);
    assert_eq!(config.sharding_item_parameters(), Some("0=A,1=B,2=C"));
    assert_eq!(config.item_parameter(0), Some("A"));
    assert_eq!(config.item_parameter(2), Some("C"));
    assert_eq!(config.job_parameter(), Some("param"));
    assert!(config.monitor_execution());
    assert!(config.failover());
    assert!(config.misfire());
    assert_eq!(config.job_sharding_strategy_type(), Some("AVG_ALLOCATION"));
    assert_eq!(config.job_executor_service_handler_type(), Some("CPU"));
    assert_eq!(config.job_error_handler_type(), Some("IGNORE"));
    assert_eq!(config.description(), Some("Job description"));
    assert_eq!(config.props().get("key").map(String::as_str), Some("value"));
    assert!(config.disabled());
    assert!(config.overwrite());
    assert_eq!(config.max_time_diff_seconds(), 60);
    assert_eq!(config.reconcile_interval_minutes(), 5);
}

#[test]
fn test_all_flags_configuration_to_record() {
    let config = JobConfiguration::builder("test_job", 3)
        .cron("0/1 * * * * ?")
        .sharding_item_parameters("0=A,1=B,2=C")
        .job_parameter("param")
        .monitor_execution(true)
        .failover(true)
        .misfire(true)
        .job_sharding_strategy_type("AVG_ALLOCATION")
        .job_executor_service_handler_type("CPU")
        .job_error_handler_type("IGNORE")
        .description("Job description")
        .set_property("key", "value")
        .disabled(true)
        .overwrite(true)
        .max_time_diff_seconds(60)
        .reconcile_interval_minutes(5)
        .build()
        .unwrap();

    let record = YamlJobConfiguration::from(&config);
    assert_eq!(record.job_name.as_deref(), Some("test_job"));
    assert_eq!(record.cron.as_deref(), Some("0/1 * * * * ?"));
    assert_eq!(record.sharding_total_count, 3);
    assert_eq!(record.sharding_item_parameters.as_deref(), Some("0=A,1=B,2=C"));
    assert_eq!(record.job_parameter.as_deref(), Some("param"));
    assert!(record.monitor_execution);
    assert!(record.failover);
    assert!(record.misfire);
    assert_eq!(record.job_sharding_strategy_type.as_deref(), Some("AVG_ALLOCATION"));
    assert_eq!(record.job_executor_service_handler_type.as_deref(), Some("CPU"));
    assert_eq!(record.job_error_handler_type.as_deref(), Some("IGNORE"));
    assert_eq!(record.description.as_deref(), Some("Job description"));
    assert_eq!(record.props.get("key").map(String::as_str), Some("value"));
    assert!(record.disabled);
    assert!(record.overwrite);
    assert_eq!(record.max_time_diff_seconds, 60);
    assert_eq!(record.reconcile_interval_minutes, 5);
}

#[test]
fn test_record_round_trip() {
    let config = yaml::from_yaml(COMPLETE_YAML).unwrap();
    assert_eq!(yaml::to_yaml(&config).unwrap(), COMPLETE_YAML);
}

#[rstest]
#[case("jobName: j\nshardingTotalCount: 1\nfailover: true\nmonitorExecution: false\n")]
#[case("jobName: j\nshardingTotalCount: 1\nfailover: true\n")]
fn test_failover_requires_monitoring(#[case] text: &str) {
    assert_eq!(
        yaml::from_yaml(text).unwrap_err(),
        ConfigError::FailoverRequiresMonitoring
    );
}

#[test]
fn test_builder_rejects_failover_without_monitoring() {
    let err = JobConfiguration::builder("j", 1)
        .monitor_execution(false)
        .failover(true)
        .build()
        .unwrap_err();
    assert_eq!(err, ConfigError::FailoverRequiresMonitoring);
}

#[rstest]
#[case::unknown_strategy(JobConfiguration::builder("bad_strategy", 1).job_sharding_strategy_type("RANDOM"))]
#[case::unknown_handler(JobConfiguration::builder("bad_handler", 1).job_error_handler_type("EMAIL"))]
#[case::unknown_pool(JobConfiguration::builder("bad_pool", 1).job_executor_service_handler_type("GPU"))]
#[tokio::test]
async fn test_unknown_plugins_fail_startup(#[case] builder: elastic_scheduler::JobConfigurationBuilder) {
    let registry = MemoryRegistry::new();
    let client: Arc<dyn RegistryClient> = Arc::new(registry.connect());
    let result = JobScheduler::builder(client, common::RecordingJob::new(), builder.build().unwrap())
        .options(options("a"))
        .start()
        .await;
    assert!(matches!(result, Err(SchedulerError::ConfigurationInvalid(_))));
}

#[tokio::test]
async fn test_clock_skew_fails_startup() {
    let registry = MemoryRegistry::new();
    registry.set_clock_offset(chrono::Duration::seconds(120));
    let client: Arc<dyn RegistryClient> = Arc::new(registry.connect());
    let config = JobConfiguration::builder("skewed", 1)
        .max_time_diff_seconds(60)
        .build()
        .unwrap();

    let result = JobScheduler::builder(client, common::RecordingJob::new(), config)
        .options(options("a"))
        .start()
        .await;
    assert!(matches!(result, Err(SchedulerError::ClockSkewExceeded { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stored_record_wins_unless_overwrite() {
    let registry = MemoryRegistry::new();
    let a = start(&registry, "a", JobConfiguration::builder("stored", 2).build().unwrap()).await;

    let b = start(&registry, "b", JobConfiguration::builder("stored", 5).build().unwrap()).await;
    assert_eq!(b.scheduler.config().sharding_total_count(), 2);

    let c = start(
        &registry,
        "c",
        JobConfiguration::builder("stored", 4).overwrite(true).build().unwrap(),
    )
    .await;
    assert_eq!(c.scheduler.config().sharding_total_count(), 4);

    // The overwrite reaches the running instances through the config watch.
    assert!(wait_until(std::time::Duration::from_secs(5), || async {
        a.scheduler.config().sharding_total_count() == 4
            && b.scheduler.config().sharding_total_count() == 4
    })
    .await);
    let stored = registry
        .connect()
        .get(&layout("stored").config())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(yaml::from_yaml(&stored).unwrap().sharding_total_count(), 4);

    for member in [c, b, a] {
        member.scheduler.shutdown().await;
    }
}
