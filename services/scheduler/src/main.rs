//! Elastic job scheduler host
//!
//! Runs one job against an in-process registry ensemble. The job record is
//! read from `ELASTIC_JOB_CONFIG`; without it a demo job logs each shard
//! every five seconds.
//!
//! ## Lifecycle
//!
//! - **Startup**: store the job record, register the instance, join the
//!   leader election and start the trigger
//! - **Running**: passes fire at cron instants until Ctrl-C
//! - **Shutdown**: in-flight shards drain for `ELASTIC_SHUTDOWN_GRACE_SECS`

use std::sync::Arc;

use anyhow::Result;
use elastic_registry::{MemoryRegistry, RegistryClient};
use elastic_scheduler::config::Config;
use elastic_scheduler::{FnJob, JobConfiguration, JobScheduler, ShardingContext};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        namespace = %config.namespace,
        job_config = config.job_config_path.as_deref().unwrap_or("<demo>"),
        "Starting elastic job scheduler"
    );

    let job_config = match config.load_job()? {
        Some(job_config) => job_config,
        None => JobConfiguration::builder("demo_job", 3)
            .cron("0/5 * * * * ?")
            .sharding_item_parameters("0=alpha,1=beta,2=gamma")
            .description("Logs every shard")
            .build()?,
    };

    let registry = MemoryRegistry::new();
    let client: Arc<dyn RegistryClient> = Arc::new(registry.connect());
    let job = Arc::new(FnJob::new(|ctx: ShardingContext| async move {
        info!(
            task_id = %ctx.task_id,
            shard = ctx.sharding_item,
            parameter = ctx.sharding_parameter.as_deref().unwrap_or_default(),
            source = %ctx.source,
            "Shard fired"
        );
        Ok(())
    }));

    let scheduler = JobScheduler::builder(client, job, job_config)
        .options(config.scheduler_options())
        .start()
        .await?;
    info!(instance_id = %scheduler.instance_id(), "Scheduler running");

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    scheduler.shutdown().await;
    info!("Elastic job scheduler shutdown complete");
    Ok(())
}
