//! Running the shards of one pass.
//!
//! For every shard in the pass context:
//!
//! - with `monitorExecution`, claim `execution/<i>/running` (ephemeral,
//!   data = own id); a shard already running elsewhere is skipped and, with
//!   `misfire`, flagged so that the deletion of that marker triggers a
//!   make-up run
//! - run the job on the pool selected by `jobExecutorServiceHandlerType`
//! - on return or error: clear `misfire`, stamp `completed`, delete
//!   `running` (retrying transient registry failures), release a failover
//!   claim
//! - route errors to the job's error handler
//!
//! Shard failures never fail the pass; only bookkeeping against the
//! registry can.

mod pool;

pub use pool::{ExecutorPool, ExecutorServiceKind, IO_SOFT_CAP};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use elastic_id::InstanceId;
use elastic_registry::{
    retry_with_backoff, BackoffPolicy, CreateMode, RegistryClient, RegistryError, RegistryResult,
};
use tracing::{debug, error, info, instrument, warn};

use crate::config_store::ConfigSnapshot;
use crate::context::ExecutionContextBuilder;
use crate::error::{SchedulerError, SchedulerResult};
use crate::error_handler::{ErrorHandlerRegistry, JobErrorHandler};
use crate::failover::FailoverService;
use crate::job::{ElasticJob, ExecutionSource, ShardingContext};
use crate::job_config::JobConfiguration;
use crate::layout::NodeLayout;

/// Outcome of one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub source: ExecutionSource,
    pub succeeded: Vec<u32>,
    pub failed: Vec<u32>,
    /// Shards running elsewhere (or refused during shutdown).
    pub skipped: Vec<u32>,
}

impl ExecutionReport {
    fn new(source: ExecutionSource) -> Self {
        Self {
            source,
            succeeded: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// Shards that actually ran.
    pub fn executed(&self) -> Vec<u32> {
        let mut items: Vec<u32> = self.succeeded.iter().chain(&self.failed).copied().collect();
        items.sort_unstable();
        items
    }

    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// Default bound on retrying shard bookkeeping, one session timeout.
pub const DEFAULT_RETRY_DEADLINE: Duration = Duration::from_secs(10);

enum ShardOutcome {
    Succeeded,
    Failed,
}

/// Dispatches shards to the user job.
pub struct JobExecutor {
    registry: Arc<dyn RegistryClient>,
    layout: NodeLayout,
    instance_id: InstanceId,
    config: Arc<ConfigSnapshot>,
    job: Arc<dyn ElasticJob>,
    contexts: ExecutionContextBuilder,
    failover: Arc<FailoverService>,
    error_handlers: ErrorHandlerRegistry,
    backoff: BackoffPolicy,
    retry_deadline: Duration,
    pool: Mutex<Option<Arc<ExecutorPool>>>,
    shutting_down: AtomicBool,
}

impl JobExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        layout: NodeLayout,
        instance_id: InstanceId,
        config: Arc<ConfigSnapshot>,
        job: Arc<dyn ElasticJob>,
        contexts: ExecutionContextBuilder,
        failover: Arc<FailoverService>,
        error_handlers: ErrorHandlerRegistry,
    ) -> Self {
        Self {
            registry,
            layout,
            instance_id,
            config,
            job,
            contexts,
            failover,
            error_handlers,
            backoff: BackoffPolicy::default(),
            retry_deadline: DEFAULT_RETRY_DEADLINE,
            pool: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Retry policy for completion bookkeeping.
    pub fn with_registry_retry(mut self, backoff: BackoffPolicy, deadline: Duration) -> Self {
        self.backoff = backoff;
        self.retry_deadline = deadline;
        self
    }

    /// Fail early if the record names an unknown handler or pool.
    pub fn validate(&self, config: &JobConfiguration) -> SchedulerResult<()> {
        self.error_handlers
            .resolve(config.job_error_handler_type())?;
        ExecutorServiceKind::resolve(config.job_executor_service_handler_type())?;
        Ok(())
    }

    /// Run one pass and wait for all of its shards.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn run_pass(&self, source: ExecutionSource) -> SchedulerResult<ExecutionReport> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShuttingDown);
        }

        let contexts = self.contexts.build(source).await?;
        let mut report = ExecutionReport::new(contexts.source);
        if contexts.is_empty() {
            debug!(source = %source, "No shards to run");
            return Ok(report);
        }

        let config = self.config.load();
        let handler = self.error_handlers.resolve(config.job_error_handler_type())?;
        let pool = self.pool_for(&config)?;
        let monitored = config.monitor_execution();
        let release_claims = contexts.source == ExecutionSource::Failover;

        let mut handles = Vec::new();
        for item in contexts.items() {
            if monitored
                && !self.mark_running(item).await?
                && !(config.misfire() && self.flag_misfire(item).await?)
            {
                debug!(shard = item, "Shard still running elsewhere, skipping");
                report.skipped.push(item);
                continue;
            }

            let run = ShardRun {
                registry: Arc::clone(&self.registry),
                layout: self.layout.clone(),
                instance_id: self.instance_id.clone(),
                failover: Arc::clone(&self.failover),
                job: Arc::clone(&self.job),
                handler: Arc::clone(&handler),
                backoff: self.backoff.clone(),
                retry_deadline: self.retry_deadline,
                monitored,
                release_claim: release_claims,
            };
            let ctx = contexts.context_for(item);
            match pool.spawn(run.execute(ctx)) {
                Ok(handle) => handles.push((item, handle)),
                Err(e) => {
                    warn!(shard = item, error = %e, "Shard refused by executor pool");
                    if monitored {
                        release_running(self.registry.as_ref(), &self.layout, item, &self.instance_id)
                            .await?;
                    }
                    report.skipped.push(item);
                }
            }
        }

        for (item, handle) in handles {
            match handle.await {
                Ok(Some(ShardOutcome::Succeeded)) => report.succeeded.push(item),
                Ok(Some(ShardOutcome::Failed)) => report.failed.push(item),
                Ok(None) => {
                    warn!(shard = item, "Executor pool closed before the shard started");
                    if monitored {
                        release_running(self.registry.as_ref(), &self.layout, item, &self.instance_id)
                            .await?;
                    }
                    report.skipped.push(item);
                }
                Err(e) => {
                    error!(shard = item, error = %e, "Shard task aborted");
                    if monitored {
                        release_running(self.registry.as_ref(), &self.layout, item, &self.instance_id)
                            .await?;
                    }
                    report.failed.push(item);
                }
            }
        }

        info!(
            task_id = %contexts.task_id,
            source = %report.source,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Pass completed"
        );
        Ok(report)
    }

    /// Flag `items` as having missed a tick.
    pub async fn mark_misfired(&self, items: &[u32]) -> SchedulerResult<()> {
        if !self.config.load().monitor_execution() {
            return Ok(());
        }
        for &item in items {
            self.set_misfire(item).await?;
        }
        Ok(())
    }

    /// Refuse new passes and wait up to `grace` for running shards.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.shutting_down.store(true, Ordering::SeqCst);
        let pool = self.lock_pool().take();
        match pool {
            Some(pool) => pool.drain(grace).await,
            None => true,
        }
    }

    async fn mark_running(&self, item: u32) -> SchedulerResult<bool> {
        match self
            .registry
            .create(
                &self.layout.execution_running(item),
                self.instance_id.as_str(),
                CreateMode::Ephemeral,
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(RegistryError::Exists(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Flag a shard that is running elsewhere, then try to claim it once
    /// more: a run that ended in between would otherwise leave the flag
    /// with no deletion left to react to.
    async fn flag_misfire(&self, item: u32) -> SchedulerResult<bool> {
        self.set_misfire(item).await?;
        self.mark_running(item).await
    }

    async fn set_misfire(&self, item: u32) -> SchedulerResult<()> {
        self.registry
            .set(&self.layout.execution_misfire(item), "")
            .await?;
        Ok(())
    }

    fn pool_for(&self, config: &JobConfiguration) -> SchedulerResult<Arc<ExecutorPool>> {
        let kind = ExecutorServiceKind::resolve(config.job_executor_service_handler_type())?;
        let mut slot = self.lock_pool();
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShuttingDown);
        }
        match slot.as_ref() {
            Some(pool) if pool.kind() == kind => Ok(Arc::clone(pool)),
            _ => {
                let pool = Arc::new(ExecutorPool::new(kind));
                *slot = Some(Arc::clone(&pool));
                Ok(pool)
            }
        }
    }

    fn lock_pool(&self) -> std::sync::MutexGuard<'_, Option<Arc<ExecutorPool>>> {
        self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Everything one shard task needs, owned so it can run on the pool.
struct ShardRun {
    registry: Arc<dyn RegistryClient>,
    layout: NodeLayout,
    instance_id: InstanceId,
    failover: Arc<FailoverService>,
    job: Arc<dyn ElasticJob>,
    handler: Arc<dyn JobErrorHandler>,
    backoff: BackoffPolicy,
    retry_deadline: Duration,
    monitored: bool,
    release_claim: bool,
}

impl ShardRun {
    async fn execute(self, ctx: ShardingContext) -> ShardOutcome {
        let item = ctx.sharding_item;
        let job_name = ctx.job_name.clone();
        debug!(shard = item, source = %ctx.source, "Running shard");

        let result = self.job.execute(ctx).await;
        self.finish(item).await;

        match result {
            Ok(()) => ShardOutcome::Succeeded,
            Err(e) => {
                if let Err(uncaught) = self.handler.handle(&job_name, item, e).await {
                    error!(shard = item, error = %uncaught, "Uncaught shard failure");
                }
                ShardOutcome::Failed
            }
        }
    }

    async fn finish(&self, item: u32) {
        if self.monitored {
            let completed = Utc::now().to_rfc3339();
            // `running` goes last: its deletion is what peers react to.
            let recorded = retry_with_backoff(&self.backoff, self.retry_deadline, || async {
                self.registry.delete(&self.layout.execution_misfire(item)).await?;
                self.registry
                    .set(&self.layout.execution_completed(item), &completed)
                    .await?;
                release_running(self.registry.as_ref(), &self.layout, item, &self.instance_id).await
            })
            .await;
            if let Err(e) = recorded {
                warn!(shard = item, error = %e, "Failed to record shard completion");
            }
        }

        if self.release_claim {
            if let Err(e) = self.failover.complete(item).await {
                warn!(shard = item, error = %e, "Failed to release failover claim");
            }
        }
    }
}

/// Delete `running` for `item` unless another instance holds it by now
/// (after a session loss the shard may have failed over).
async fn release_running(
    registry: &dyn RegistryClient,
    layout: &NodeLayout,
    item: u32,
    me: &InstanceId,
) -> RegistryResult<()> {
    let path = layout.execution_running(item);
    if registry.get(&path).await?.as_deref() == Some(me.as_str()) {
        registry.delete(&path).await?;
    }
    Ok(())
}
