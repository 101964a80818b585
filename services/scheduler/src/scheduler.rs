//! Bootstrap and lifecycle of one job on one instance.
//!
//! ```ignore
//! let scheduler = JobScheduler::builder(registry, Arc::new(MyJob), config)
//!     .options(SchedulerOptions::default())
//!     .start()
//!     .await?;
//! // ...
//! scheduler.shutdown().await;
//! ```
//!
//! Startup: validate the plug-in names, store (or adopt) the configuration
//! record, check clock skew, publish the instance, join the election,
//! claim orphaned shards, then start the trigger, dispatcher and reconcile
//! tasks and report `Running`.
//!
//! Shutdown: stop the trigger, drain in-flight shards for the grace
//! period, withdraw the leader and instance nodes, stop the background
//! tasks, report `Stopped`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use elastic_id::{InstanceId, Namespace};
use elastic_registry::{BackoffPolicy, RegistryClient};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::config_store::{ConfigSnapshot, ConfigStore};
use crate::context::ExecutionContextBuilder;
use crate::error::{SchedulerError, SchedulerResult};
use crate::error_handler::{ErrorHandlerRegistry, JobErrorHandler};
use crate::executor::{ExecutionReport, ExecutorServiceKind, JobExecutor, DEFAULT_RETRY_DEADLINE};
use crate::failover::FailoverService;
use crate::health::{HealthReporter, HealthState};
use crate::instance::{Instance, InstanceRegistry};
use crate::job::ElasticJob;
use crate::job_config::JobConfiguration;
use crate::layout::NodeLayout;
use crate::leader::LeaderElection;
use crate::listener::Dispatcher;
use crate::plugin::NamedRegistry;
use crate::reconcile::ReconcileLoop;
use crate::sharding::{builtin_strategies, BarrierOptions, ShardingService, ShardingStrategy};
use crate::trigger::{CronTrigger, TriggerState};

/// Default registry namespace.
pub const DEFAULT_NAMESPACE: &str = "elastic-job";

/// Host-side knobs for one scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Root of the job's registry subtree.
    pub namespace: String,

    /// Hostname used in the instance id; the machine's hostname when unset.
    pub hostname: Option<String>,

    /// Free-form label published on the instance node.
    pub label: Option<String>,

    /// How long shutdown waits for in-flight shards.
    pub shutdown_grace: Duration,

    /// Backoff between session re-establishment attempts and between
    /// retries of transient registry failures.
    pub registry_backoff: BackoffPolicy,

    /// Registry session timeout; transient failures are retried for at
    /// most this long.
    pub session_timeout: Duration,

    /// Wait policy of the sharding barrier.
    pub barrier: BarrierOptions,

    /// Close the registry session on shutdown. Leave unset when the host
    /// shares the client with other jobs.
    pub close_session_on_shutdown: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            hostname: None,
            label: None,
            shutdown_grace: Duration::from_secs(10),
            registry_backoff: BackoffPolicy::default(),
            session_timeout: DEFAULT_RETRY_DEADLINE,
            barrier: BarrierOptions::default(),
            close_session_on_shutdown: false,
        }
    }
}

/// Assembles a [`JobScheduler`].
pub struct JobSchedulerBuilder {
    registry: Arc<dyn RegistryClient>,
    job: Arc<dyn ElasticJob>,
    config: JobConfiguration,
    options: SchedulerOptions,
    strategies: NamedRegistry<dyn ShardingStrategy>,
    error_handlers: ErrorHandlerRegistry,
}

impl JobSchedulerBuilder {
    pub fn options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    /// Make a custom sharding strategy selectable by name.
    pub fn sharding_strategy(
        mut self,
        name: impl Into<String>,
        strategy: Arc<dyn ShardingStrategy>,
    ) -> Self {
        self.strategies.register(name, strategy);
        self
    }

    /// Make a custom error handler selectable by name.
    pub fn error_handler(mut self, name: impl Into<String>, handler: Arc<dyn JobErrorHandler>) -> Self {
        self.error_handlers.register(name, handler);
        self
    }

    /// Join the job's cohort and start firing.
    #[instrument(skip(self), fields(job_name = %self.config.job_name()))]
    pub async fn start(self) -> SchedulerResult<JobScheduler> {
        let Self {
            registry,
            job,
            config,
            options,
            strategies,
            error_handlers,
        } = self;

        let health = Arc::new(HealthReporter::new());
        let namespace = Namespace::parse(&options.namespace)
            .map_err(|e| SchedulerError::ConfigurationInvalid(e.to_string()))?;
        let hostname = match &options.hostname {
            Some(hostname) => hostname.clone(),
            None => local_hostname()?,
        };
        let instance_id = InstanceId::for_current_process(&hostname)
            .map_err(|e| SchedulerError::ConfigurationInvalid(e.to_string()))?;
        let layout = NodeLayout::new(&namespace, config.job_name());

        // A record naming unknown plug-ins must never reach the registry,
        // and an adopted one must be usable before this instance joins.
        check_plugins(&strategies, &error_handlers, &config)?;
        let store = ConfigStore::new(Arc::clone(&registry), layout.clone());
        let effective = store.store(&config).await?;
        check_plugins(&strategies, &error_handlers, &effective)?;
        let snapshot = Arc::new(ConfigSnapshot::new(effective.clone()));

        let instances = Arc::new(InstanceRegistry::new(
            Arc::clone(&registry),
            layout.clone(),
            Instance::new(instance_id.clone(), options.label.clone()),
        ));
        instances
            .check_clock_skew(effective.max_time_diff_seconds())
            .await?;

        let leader = Arc::new(LeaderElection::new(
            Arc::clone(&registry),
            layout.clone(),
            instance_id.clone(),
        ));
        let sharding = Arc::new(ShardingService::new(
            Arc::clone(&registry),
            layout.clone(),
            Arc::clone(&instances),
            Arc::clone(&leader),
            strategies,
            options.barrier.clone(),
        ));
        let nudge = Arc::new(Notify::new());
        let makeup = Arc::new(Notify::new());
        let failover = Arc::new(FailoverService::new(
            Arc::clone(&registry),
            layout.clone(),
            Arc::clone(&instances),
            Arc::clone(&snapshot),
            Arc::clone(&nudge),
        ));
        let contexts = ExecutionContextBuilder::new(
            Arc::clone(&registry),
            layout.clone(),
            Arc::clone(&snapshot),
            Arc::clone(&instances),
            Arc::clone(&sharding),
            Arc::clone(&failover),
        );
        let executor = Arc::new(
            JobExecutor::new(
                Arc::clone(&registry),
                layout.clone(),
                instance_id.clone(),
                Arc::clone(&snapshot),
                job,
                contexts,
                Arc::clone(&failover),
                error_handlers,
            )
            .with_registry_retry(options.registry_backoff.clone(), options.session_timeout),
        );

        instances.register(effective.disabled()).await?;
        leader.elect().await?;
        failover.sweep_orphans().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let trigger = CronTrigger::new(
            Arc::clone(&snapshot),
            Arc::clone(&executor),
            health.subscribe(),
            Arc::clone(&nudge),
            Arc::clone(&makeup),
        );
        let trigger_state = trigger.state();
        let last_report = trigger.reports();
        let trigger_handle = tokio::spawn(trigger.run(shutdown_rx.clone()));

        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            layout.clone(),
            Arc::clone(&snapshot),
            Arc::clone(&instances),
            Arc::clone(&leader),
            Arc::clone(&sharding),
            Arc::clone(&failover),
            Arc::clone(&executor),
            Arc::clone(&health),
            trigger_state.clone(),
            makeup,
            options.registry_backoff.clone(),
        );
        let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown_rx.clone()));

        let reconcile = ReconcileLoop::new(
            Arc::clone(&snapshot),
            Arc::clone(&instances),
            Arc::clone(&leader),
            Arc::clone(&sharding),
            trigger_state.clone(),
        );
        let reconcile_handle = tokio::spawn(reconcile.run(shutdown_rx));

        health.set(HealthState::Running);
        info!(
            instance_id = %instance_id,
            total = effective.sharding_total_count(),
            cron = effective.cron().unwrap_or("<on demand>"),
            "Job scheduler started"
        );

        Ok(JobScheduler {
            registry,
            instance_id,
            options,
            store,
            config: snapshot,
            instances,
            leader,
            sharding,
            executor,
            health,
            nudge,
            trigger_state,
            last_report,
            shutdown_tx,
            tasks: Tasks {
                trigger: trigger_handle,
                dispatcher: dispatcher_handle,
                reconcile: reconcile_handle,
            },
        })
    }
}

struct Tasks {
    trigger: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
    reconcile: JoinHandle<()>,
}

/// A running job on this instance.
pub struct JobScheduler {
    registry: Arc<dyn RegistryClient>,
    instance_id: InstanceId,
    options: SchedulerOptions,
    store: ConfigStore,
    config: Arc<ConfigSnapshot>,
    instances: Arc<InstanceRegistry>,
    leader: Arc<LeaderElection>,
    sharding: Arc<ShardingService>,
    executor: Arc<JobExecutor>,
    health: Arc<HealthReporter>,
    nudge: Arc<Notify>,
    trigger_state: watch::Receiver<TriggerState>,
    last_report: watch::Receiver<Option<ExecutionReport>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Tasks,
}

impl JobScheduler {
    pub fn builder(
        registry: Arc<dyn RegistryClient>,
        job: Arc<dyn ElasticJob>,
        config: JobConfiguration,
    ) -> JobSchedulerBuilder {
        JobSchedulerBuilder {
            registry,
            job,
            config,
            options: SchedulerOptions::default(),
            strategies: builtin_strategies(),
            error_handlers: ErrorHandlerRegistry::new(),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn health(&self) -> watch::Receiver<HealthState> {
        self.health.subscribe()
    }

    pub fn health_state(&self) -> HealthState {
        self.health.current()
    }

    pub fn trigger_state(&self) -> watch::Receiver<TriggerState> {
        self.trigger_state.clone()
    }

    /// Configuration currently in effect.
    pub fn config(&self) -> Arc<JobConfiguration> {
        self.config.load()
    }

    /// Outcome of the most recent pass, if any ran yet.
    pub fn last_report(&self) -> Option<ExecutionReport> {
        self.last_report.borrow().clone()
    }

    /// Run a pass now, outside the cron schedule. A pass already in flight
    /// is followed by exactly one more.
    pub fn trigger_now(&self) {
        self.nudge.notify_one();
    }

    /// Store a new record for the job; every instance picks it up.
    pub async fn update_config(&self, config: JobConfiguration) -> SchedulerResult<()> {
        self.sharding.validate(&config)?;
        self.executor.validate(&config)?;

        let current = self.config.load();
        let resharding = config.sharding_total_count() != current.sharding_total_count()
            || config.job_sharding_strategy_type() != current.job_sharding_strategy_type();

        self.store.update(&config).await?;
        if self.config.replace(config) && resharding {
            self.sharding.set_resharding_flag().await?;
        }
        Ok(())
    }

    /// Enable or disable this host for the job. Disabled hosts own no
    /// shards after the next re-sharding.
    pub async fn set_server_enabled(&self, enabled: bool) -> SchedulerResult<()> {
        self.instances.set_server_enabled(enabled).await
    }

    pub async fn is_leader(&self) -> SchedulerResult<bool> {
        self.leader.is_leader().await
    }

    /// Shards this instance currently owns. Empty while the job or the
    /// host is disabled.
    pub async fn owned_items(&self) -> SchedulerResult<Vec<u32>> {
        let config = self.config.load();
        if config.disabled() || !self.instances.is_server_enabled().await? {
            return Ok(Vec::new());
        }
        self.sharding
            .items_of(&self.instance_id, config.sharding_total_count())
            .await
    }

    /// The persisted assignment.
    pub async fn assignment(&self) -> SchedulerResult<BTreeMap<u32, InstanceId>> {
        self.sharding
            .assignment(self.config.load().sharding_total_count())
            .await
    }

    /// Leave the cohort. Shards still running after the grace period are
    /// abandoned to failover.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn shutdown(self) {
        info!("Shutting down job scheduler");
        let _ = self.shutdown_tx.send(true);
        let grace = self.options.shutdown_grace;

        if !self.executor.shutdown(grace).await {
            warn!(grace_secs = grace.as_secs(), "In-flight shards abandoned");
        }
        join_or_abort(self.tasks.trigger, grace, "trigger").await;

        if let Err(e) = self.leader.resign().await {
            warn!(error = %e, "Failed to resign leadership");
        }
        if let Err(e) = self.instances.unregister().await {
            warn!(error = %e, "Failed to unregister instance");
        }

        join_or_abort(self.tasks.dispatcher, grace, "dispatcher").await;
        join_or_abort(self.tasks.reconcile, grace, "reconcile").await;

        if self.options.close_session_on_shutdown {
            self.registry.close().await;
        }
        self.health.set(HealthState::Stopped);
        info!("Job scheduler stopped");
    }
}

async fn join_or_abort(handle: JoinHandle<()>, grace: Duration, task: &'static str) {
    let abort = handle.abort_handle();
    match tokio::time::timeout(grace, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(task, error = %e, "Task ended abnormally"),
        Err(_) => {
            warn!(task, "Task did not stop in time, aborting");
            abort.abort();
        }
    }
}

fn check_plugins(
    strategies: &NamedRegistry<dyn ShardingStrategy>,
    error_handlers: &ErrorHandlerRegistry,
    config: &JobConfiguration,
) -> SchedulerResult<()> {
    strategies.resolve(config.job_sharding_strategy_type())?;
    error_handlers.resolve(config.job_error_handler_type())?;
    ExecutorServiceKind::resolve(config.job_executor_service_handler_type())?;
    Ok(())
}

fn local_hostname() -> SchedulerResult<String> {
    let name = nix::unistd::gethostname()
        .map_err(|e| SchedulerError::ConfigurationInvalid(format!("cannot read hostname: {e}")))?;
    name.into_string()
        .map_err(|_| SchedulerError::ConfigurationInvalid("hostname is not valid UTF-8".to_string()))
}
