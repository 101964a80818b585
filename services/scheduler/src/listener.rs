//! Registry event dispatcher.
//!
//! Cross-instance coordination is a sequence of registry transitions. The
//! dispatcher funnels every watch this instance needs into one channel and
//! applies the matching transition:
//!
//! | Event | Transition |
//! |---|---|
//! | `instances` children changed | leader sets `sharding/necessary` |
//! | leader node deleted | run an election |
//! | `config` created/changed | reload the snapshot; a new total sets `necessary` |
//! | `sharding/necessary` created/changed | an idle leader re-shards |
//! | `execution/<i>/running` deleted | failover check for shard `i`; a make-up run if `i` is owned here and flagged `misfire` |
//!
//! Session state is handled here too: `Suspended` degrades health (the
//! trigger pauses), `Expired` additionally re-establishes the session,
//! republishes the instance, rejoins the election and requests
//! re-sharding before returning to `Running`.

use std::sync::Arc;

use elastic_registry::{
    BackoffPolicy, RegistryClient, SessionState, WatchEvent, WatchEventKind, WatchKind,
    WatchStream,
};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config_store::ConfigSnapshot;
use crate::error::SchedulerResult;
use crate::executor::JobExecutor;
use crate::failover::FailoverService;
use crate::health::{HealthReporter, HealthState};
use crate::instance::InstanceRegistry;
use crate::layout::NodeLayout;
use crate::leader::LeaderElection;
use crate::sharding::ShardingService;
use crate::trigger::TriggerState;
use crate::yaml;

const EVENT_BUFFER: usize = 256;

/// Everything the dispatcher drives.
pub struct Dispatcher {
    registry: Arc<dyn RegistryClient>,
    layout: NodeLayout,
    config: Arc<ConfigSnapshot>,
    instances: Arc<InstanceRegistry>,
    leader: Arc<LeaderElection>,
    sharding: Arc<ShardingService>,
    failover: Arc<FailoverService>,
    executor: Arc<JobExecutor>,
    health: Arc<HealthReporter>,
    trigger: watch::Receiver<TriggerState>,
    makeup: Arc<Notify>,
    reconnect_backoff: BackoffPolicy,
}

/// Watch forwarding tasks feeding the dispatcher.
struct Subscriptions {
    tasks: JoinSet<()>,
    tx: mpsc::Sender<WatchEvent>,
    running_watched: u32,
}

impl Subscriptions {
    fn forward(&mut self, mut stream: WatchStream) {
        let tx = self.tx.clone();
        self.tasks.spawn(async move {
            while let Some(event) = stream.next().await {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
    }
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        layout: NodeLayout,
        config: Arc<ConfigSnapshot>,
        instances: Arc<InstanceRegistry>,
        leader: Arc<LeaderElection>,
        sharding: Arc<ShardingService>,
        failover: Arc<FailoverService>,
        executor: Arc<JobExecutor>,
        health: Arc<HealthReporter>,
        trigger: watch::Receiver<TriggerState>,
        makeup: Arc<Notify>,
        reconnect_backoff: BackoffPolicy,
    ) -> Self {
        Self {
            registry,
            layout,
            config,
            instances,
            leader,
            sharding,
            failover,
            executor,
            health,
            trigger,
            makeup,
            reconnect_backoff,
        }
    }

    /// Run until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let mut subs = Subscriptions {
            tasks: JoinSet::new(),
            tx,
            running_watched: 0,
        };
        if let Err(e) = self.subscribe(&mut subs).await {
            error!(error = %e, "Failed to register watches");
        }

        let mut session = self.registry.session_state();
        info!("Starting registry event dispatcher");

        // Re-sharding may already be pending from the election at startup.
        self.on_resharding_requested().await;

        loop {
            if *shutdown.borrow() {
                info!("Dispatcher shutting down");
                break;
            }

            tokio::select! {
                Some(event) = rx.recv() => {
                    if let Err(e) = self.dispatch(&event, &mut subs).await {
                        warn!(path = %event.path, error = %e, "Failed to handle registry event");
                    }
                }
                changed = session.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *session.borrow_and_update();
                    self.on_session_state(state, &mut shutdown).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        subs.tasks.abort_all();
    }

    async fn subscribe(&self, subs: &mut Subscriptions) -> SchedulerResult<()> {
        let streams = [
            (self.layout.instances(), WatchKind::Children),
            (self.layout.leader(), WatchKind::Data),
            (self.layout.config(), WatchKind::Data),
            (self.layout.sharding_necessary(), WatchKind::Data),
        ];
        for (path, kind) in streams {
            subs.forward(self.registry.watch(&path, kind).await?);
        }
        self.watch_running(subs).await
    }

    /// Make sure every in-range shard has a `running` watch.
    async fn watch_running(&self, subs: &mut Subscriptions) -> SchedulerResult<()> {
        let total = self.config.load().sharding_total_count();
        for item in subs.running_watched..total {
            let stream = self
                .registry
                .watch(&self.layout.execution_running(item), WatchKind::Data)
                .await?;
            subs.forward(stream);
        }
        subs.running_watched = subs.running_watched.max(total);
        Ok(())
    }

    async fn dispatch(&self, event: &WatchEvent, subs: &mut Subscriptions) -> SchedulerResult<()> {
        debug!(path = %event.path, kind = ?event.kind, "Registry event");
        let path = event.path.as_str();

        if path == self.layout.instances() {
            if event.kind == WatchEventKind::ChildrenChanged && self.leader.is_leader().await? {
                info!("Instances changed, requesting re-sharding");
                self.sharding.set_resharding_flag().await?;
            }
        } else if path == self.layout.leader() {
            if event.kind == WatchEventKind::Deleted {
                info!("Leader gone, running election");
                self.leader.elect().await?;
            }
        } else if path == self.layout.config() {
            if let (WatchEventKind::Created | WatchEventKind::Changed, Some(data)) =
                (event.kind, event.data.as_deref())
            {
                self.on_config_changed(data).await?;
                self.watch_running(subs).await?;
            }
        } else if path == self.layout.sharding_necessary() {
            if matches!(event.kind, WatchEventKind::Created | WatchEventKind::Changed) {
                self.on_resharding_requested().await;
            }
        } else if let Some(item) = self.layout.running_item(path) {
            if event.kind == WatchEventKind::Deleted {
                self.failover
                    .on_running_removed(item, event.data.as_deref())
                    .await?;
                self.on_running_ended(item).await?;
            }
        }
        Ok(())
    }

    async fn on_config_changed(&self, data: &str) -> SchedulerResult<()> {
        let config = match yaml::from_yaml(data) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "Ignoring invalid configuration update");
                return Ok(());
            }
        };
        let current = self.config.load();
        if config.job_name() != current.job_name() {
            warn!(job_name = %config.job_name(), "Ignoring configuration of another job");
            return Ok(());
        }
        if let Err(e) = self
            .sharding
            .validate(&config)
            .and_then(|()| self.executor.validate(&config))
        {
            error!(error = %e, "Ignoring configuration update");
            return Ok(());
        }

        let resharding = config.sharding_total_count() != current.sharding_total_count()
            || config.job_sharding_strategy_type() != current.job_sharding_strategy_type();
        if self.config.replace(config) {
            info!("Configuration reloaded");
            if resharding {
                self.sharding.set_resharding_flag().await?;
            }
        }
        Ok(())
    }

    /// A shard skipped because it was running elsewhere gets its make-up
    /// run once that run ends, if this instance owns it.
    async fn on_running_ended(&self, item: u32) -> SchedulerResult<()> {
        let config = self.config.load();
        if !(config.misfire() && config.monitor_execution()) || item >= config.sharding_total_count() {
            return Ok(());
        }
        if !self.registry.exists(&self.layout.execution_misfire(item)).await? {
            return Ok(());
        }
        let owned = self
            .sharding
            .items_of(self.instances.id(), config.sharding_total_count())
            .await?;
        if owned.contains(&item) {
            info!(shard = item, "Misfired shard is free again, requesting make-up run");
            self.makeup.notify_one();
        }
        Ok(())
    }

    /// Re-shard right away if this instance leads and is not mid-pass; a
    /// firing leader re-shards at its next pass instead.
    async fn on_resharding_requested(&self) {
        if *self.trigger.borrow() == TriggerState::Firing {
            return;
        }
        if let Err(e) = self.reshard_if_leader().await {
            warn!(error = %e, "Re-sharding on request failed");
        }
    }

    async fn reshard_if_leader(&self) -> SchedulerResult<()> {
        if self.leader.is_leader().await? && self.sharding.is_resharding_needed().await? {
            self.sharding.reshard(&self.config.load()).await?;
        }
        Ok(())
    }

    async fn on_session_state(&self, state: SessionState, shutdown: &mut watch::Receiver<bool>) {
        match state {
            SessionState::Connected => self.health.set(HealthState::Running),
            SessionState::Suspended => {
                warn!("Registry session suspended, pausing triggers");
                self.health.set(HealthState::Degraded);
            }
            SessionState::Expired => {
                warn!("Registry session expired, pausing triggers");
                self.health.set(HealthState::Degraded);
                self.recover(shutdown).await;
            }
        }
    }

    /// Re-establish the session and rejoin the cohort.
    async fn recover(&self, shutdown: &mut watch::Receiver<bool>) {
        let mut attempt = 0;
        loop {
            let delay = self.reconnect_backoff.delay(attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }

            match self.rejoin().await {
                Ok(()) => {
                    info!(attempts = attempt + 1, "Rejoined after session expiry");
                    self.health.set(HealthState::Running);
                    return;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Rejoin failed, retrying");
                    attempt += 1;
                }
            }
        }
    }

    async fn rejoin(&self) -> SchedulerResult<()> {
        self.registry.reconnect().await?;
        let config = self.config.load();
        self.instances.register(config.disabled()).await?;
        self.leader.elect().await?;
        self.sharding.set_resharding_flag().await?;
        self.failover.sweep_orphans().await?;
        Ok(())
    }
}
