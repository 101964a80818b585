//! Periodic consistency check of the shard assignment.
//!
//! Every `reconcileIntervalMinutes` the leader compares the persisted
//! assignment against the available instances. Unassigned shards, shards
//! owned by instances that are gone, and out-of-range shard nodes all set
//! `sharding/necessary`; the dispatcher then re-shards. The check is
//! skipped while a pass is firing or re-sharding is already pending.
//! Drift that keeps coming back after repeated re-sharding slows the loop
//! down until the job converges or the retry window passes.

use std::sync::Arc;
use std::time::Duration;

use elastic_reconcile::{
    detect_drift, ConvergenceStatus, DriftReport, RetryTracker, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_WINDOW,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config_store::ConfigSnapshot;
use crate::error::SchedulerResult;
use crate::instance::InstanceRegistry;
use crate::leader::LeaderElection;
use crate::sharding::ShardingService;
use crate::trigger::TriggerState;

/// Interval multiplier while drift keeps recurring.
pub const EXHAUSTED_BACKOFF: u32 = 4;

/// Leader-side drift detection.
pub struct ReconcileLoop {
    config: Arc<ConfigSnapshot>,
    instances: Arc<InstanceRegistry>,
    leader: Arc<LeaderElection>,
    sharding: Arc<ShardingService>,
    trigger: watch::Receiver<TriggerState>,
    tracker: RetryTracker,
}

impl ReconcileLoop {
    pub fn new(
        config: Arc<ConfigSnapshot>,
        instances: Arc<InstanceRegistry>,
        leader: Arc<LeaderElection>,
        sharding: Arc<ShardingService>,
        trigger: watch::Receiver<TriggerState>,
    ) -> Self {
        Self {
            config,
            instances,
            leader,
            sharding,
            trigger,
            tracker: RetryTracker::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW),
        }
    }

    /// Run one check. Returns `None` when the check was skipped.
    pub async fn reconcile_once(&mut self) -> SchedulerResult<Option<DriftReport>> {
        if *self.trigger.borrow() == TriggerState::Firing {
            debug!("Pass in flight, skipping reconcile");
            return Ok(None);
        }
        if !self.leader.is_leader().await? || self.sharding.is_resharding_needed().await? {
            return Ok(None);
        }

        let config = self.config.load();
        let job = config.job_name().as_str().to_string();
        let observed = self.sharding.observed_assignment().await?;
        let available: Vec<String> = self
            .instances
            .available_instances()
            .await?
            .iter()
            .map(ToString::to_string)
            .collect();
        let report = detect_drift(config.sharding_total_count(), &observed, &available);

        match report.status() {
            ConvergenceStatus::Converged => {
                self.tracker.clear(&job);
            }
            ConvergenceStatus::Unknown => {
                debug!("No available instances, nothing to reconcile");
            }
            ConvergenceStatus::Diverged => {
                warn!(drifts = ?report.drifts(), "Sharding drift detected");
                if self.tracker.record_failure(&job) {
                    error!(
                        job_name = %job,
                        backoff = EXHAUSTED_BACKOFF,
                        "Sharding keeps drifting after repeated re-sharding, slowing checks"
                    );
                }
                self.sharding.set_resharding_flag().await?;
            }
        }

        Ok(Some(report))
    }

    /// Time until the next check; `None` when checks are off.
    fn interval(&self) -> Option<Duration> {
        let config = self.config.load();
        let minutes = config.reconcile_interval_minutes();
        if minutes <= 0 {
            return None;
        }
        let base = Duration::from_secs(minutes as u64 * 60);
        if self.tracker.is_exhausted(config.job_name().as_str()) {
            Some(base * EXHAUSTED_BACKOFF)
        } else {
            Some(base)
        }
    }

    /// Run until shutdown. A non-positive interval disables the loop until
    /// the configuration changes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut versions = self.config.subscribe();
        info!("Starting reconcile loop");

        loop {
            let interval = self.interval();

            tokio::select! {
                _ = sleep_for(interval) => {
                    if let Err(e) = self.reconcile_once().await {
                        warn!(error = %e, "Reconcile check failed");
                    }
                }
                changed = versions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconcile loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}

async fn sleep_for(interval: Option<Duration>) {
    match interval {
        Some(interval) => tokio::time::sleep(interval).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Instance;
    use crate::job_config::JobConfiguration;
    use crate::layout::NodeLayout;
    use crate::sharding::{builtin_strategies, BarrierOptions};
    use elastic_id::InstanceId;
    use elastic_reconcile::Drift;
    use elastic_registry::{MemoryRegistry, RegistryClient};

    fn layout() -> NodeLayout {
        NodeLayout::new(&"ns".parse().unwrap(), &"job".parse().unwrap())
    }

    struct Fixture {
        client: Arc<dyn RegistryClient>,
        sharding: Arc<ShardingService>,
        leader: Arc<LeaderElection>,
        trigger: watch::Sender<TriggerState>,
        reconcile: ReconcileLoop,
    }

    async fn fixture(registry: &MemoryRegistry) -> Fixture {
        let client: Arc<dyn RegistryClient> = Arc::new(registry.connect());
        let id = InstanceId::new("a", 1, 1).unwrap();
        let instances = Arc::new(InstanceRegistry::new(
            Arc::clone(&client),
            layout(),
            Instance::new(id.clone(), None),
        ));
        instances.register(false).await.unwrap();
        let leader = Arc::new(LeaderElection::new(Arc::clone(&client), layout(), id));
        let sharding = Arc::new(ShardingService::new(
            Arc::clone(&client),
            layout(),
            Arc::clone(&instances),
            Arc::clone(&leader),
            builtin_strategies(),
            BarrierOptions::default(),
        ));
        let config = Arc::new(ConfigSnapshot::new(
            JobConfiguration::builder("job", 2).build().unwrap(),
        ));
        let (trigger, trigger_rx) = watch::channel(TriggerState::Idle);
        let reconcile = ReconcileLoop::new(
            config,
            instances,
            Arc::clone(&leader),
            Arc::clone(&sharding),
            trigger_rx,
        );
        Fixture {
            client,
            sharding,
            leader,
            trigger,
            reconcile,
        }
    }

    async fn sharded(registry: &MemoryRegistry) -> Fixture {
        let f = fixture(registry).await;
        f.leader.elect().await.unwrap();
        let config = JobConfiguration::builder("job", 2).build().unwrap();
        f.sharding.shard_if_necessary(&config).await.unwrap();
        f
    }

    #[tokio::test]
    async fn test_converged_assignment_is_left_alone() {
        let registry = MemoryRegistry::new();
        let mut f = sharded(&registry).await;

        let report = f.reconcile.reconcile_once().await.unwrap().unwrap();
        assert_eq!(report.status(), ConvergenceStatus::Converged);
        assert!(!f.sharding.is_resharding_needed().await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_owner_requests_resharding() {
        let registry = MemoryRegistry::new();
        let mut f = sharded(&registry).await;
        f.client
            .set(&layout().sharding_instance(1), "gone@9@9")
            .await
            .unwrap();

        let report = f.reconcile.reconcile_once().await.unwrap().unwrap();
        assert_eq!(
            report.drifts(),
            &[Drift::OwnerNotLive {
                item: 1,
                owner: "gone@9@9".to_string()
            }]
        );
        assert!(f.sharding.is_resharding_needed().await.unwrap());
    }

    #[tokio::test]
    async fn test_recurring_drift_backs_off_the_interval() {
        let registry = MemoryRegistry::new();
        let mut f = sharded(&registry).await;
        let base = Duration::from_secs(10 * 60);
        assert_eq!(f.reconcile.interval(), Some(base));

        for _ in 0..=DEFAULT_MAX_RETRIES {
            f.client
                .set(&layout().sharding_instance(1), "gone@9@9")
                .await
                .unwrap();
            let report = f.reconcile.reconcile_once().await.unwrap().unwrap();
            assert_eq!(report.status(), ConvergenceStatus::Diverged);
            assert!(f.sharding.is_resharding_needed().await.unwrap());
            f.client.delete(&layout().sharding_necessary()).await.unwrap();
        }
        assert_eq!(f.reconcile.interval(), Some(base * EXHAUSTED_BACKOFF));

        f.client
            .set(&layout().sharding_instance(1), "a@1@1")
            .await
            .unwrap();
        let report = f.reconcile.reconcile_once().await.unwrap().unwrap();
        assert_eq!(report.status(), ConvergenceStatus::Converged);
        assert_eq!(f.reconcile.interval(), Some(base));
    }

    #[tokio::test]
    async fn test_skipped_when_not_leader_or_firing() {
        let registry = MemoryRegistry::new();
        let mut f = fixture(&registry).await;
        assert!(f.reconcile.reconcile_once().await.unwrap().is_none());

        let registry = MemoryRegistry::new();
        let mut f = sharded(&registry).await;
        f.trigger.send_replace(TriggerState::Firing);
        assert!(f.reconcile.reconcile_once().await.unwrap().is_none());
    }
}
