//! Taking over shards from crashed instances.
//!
//! Failover is active only when the job has both `failover` and
//! `monitorExecution` set. A shard needs failover when its `running`
//! marker disappears (or is found at startup) while the instance named in
//! it is no longer live. Any live instance may claim it:
//!
//! 1. Create `failover/<i>/leader` ephemerally; losers stop here
//! 2. Skip if `sharding/<i>/failover` already names a claimant
//! 3. Write `sharding/<i>/failover` = own id (ephemeral) and nudge the trigger
//!
//! A claimant that crashes before finishing loses both nodes with its
//! session, so the shard becomes claimable again.

use std::collections::BTreeSet;
use std::sync::Arc;

use elastic_id::InstanceId;
use elastic_registry::{CreateMode, RegistryClient, RegistryError};
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use crate::config_store::ConfigSnapshot;
use crate::error::SchedulerResult;
use crate::instance::InstanceRegistry;
use crate::layout::NodeLayout;

/// Claims and tracks failover shards for one instance.
pub struct FailoverService {
    registry: Arc<dyn RegistryClient>,
    layout: NodeLayout,
    instances: Arc<InstanceRegistry>,
    config: Arc<ConfigSnapshot>,
    nudge: Arc<Notify>,
}

impl FailoverService {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        layout: NodeLayout,
        instances: Arc<InstanceRegistry>,
        config: Arc<ConfigSnapshot>,
        nudge: Arc<Notify>,
    ) -> Self {
        Self {
            registry,
            layout,
            instances,
            config,
            nudge,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.load().is_failover_enabled()
    }

    /// React to a `running` marker being deleted. `executor` is the data the
    /// marker held. Returns whether this instance claimed the shard.
    pub async fn on_running_removed(&self, item: u32, executor: Option<&str>) -> SchedulerResult<bool> {
        if !self.is_enabled() || item >= self.config.load().sharding_total_count() {
            return Ok(false);
        }

        let Some(executor) = executor.and_then(|e| InstanceId::parse(e).ok()) else {
            debug!(shard = item, "Running marker without executor, ignoring");
            return Ok(false);
        };
        if &executor == self.instances.id() || self.instances.is_live(&executor).await? {
            return Ok(false);
        }

        info!(shard = item, crashed = %executor, "Shard lost with its instance");
        self.claim(item).await
    }

    /// Try to claim `item` for this instance.
    #[instrument(skip(self), fields(instance_id = %self.instances.id()))]
    pub async fn claim(&self, item: u32) -> SchedulerResult<bool> {
        let lock = self.layout.failover_lock(item);
        let me = self.instances.id().as_str();

        match self.registry.create(&lock, me, CreateMode::Ephemeral).await {
            Ok(_) => {}
            Err(RegistryError::Exists(_)) => {
                debug!(shard = item, "Failover claim lost");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        let claim = self.layout.sharding_failover(item);
        let claimed = match self.registry.create(&claim, me, CreateMode::Ephemeral).await {
            Ok(_) => true,
            Err(RegistryError::Exists(_)) => false,
            Err(e) => {
                self.release_lock(item).await;
                return Err(e.into());
            }
        };
        self.release_lock(item).await;

        if claimed {
            info!(shard = item, "Claimed shard for failover");
            self.nudge.notify_one();
        } else {
            debug!(shard = item, "Shard already claimed for failover");
        }
        Ok(claimed)
    }

    async fn release_lock(&self, item: u32) {
        if let Err(e) = self.registry.delete(&self.layout.failover_lock(item)).await {
            warn!(shard = item, error = %e, "Failed to release failover lock");
        }
    }

    /// Shards claimed by this instance.
    pub async fn local_claims(&self) -> SchedulerResult<Vec<u32>> {
        Ok(self
            .claims()
            .await?
            .into_iter()
            .filter(|(_, claimant)| claimant == self.instances.id().as_str())
            .map(|(item, _)| item)
            .collect())
    }

    /// Shards claimed by other instances.
    pub async fn claimed_by_others(&self) -> SchedulerResult<BTreeSet<u32>> {
        Ok(self
            .claims()
            .await?
            .into_iter()
            .filter(|(_, claimant)| claimant != self.instances.id().as_str())
            .map(|(item, _)| item)
            .collect())
    }

    async fn claims(&self) -> SchedulerResult<Vec<(u32, String)>> {
        if !self.is_enabled() {
            return Ok(Vec::new());
        }
        let mut claims = Vec::new();
        for item in 0..self.config.load().sharding_total_count() {
            if let Some(claimant) = self
                .registry
                .get(&self.layout.sharding_failover(item))
                .await?
            {
                claims.push((item, claimant));
            }
        }
        Ok(claims)
    }

    /// Clear this instance's claim on `item` after the shard ran.
    pub async fn complete(&self, item: u32) -> SchedulerResult<()> {
        let claim = self.layout.sharding_failover(item);
        if self.registry.get(&claim).await?.as_deref() == Some(self.instances.id().as_str()) {
            self.registry.delete(&claim).await?;
            self.registry.delete(&self.layout.failover_item(item)).await?;
            info!(shard = item, "Failover shard completed");
        }
        Ok(())
    }

    /// Claim shards whose `running` marker outlived its instance.
    pub async fn sweep_orphans(&self) -> SchedulerResult<Vec<u32>> {
        if !self.is_enabled() {
            return Ok(Vec::new());
        }
        let mut claimed = Vec::new();
        for item in 0..self.config.load().sharding_total_count() {
            let executor = self
                .registry
                .get(&self.layout.execution_running(item))
                .await?;
            if executor.is_some() && self.on_running_removed(item, executor.as_deref()).await? {
                claimed.push(item);
            }
        }
        if !claimed.is_empty() {
            info!(shards = ?claimed, "Claimed orphaned shards at startup");
        }
        Ok(claimed)
    }
}
