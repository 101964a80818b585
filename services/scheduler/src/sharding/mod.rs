//! Shard assignment.
//!
//! Only the leader shards. A round runs under the `sharding/processing`
//! barrier:
//!
//! 1. Create `processing` ephemerally (other instances wait on its absence)
//! 2. Snapshot the available instances, sorted by id
//! 3. Clear prior `sharding/<i>/instance` entries (and out-of-range shards)
//! 4. Ask the job's strategy for an allocation and validate it
//! 5. Persist each shard's owner
//! 6. Clear `sharding/necessary`, then delete `processing`
//!
//! A failed round leaves `necessary` set; on `ShardingFailed` the leader
//! resigns so that another instance retries.

mod strategy;

pub use strategy::{
    builtin_strategies, validate_allocation, Allocation, AverageAllocation, Odevity, RoundRobin,
    ShardingStrategy, AVG_ALLOCATION, ODEVITY, ROUND_ROBIN,
};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use elastic_id::InstanceId;
use elastic_registry::{BackoffPolicy, CreateMode, RegistryClient, RegistryError};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::instance::InstanceRegistry;
use crate::job_config::JobConfiguration;
use crate::layout::{shard_items, NodeLayout};
use crate::leader::LeaderElection;
use crate::plugin::NamedRegistry;

/// How long instances wait on the sharding barrier.
#[derive(Debug, Clone)]
pub struct BarrierOptions {
    /// Poll backoff while waiting.
    pub backoff: BackoffPolicy,

    /// Give up on the current pass after this long.
    pub timeout: Duration,
}

impl Default for BarrierOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::fixed(Duration::from_millis(50), Duration::from_millis(500)),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Computes, persists and reads the shard assignment.
pub struct ShardingService {
    registry: Arc<dyn RegistryClient>,
    layout: NodeLayout,
    instances: Arc<InstanceRegistry>,
    leader: Arc<LeaderElection>,
    strategies: NamedRegistry<dyn ShardingStrategy>,
    barrier: BarrierOptions,
}

impl ShardingService {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        layout: NodeLayout,
        instances: Arc<InstanceRegistry>,
        leader: Arc<LeaderElection>,
        strategies: NamedRegistry<dyn ShardingStrategy>,
        barrier: BarrierOptions,
    ) -> Self {
        Self {
            registry,
            layout,
            instances,
            leader,
            strategies,
            barrier,
        }
    }

    /// Fail early if the record names an unknown strategy.
    pub fn validate(&self, config: &JobConfiguration) -> SchedulerResult<()> {
        self.strategies
            .resolve(config.job_sharding_strategy_type())
            .map(|_| ())
    }

    pub async fn set_resharding_flag(&self) -> SchedulerResult<()> {
        self.registry
            .set(&self.layout.sharding_necessary(), "")
            .await?;
        debug!("Re-sharding requested");
        Ok(())
    }

    pub async fn is_resharding_needed(&self) -> SchedulerResult<bool> {
        Ok(self
            .registry
            .exists(&self.layout.sharding_necessary())
            .await?)
    }

    pub async fn is_sharding_in_progress(&self) -> SchedulerResult<bool> {
        Ok(self
            .registry
            .exists(&self.layout.sharding_processing())
            .await?)
    }

    /// Make sure the assignment is current before a pass.
    ///
    /// The leader shards when the flag is set; other instances wait until
    /// the flag and the barrier are gone.
    pub async fn shard_if_necessary(&self, config: &JobConfiguration) -> SchedulerResult<()> {
        if !self.is_resharding_needed().await? {
            return Ok(());
        }

        if self
            .leader
            .is_leader_until_block(&self.barrier.backoff, self.barrier.timeout)
            .await?
        {
            self.reshard(config).await
        } else {
            self.wait_until_sharding_completed(config).await
        }
    }

    /// Wait for the leader to finish sharding. Takes over if this instance
    /// becomes leader while waiting.
    pub async fn wait_until_sharding_completed(
        &self,
        config: &JobConfiguration,
    ) -> SchedulerResult<()> {
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            let necessary = self.is_resharding_needed().await?;
            let processing = self.is_sharding_in_progress().await?;
            if !necessary && !processing {
                return Ok(());
            }
            if necessary && !processing && self.leader.is_leader().await? {
                return self.reshard(config).await;
            }
            if started.elapsed() >= self.barrier.timeout {
                return Err(SchedulerError::ShardingFailed(format!(
                    "sharding did not complete within {}ms",
                    self.barrier.timeout.as_millis()
                )));
            }

            tokio::time::sleep(self.barrier.backoff.delay(attempt)).await;
            attempt += 1;
        }
    }

    /// Run one sharding round under the barrier.
    #[instrument(skip(self, config), fields(job_name = %config.job_name(), total = config.sharding_total_count()))]
    pub async fn reshard(&self, config: &JobConfiguration) -> SchedulerResult<()> {
        let processing = self.layout.sharding_processing();
        match self
            .registry
            .create(&processing, self.instances.id().as_str(), CreateMode::Ephemeral)
            .await
        {
            Ok(_) => {}
            Err(RegistryError::Exists(_)) => {
                debug!("Sharding already in progress, waiting for it");
                return self.wait_for_barrier().await;
            }
            Err(e) => return Err(e.into()),
        }

        let result = self.reshard_under_barrier(config).await;

        if let Err(e) = self.registry.delete(&processing).await {
            warn!(error = %e, "Failed to release sharding barrier");
        }

        if let Err(SchedulerError::ShardingFailed(reason)) = &result {
            error!(reason = %reason, "Sharding failed, resigning leadership");
            if let Err(e) = self.leader.resign().await {
                warn!(error = %e, "Failed to resign leadership");
            }
        }

        result
    }

    async fn wait_for_barrier(&self) -> SchedulerResult<()> {
        let started = Instant::now();
        let mut attempt = 0;

        while self.is_sharding_in_progress().await? {
            if started.elapsed() >= self.barrier.timeout {
                return Err(SchedulerError::ShardingFailed(format!(
                    "sharding barrier held for more than {}ms",
                    self.barrier.timeout.as_millis()
                )));
            }
            tokio::time::sleep(self.barrier.backoff.delay(attempt)).await;
            attempt += 1;
        }
        Ok(())
    }

    async fn reshard_under_barrier(&self, config: &JobConfiguration) -> SchedulerResult<()> {
        let total = config.sharding_total_count();
        let instances = self.instances.available_instances().await?;

        let existing = shard_items(&self.registry.children(&self.layout.sharding()).await?);
        for item in existing {
            if item >= total {
                self.registry.delete(&self.layout.sharding_item(item)).await?;
            } else {
                self.registry
                    .delete(&self.layout.sharding_instance(item))
                    .await?;
            }
        }

        if instances.is_empty() {
            warn!("No available instances, assignment cleared");
            self.registry
                .delete(&self.layout.sharding_necessary())
                .await?;
            return Ok(());
        }

        let name = config
            .job_sharding_strategy_type()
            .unwrap_or(AVG_ALLOCATION);
        let strategy = self
            .strategies
            .resolve(config.job_sharding_strategy_type())
            .map_err(|e| SchedulerError::ShardingFailed(e.to_string()))?;
        let allocation = strategy
            .sharding(&instances, config.job_name().as_str(), total)
            .map_err(|e| SchedulerError::ShardingFailed(format!("strategy {name} failed: {e:#}")))?;
        let owners = validate_allocation(&allocation, &instances, total)?;

        for (item, owner) in &owners {
            self.registry
                .set(&self.layout.sharding_instance(*item), owner.as_str())
                .await?;
        }
        self.registry
            .delete(&self.layout.sharding_necessary())
            .await?;

        info!(
            strategy = name,
            instances = instances.len(),
            "Sharding completed"
        );
        Ok(())
    }

    /// Owner of every in-range shard that has one.
    pub async fn assignment(&self, total: u32) -> SchedulerResult<BTreeMap<u32, InstanceId>> {
        let mut owners = BTreeMap::new();
        for item in 0..total {
            if let Some(owner) = self.owner_of(item).await? {
                owners.insert(item, owner);
            }
        }
        Ok(owners)
    }

    /// Shards assigned to `instance`.
    pub async fn items_of(&self, instance: &InstanceId, total: u32) -> SchedulerResult<Vec<u32>> {
        Ok(self
            .assignment(total)
            .await?
            .into_iter()
            .filter(|(_, owner)| owner == instance)
            .map(|(item, _)| item)
            .collect())
    }

    /// Every shard node found in the registry, in or out of range, with
    /// its raw owner.
    pub async fn observed_assignment(&self) -> SchedulerResult<BTreeMap<u32, Option<String>>> {
        let mut observed = BTreeMap::new();
        for item in shard_items(&self.registry.children(&self.layout.sharding()).await?) {
            let owner = self
                .registry
                .get(&self.layout.sharding_instance(item))
                .await?
                .filter(|owner| !owner.is_empty());
            observed.insert(item, owner);
        }
        Ok(observed)
    }

    async fn owner_of(&self, item: u32) -> SchedulerResult<Option<InstanceId>> {
        let Some(data) = self
            .registry
            .get(&self.layout.sharding_instance(item))
            .await?
        else {
            return Ok(None);
        };
        Ok(InstanceId::parse(&data).ok())
    }
}
