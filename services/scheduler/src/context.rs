//! Which shards this instance runs, resolved at trigger time.

use std::collections::BTreeMap;
use std::sync::Arc;

use elastic_id::InstanceId;
use elastic_registry::RegistryClient;
use tracing::debug;

use crate::config_store::ConfigSnapshot;
use crate::error::SchedulerResult;
use crate::failover::FailoverService;
use crate::instance::InstanceRegistry;
use crate::job::{ExecutionSource, ShardingContext};
use crate::job_config::JobConfiguration;
use crate::layout::NodeLayout;
use crate::sharding::ShardingService;

/// The shards of one pass and what each of them receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardingContexts {
    pub job_name: String,
    pub task_id: String,
    pub sharding_total_count: u32,
    pub job_parameter: String,
    /// Shard → its item parameter.
    pub items: BTreeMap<u32, Option<String>>,
    pub source: ExecutionSource,
}

impl ShardingContexts {
    fn new(
        config: &JobConfiguration,
        instance_id: &InstanceId,
        items: Vec<u32>,
        source: ExecutionSource,
    ) -> Self {
        let listed: Vec<String> = items.iter().map(u32::to_string).collect();
        let task_id = format!(
            "{}@-@{}@-@{}@-@{}",
            config.job_name(),
            listed.join(","),
            source,
            instance_id
        );
        Self {
            job_name: config.job_name().to_string(),
            task_id,
            sharding_total_count: config.sharding_total_count(),
            job_parameter: config.job_parameter().unwrap_or_default().to_string(),
            items: items
                .into_iter()
                .map(|item| (item, config.item_parameter(item).map(str::to_string)))
                .collect(),
            source,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> Vec<u32> {
        self.items.keys().copied().collect()
    }

    /// Context handed to the job for one shard.
    pub fn context_for(&self, item: u32) -> ShardingContext {
        ShardingContext {
            job_name: self.job_name.clone(),
            task_id: self.task_id.clone(),
            sharding_total_count: self.sharding_total_count,
            job_parameter: self.job_parameter.clone(),
            sharding_item: item,
            sharding_parameter: self.items.get(&item).cloned().flatten(),
            source: self.source,
        }
    }
}

/// Resolves the shards of a pass.
pub struct ExecutionContextBuilder {
    registry: Arc<dyn RegistryClient>,
    layout: NodeLayout,
    config: Arc<ConfigSnapshot>,
    instances: Arc<InstanceRegistry>,
    sharding: Arc<ShardingService>,
    failover: Arc<FailoverService>,
}

impl ExecutionContextBuilder {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        layout: NodeLayout,
        config: Arc<ConfigSnapshot>,
        instances: Arc<InstanceRegistry>,
        sharding: Arc<ShardingService>,
        failover: Arc<FailoverService>,
    ) -> Self {
        Self {
            registry,
            layout,
            config,
            instances,
            sharding,
            failover,
        }
    }

    /// Shards to run now.
    ///
    /// Local failover claims run alone. Otherwise the pass covers the
    /// assigned shards minus those another instance claimed for failover,
    /// after sharding (or waiting for it) if re-sharding is pending. A
    /// misfire pass keeps only the shards flagged `misfire`. Disabled jobs
    /// and disabled hosts get an empty context.
    pub async fn build(&self, source: ExecutionSource) -> SchedulerResult<ShardingContexts> {
        let config = self.config.load();
        let me = self.instances.id();

        if config.disabled() || !self.instances.is_server_enabled().await? {
            debug!("Job or server disabled, nothing to run");
            return Ok(ShardingContexts::new(&config, me, Vec::new(), source));
        }

        let claims = self.failover.local_claims().await?;
        if !claims.is_empty() {
            return Ok(ShardingContexts::new(
                &config,
                me,
                claims,
                ExecutionSource::Failover,
            ));
        }
        if source == ExecutionSource::Failover {
            return Ok(ShardingContexts::new(&config, me, Vec::new(), source));
        }

        self.sharding.shard_if_necessary(&config).await?;

        let taken = self.failover.claimed_by_others().await?;
        let items: Vec<u32> = self
            .sharding
            .items_of(me, config.sharding_total_count())
            .await?
            .into_iter()
            .filter(|item| !taken.contains(item))
            .collect();
        let items = if source == ExecutionSource::Misfire {
            self.misfired(items).await?
        } else {
            items
        };

        Ok(ShardingContexts::new(&config, me, items, source))
    }

    async fn misfired(&self, items: Vec<u32>) -> SchedulerResult<Vec<u32>> {
        let mut flagged = Vec::with_capacity(items.len());
        for item in items {
            if self
                .registry
                .exists(&self.layout.execution_misfire(item))
                .await?
            {
                flagged.push(item);
            }
        }
        Ok(flagged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contexts_pair_parameters() {
        let config = JobConfiguration::builder("job", 3)
            .sharding_item_parameters("0=A,2=C")
            .job_parameter("p")
            .build()
            .unwrap();
        let id = InstanceId::new("h", 1, 1).unwrap();
        let contexts = ShardingContexts::new(&config, &id, vec![0, 1, 2], ExecutionSource::Ready);

        assert_eq!(contexts.task_id, "job@-@0,1,2@-@READY@-@h@1@1");
        assert_eq!(contexts.items(), vec![0, 1, 2]);

        let zero = contexts.context_for(0);
        assert_eq!(zero.sharding_parameter.as_deref(), Some("A"));
        assert_eq!(zero.job_parameter, "p");
        assert_eq!(zero.sharding_total_count, 3);
        assert!(contexts.context_for(1).sharding_parameter.is_none());
    }
}
