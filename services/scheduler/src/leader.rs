//! Leader election.
//!
//! Candidates race to create `leader/election/instance` ephemerally with
//! their own id as data. The node vanishes with the leader's session, and
//! the dispatcher (which watches it) re-runs the election. Winning an
//! election sets the re-sharding flag.

use std::sync::Arc;
use std::time::Duration;

use elastic_id::InstanceId;
use elastic_registry::{BackoffPolicy, CreateMode, RegistryClient, RegistryError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SchedulerResult;
use crate::layout::NodeLayout;

/// One instance's view of the job's leader.
pub struct LeaderElection {
    registry: Arc<dyn RegistryClient>,
    layout: NodeLayout,
    instance_id: InstanceId,
}

impl LeaderElection {
    pub fn new(registry: Arc<dyn RegistryClient>, layout: NodeLayout, instance_id: InstanceId) -> Self {
        Self {
            registry,
            layout,
            instance_id,
        }
    }

    /// Try to become leader. Returns whether this instance leads afterwards.
    pub async fn elect(&self) -> SchedulerResult<bool> {
        match self
            .registry
            .create(&self.layout.leader(), self.instance_id.as_str(), CreateMode::Ephemeral)
            .await
        {
            Ok(_) => {
                info!(instance_id = %self.instance_id, "Elected leader");
                self.registry
                    .set(&self.layout.sharding_necessary(), "")
                    .await?;
                Ok(true)
            }
            Err(RegistryError::Exists(_)) => self.is_leader().await,
            Err(e) => Err(e.into()),
        }
    }

    /// Current leader, if one is elected.
    pub async fn leader_id(&self) -> SchedulerResult<Option<InstanceId>> {
        let Some(data) = self.registry.get(&self.layout.leader()).await? else {
            return Ok(None);
        };
        match InstanceId::parse(&data) {
            Ok(id) => Ok(Some(id)),
            Err(e) => {
                warn!(data = %data, error = %e, "Leader node holds a malformed id");
                Ok(None)
            }
        }
    }

    pub async fn is_leader(&self) -> SchedulerResult<bool> {
        Ok(self.leader_id().await?.as_ref() == Some(&self.instance_id))
    }

    /// Answer `is_leader`, first waiting (and competing) for a leader to
    /// exist. Gives up after `timeout` and answers `false`.
    pub async fn is_leader_until_block(
        &self,
        policy: &BackoffPolicy,
        timeout: Duration,
    ) -> SchedulerResult<bool> {
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            if let Some(leader) = self.leader_id().await? {
                return Ok(leader == self.instance_id);
            }
            if self.elect().await? {
                return Ok(true);
            }
            if started.elapsed() >= timeout {
                warn!(waited_ms = timeout.as_millis() as u64, "No leader elected in time");
                return Ok(false);
            }

            let delay = policy.delay(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Waiting for leader election");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Step down if this instance is the leader.
    pub async fn resign(&self) -> SchedulerResult<()> {
        if self.is_leader().await? {
            self.registry.delete(&self.layout.leader()).await?;
            info!(instance_id = %self.instance_id, "Resigned leadership");
        }
        Ok(())
    }
}
