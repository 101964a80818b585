//! Instance liveness and server status.
//!
//! Each scheduler process publishes `instances/<id>` ephemerally, so its
//! presence is tied to the registry session. Server status is persistent
//! and per host: an operator can disable a host, which removes its
//! instances from sharding without stopping them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use elastic_id::InstanceId;
use elastic_registry::{CreateMode, RegistryClient, RegistryError};
use tracing::{debug, info, instrument, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::layout::NodeLayout;

/// Status stored under `servers/<hostname>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Enabled,
    Disabled,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "ENABLED",
            Self::Disabled => "DISABLED",
        }
    }

    /// Anything other than `DISABLED` counts as enabled.
    pub fn parse(data: &str) -> Self {
        if data.trim() == Self::Disabled.as_str() {
            Self::Disabled
        } else {
            Self::Enabled
        }
    }
}

/// Description of this process as a job participant.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: InstanceId,
    pub startup: DateTime<Utc>,
    pub label: Option<String>,
}

impl Instance {
    pub fn new(id: InstanceId, label: Option<String>) -> Self {
        Self {
            id,
            startup: Utc::now(),
            label,
        }
    }

    pub fn hostname(&self) -> &str {
        self.id.hostname()
    }
}

/// Publishes this instance and answers membership queries.
pub struct InstanceRegistry {
    registry: Arc<dyn RegistryClient>,
    layout: NodeLayout,
    instance: Instance,
}

impl InstanceRegistry {
    pub fn new(registry: Arc<dyn RegistryClient>, layout: NodeLayout, instance: Instance) -> Self {
        Self {
            registry,
            layout,
            instance,
        }
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn id(&self) -> &InstanceId {
        &self.instance.id
    }

    /// Fail if the local clock is too far from the registry clock.
    ///
    /// A non-positive `max_secs` disables the check.
    pub async fn check_clock_skew(&self, max_secs: i32) -> SchedulerResult<()> {
        if max_secs <= 0 {
            return Ok(());
        }

        let server_now = self.registry.server_time().await?;
        let skew_secs = (Utc::now() - server_now).num_seconds().abs();
        if skew_secs > i64::from(max_secs) {
            return Err(SchedulerError::ClockSkewExceeded {
                skew_secs,
                max_secs,
            });
        }

        debug!(skew_secs, max_secs, "Clock skew within bounds");
        Ok(())
    }

    /// Publish the instance node and, on first start of this host, its
    /// server status.
    #[instrument(skip(self), fields(instance_id = %self.instance.id))]
    pub async fn register(&self, disabled: bool) -> SchedulerResult<()> {
        let server = self.layout.server(self.instance.hostname());
        if self.registry.get(&server).await?.is_none() {
            let status = if disabled {
                ServerStatus::Disabled
            } else {
                ServerStatus::Enabled
            };
            self.registry.set(&server, status.as_str()).await?;
        }

        let label = self.instance.label.as_deref().unwrap_or_default();
        match self
            .registry
            .create(&self.layout.instance(&self.instance.id), label, CreateMode::Ephemeral)
            .await
        {
            Ok(_) => {}
            Err(RegistryError::Exists(path)) => {
                debug!(path = %path, "Instance node already published");
            }
            Err(e) => return Err(e.into()),
        }

        info!(startup = %self.instance.startup, "Instance registered");
        Ok(())
    }

    /// Remove the instance node.
    pub async fn unregister(&self) -> SchedulerResult<()> {
        self.registry
            .delete(&self.layout.instance(&self.instance.id))
            .await?;
        info!(instance_id = %self.instance.id, "Instance unregistered");
        Ok(())
    }

    /// Live instances, sorted by id.
    pub async fn live_instances(&self) -> SchedulerResult<Vec<InstanceId>> {
        let children = self.registry.children(&self.layout.instances()).await?;
        let mut ids: Vec<InstanceId> = children
            .iter()
            .filter_map(|child| match InstanceId::parse(child) {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(node = %child, error = %e, "Ignoring malformed instance node");
                    None
                }
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Live instances whose host is enabled, sorted by id.
    pub async fn available_instances(&self) -> SchedulerResult<Vec<InstanceId>> {
        let mut available = Vec::new();
        for id in self.live_instances().await? {
            if self.server_status(id.hostname()).await? == ServerStatus::Enabled {
                available.push(id);
            }
        }
        Ok(available)
    }

    pub async fn is_live(&self, id: &InstanceId) -> SchedulerResult<bool> {
        Ok(self.registry.exists(&self.layout.instance(id)).await?)
    }

    pub async fn server_status(&self, hostname: &str) -> SchedulerResult<ServerStatus> {
        Ok(self
            .registry
            .get(&self.layout.server(hostname))
            .await?
            .map(|data| ServerStatus::parse(&data))
            .unwrap_or(ServerStatus::Enabled))
    }

    pub async fn is_server_enabled(&self) -> SchedulerResult<bool> {
        Ok(self.server_status(self.instance.hostname()).await? == ServerStatus::Enabled)
    }

    /// Enable or disable this host and request re-sharding.
    pub async fn set_server_enabled(&self, enabled: bool) -> SchedulerResult<()> {
        let status = if enabled {
            ServerStatus::Enabled
        } else {
            ServerStatus::Disabled
        };
        self.registry
            .set(&self.layout.server(self.instance.hostname()), status.as_str())
            .await?;
        self.registry
            .set(&self.layout.sharding_necessary(), "")
            .await?;
        info!(hostname = %self.instance.hostname(), status = status.as_str(), "Server status changed");
        Ok(())
    }
}
