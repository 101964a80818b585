//! Registry-backed storage of the job record, and the live snapshot.
//!
//! The stored record is shared by all instances of a job. The first
//! instance to start writes it; later instances adopt the stored record
//! unless they start with `overwrite` set.

use std::sync::Arc;

use arc_swap::ArcSwap;
use elastic_reconcile::SpecHash;
use elastic_registry::RegistryClient;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::job_config::JobConfiguration;
use crate::layout::NodeLayout;
use crate::yaml::{self, YamlJobConfiguration};

/// Reads and writes the job record.
pub struct ConfigStore {
    registry: Arc<dyn RegistryClient>,
    layout: NodeLayout,
}

impl ConfigStore {
    pub fn new(registry: Arc<dyn RegistryClient>, layout: NodeLayout) -> Self {
        Self { registry, layout }
    }

    /// The stored record, if any.
    pub async fn load(&self) -> SchedulerResult<Option<JobConfiguration>> {
        match self.registry.get(&self.layout.config()).await? {
            Some(data) => Ok(Some(yaml::from_yaml(&data)?)),
            None => Ok(None),
        }
    }

    /// Store `config` subject to the overwrite policy; returns the record
    /// now in effect.
    #[instrument(skip(self, config), fields(job_name = %config.job_name()))]
    pub async fn store(&self, config: &JobConfiguration) -> SchedulerResult<JobConfiguration> {
        let stored = match self.load().await {
            Ok(stored) => stored,
            // An unreadable stored record is replaced.
            Err(SchedulerError::ConfigurationInvalid(reason)) => {
                warn!(reason = %reason, "Stored job record is invalid, replacing it");
                None
            }
            Err(e) => return Err(e),
        };

        match stored {
            Some(stored) if !config.overwrite() => {
                debug!("Job record exists and overwrite is off, using stored record");
                Ok(stored)
            }
            _ => {
                self.write(config).await?;
                info!("Job record stored");
                Ok(config.clone())
            }
        }
    }

    /// Replace the stored record unconditionally.
    pub async fn update(&self, config: &JobConfiguration) -> SchedulerResult<()> {
        if config.job_name().as_str() != self.job_name() {
            return Err(SchedulerError::ConfigurationInvalid(format!(
                "record for job '{}' cannot replace job '{}'",
                config.job_name(),
                self.job_name()
            )));
        }
        self.write(config).await
    }

    async fn write(&self, config: &JobConfiguration) -> SchedulerResult<()> {
        let data = yaml::to_yaml(config)?;
        self.registry.set(&self.layout.config(), &data).await?;
        Ok(())
    }

    fn job_name(&self) -> &str {
        self.layout.root().rsplit('/').next().unwrap_or_default()
    }
}

/// Content fingerprint of a record, used to ignore no-op rewrites.
pub fn fingerprint(config: &JobConfiguration) -> SpecHash {
    let yaml = YamlJobConfiguration::from(config);
    // Serializing a struct of strings, integers and a string map cannot fail.
    let json = serde_json::to_value(&yaml).unwrap_or_default();
    SpecHash::from_json(&json)
}

// =============================================================================
// Live snapshot
// =============================================================================

/// The record currently in effect on this instance.
///
/// Readers take a cheap `Arc` snapshot; a reload swaps the whole record
/// atomically and bumps a version that wakes the trigger.
pub struct ConfigSnapshot {
    current: ArcSwap<JobConfiguration>,
    fingerprint: ArcSwap<SpecHash>,
    version: watch::Sender<u64>,
}

impl ConfigSnapshot {
    pub fn new(config: JobConfiguration) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            fingerprint: ArcSwap::from_pointee(fingerprint(&config)),
            current: ArcSwap::from_pointee(config),
            version,
        }
    }

    /// Current record.
    pub fn load(&self) -> Arc<JobConfiguration> {
        self.current.load_full()
    }

    /// Install a new record. Returns false (and changes nothing) when the
    /// record is identical to the current one.
    pub fn replace(&self, config: JobConfiguration) -> bool {
        let next = fingerprint(&config);
        if *self.fingerprint.load_full() == next {
            return false;
        }

        self.current.store(Arc::new(config));
        self.fingerprint.store(Arc::new(next));
        self.version.send_modify(|v| *v += 1);
        true
    }

    /// Version counter, bumped on every effective replace.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elastic_registry::MemoryRegistry;

    fn config(total: i32) -> JobConfiguration {
        JobConfiguration::builder("test_job", total)
            .cron("0/1 * * * * ?")
            .build()
            .unwrap()
    }

    fn store() -> (MemoryRegistry, ConfigStore) {
        let registry = MemoryRegistry::new();
        let layout = NodeLayout::new(&"ns".parse().unwrap(), &"test_job".parse().unwrap());
        let store = ConfigStore::new(Arc::new(registry.connect()), layout);
        (registry, store)
    }

    #[tokio::test]
    async fn test_first_store_writes() {
        let (_registry, store) = store();
        assert!(store.load().await.unwrap().is_none());

        let stored = store.store(&config(3)).await.unwrap();
        assert_eq!(stored, config(3));
        assert_eq!(store.load().await.unwrap(), Some(config(3)));
    }

    #[tokio::test]
    async fn test_stored_record_wins_without_overwrite() {
        let (_registry, store) = store();
        store.store(&config(3)).await.unwrap();

        let effective = store.store(&config(5)).await.unwrap();
        assert_eq!(effective.sharding_total_count(), 3);
    }

    #[tokio::test]
    async fn test_overwrite_replaces() {
        let (_registry, store) = store();
        store.store(&config(3)).await.unwrap();

        let replacement = config(5).to_builder().overwrite(true).build().unwrap();
        let effective = store.store(&replacement).await.unwrap();
        assert_eq!(effective.sharding_total_count(), 5);
        assert_eq!(store.load().await.unwrap(), Some(replacement));
    }

    #[tokio::test]
    async fn test_invalid_stored_record_is_replaced() {
        let (registry, store) = store();
        registry
            .connect()
            .set("/ns/test_job/config", "shardingTotalCount: 0\n")
            .await
            .unwrap();

        let effective = store.store(&config(2)).await.unwrap();
        assert_eq!(effective, config(2));
    }

    #[tokio::test]
    async fn test_update_rejects_other_job() {
        let (_registry, store) = store();
        let other = JobConfiguration::builder("other", 1).build().unwrap();
        assert!(matches!(
            store.update(&other).await,
            Err(SchedulerError::ConfigurationInvalid(_))
        ));
    }

    #[test]
    fn test_snapshot_ignores_identical_records() {
        let snapshot = ConfigSnapshot::new(config(3));
        let version = snapshot.subscribe();

        assert!(!snapshot.replace(config(3)));
        assert_eq!(*version.borrow(), 0);

        assert!(snapshot.replace(config(4)));
        assert_eq!(*version.borrow(), 1);
        assert_eq!(snapshot.load().sharding_total_count(), 4);
    }
}
