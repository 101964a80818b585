//! Registry path layout for one job.
//!
//! Every node a job touches lives under `/<namespace>/<jobName>`:
//!
//! ```text
//! config                    persistent   YAML job record
//! instances/<instanceId>    ephemeral    instance label
//! servers/<hostname>        persistent   ENABLED | DISABLED
//! leader/election/instance  ephemeral    leader instance id
//! sharding/necessary        persistent   re-shard marker
//! sharding/processing       ephemeral    sharding barrier
//! sharding/<i>/instance     persistent   owning instance id
//! sharding/<i>/failover     ephemeral    failover claimant
//! execution/<i>/running     ephemeral    executing instance id
//! execution/<i>/completed   persistent   last completion (RFC 3339)
//! execution/<i>/misfire     persistent   missed-tick flag
//! failover/<i>/leader       ephemeral    failover claim lock
//! ```

use elastic_id::{InstanceId, JobName, Namespace};

/// Pure mapping from job concepts to registry paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLayout {
    root: String,
}

impl NodeLayout {
    pub fn new(namespace: &Namespace, job_name: &JobName) -> Self {
        Self {
            root: format!("/{namespace}/{job_name}"),
        }
    }

    /// `/<namespace>/<jobName>`
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn config(&self) -> String {
        format!("{}/config", self.root)
    }

    // Instances and servers

    pub fn instances(&self) -> String {
        format!("{}/instances", self.root)
    }

    pub fn instance(&self, id: &InstanceId) -> String {
        format!("{}/instances/{id}", self.root)
    }

    pub fn servers(&self) -> String {
        format!("{}/servers", self.root)
    }

    pub fn server(&self, hostname: &str) -> String {
        format!("{}/servers/{hostname}", self.root)
    }

    // Leader

    pub fn leader(&self) -> String {
        format!("{}/leader/election/instance", self.root)
    }

    // Sharding

    pub fn sharding(&self) -> String {
        format!("{}/sharding", self.root)
    }

    pub fn sharding_necessary(&self) -> String {
        format!("{}/sharding/necessary", self.root)
    }

    pub fn sharding_processing(&self) -> String {
        format!("{}/sharding/processing", self.root)
    }

    pub fn sharding_item(&self, item: u32) -> String {
        format!("{}/sharding/{item}", self.root)
    }

    pub fn sharding_instance(&self, item: u32) -> String {
        format!("{}/sharding/{item}/instance", self.root)
    }

    pub fn sharding_failover(&self, item: u32) -> String {
        format!("{}/sharding/{item}/failover", self.root)
    }

    // Execution state

    pub fn execution_running(&self, item: u32) -> String {
        format!("{}/execution/{item}/running", self.root)
    }

    pub fn execution_completed(&self, item: u32) -> String {
        format!("{}/execution/{item}/completed", self.root)
    }

    pub fn execution_misfire(&self, item: u32) -> String {
        format!("{}/execution/{item}/misfire", self.root)
    }

    // Failover

    pub fn failover_item(&self, item: u32) -> String {
        format!("{}/failover/{item}", self.root)
    }

    pub fn failover_lock(&self, item: u32) -> String {
        format!("{}/failover/{item}/leader", self.root)
    }

    /// Shard index of a `running` node path, if `path` is one.
    pub fn running_item(&self, path: &str) -> Option<u32> {
        path.strip_prefix(&self.root)?
            .strip_prefix("/execution/")?
            .strip_suffix("/running")?
            .parse()
            .ok()
    }
}

/// Shard indexes among the children of `sharding/`.
pub fn shard_items(children: &[String]) -> Vec<u32> {
    let mut items: Vec<u32> = children.iter().filter_map(|c| c.parse().ok()).collect();
    items.sort_unstable();
    items
}
