//! # elastic-scheduler
//!
//! Distributed, sharded cron scheduler core. A cohort of processes running
//! the same job elect a leader through a coordination registry, split the
//! job's shards between themselves, fire the job at cron instants and
//! recover shards of crashed peers.
//!
//! ## Architecture
//!
//! - **Registry layout** (`layout`): every node the cohort reads or writes
//! - **Configuration** (`job_config`, `yaml`, `config_store`): the YAML job
//!   record, its registry persistence and the live snapshot
//! - **Membership** (`instance`, `leader`): instance publication and leader
//!   election
//! - **Sharding** (`sharding`): barrier-protected assignment by a named
//!   strategy
//! - **Execution** (`trigger`, `context`, `executor`, `error_handler`): cron
//!   firing, shard resolution, dispatch and failure handling
//! - **Recovery** (`failover`, `reconcile`, `listener`): failover claims,
//!   drift repair and reaction to registry events
//! - **Lifecycle** (`scheduler`, `health`): bootstrap, shutdown and the
//!   observable health state
//!
//! The host supplies an [`elastic_registry::RegistryClient`] and an
//! [`ElasticJob`], and drives everything through [`JobScheduler`].

pub mod config;
pub mod config_store;
pub mod context;
pub mod error;
pub mod error_handler;
pub mod executor;
pub mod failover;
pub mod health;
pub mod instance;
pub mod job;
pub mod job_config;
pub mod layout;
pub mod leader;
pub mod listener;
pub mod plugin;
pub mod reconcile;
pub mod schedule;
pub mod scheduler;
pub mod sharding;
pub mod trigger;
pub mod yaml;

pub use error::{SchedulerError, SchedulerResult};
pub use error_handler::JobErrorHandler;
pub use health::HealthState;
pub use job::{ElasticJob, ExecutionSource, FnJob, ShardingContext};
pub use job_config::{ConfigError, JobConfiguration, JobConfigurationBuilder};
pub use scheduler::{JobScheduler, JobSchedulerBuilder, SchedulerOptions};
pub use sharding::ShardingStrategy;
pub use trigger::TriggerState;
