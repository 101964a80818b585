//! Shared fixtures for the scheduler integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use elastic_id::{JobName, Namespace};
use elastic_registry::{BackoffPolicy, MemoryRegistry, RegistryClient, SessionId};
use elastic_scheduler::layout::NodeLayout;
use elastic_scheduler::sharding::BarrierOptions;
use elastic_scheduler::{
    ElasticJob, ExecutionSource, JobConfiguration, JobScheduler, SchedulerOptions,
    ShardingContext,
};
use tokio::time::Instant;

pub const NAMESPACE: &str = "it";

/// One recorded shard invocation.
#[derive(Debug, Clone)]
pub struct Call {
    pub item: u32,
    pub source: ExecutionSource,
    pub task_id: String,
    pub parameter: Option<String>,
    pub started: Instant,
}

/// Job that records every invocation and can be told to hold shards.
#[derive(Default)]
pub struct RecordingJob {
    calls: Mutex<Vec<Call>>,
    shard_delays: Mutex<BTreeMap<u32, Duration>>,
    first_delay: Mutex<Option<Duration>>,
}

impl RecordingJob {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every run of `item` takes `delay`.
    pub fn hold_shard(&self, item: u32, delay: Duration) {
        self.shard_delays.lock().unwrap().insert(item, delay);
    }

    /// Only the very first invocation takes `delay`.
    pub fn hold_first_call(&self, delay: Duration) {
        *self.first_delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn count_of(&self, item: u32, source: ExecutionSource) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.item == item && c.source == source)
            .count()
    }
}

#[async_trait]
impl ElasticJob for RecordingJob {
    async fn execute(&self, ctx: ShardingContext) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(Call {
            item: ctx.sharding_item,
            source: ctx.source,
            task_id: ctx.task_id.clone(),
            parameter: ctx.sharding_parameter.clone(),
            started: Instant::now(),
        });

        let first = self.first_delay.lock().unwrap().take();
        let delay = first.or_else(|| self.shard_delays.lock().unwrap().get(&ctx.sharding_item).copied());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

/// One scheduler process of a test cohort.
pub struct Member {
    pub scheduler: JobScheduler,
    pub client: Arc<dyn RegistryClient>,
    pub session: SessionId,
    pub job: Arc<RecordingJob>,
}

pub fn options(hostname: &str) -> SchedulerOptions {
    SchedulerOptions {
        namespace: NAMESPACE.to_string(),
        hostname: Some(hostname.to_string()),
        shutdown_grace: Duration::from_secs(2),
        registry_backoff: BackoffPolicy::fixed(Duration::from_millis(50), Duration::from_millis(200)),
        session_timeout: Duration::from_secs(2),
        barrier: BarrierOptions {
            backoff: BackoffPolicy::fixed(Duration::from_millis(10), Duration::from_millis(50)),
            timeout: Duration::from_secs(5),
        },
        ..SchedulerOptions::default()
    }
}

pub async fn start(registry: &MemoryRegistry, hostname: &str, config: JobConfiguration) -> Member {
    start_with(registry, config, options(hostname)).await
}

pub async fn start_with(
    registry: &MemoryRegistry,
    config: JobConfiguration,
    options: SchedulerOptions,
) -> Member {
    start_with_job(registry, config, options, RecordingJob::new()).await
}

pub async fn start_with_job(
    registry: &MemoryRegistry,
    config: JobConfiguration,
    options: SchedulerOptions,
    job: Arc<RecordingJob>,
) -> Member {
    let session = registry.connect();
    let sid = session.session_id();
    let client: Arc<dyn RegistryClient> = Arc::new(session);
    let scheduler = JobScheduler::builder(Arc::clone(&client), job.clone(), config)
        .options(options)
        .start()
        .await
        .expect("scheduler starts");
    Member {
        scheduler,
        client,
        session: sid,
        job,
    }
}

pub fn layout(job: &str) -> NodeLayout {
    NodeLayout::new(
        &Namespace::parse(NAMESPACE).unwrap(),
        &JobName::parse(job).unwrap(),
    )
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Owner hostname of every shard, read from the registry.
pub async fn owners(member: &Member) -> BTreeMap<u32, String> {
    member
        .scheduler
        .assignment()
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|(item, owner)| (item, owner.hostname().to_string()))
        .collect()
}

pub fn expected(pairs: &[(u32, &str)]) -> BTreeMap<u32, String> {
    pairs.iter().map(|(i, h)| (*i, h.to_string())).collect()
}
