//! The user job contract.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

/// Why a shard is being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionSource {
    /// Regular cron (or on-demand) trigger.
    Ready,
    /// Taking over a shard from a crashed instance.
    Failover,
    /// Make-up pass for missed ticks.
    Misfire,
}

impl ExecutionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Failover => "FAILOVER",
            Self::Misfire => "MISFIRE",
        }
    }
}

impl std::fmt::Display for ExecutionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a job needs to process one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardingContext {
    pub job_name: String,
    /// Identifies the pass this shard belongs to.
    pub task_id: String,
    pub sharding_total_count: u32,
    pub job_parameter: String,
    pub sharding_item: u32,
    pub sharding_parameter: Option<String>,
    pub source: ExecutionSource,
}

/// A job that processes one shard at a time.
///
/// Shards of one pass run concurrently, so implementations must be
/// shareable. Errors are routed to the job's error handler and never stop
/// the scheduler.
#[async_trait]
pub trait ElasticJob: Send + Sync + 'static {
    async fn execute(&self, ctx: ShardingContext) -> anyhow::Result<()>;
}

/// Adapts an async closure into an [`ElasticJob`].
pub struct FnJob<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnJob<F, Fut>
where
    F: Fn(ShardingContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _fut: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> ElasticJob for FnJob<F, Fut>
where
    F: Fn(ShardingContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn execute(&self, ctx: ShardingContext) -> anyhow::Result<()> {
        (self.f)(ctx).await
    }
}
