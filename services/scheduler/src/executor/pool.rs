//! Bounded pools for shard execution.
//!
//! A pool is a semaphore over tokio tasks: every shard is spawned
//! immediately and waits for a permit before running the job. Draining
//! acquires every permit, which only succeeds once in-flight shards are
//! done.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{SchedulerError, SchedulerResult};

/// Permits for the `IO` pool.
pub const IO_SOFT_CAP: usize = 256;

/// Pool flavour selected by `jobExecutorServiceHandlerType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorServiceKind {
    /// One permit per available core.
    Cpu,
    /// Effectively unbounded, capped at [`IO_SOFT_CAP`].
    Io,
    /// Shards run one after another.
    SingleThread,
    /// Fixed number of permits.
    Fixed(usize),
}

impl ExecutorServiceKind {
    /// Parse the record value; absent means `CPU`.
    pub fn resolve(name: Option<&str>) -> SchedulerResult<Self> {
        let name = match name.map(str::trim) {
            Some(n) if !n.is_empty() => n,
            _ => return Ok(Self::Cpu),
        };

        match name {
            "CPU" => Ok(Self::Cpu),
            "IO" => Ok(Self::Io),
            "SINGLE_THREAD" => Ok(Self::SingleThread),
            other => match other.parse::<usize>() {
                Ok(size) if size > 0 => Ok(Self::Fixed(size)),
                _ => Err(SchedulerError::ConfigurationInvalid(format!(
                    "unknown executor service handler '{other}' (known: CPU, IO, SINGLE_THREAD, <positive integer>)"
                ))),
            },
        }
    }

    /// Number of shards allowed to run at once.
    pub fn size(&self) -> usize {
        match self {
            Self::Cpu => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            Self::Io => IO_SOFT_CAP,
            Self::SingleThread => 1,
            Self::Fixed(size) => *size,
        }
    }
}

/// A semaphore-bounded set of shard tasks.
pub struct ExecutorPool {
    kind: ExecutorServiceKind,
    size: usize,
    permits: Arc<Semaphore>,
}

impl ExecutorPool {
    pub fn new(kind: ExecutorServiceKind) -> Self {
        let size = kind.size();
        debug!(kind = ?kind, size, "Created executor pool");
        Self {
            kind,
            size,
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn kind(&self) -> ExecutorServiceKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Spawn `task`; it runs once a permit is free. Fails with
    /// `ShuttingDown` once the pool was drained. A task still queued when
    /// the pool closes never runs and resolves to `None`.
    pub fn spawn<F>(&self, task: F) -> SchedulerResult<JoinHandle<Option<F::Output>>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.permits.is_closed() {
            return Err(SchedulerError::ShuttingDown);
        }

        let permits = Arc::clone(&self.permits);
        Ok(tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.ok()?;
            Some(task.await)
        }))
    }

    /// Stop accepting work and wait up to `grace` for running shards.
    /// Returns true if everything finished in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        let all = u32::try_from(self.size).unwrap_or(u32::MAX);
        let drained = match tokio::time::timeout(grace, self.permits.acquire_many(all)).await {
            Ok(Ok(permits)) => {
                permits.forget();
                true
            }
            Ok(Err(_)) => true,
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "Shards still running after grace period");
                false
            }
        };
        self.permits.close();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[rstest]
    #[case(None, ExecutorServiceKind::Cpu)]
    #[case(Some(""), ExecutorServiceKind::Cpu)]
    #[case(Some("CPU"), ExecutorServiceKind::Cpu)]
    #[case(Some("IO"), ExecutorServiceKind::Io)]
    #[case(Some("SINGLE_THREAD"), ExecutorServiceKind::SingleThread)]
    #[case(Some("8"), ExecutorServiceKind::Fixed(8))]
    fn test_resolve(#[case] name: Option<&str>, #[case] expected: ExecutorServiceKind) {
        assert_eq!(ExecutorServiceKind::resolve(name).unwrap(), expected);
    }

    #[rstest]
    #[case("0")]
    #[case("GPU")]
    #[case("-2")]
    fn test_resolve_rejects(#[case] name: &str) {
        assert!(matches!(
            ExecutorServiceKind::resolve(Some(name)),
            Err(SchedulerError::ConfigurationInvalid(_))
        ));
    }

    #[test]
    fn test_sizes() {
        assert!(ExecutorServiceKind::Cpu.size() >= 1);
        assert_eq!(ExecutorServiceKind::SingleThread.size(), 1);
        assert_eq!(ExecutorServiceKind::Io.size(), IO_SOFT_CAP);
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let pool = ExecutorPool::new(ExecutorServiceKind::Fixed(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                pool.spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_some());
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_running_shards() {
        let pool = ExecutorPool::new(ExecutorServiceKind::Fixed(4));
        let handle = pool
            .spawn(tokio::time::sleep(Duration::from_millis(100)))
            .unwrap();
        tokio::task::yield_now().await;

        assert!(pool.drain(Duration::from_secs(1)).await);
        assert_eq!(handle.await.unwrap(), Some(()));
        assert!(matches!(
            pool.spawn(async {}),
            Err(SchedulerError::ShuttingDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_gives_up_after_grace() {
        let pool = ExecutorPool::new(ExecutorServiceKind::SingleThread);
        let _handle = pool
            .spawn(tokio::time::sleep(Duration::from_secs(60)))
            .unwrap();
        tokio::task::yield_now().await;

        assert!(!pool.drain(Duration::from_millis(100)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_shard_never_runs_after_failed_drain() {
        let pool = ExecutorPool::new(ExecutorServiceKind::SingleThread);
        let started = Arc::new(AtomicUsize::new(0));
        let _busy = pool
            .spawn(tokio::time::sleep(Duration::from_secs(60)))
            .unwrap();
        let queued = {
            let started = Arc::clone(&started);
            pool.spawn(async move {
                started.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        };
        tokio::task::yield_now().await;

        assert!(!pool.drain(Duration::from_millis(100)).await);
        assert_eq!(queued.await.unwrap(), None);
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }
}
