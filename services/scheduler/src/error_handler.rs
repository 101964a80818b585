//! What happens when a shard fails.
//!
//! The handler is chosen by `jobErrorHandlerType`. Built-ins:
//!
//! - `LOG` (default): log at error level
//! - `IGNORE`: log at debug level
//! - `THROW`: propagate as `JobExecutionFailed`, logged by the executor as
//!   an uncaught shard failure
//!
//! Hosts register further handlers (notifiers and the like) by name. No
//! handler outcome affects the next trigger.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::error::{SchedulerError, SchedulerResult};
use crate::plugin::NamedRegistry;

pub const LOG: &str = "LOG";
pub const IGNORE: &str = "IGNORE";
pub const THROW: &str = "THROW";

/// Reacts to one shard failure.
#[async_trait]
pub trait JobErrorHandler: Send + Sync {
    async fn handle(&self, job_name: &str, item: u32, error: anyhow::Error) -> SchedulerResult<()>;
}

pub struct LogErrorHandler;

#[async_trait]
impl JobErrorHandler for LogErrorHandler {
    async fn handle(&self, job_name: &str, item: u32, error: anyhow::Error) -> SchedulerResult<()> {
        error!(job_name, shard = item, error = %format!("{error:#}"), "Job shard failed");
        Ok(())
    }
}

pub struct IgnoreErrorHandler;

#[async_trait]
impl JobErrorHandler for IgnoreErrorHandler {
    async fn handle(&self, job_name: &str, item: u32, error: anyhow::Error) -> SchedulerResult<()> {
        debug!(job_name, shard = item, error = %format!("{error:#}"), "Job shard failed (ignored)");
        Ok(())
    }
}

pub struct ThrowErrorHandler;

#[async_trait]
impl JobErrorHandler for ThrowErrorHandler {
    async fn handle(&self, job_name: &str, item: u32, error: anyhow::Error) -> SchedulerResult<()> {
        Err(SchedulerError::JobExecutionFailed {
            job_name: job_name.to_string(),
            item,
            source: error,
        })
    }
}

/// Named error handlers, `LOG` by default.
#[derive(Clone)]
pub struct ErrorHandlerRegistry {
    handlers: NamedRegistry<dyn JobErrorHandler>,
}

impl ErrorHandlerRegistry {
    pub fn new() -> Self {
        let mut handlers: NamedRegistry<dyn JobErrorHandler> =
            NamedRegistry::new("error handler", LOG);
        handlers.register(LOG, Arc::new(LogErrorHandler));
        handlers.register(IGNORE, Arc::new(IgnoreErrorHandler));
        handlers.register(THROW, Arc::new(ThrowErrorHandler));
        Self { handlers }
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn JobErrorHandler>) {
        self.handlers.register(name, handler);
    }

    pub fn resolve(&self, name: Option<&str>) -> SchedulerResult<Arc<dyn JobErrorHandler>> {
        self.handlers.resolve(name)
    }
}

impl Default for ErrorHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
