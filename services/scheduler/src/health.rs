//! Scheduler health as seen by the host.

use tokio::sync::watch;
use tracing::{info, warn};

/// Lifecycle state of a running scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Bootstrapping: registering, electing, loading configuration.
    Starting,
    /// Connected and firing.
    Running,
    /// Registry session suspended or lost; triggers are skipped.
    Degraded,
    /// Shut down.
    Stopped,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Degraded => "degraded",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publishes health transitions.
#[derive(Debug)]
pub struct HealthReporter {
    tx: watch::Sender<HealthState>,
}

impl HealthReporter {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(HealthState::Starting);
        Self { tx }
    }

    /// Move to `state`, logging the transition. `Stopped` is terminal.
    pub fn set(&self, state: HealthState) {
        self.tx.send_if_modified(|current| {
            if *current == state || *current == HealthState::Stopped {
                return false;
            }
            match state {
                HealthState::Degraded => warn!(from = %current, to = %state, "Scheduler health changed"),
                _ => info!(from = %current, to = %state, "Scheduler health changed"),
            }
            *current = state;
            true
        });
    }

    pub fn current(&self) -> HealthState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthState> {
        self.tx.subscribe()
    }
}

impl Default for HealthReporter {
    fn default() -> Self {
        Self::new()
    }
}
