//! Value types shared by registry clients.

use tokio::sync::broadcast;
use tracing::warn;

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session.
    Persistent,
    /// Removed when the creating session ends.
    Ephemeral,
    /// Ephemeral with a monotonically increasing suffix appended to the name.
    EphemeralSequential,
}

impl CreateMode {
    /// Returns true if the node is owned by its session.
    pub fn is_ephemeral(&self) -> bool {
        !matches!(self, Self::Persistent)
    }
}

/// Session lifecycle as observed by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Operations reach the registry.
    Connected,
    /// Connection lost; the session (and its ephemerals) may still be alive.
    Suspended,
    /// The session is gone; its ephemerals were deleted.
    Expired,
}

/// Opaque session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// What a watch observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    /// Creation, data change, and deletion of the node itself.
    Data,
    /// Changes to the set of direct children.
    Children,
}

/// Kind of change delivered to a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Changed,
    Deleted,
    ChildrenChanged,
}

/// A single watch notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Path the watch was registered on.
    pub path: String,

    /// What happened.
    pub kind: WatchEventKind,

    /// Node data after the change; for `Deleted`, the last data it held.
    pub data: Option<String>,
}

/// Stream of events for one `(path, kind)` registration.
///
/// Registrations stay armed: the stream keeps yielding until the client is
/// dropped.
pub struct WatchStream {
    path: String,
    rx: broadcast::Receiver<WatchEvent>,
}

impl WatchStream {
    pub(crate) fn new(path: String, rx: broadcast::Receiver<WatchEvent>) -> Self {
        Self { path, rx }
    }

    /// Path this stream watches.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the next event. Returns `None` once the client is gone.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(path = %self.path, skipped, "Watch stream lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
