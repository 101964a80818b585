//! Coordination registry contract.
//!
//! The scheduler coordinates through a hierarchical, sessioned key-value
//! store (ZooKeeper-like). This crate defines the typed client contract the
//! scheduler depends on and ships an in-memory ensemble that honours the
//! same semantics for tests and single-host deployments.
//!
//! # Contract
//!
//! - Paths are absolute (`/a/b/c`), without a trailing slash
//! - Parents are created persistently on demand
//! - Ephemeral nodes disappear when their session ends
//! - `create` is an atomic create-if-absent (`Exists` on conflict)
//! - Every operation except sequential create is idempotent
//! - A client holds at most one registration per `(path, kind)`; watches
//!   stay armed after firing
//!
//! # Modules
//!
//! - `memory`: in-memory ensemble with session expiry controls
//! - `retry`: exponential backoff for transient failures

mod error;
mod memory;
mod retry;
mod types;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

pub use error::{RegistryError, RegistryResult};
pub use memory::{MemoryRegistry, MemorySession};
pub use retry::{retry_with_backoff, BackoffPolicy};
pub use types::{
    CreateMode, SessionId, SessionState, WatchEvent, WatchEventKind, WatchKind, WatchStream,
};

/// Typed facade over the coordination service.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Current session id (changes after `reconnect`).
    fn session_id(&self) -> SessionId;

    /// Session state updates.
    fn session_state(&self) -> watch::Receiver<SessionState>;

    /// Create a node. Returns the created path (differs for sequential nodes).
    async fn create(&self, path: &str, data: &str, mode: CreateMode) -> RegistryResult<String>;

    /// Create or replace a persistent node's data.
    async fn set(&self, path: &str, data: &str) -> RegistryResult<()>;

    /// Read a node's data.
    async fn get(&self, path: &str) -> RegistryResult<Option<String>>;

    /// Check whether a node exists.
    async fn exists(&self, path: &str) -> RegistryResult<bool>;

    /// Names of direct children, sorted. Empty when the node is absent.
    async fn children(&self, path: &str) -> RegistryResult<Vec<String>>;

    /// Delete a node and its subtree. Absent nodes are not an error.
    async fn delete(&self, path: &str) -> RegistryResult<()>;

    /// Watch a node's data or its children.
    async fn watch(&self, path: &str, kind: WatchKind) -> RegistryResult<WatchStream>;

    /// Wall clock advertised by the registry.
    async fn server_time(&self) -> RegistryResult<DateTime<Utc>>;

    /// Establish a new session after expiry. No-op while connected.
    async fn reconnect(&self) -> RegistryResult<()>;

    /// End the session, removing its ephemerals.
    async fn close(&self);
}

/// Validate an absolute registry path.
pub fn validate_path(path: &str) -> RegistryResult<()> {
    let valid = path.starts_with('/')
        && (path.len() == 1 || !path.ends_with('/'))
        && !path.contains("//");
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidPath(path.to_string()))
    }
}

/// Parent of an absolute path; `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}
