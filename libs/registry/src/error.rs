//! Error types for registry operations.

use thiserror::Error;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors returned by a [`crate::RegistryClient`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The node does not exist.
    #[error("node not found: {0}")]
    NotFound(String),

    /// The node already exists (create-if-absent lost).
    #[error("node already exists: {0}")]
    Exists(String),

    /// The session backing this client has expired.
    #[error("registry session lost")]
    SessionLost,

    /// The registry did not answer in time (connection suspended).
    #[error("registry operation timed out: {0}")]
    Timeout(String),

    /// The path is not a valid absolute registry path.
    #[error("invalid registry path: {0}")]
    InvalidPath(String),
}

impl RegistryError {
    /// Returns true if retrying the operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SessionLost | Self::Timeout(_))
    }

    /// Returns true if this error is a lost create-if-absent race.
    pub fn is_exists(&self) -> bool {
        matches!(self, Self::Exists(_))
    }
}
