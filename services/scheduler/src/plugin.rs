//! Lookup of named strategies.
//!
//! Sharding strategies and error handlers are selected by name from the
//! job record. Built-ins are registered up front; hosts may add their own
//! before the scheduler starts. An empty or absent name selects the default.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{SchedulerError, SchedulerResult};

/// Name → implementation map for one plug-in kind.
pub struct NamedRegistry<T: ?Sized> {
    kind: &'static str,
    default: &'static str,
    entries: BTreeMap<String, Arc<T>>,
}

impl<T: ?Sized> NamedRegistry<T> {
    /// Create an empty registry whose default entry is `default`.
    pub fn new(kind: &'static str, default: &'static str) -> Self {
        Self {
            kind,
            default,
            entries: BTreeMap::new(),
        }
    }

    /// Register (or replace) an implementation.
    pub fn register(&mut self, name: impl Into<String>, value: Arc<T>) {
        self.entries.insert(name.into(), value);
    }

    /// Resolve a name from the job record.
    pub fn resolve(&self, name: Option<&str>) -> SchedulerResult<Arc<T>> {
        let name = match name.map(str::trim) {
            Some(n) if !n.is_empty() => n,
            _ => self.default,
        };

        self.entries.get(name).cloned().ok_or_else(|| {
            SchedulerError::ConfigurationInvalid(format!(
                "unknown {} '{name}' (known: {})",
                self.kind,
                self.names().join(", ")
            ))
        })
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

impl<T: ?Sized> Clone for NamedRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            default: self.default,
            entries: self.entries.clone(),
        }
    }
}
