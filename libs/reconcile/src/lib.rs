//! Reconciliation primitives for sharded jobs.
//!
//! This library provides the pure half of the scheduler's self-healing
//! loop: given what the registry says about a job's sharding, decide
//! whether it still matches what it should be. Key concepts:
//!
//! - **Desired state**: every shard in `[0, total)` owned by one live instance.
//! - **Observed state**: the `sharding/<i>/instance` nodes in the registry.
//! - **Drift**: any difference between the two. Drift is repaired by
//!   flagging the job for re-sharding, never by patching single shards.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - Detection never mutates anything; callers act on the report

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// Convergence status for a job's sharding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Observed sharding matches desired sharding.
    Converged,

    /// Observed sharding drifted (re-sharding required).
    Diverged,

    /// Status is unknown (no live instances to judge against).
    Unknown,
}

impl ConvergenceStatus {
    /// Returns true if the job's sharding has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

/// A single sharding inconsistency.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Drift {
    /// Shard in range has no owner.
    Unassigned { item: u32 },

    /// Shard is owned by an instance that is no longer live.
    OwnerNotLive { item: u32, owner: String },

    /// A shard node exists beyond `total`.
    OutOfRange { item: u32 },
}

/// Result of comparing observed sharding against desired sharding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftReport {
    status: ConvergenceStatus,
    drifts: Vec<Drift>,
}

impl DriftReport {
    /// Overall status.
    pub fn status(&self) -> ConvergenceStatus {
        self.status
    }

    /// Individual inconsistencies, sorted.
    pub fn drifts(&self) -> &[Drift] {
        &self.drifts
    }

    /// Returns true if re-sharding should be requested.
    pub fn needs_resharding(&self) -> bool {
        !self.drifts.is_empty()
    }
}

/// Compare observed shard ownership with the desired state.
///
/// `observed` maps every shard node found in the registry to its owner
/// (`None` when the node exists without an owner). `live` is the set of
/// instances currently eligible to own shards.
pub fn detect_drift<S: AsRef<str>>(
    total: u32,
    observed: &BTreeMap<u32, Option<S>>,
    live: &[S],
) -> DriftReport {
    let live: BTreeSet<&str> = live.iter().map(AsRef::as_ref).collect();
    let mut drifts = Vec::new();

    for item in 0..total {
        match observed.get(&item) {
            None | Some(None) => drifts.push(Drift::Unassigned { item }),
            Some(Some(owner)) if !live.contains(owner.as_ref()) => {
                drifts.push(Drift::OwnerNotLive {
                    item,
                    owner: owner.as_ref().to_string(),
                })
            }
            Some(Some(_)) => {}
        }
    }

    drifts.extend(
        observed
            .range(total..)
            .map(|(item, _)| Drift::OutOfRange { item: *item }),
    );
    drifts.sort();

    let status = if live.is_empty() {
        ConvergenceStatus::Unknown
    } else if drifts.is_empty() {
        ConvergenceStatus::Converged
    } else {
        ConvergenceStatus::Diverged
    };

    DriftReport { status, drifts }
}

/// A content hash for deterministic comparison.
///
/// Used to detect when a job configuration has materially changed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute the hash of canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16]))) // First 16 bytes (128 bits)
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", serde_json::Value::String((*k).clone()), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

/// Tracks how long a job has stayed diverged.
///
/// Re-sharding normally repairs drift within one pass; drift that keeps
/// coming back inside the window is escalated by the caller.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Maximum retries per resource.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: resource_key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, resource_key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Check if retries are exhausted for a resource.
    pub fn is_exhausted(&self, resource_key: &str) -> bool {
        let Some((count, first)) = self.failures.get(resource_key) else {
            return false;
        };

        if Instant::now().duration_since(*first) > self.window {
            return false;
        }

        *count > self.max_retries
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }
}

/// Default retry limit before persistent drift is escalated.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(60 * 60);
