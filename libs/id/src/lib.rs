//! # elastic-id
//!
//! Identifier types for the elastic job scheduler.
//!
//! ## Design Principles
//!
//! - Names are user-controlled labels that end up as registry path
//!   segments, so they are validated once at the boundary
//! - Instance ids are system-generated and unique per process lifetime
//! - All identifiers have a canonical string form with strict parsing
//! - Types are distinct so a job name can never be passed as an instance id
//!
//! ## Instance Id Format
//!
//! `{hostname}@{pid}@{nanoseed}`
//!
//! Examples:
//! - `worker-1@4211@1718037263117000123`
//! - `10.0.0.7@98@1718037263990000001`
//!
//! Instance ids compare lexicographically on their canonical string. The
//! sharding strategies rely on this ordering for deterministic allocation.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
