//! Typed identifiers for jobs, namespaces, and scheduler instances.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::{define_name, IdError};

// =============================================================================
// Names
// =============================================================================

define_name!(JobName, "job name");
define_name!(Namespace, "namespace");

// =============================================================================
// Instance Id
// =============================================================================

/// Identity of one scheduler process participating in a job.
///
/// Canonical form is `hostname@pid@nanoseed`. The seed is taken from the
/// wall clock at startup so that a restarted process with a recycled pid
/// still gets a fresh id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(String);

impl InstanceId {
    /// Separator between the id components.
    pub const SEPARATOR: char = '@';

    /// Builds an id from explicit components.
    pub fn new(hostname: &str, pid: u32, seed: u64) -> Result<Self, IdError> {
        validate_hostname(hostname)?;
        Ok(Self(format!("{hostname}@{pid}@{seed}")))
    }

    /// Builds an id for the current process on the given host.
    pub fn for_current_process(hostname: &str) -> Result<Self, IdError> {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self::new(hostname, std::process::id(), seed)
    }

    /// Parses an id from its canonical form.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty { kind: "instance id" });
        }

        let mut parts = s.rsplitn(3, Self::SEPARATOR);
        let (Some(seed), Some(pid), Some(hostname)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(IdError::MissingSeparator(s.to_string()));
        };

        validate_hostname(hostname)?;
        pid.parse::<u32>().map_err(|_| IdError::InvalidComponent {
            component: "pid",
            value: s.to_string(),
        })?;
        seed.parse::<u64>().map_err(|_| IdError::InvalidComponent {
            component: "seed",
            value: s.to_string(),
        })?;

        Ok(Self(s.to_string()))
    }

    /// Hostname component.
    #[must_use]
    pub fn hostname(&self) -> &str {
        self.components().0
    }

    /// Process id component.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.components().1.parse().unwrap_or_default()
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn components(&self) -> (&str, &str) {
        // Validated at construction: two separators are always present.
        let mut parts = self.0.rsplitn(3, Self::SEPARATOR);
        let _seed = parts.next();
        let pid = parts.next().unwrap_or_default();
        let hostname = parts.next().unwrap_or_default();
        (hostname, pid)
    }
}

fn validate_hostname(hostname: &str) -> Result<(), IdError> {
    if hostname.is_empty() {
        return Err(IdError::Empty { kind: "hostname" });
    }
    if let Some(ch) = hostname
        .chars()
        .find(|c| *c == '/' || *c == InstanceId::SEPARATOR || c.is_control())
    {
        return Err(IdError::InvalidCharacter {
            kind: "hostname",
            value: hostname.to_string(),
            ch,
        });
    }
    Ok(())
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for InstanceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for InstanceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for InstanceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for InstanceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_job_name_rejects_slash() {
        let result: Result<JobName, _> = "billing/sync".parse();
        assert!(matches!(
            result.unwrap_err(),
            IdError::InvalidCharacter { ch: '/', .. }
        ));
    }

    #[test]
    fn test_job_name_empty() {
        let result: Result<JobName, _> = "".parse();
        assert!(result.unwrap_err().is_empty());
    }

    #[test]
    fn test_namespace_json() {
        let ns: Namespace = serde_json::from_str("\"elastic-job\"").unwrap();
        assert_eq!(ns.as_str(), "elastic-job");
        assert!(serde_json::from_str::<Namespace>("\"a/b\"").is_err());
    }

    #[test]
    fn test_instance_id_components() {
        let id = InstanceId::new("worker-1", 4211, 99).unwrap();
        assert_eq!(id.as_str(), "worker-1@4211@99");
        assert_eq!(id.hostname(), "worker-1");
        assert_eq!(id.pid(), 4211);
    }

    #[test]
    fn test_instance_id_missing_separator() {
        assert!(matches!(
            InstanceId::parse("worker-1@4211"),
            Err(IdError::MissingSeparator(_))
        ));
    }

    #[test]
    fn test_instance_id_bad_pid() {
        assert!(matches!(
            InstanceId::parse("worker-1@abc@1"),
            Err(IdError::InvalidComponent {
                component: "pid",
                ..
            })
        ));
    }

    #[test]
    fn test_instance_id_rejects_separator_in_hostname() {
        assert!(InstanceId::new("a@b", 1, 1).is_err());
    }

    #[test]
    fn test_instance_id_for_current_process() {
        let id = InstanceId::for_current_process("localhost").unwrap();
        assert_eq!(id.hostname(), "localhost");
        assert_eq!(id.pid(), std::process::id());
    }

    proptest! {
        #[test]
        fn instance_id_order_follows_canonical_string(
            a in "[a-z][a-z0-9-]{0,8}",
            b in "[a-z][a-z0-9-]{0,8}",
            pid in 1u32..100_000,
            seed in any::<u64>(),
        ) {
            let left = InstanceId::new(&a, pid, seed).unwrap();
            let right = InstanceId::new(&b, pid, seed).unwrap();
            prop_assert_eq!(left.cmp(&right), left.as_str().cmp(right.as_str()));
            prop_assert_eq!(InstanceId::parse(left.as_str()).unwrap(), left);
        }
    }
}
