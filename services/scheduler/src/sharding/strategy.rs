//! Shard allocation strategies.
//!
//! A strategy maps a sorted list of instances and a shard count to an
//! assignment. Results are validated by the sharding service, so a custom
//! strategy that drops or duplicates shards fails the sharding round
//! instead of corrupting the assignment.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use elastic_id::InstanceId;

use crate::error::{SchedulerError, SchedulerResult};
use crate::plugin::NamedRegistry;

pub const AVG_ALLOCATION: &str = "AVG_ALLOCATION";
pub const ODEVITY: &str = "ODEVITY";
pub const ROUND_ROBIN: &str = "ROUND_ROBIN";

/// Instance → owned shard indexes.
pub type Allocation = BTreeMap<InstanceId, Vec<u32>>;

/// Allocates shards to instances.
pub trait ShardingStrategy: Send + Sync {
    /// `instances` is sorted by id and non-empty.
    fn sharding(&self, instances: &[InstanceId], job_name: &str, total: u32)
        -> anyhow::Result<Allocation>;
}

/// Built-in strategies, with `AVG_ALLOCATION` as the default.
pub fn builtin_strategies() -> NamedRegistry<dyn ShardingStrategy> {
    let mut registry: NamedRegistry<dyn ShardingStrategy> =
        NamedRegistry::new("sharding strategy", AVG_ALLOCATION);
    registry.register(AVG_ALLOCATION, Arc::new(AverageAllocation));
    registry.register(ODEVITY, Arc::new(Odevity));
    registry.register(ROUND_ROBIN, Arc::new(RoundRobin));
    registry
}

/// Contiguous blocks in instance order; the first `N mod M` instances get
/// one extra shard.
pub struct AverageAllocation;

impl ShardingStrategy for AverageAllocation {
    fn sharding(&self, instances: &[InstanceId], _job_name: &str, total: u32) -> anyhow::Result<Allocation> {
        Ok(average(instances.iter(), total))
    }
}

/// Average allocation whose instance order depends on the parity of
/// `N mod M`: odd keeps ascending order (the smaller id gets the larger
/// block), even reverses it.
pub struct Odevity;

impl ShardingStrategy for Odevity {
    fn sharding(&self, instances: &[InstanceId], _job_name: &str, total: u32) -> anyhow::Result<Allocation> {
        if instances.is_empty() {
            return Ok(Allocation::new());
        }
        let remainder = total % instances.len() as u32;
        if remainder % 2 == 1 {
            Ok(average(instances.iter(), total))
        } else {
            Ok(average(instances.iter().rev(), total))
        }
    }
}

/// Shard `i` goes to instance `i mod M`.
pub struct RoundRobin;

impl ShardingStrategy for RoundRobin {
    fn sharding(&self, instances: &[InstanceId], _job_name: &str, total: u32) -> anyhow::Result<Allocation> {
        let mut allocation: Allocation = instances.iter().map(|i| (i.clone(), Vec::new())).collect();
        if instances.is_empty() {
            return Ok(allocation);
        }
        for item in 0..total {
            let owner = &instances[item as usize % instances.len()];
            allocation.entry(owner.clone()).or_default().push(item);
        }
        Ok(allocation)
    }
}

fn average<'a>(instances: impl ExactSizeIterator<Item = &'a InstanceId>, total: u32) -> Allocation {
    let count = instances.len() as u32;
    let mut allocation = Allocation::new();
    if count == 0 {
        return allocation;
    }

    let base = total / count;
    let extra = total % count;
    let mut next = 0;
    for (index, instance) in instances.enumerate() {
        let size = base + u32::from((index as u32) < extra);
        allocation.insert(instance.clone(), (next..next + size).collect());
        next += size;
    }
    allocation
}

/// Check that `allocation` covers every shard exactly once using only
/// `instances`, and invert it.
pub fn validate_allocation(
    allocation: &Allocation,
    instances: &[InstanceId],
    total: u32,
) -> SchedulerResult<BTreeMap<u32, InstanceId>> {
    let allowed: BTreeSet<&InstanceId> = instances.iter().collect();
    let mut owners = BTreeMap::new();

    for (instance, items) in allocation {
        if !allowed.contains(instance) {
            return Err(SchedulerError::ShardingFailed(format!(
                "shards assigned to unknown instance {instance}"
            )));
        }
        for &item in items {
            if item >= total {
                return Err(SchedulerError::ShardingFailed(format!(
                    "shard {item} is out of range for total {total}"
                )));
            }
            if let Some(previous) = owners.insert(item, instance.clone()) {
                return Err(SchedulerError::ShardingFailed(format!(
                    "shard {item} assigned to both {previous} and {instance}"
                )));
            }
        }
    }

    if owners.len() as u32 != total {
        let missing: Vec<String> = (0..total)
            .filter(|i| !owners.contains_key(i))
            .map(|i| i.to_string())
            .collect();
        return Err(SchedulerError::ShardingFailed(format!(
            "shards left unassigned: {}",
            missing.join(",")
        )));
    }

    Ok(owners)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ids(hosts: &[&str]) -> Vec<InstanceId> {
        hosts
            .iter()
            .map(|h| InstanceId::new(h, 1, 1).unwrap())
            .collect()
    }

    fn items_of(allocation: &Allocation, host: &str) -> Vec<u32> {
        allocation
            .iter()
            .find(|(id, _)| id.hostname() == host)
            .map(|(_, items)| items.clone())
            .unwrap_or_default()
    }

    #[test]
    fn test_average_seven_over_three() {
        let allocation = AverageAllocation
            .sharding(&ids(&["a", "b", "c"]), "job", 7)
            .unwrap();
        assert_eq!(items_of(&allocation, "a"), vec![0, 1, 2]);
        assert_eq!(items_of(&allocation, "b"), vec![3, 4]);
        assert_eq!(items_of(&allocation, "c"), vec![5, 6]);
    }

    #[test]
    fn test_average_more_instances_than_shards() {
        let allocation = AverageAllocation
            .sharding(&ids(&["a", "b", "c"]), "job", 2)
            .unwrap();
        assert_eq!(items_of(&allocation, "a"), vec![0]);
        assert_eq!(items_of(&allocation, "b"), vec![1]);
        assert!(items_of(&allocation, "c").is_empty());
    }

    #[test]
    fn test_odevity_odd_remainder_prefers_smaller_id() {
        // 7 mod 3 = 1
        let allocation = Odevity.sharding(&ids(&["a", "b", "c"]), "job", 7).unwrap();
        assert_eq!(items_of(&allocation, "a"), vec![0, 1, 2]);
        assert_eq!(items_of(&allocation, "c"), vec![5, 6]);
    }

    #[test]
    fn test_odevity_even_remainder_prefers_larger_id() {
        // 8 mod 3 = 2
        let allocation = Odevity.sharding(&ids(&["a", "b", "c"]), "job", 8).unwrap();
        assert_eq!(items_of(&allocation, "c"), vec![0, 1, 2]);
        assert_eq!(items_of(&allocation, "b"), vec![3, 4, 5]);
        assert_eq!(items_of(&allocation, "a"), vec![6, 7]);
    }

    #[test]
    fn test_round_robin() {
        let allocation = RoundRobin.sharding(&ids(&["a", "b", "c"]), "job", 7).unwrap();
        assert_eq!(items_of(&allocation, "a"), vec![0, 3, 6]);
        assert_eq!(items_of(&allocation, "b"), vec![1, 4]);
        assert_eq!(items_of(&allocation, "c"), vec![2, 5]);
    }

    #[test]
    fn test_builtins_resolve() {
        let strategies = builtin_strategies();
        assert_eq!(strategies.names(), vec![AVG_ALLOCATION, ODEVITY, ROUND_ROBIN]);
        assert!(strategies.resolve(None).is_ok());
        assert!(strategies.resolve(Some("FANCY")).is_err());
    }

    #[test]
    fn test_validation_rejects_duplicates_and_gaps() {
        let instances = ids(&["a", "b"]);
        let mut allocation = Allocation::new();
        allocation.insert(instances[0].clone(), vec![0, 1]);
        allocation.insert(instances[1].clone(), vec![1]);
        assert!(matches!(
            validate_allocation(&allocation, &instances, 3),
            Err(SchedulerError::ShardingFailed(_))
        ));

        allocation.insert(instances[1].clone(), vec![]);
        let err = validate_allocation(&allocation, &instances, 3).unwrap_err();
        assert!(err.to_string().contains("unassigned: 2"));
    }

    #[test]
    fn test_validation_rejects_unknown_instance() {
        let instances = ids(&["a"]);
        let mut allocation = Allocation::new();
        allocation.insert(ids(&["z"])[0].clone(), vec![0]);
        assert!(validate_allocation(&allocation, &instances, 1).is_err());
    }

    proptest! {
        #[test]
        fn every_strategy_covers_each_shard_once(
            hosts in proptest::collection::btree_set("[a-z]{1,6}", 1..8),
            total in 1u32..64,
        ) {
            let instances: Vec<InstanceId> = hosts
                .iter()
                .map(|h| InstanceId::new(h, 7, 7).unwrap())
                .collect();
            let strategies = builtin_strategies();
            for name in strategies.names() {
                let strategy = strategies.resolve(Some(name)).unwrap();
                let allocation = strategy.sharding(&instances, "job", total).unwrap();
                let owners = validate_allocation(&allocation, &instances, total).unwrap();
                prop_assert_eq!(owners.len() as u32, total);
            }
        }

        #[test]
        fn average_sizes_differ_by_at_most_one(
            count in 1usize..10,
            total in 1u32..100,
        ) {
            let instances: Vec<InstanceId> = (0..count)
                .map(|i| InstanceId::new(&format!("h{i:02}"), 1, 1).unwrap())
                .collect();
            let allocation = AverageAllocation.sharding(&instances, "job", total).unwrap();
            let sizes: Vec<usize> = instances.iter().map(|i| allocation[i].len()).collect();
            let max = *sizes.iter().max().unwrap();
            let min = *sizes.iter().min().unwrap();
            prop_assert!(max - min <= 1);
            prop_assert!(sizes.windows(2).all(|w| w[0] >= w[1]));
        }
    }
}
