//! Partition resolvers
//!
//! By default a key's own hash picks its bucket. A [`PartitionResolver`]
//! substitutes a routing key so related entries share a bucket; a
//! [`FixedPartitionResolver`] additionally names the fixed partition the
//! entry belongs to. Servers run the same resolvers, so both sides agree.

use cache_types::{BucketId, Cacheable, CacheableKey};
use std::sync::Arc;

use super::partition::PartitionMetadata;

pub trait PartitionResolver: Send + Sync {
    fn routing_key(&self, key: &CacheableKey, callback_arg: Option<&Cacheable>) -> CacheableKey;
}

pub trait FixedPartitionResolver: Send + Sync {
    /// Partition for `key`, one of `partitions`
    fn partition_name(&self, key: &CacheableKey, partitions: &[&str]) -> String;

    fn routing_key(&self, key: &CacheableKey) -> CacheableKey {
        key.clone()
    }
}

impl<F> PartitionResolver for F
where
    F: Fn(&CacheableKey) -> CacheableKey + Send + Sync,
{
    fn routing_key(&self, key: &CacheableKey, _callback_arg: Option<&Cacheable>) -> CacheableKey {
        self(key)
    }
}

/// How one region maps keys to buckets
#[derive(Clone, Default)]
pub enum RegionResolver {
    #[default]
    KeyHash,
    Routing(Arc<dyn PartitionResolver>),
    Fixed(Arc<dyn FixedPartitionResolver>),
}

/// Result of resolving a key against a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketResolution {
    Bucket(BucketId),
    /// The region is not partitioned
    Unpartitioned,
    /// The resolver named a partition the snapshot does not know
    UnknownPartition,
}

impl RegionResolver {
    pub fn resolve(
        &self,
        snapshot: &PartitionMetadata,
        key: &CacheableKey,
        callback_arg: Option<&Cacheable>,
    ) -> BucketResolution {
        if !snapshot.is_partitioned() {
            return BucketResolution::Unpartitioned;
        }
        let bucket = match self {
            RegionResolver::KeyHash => key.bucket(snapshot.total_buckets),
            RegionResolver::Routing(resolver) => resolver
                .routing_key(key, callback_arg)
                .bucket(snapshot.total_buckets),
            RegionResolver::Fixed(resolver) => {
                let names: Vec<&str> = snapshot
                    .fixed_partitions
                    .iter()
                    .map(|p| p.name.as_str())
                    .collect();
                let name = resolver.partition_name(key, &names);
                match snapshot.fixed_partition(&name) {
                    Some(partition) => {
                        partition.bucket_for_hash(resolver.routing_key(key).hash_code())
                    }
                    None => return BucketResolution::UnknownPartition,
                }
            }
        };
        match bucket {
            Some(bucket) => BucketResolution::Bucket(bucket),
            None => BucketResolution::UnknownPartition,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_codec::PartitionAttributes;
    use cache_types::FixedPartition;
    use std::collections::HashMap;

    fn snapshot(total: u32, fixed: Vec<FixedPartition>) -> PartitionMetadata {
        let attributes = PartitionAttributes {
            total_buckets: total,
            colocated_with: None,
            fixed_partitions: fixed,
        };
        PartitionMetadata::new("orders", &attributes, Arc::new(HashMap::new()), 1)
    }

    struct ByQuarter;

    impl FixedPartitionResolver for ByQuarter {
        fn partition_name(&self, key: &CacheableKey, _partitions: &[&str]) -> String {
            match key {
                CacheableKey::Int32(month) if *month <= 3 => "q1".into(),
                CacheableKey::Int32(_) => "q2".into(),
                _ => "unknown".into(),
            }
        }
    }

    #[test]
    fn default_resolution_uses_the_key_hash() {
        let snap = snapshot(113, Vec::new());
        let key = CacheableKey::from("customer-7");
        assert_eq!(
            RegionResolver::KeyHash.resolve(&snap, &key, None),
            BucketResolution::Bucket(key.bucket(113).unwrap())
        );
        assert_eq!(
            RegionResolver::KeyHash.resolve(&snapshot(0, Vec::new()), &key, None),
            BucketResolution::Unpartitioned
        );
    }

    #[test]
    fn routing_resolver_colocates_keys() {
        let snap = snapshot(113, Vec::new());
        let by_prefix = |key: &CacheableKey| match key {
            CacheableKey::String(s) => CacheableKey::from(s.split('|').next().unwrap_or("")),
            other => other.clone(),
        };
        let resolver = RegionResolver::Routing(Arc::new(by_prefix));
        let a = resolver.resolve(&snap, &"cust-1|order-1".into(), None);
        let b = resolver.resolve(&snap, &"cust-1|order-2".into(), None);
        assert_eq!(a, b);
    }

    #[test]
    fn fixed_partitions_offset_into_their_range() {
        let snap = snapshot(
            20,
            vec![FixedPartition::new("q1", 0, 10), FixedPartition::new("q2", 10, 10)],
        );
        let resolver = RegionResolver::Fixed(Arc::new(ByQuarter));

        match resolver.resolve(&snap, &CacheableKey::Int32(2), None) {
            BucketResolution::Bucket(b) => assert!(b.get() < 10),
            other => panic!("unexpected {:?}", other),
        }
        match resolver.resolve(&snap, &CacheableKey::Int32(7), None) {
            BucketResolution::Bucket(b) => assert!((10..20).contains(&b.get())),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            resolver.resolve(&snap, &CacheableKey::from("x"), None),
            BucketResolution::UnknownPartition
        );
    }
}
