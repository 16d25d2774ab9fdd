//! Bucket ownership types

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ServerLocation;

/// Index of a bucket inside one partitioned region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketId(u32);

impl BucketId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bucket-{}", self.0)
    }
}

/// Owners of a single bucket as last reported by the cluster.
///
/// Instances are never mutated in place; a refresh builds new ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketMetadata {
    pub bucket_id: BucketId,
    pub primary: Option<ServerLocation>,
    pub replicas: Vec<ServerLocation>,
}

impl BucketMetadata {
    pub fn new(bucket_id: BucketId, primary: Option<ServerLocation>, replicas: Vec<ServerLocation>) -> Self {
        Self {
            bucket_id,
            primary,
            replicas,
        }
    }

    /// Primary first, then replicas
    pub fn servers(&self) -> impl Iterator<Item = &ServerLocation> {
        self.primary.iter().chain(self.replicas.iter())
    }

    pub fn is_hosted_by(&self, location: &ServerLocation) -> bool {
        self.servers().any(|s| s == location)
    }
}

/// A named fixed partition and the contiguous bucket range it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedPartition {
    pub name: String,
    pub starting_bucket: u32,
    pub num_buckets: u32,
}

impl FixedPartition {
    pub fn new(name: impl Into<String>, starting_bucket: u32, num_buckets: u32) -> Self {
        Self {
            name: name.into(),
            starting_bucket,
            num_buckets,
        }
    }

    /// Bucket inside this partition for a routing hash
    pub fn bucket_for_hash(&self, hash: i32) -> Option<BucketId> {
        crate::key::bucket_for_hash(hash, self.num_buckets)
            .map(|b| BucketId::new(self.starting_bucket + b.get()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn servers_lists_primary_before_replicas() {
        let a = ServerLocation::new("a", 1);
        let b = ServerLocation::new("b", 1);
        let meta = BucketMetadata::new(BucketId::new(3), Some(a.clone()), vec![b.clone()]);
        let servers: Vec<_> = meta.servers().cloned().collect();
        assert_eq!(servers, vec![a, b.clone()]);
        assert!(meta.is_hosted_by(&b));
    }

    #[test]
    fn fixed_partition_offsets_by_starting_bucket() {
        let partition = FixedPartition::new("Q1", 10, 4);
        assert_eq!(partition.bucket_for_hash(6), Some(BucketId::new(12)));
        assert_eq!(partition.bucket_for_hash(-6), Some(BucketId::new(12)));
        assert_eq!(FixedPartition::new("empty", 0, 0).bucket_for_hash(1), None);
    }
}
