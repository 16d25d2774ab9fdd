//! Bucket map snapshot of one partitioned region

use cache_codec::{BucketLocations, PartitionAttributes};
use cache_types::{BucketId, BucketMetadata, FixedPartition, ServerLocation};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::time::Instant;

/// Immutable view of a region's bucket placement. A refresh builds a new
/// snapshot and swaps it in; readers keep whichever `Arc` they loaded.
#[derive(Debug, Clone)]
pub struct PartitionMetadata {
    pub region: String,
    pub total_buckets: u32,
    pub colocated_with: Option<String>,
    pub fixed_partitions: Vec<FixedPartition>,
    /// Shared by every region of a colocation group
    pub buckets: Arc<HashMap<BucketId, BucketMetadata>>,
    pub version: u64,
    pub refreshed_at: Instant,
}

impl PartitionMetadata {
    /// Build bucket metadata from a locations reply. With a server group,
    /// servers outside the group are dropped; a bucket whose primary is
    /// outside the group keeps only its in-group replicas.
    pub fn build_buckets(
        locations: Vec<BucketLocations>,
        server_group: Option<&str>,
    ) -> HashMap<BucketId, BucketMetadata> {
        locations
            .into_iter()
            .map(|bucket| {
                let mut primary = None;
                let mut replicas = Vec::new();
                for server in bucket.servers {
                    let in_group = server_group
                        .map_or(true, |group| server.server_groups.iter().any(|g| g == group));
                    if !in_group {
                        continue;
                    }
                    if server.is_primary && primary.is_none() {
                        primary = Some(server.location);
                    } else {
                        replicas.push(server.location);
                    }
                }
                (
                    bucket.bucket_id,
                    BucketMetadata::new(bucket.bucket_id, primary, replicas),
                )
            })
            .collect()
    }

    pub fn new(
        region: &str,
        attributes: &PartitionAttributes,
        buckets: Arc<HashMap<BucketId, BucketMetadata>>,
        version: u64,
    ) -> Self {
        Self {
            region: region.to_string(),
            total_buckets: attributes.total_buckets,
            colocated_with: attributes.colocated_with.clone(),
            fixed_partitions: attributes.fixed_partitions.clone(),
            buckets,
            version,
            refreshed_at: Instant::now(),
        }
    }

    pub fn is_partitioned(&self) -> bool {
        self.total_buckets > 0
    }

    pub fn bucket(&self, bucket: BucketId) -> Option<&BucketMetadata> {
        self.buckets.get(&bucket)
    }

    pub fn primary(&self, bucket: BucketId) -> Option<&ServerLocation> {
        self.bucket(bucket).and_then(|b| b.primary.as_ref())
    }

    pub fn fixed_partition(&self, name: &str) -> Option<&FixedPartition> {
        self.fixed_partitions.iter().find(|p| p.name == name)
    }

    /// Every bucket id of the region
    pub fn all_buckets(&self) -> BTreeSet<BucketId> {
        (0..self.total_buckets).map(BucketId::new).collect()
    }

    /// Every server hosting at least one bucket
    pub fn servers(&self) -> HashSet<ServerLocation> {
        self.buckets
            .values()
            .flat_map(|b| b.servers().cloned())
            .collect()
    }

    /// Buckets with a known primary
    pub fn known_primaries(&self) -> usize {
        self.buckets.values().filter(|b| b.primary.is_some()).count()
    }
}
