//! Grouping keys and buckets by server
//!
//! Bulk operations send one batch per server; function execution sends one
//! request per server with the buckets it should run over. A bucket is never
//! split between servers.

use cache_types::{BucketId, Cacheable, CacheableKey, ServerLocation};
use rand::seq::IteratorRandom;
use std::collections::{BTreeSet, HashMap, HashSet};

use super::partition::PartitionMetadata;
use super::resolver::{BucketResolution, RegionResolver};

/// Keys split into per-server batches
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyGrouping {
    pub by_server: HashMap<ServerLocation, Vec<CacheableKey>>,
    /// Keys without a known primary; sent through any pool connection
    pub unrouted: Vec<CacheableKey>,
}

impl KeyGrouping {
    pub fn all_unrouted(keys: Vec<CacheableKey>) -> Self {
        Self {
            by_server: HashMap::new(),
            unrouted: keys,
        }
    }

    pub fn batch_count(&self) -> usize {
        self.by_server.len() + usize::from(!self.unrouted.is_empty())
    }
}

/// Group keys by the primary of their bucket
pub fn group_keys(
    snapshot: &PartitionMetadata,
    resolver: &RegionResolver,
    keys: Vec<CacheableKey>,
    callback_arg: Option<&Cacheable>,
) -> KeyGrouping {
    let mut grouping = KeyGrouping::default();
    for key in keys {
        let primary = match resolver.resolve(snapshot, &key, callback_arg) {
            BucketResolution::Bucket(bucket) => snapshot.primary(bucket).cloned(),
            _ => None,
        };
        match primary {
            Some(server) => grouping.by_server.entry(server).or_default().push(key),
            None => grouping.unrouted.push(key),
        }
    }
    grouping
}

/// Assign each bucket to exactly one server outside `excluded`. With
/// `primary_only` every bucket goes to its primary; otherwise a small
/// covering set of servers is chosen. `None` when some bucket has no
/// eligible server.
pub fn group_buckets(
    snapshot: &PartitionMetadata,
    buckets: &BTreeSet<BucketId>,
    primary_only: bool,
    excluded: &HashSet<ServerLocation>,
) -> Option<HashMap<ServerLocation, BTreeSet<BucketId>>> {
    if primary_only {
        let mut grouped: HashMap<ServerLocation, BTreeSet<BucketId>> = HashMap::new();
        for bucket in buckets {
            let primary = snapshot.primary(*bucket).filter(|p| !excluded.contains(*p))?;
            grouped.entry(primary.clone()).or_default().insert(*bucket);
        }
        return Some(grouped);
    }
    minimal_cover(snapshot, buckets, excluded)
}

/// Greedy set cover: a random first server, then repeatedly the server
/// hosting the most still-uncovered buckets
fn minimal_cover(
    snapshot: &PartitionMetadata,
    buckets: &BTreeSet<BucketId>,
    excluded: &HashSet<ServerLocation>,
) -> Option<HashMap<ServerLocation, BTreeSet<BucketId>>> {
    let mut hosted: HashMap<ServerLocation, BTreeSet<BucketId>> = HashMap::new();
    for bucket in buckets {
        let metadata = snapshot.bucket(*bucket)?;
        let mut any = false;
        for server in metadata.servers().filter(|s| !excluded.contains(*s)) {
            hosted.entry(server.clone()).or_default().insert(*bucket);
            any = true;
        }
        if !any {
            return None;
        }
    }

    let mut uncovered = buckets.clone();
    let mut grouped = HashMap::new();
    let mut next = hosted.keys().choose(&mut rand::thread_rng()).cloned();

    while !uncovered.is_empty() {
        let server = match next.take() {
            Some(server) => server,
            None => hosted
                .iter()
                .max_by_key(|(server, set)| (set.intersection(&uncovered).count(), std::cmp::Reverse((*server).clone())))
                .map(|(server, _)| server.clone())?,
        };
        let Some(set) = hosted.remove(&server) else {
            continue;
        };
        let assigned: BTreeSet<BucketId> = set.intersection(&uncovered).copied().collect();
        if assigned.is_empty() {
            continue;
        }
        for bucket in &assigned {
            uncovered.remove(bucket);
        }
        grouped.insert(server, assigned);
    }
    Some(grouped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_codec::PartitionAttributes;
    use cache_types::BucketMetadata;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn server(name: &str) -> ServerLocation {
        ServerLocation::new(name, 40404)
    }

    /// `total` buckets over `servers`, each bucket on two consecutive servers
    fn snapshot(total: u32, servers: &[&str]) -> PartitionMetadata {
        let buckets = (0..total)
            .map(|b| {
                let primary = server(servers[b as usize % servers.len()]);
                let replica = server(servers[(b as usize + 1) % servers.len()]);
                (BucketId::new(b), BucketMetadata::new(BucketId::new(b), Some(primary), vec![replica]))
            })
            .collect();
        let attributes = PartitionAttributes {
            total_buckets: total,
            colocated_with: None,
            fixed_partitions: Vec::new(),
        };
        PartitionMetadata::new("orders", &attributes, Arc::new(buckets), 1)
    }

    #[test]
    fn keys_go_to_their_primary_or_the_default_batch() {
        let snap = snapshot(4, &["a", "b"]);
        let keys: Vec<CacheableKey> = (0..8).map(CacheableKey::Int32).collect();
        let grouping = group_keys(&snap, &RegionResolver::KeyHash, keys.clone(), None);

        assert!(grouping.unrouted.is_empty());
        assert_eq!(grouping.by_server[&server("a")].len(), 4);
        assert_eq!(grouping.by_server[&server("b")].len(), 4);

        let empty = snapshot(0, &["a"]);
        let grouping = group_keys(&empty, &RegionResolver::KeyHash, keys, None);
        assert_eq!(grouping.unrouted.len(), 8);
        assert_eq!(grouping.batch_count(), 1);
    }

    #[test]
    fn write_optimised_grouping_uses_primaries() {
        let snap = snapshot(6, &["a", "b", "c"]);
        let grouped = group_buckets(&snap, &snap.all_buckets(), true, &HashSet::new()).unwrap();
        assert_eq!(grouped.len(), 3);
        for (server, buckets) in &grouped {
            for bucket in buckets {
                assert_eq!(snap.primary(*bucket), Some(server));
            }
        }
    }

    #[test]
    fn missing_owner_yields_no_grouping() {
        let mut snap = snapshot(2, &["a"]);
        let mut buckets = (*snap.buckets).clone();
        buckets.insert(BucketId::new(1), BucketMetadata::new(BucketId::new(1), None, Vec::new()));
        snap.buckets = Arc::new(buckets);
        assert!(group_buckets(&snap, &snap.all_buckets(), true, &HashSet::new()).is_none());
        assert!(group_buckets(&snap, &snap.all_buckets(), false, &HashSet::new()).is_none());
    }

    #[test]
    fn excluded_servers_are_never_chosen() {
        let snap = snapshot(6, &["a", "b", "c"]);
        let excluded = HashSet::from([server("a")]);
        let grouped = group_buckets(&snap, &snap.all_buckets(), false, &excluded).unwrap();
        assert!(!grouped.contains_key(&server("a")));
        assert_eq!(grouped.values().map(|b| b.len()).sum::<usize>(), 6);
        // buckets whose primary is excluded have no eligible server
        assert!(group_buckets(&snap, &snap.all_buckets(), true, &excluded).is_none());
    }

    proptest! {
        #[test]
        fn cover_assigns_every_bucket_exactly_once(total in 1u32..64, servers in 1usize..6) {
            let names: Vec<String> = (0..servers).map(|i| format!("s{}", i)).collect();
            let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
            let snap = snapshot(total, &refs);
            let wanted = snap.all_buckets();

            let grouped = group_buckets(&snap, &wanted, false, &HashSet::new()).unwrap();
            let mut seen = BTreeSet::new();
            for (server, buckets) in &grouped {
                for bucket in buckets {
                    prop_assert!(snap.bucket(*bucket).unwrap().is_hosted_by(server));
                    prop_assert!(seen.insert(*bucket), "bucket {} assigned twice", bucket);
                }
            }
            prop_assert_eq!(seen, wanted);
            prop_assert!(grouped.len() <= (total as usize).min(servers));
        }
    }
}
