//! # Client Metadata Service
//!
//! Tracks which server hosts which bucket of every partitioned region the
//! client touches, and keeps that map fresh.
//!
//! ## Snapshots
//!
//! Each region has a lazily created entry holding an `Arc<PartitionMetadata>`.
//! A refresh fetches bucket locations from any live server, builds a new
//! snapshot and swaps it in. Readers never block on a refresh; they keep the
//! snapshot they loaded. Regions of one colocation group share a single
//! bucket map and are swapped together.
//!
//! ## Refresh
//!
//! ```text
//! hop flag ──record_hop──▶ hops ≥ threshold ──┐
//! mark_stale ─────────────────────────────────┼─▶ queue (coalesced) ─▶ worker ─▶ refresh
//! refresh_interval timer ─────────────────────┘
//! ```
//!
//! At most one fetch per region is in flight. A caller that waited on the
//! region's refresh lock while another caller completed a refresh returns the
//! new snapshot without fetching again. Failed refreshes are logged and
//! otherwise ignored: routing falls back to pool-selected servers.

pub mod grouping;
pub mod partition;
pub mod resolver;

pub use grouping::KeyGrouping;
pub use partition::PartitionMetadata;
pub use resolver::{BucketResolution, FixedPartitionResolver, PartitionResolver, RegionResolver};

use cache_codec::{Operation, PartitionAttributes, ResponseBody};
use cache_config::MetadataSettings;
use cache_network::{Pool, PooledConnection, Scheduler, TaskControl, TaskGroup};
use cache_types::{BucketId, BucketMetadata, Cacheable, CacheableKey, ServerLocation};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};

/// Longest colocation chain followed when looking for a group's root
const MAX_COLOCATION_DEPTH: usize = 16;

#[derive(Default)]
struct RegionEntry {
    snapshot: RwLock<Option<Arc<PartitionMetadata>>>,
    /// Fetched once per region
    attributes: RwLock<Option<PartitionAttributes>>,
    refresh_lock: tokio::sync::Mutex<()>,
    /// Bumped on every snapshot swap
    generation: AtomicU64,
    hops: AtomicU32,
    refreshes: AtomicU64,
    failures: AtomicU64,
}

impl RegionEntry {
    fn snapshot(&self) -> Option<Arc<PartitionMetadata>> {
        self.snapshot.read().clone()
    }

    fn attributes(&self) -> Option<PartitionAttributes> {
        self.attributes.read().clone()
    }

    fn install(&self, snapshot: Arc<PartitionMetadata>) {
        *self.snapshot.write() = Some(snapshot);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        self.hops.store(0, Ordering::Release);
    }
}

/// Bucket map cache for the regions served by one pool
pub struct ClientMetadataService {
    pool: Arc<Pool>,
    settings: MetadataSettings,
    server_group: Option<String>,
    regions: DashMap<String, Arc<RegionEntry>>,
    resolvers: DashMap<String, RegionResolver>,
    queued: Mutex<HashSet<String>>,
    refresh_tx: mpsc::UnboundedSender<String>,
    versions: AtomicU64,
    tasks: TaskGroup,
}

impl ClientMetadataService {
    /// Create the service and start its refresh worker
    pub fn new(pool: Arc<Pool>, settings: MetadataSettings, scheduler: &Scheduler) -> Arc<Self> {
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let service = Arc::new(Self {
            server_group: pool.settings().server_group.clone(),
            tasks: scheduler.task_group(format!("metadata:{}", pool.name())),
            pool,
            settings,
            regions: DashMap::new(),
            resolvers: DashMap::new(),
            queued: Mutex::new(HashSet::new()),
            refresh_tx,
            versions: AtomicU64::new(0),
        });
        service.start_worker(refresh_rx);
        service.start_timer();
        service
    }

    fn start_worker(self: &Arc<Self>, mut refresh_rx: mpsc::UnboundedReceiver<String>) {
        let weak = Arc::downgrade(self);
        self.tasks.spawn("metadata-refresh-worker", move |mut stop| async move {
            loop {
                let region = tokio::select! {
                    region = refresh_rx.recv() => match region {
                        Some(region) => region,
                        None => break,
                    },
                    _ = stop.stopped() => break,
                };
                let Some(service) = weak.upgrade() else {
                    break;
                };
                service.queued.lock().remove(&region);
                if let Err(e) = service.refresh(&region).await {
                    warn!(region = %region, error = %e, "Background metadata refresh failed");
                }
            }
        });
    }

    fn start_timer(self: &Arc<Self>) {
        let Some(period) = self.settings.refresh_interval() else {
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        self.tasks.spawn_periodic("metadata-refresh-timer", period, move || {
            let weak = weak.clone();
            async move {
                let Some(service) = weak.upgrade() else {
                    return TaskControl::Stop;
                };
                for region in service.known_regions() {
                    service.schedule_refresh(&region);
                }
                TaskControl::Continue
            }
        });
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    fn entry(&self, region: &str) -> Arc<RegionEntry> {
        if let Some(entry) = self.regions.get(region) {
            return entry.clone();
        }
        self.regions
            .entry(region.to_string())
            .or_insert_with(|| Arc::new(RegionEntry::default()))
            .clone()
    }

    /// Regions with an entry, sorted
    pub fn known_regions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.regions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn set_resolver(&self, region: &str, resolver: RegionResolver) {
        self.resolvers.insert(region.to_string(), resolver);
    }

    pub fn resolver(&self, region: &str) -> RegionResolver {
        self.resolvers
            .get(region)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Current snapshot; schedules a refresh when the region was never loaded
    pub fn snapshot(&self, region: &str) -> Option<Arc<PartitionMetadata>> {
        let snapshot = self.entry(region).snapshot();
        if snapshot.is_none() {
            self.schedule_refresh(region);
        }
        snapshot
    }

    /// Snapshot if one is installed; never schedules a fetch
    pub fn cached(&self, region: &str) -> Option<Arc<PartitionMetadata>> {
        self.regions.get(region).and_then(|entry| entry.snapshot())
    }

    /// Primary and replicas of one bucket
    pub fn get_bucket_servers(&self, region: &str, bucket: BucketId) -> Option<BucketMetadata> {
        self.snapshot(region)?.bucket(bucket).cloned()
    }

    /// Bucket of `key` under the region's resolver
    pub fn bucket_for_key(
        &self,
        region: &str,
        key: &CacheableKey,
        callback_arg: Option<&Cacheable>,
    ) -> Option<BucketId> {
        let snapshot = self.snapshot(region)?;
        match self.resolver(region).resolve(&snapshot, key, callback_arg) {
            BucketResolution::Bucket(bucket) => Some(bucket),
            BucketResolution::Unpartitioned => None,
            BucketResolution::UnknownPartition => {
                debug!(region, key = %key, "Key resolved to an unknown partition");
                self.schedule_refresh(region);
                None
            }
        }
    }

    /// Known primary for `key`, if any
    pub fn primary_for_key(
        &self,
        region: &str,
        key: &CacheableKey,
        callback_arg: Option<&Cacheable>,
    ) -> Option<(BucketId, ServerLocation)> {
        let bucket = self.bucket_for_key(region, key, callback_arg)?;
        let primary = self.snapshot(region)?.primary(bucket).cloned();
        match primary {
            Some(primary) => Some((bucket, primary)),
            None => {
                self.schedule_refresh(region);
                None
            }
        }
    }

    /// Split keys into per-primary batches
    pub fn group_keys(
        &self,
        region: &str,
        keys: Vec<CacheableKey>,
        callback_arg: Option<&Cacheable>,
    ) -> KeyGrouping {
        let Some(snapshot) = self.snapshot(region) else {
            return KeyGrouping::all_unrouted(keys);
        };
        let grouping =
            grouping::group_keys(&snapshot, &self.resolver(region), keys, callback_arg);
        if !grouping.unrouted.is_empty() && snapshot.is_partitioned() {
            self.schedule_refresh(region);
        }
        grouping
    }

    /// Buckets of the given keys, for function filters
    pub fn buckets_for_keys(
        &self,
        region: &str,
        keys: &[CacheableKey],
        callback_arg: Option<&Cacheable>,
    ) -> Option<BTreeSet<BucketId>> {
        keys.iter()
            .map(|key| self.bucket_for_key(region, key, callback_arg))
            .collect()
    }

    /// One server per bucket, never one of `excluded`; `None` when some
    /// bucket has no eligible owner
    pub fn group_buckets(
        &self,
        region: &str,
        buckets: &BTreeSet<BucketId>,
        primary_only: bool,
        excluded: &HashSet<ServerLocation>,
    ) -> Option<HashMap<ServerLocation, BTreeSet<BucketId>>> {
        let snapshot = self.snapshot(region)?;
        let grouped = grouping::group_buckets(&snapshot, buckets, primary_only, excluded);
        if grouped.is_none() {
            self.schedule_refresh(region);
        }
        grouped
    }

    /// Every bucket of the region assigned to a server
    pub fn group_all_buckets(
        &self,
        region: &str,
        primary_only: bool,
    ) -> Option<HashMap<ServerLocation, BTreeSet<BucketId>>> {
        let snapshot = self.snapshot(region)?;
        if !snapshot.is_partitioned() {
            return None;
        }
        self.group_buckets(region, &snapshot.all_buckets(), primary_only, &HashSet::new())
    }

    /// Note a response served by a server that does not own the bucket
    pub fn record_hop(&self, region: &str) {
        let entry = self.entry(region);
        let hops = entry.hops.fetch_add(1, Ordering::AcqRel) + 1;
        let threshold = self.settings.hop_refresh_threshold.max(1);
        if hops >= threshold {
            entry.hops.store(0, Ordering::Release);
            debug!(region, hops, threshold, "Hop threshold reached");
            self.schedule_refresh(region);
        }
    }

    /// Queue a background refresh
    pub fn mark_stale(&self, region: &str) {
        self.schedule_refresh(region);
    }

    fn schedule_refresh(&self, region: &str) {
        if self.tasks.is_cancelled() {
            return;
        }
        if !self.queued.lock().insert(region.to_string()) {
            return;
        }
        if self.refresh_tx.send(region.to_string()).is_err() {
            self.queued.lock().remove(region);
        }
    }

    /// Fetch fresh bucket locations for `region` and swap them in.
    ///
    /// Concurrent callers share one fetch.
    pub async fn refresh(&self, region: &str) -> Result<Arc<PartitionMetadata>> {
        let entry = self.entry(region);
        let seen = entry.generation.load(Ordering::Acquire);
        let _guard = entry.refresh_lock.lock().await;
        if entry.generation.load(Ordering::Acquire) != seen {
            if let Some(snapshot) = entry.snapshot() {
                return Ok(snapshot);
            }
        }

        match self.fetch(region, &entry).await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                entry.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn fetch(&self, region: &str, entry: &RegionEntry) -> Result<Arc<PartitionMetadata>> {
        let mut connection = self
            .pool
            .acquire()
            .await
            .map_err(|e| ClientError::from_acquire(self.pool.name(), e))?;
        let server = connection.location().clone();

        let attributes = match entry.attributes() {
            Some(attributes) => attributes,
            None => {
                let body = request(&mut connection, region, Operation::GetPartitionAttributes).await?;
                let attributes = match body {
                    ResponseBody::PartitionAttributes(attributes) => attributes,
                    ResponseBody::Error(error) => return Err(ClientError::from_server(error, Some(&server))),
                    other => return Err(unexpected(&server, "partition attributes", &other)),
                };
                *entry.attributes.write() = Some(attributes.clone());
                attributes
            }
        };

        let buckets = if attributes.total_buckets == 0 {
            HashMap::new()
        } else {
            match request(&mut connection, region, Operation::GetBucketLocations).await? {
                ResponseBody::BucketLocations(locations) => {
                    PartitionMetadata::build_buckets(locations, self.server_group.as_deref())
                }
                ResponseBody::Error(error) => return Err(ClientError::from_server(error, Some(&server))),
                other => return Err(unexpected(&server, "bucket locations", &other)),
            }
        };
        drop(connection);

        let version = self.versions.fetch_add(1, Ordering::Relaxed) + 1;
        let buckets = Arc::new(buckets);
        let snapshot = Arc::new(PartitionMetadata::new(region, &attributes, buckets.clone(), version));
        entry.install(snapshot.clone());
        info!(
            region,
            version,
            buckets = attributes.total_buckets,
            primaries = snapshot.known_primaries(),
            "Bucket metadata refreshed"
        );

        if attributes.total_buckets > 0 {
            self.share_with_colocated(region, &buckets, version);
        }
        Ok(snapshot)
    }

    /// Give every loaded region of `region`'s colocation group the same bucket map
    fn share_with_colocated(
        &self,
        region: &str,
        buckets: &Arc<HashMap<BucketId, BucketMetadata>>,
        version: u64,
    ) {
        let root = self.colocation_root(region);
        let members: Vec<(String, Arc<RegionEntry>)> = self
            .regions
            .iter()
            .filter(|e| e.key() != region)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (name, member) in members {
            let Some(attributes) = member.attributes() else {
                continue;
            };
            if self.colocation_root(&name) != root {
                continue;
            }
            let snapshot = PartitionMetadata::new(&name, &attributes, buckets.clone(), version);
            member.install(Arc::new(snapshot));
            debug!(region = %name, from = region, version, "Shared colocated bucket metadata");
        }
    }

    fn colocation_root(&self, region: &str) -> String {
        let mut current = region.to_string();
        for _ in 0..MAX_COLOCATION_DEPTH {
            let parent = self
                .regions
                .get(&current)
                .and_then(|e| e.attributes())
                .and_then(|a| a.colocated_with);
            match parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
        current
    }

    /// Completed refreshes of `region`, including colocated swaps
    pub fn refresh_count(&self, region: &str) -> u64 {
        self.regions
            .get(region)
            .map_or(0, |e| e.refreshes.load(Ordering::Relaxed))
    }

    pub fn refresh_failures(&self, region: &str) -> u64 {
        self.regions
            .get(region)
            .map_or(0, |e| e.failures.load(Ordering::Relaxed))
    }

    /// Hops recorded since the last refresh
    pub fn pending_hops(&self, region: &str) -> u32 {
        self.regions
            .get(region)
            .map_or(0, |e| e.hops.load(Ordering::Relaxed))
    }

    pub fn close(&self) {
        self.tasks.cancel();
    }
}

async fn request(
    connection: &mut PooledConnection,
    region: &str,
    operation: Operation,
) -> Result<ResponseBody> {
    match connection.request(region, operation).await {
        Ok(response) => Ok(response.body),
        Err(e) => {
            connection.invalidate();
            let mut error: ClientError = e.into();
            if let ClientError::ConnectionFailure { server, .. } = &mut error {
                server.get_or_insert_with(|| connection.location().clone());
            }
            Err(error)
        }
    }
}

fn unexpected(server: &ServerLocation, what: &str, body: &ResponseBody) -> ClientError {
    ClientError::Codec {
        message: format!("unexpected reply from {} for {}: {:?}", server, what, body),
    }
}

impl std::fmt::Debug for ClientMetadataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientMetadataService")
            .field("pool", &self.pool.name())
            .field("regions", &self.known_regions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pool, settle};
    use cache_network::test_utils::SimulatedCluster;
    use cache_types::FixedPartition;
    use std::time::Duration;

    async fn service(cluster: &SimulatedCluster, scheduler: &Scheduler) -> Arc<ClientMetadataService> {
        let pool = pool(cluster, scheduler).await;
        ClientMetadataService::new(pool, MetadataSettings::default(), scheduler)
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_builds_the_bucket_map() {
        let cluster = SimulatedCluster::new();
        cluster.add_server("a", &[]);
        cluster.add_server("b", &[]);
        cluster.create_partitioned_region("orders", 16, 1);
        let scheduler = Scheduler::new();
        let metadata = service(&cluster, &scheduler).await;

        let snapshot = metadata.refresh("orders").await.unwrap();
        assert_eq!(snapshot.total_buckets, 16);
        assert_eq!(snapshot.known_primaries(), 16);

        let key = CacheableKey::from("k1");
        let (bucket, primary) = metadata.primary_for_key("orders", &key, None).unwrap();
        assert_eq!(Some(bucket), cluster.bucket_of("orders", &key));
        assert_eq!(Some(primary), cluster.primary_of("orders", &key));
        let servers = metadata.get_bucket_servers("orders", bucket).unwrap();
        assert_eq!(servers.replicas.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_refreshes_share_one_fetch() {
        let cluster = SimulatedCluster::new();
        let a = cluster.add_server("a", &[]);
        cluster.create_partitioned_region("orders", 8, 0);
        cluster.set_response_delay(&a, Some(Duration::from_millis(50)));
        let scheduler = Scheduler::new();
        let metadata = service(&cluster, &scheduler).await;
        let before = cluster.metadata_requests();

        let (first, second, third) = tokio::join!(
            metadata.refresh("orders"),
            metadata.refresh("orders"),
            metadata.refresh("orders")
        );
        assert_eq!(first.unwrap().version, second.unwrap().version);
        assert!(third.is_ok());
        assert_eq!(cluster.metadata_requests() - before, 1);
        assert_eq!(metadata.refresh_count("orders"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hops_past_the_threshold_queue_a_refresh() {
        let cluster = SimulatedCluster::new();
        cluster.add_server("a", &[]);
        cluster.create_partitioned_region("orders", 8, 0);
        let scheduler = Scheduler::new();
        let pool = pool(&cluster, &scheduler).await;
        let settings = MetadataSettings {
            hop_refresh_threshold: 3,
            ..Default::default()
        };
        let metadata = ClientMetadataService::new(pool, settings, &scheduler);
        metadata.refresh("orders").await.unwrap();

        metadata.record_hop("orders");
        metadata.record_hop("orders");
        settle().await;
        assert_eq!(metadata.refresh_count("orders"), 1);
        assert_eq!(metadata.pending_hops("orders"), 2);

        metadata.record_hop("orders");
        settle().await;
        assert_eq!(metadata.refresh_count("orders"), 2);
        assert_eq!(metadata.pending_hops("orders"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn first_lookup_loads_lazily_and_failures_are_not_fatal() {
        let cluster = SimulatedCluster::new();
        cluster.add_server("a", &[]);
        cluster.create_partitioned_region("orders", 8, 0);
        cluster.fail_metadata_requests(1);
        let scheduler = Scheduler::new();
        let metadata = service(&cluster, &scheduler).await;

        assert!(metadata.snapshot("orders").is_none());
        settle().await;
        assert_eq!(metadata.refresh_failures("orders"), 1);
        assert!(metadata.group_keys("orders", vec![1.into()], None).unrouted.len() == 1);

        settle().await;
        assert!(metadata.snapshot("orders").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn colocated_regions_share_one_bucket_map() {
        let cluster = SimulatedCluster::new();
        cluster.add_server("a", &[]);
        cluster.add_server("b", &[]);
        cluster.create_partitioned_region("customers", 12, 0);
        cluster.create_colocated_region("orders", "customers");
        let scheduler = Scheduler::new();
        let metadata = service(&cluster, &scheduler).await;

        let orders = metadata.refresh("orders").await.unwrap();
        assert_eq!(orders.colocated_with.as_deref(), Some("customers"));
        let customers = metadata.refresh("customers").await.unwrap();
        let orders = metadata.snapshot("orders").unwrap();
        assert!(Arc::ptr_eq(&orders.buckets, &customers.buckets));
    }

    #[tokio::test(start_paused = true)]
    async fn server_groups_prune_foreign_servers() {
        let cluster = SimulatedCluster::new();
        let east = cluster.add_server("east-1", &["east"]);
        cluster.add_server("west-1", &["west"]);
        cluster.create_partitioned_region("orders", 8, 1);
        let scheduler = Scheduler::new();
        let mut settings = crate::testing::settings(&cluster.servers());
        settings.server_group = Some("east".into());
        let pool = crate::testing::pool_with(&cluster, settings, &scheduler).await;
        let metadata = ClientMetadataService::new(pool, MetadataSettings::default(), &scheduler);

        let snapshot = metadata.refresh("orders").await.unwrap();
        assert_eq!(snapshot.servers(), HashSet::from([east]));
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_partitions_resolve_through_the_resolver() {
        struct ByName;
        impl FixedPartitionResolver for ByName {
            fn partition_name(&self, key: &CacheableKey, _partitions: &[&str]) -> String {
                match key {
                    CacheableKey::String(s) if s.starts_with('a') => "first".into(),
                    _ => "second".into(),
                }
            }
        }

        let cluster = SimulatedCluster::new();
        cluster.add_server("a", &[]);
        cluster.create_fixed_partitioned_region(
            "accounts",
            vec![FixedPartition::new("first", 0, 4), FixedPartition::new("second", 4, 4)],
            Arc::new(|key: &CacheableKey| match key {
                CacheableKey::String(s) if s.starts_with('a') => "first".to_string(),
                _ => "second".to_string(),
            }),
            0,
        );
        let scheduler = Scheduler::new();
        let metadata = service(&cluster, &scheduler).await;
        metadata.set_resolver("accounts", RegionResolver::Fixed(Arc::new(ByName)));
        metadata.refresh("accounts").await.unwrap();

        for name in ["alice", "bob", "anna", "zed"] {
            let key = CacheableKey::from(name);
            assert_eq!(
                metadata.bucket_for_key("accounts", &key, None),
                cluster.bucket_of("accounts", &key)
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timer_refreshes_every_known_region() {
        let cluster = SimulatedCluster::new();
        cluster.add_server("a", &[]);
        cluster.create_partitioned_region("orders", 4, 0);
        let scheduler = Scheduler::new();
        let pool = pool(&cluster, &scheduler).await;
        let settings = MetadataSettings {
            refresh_interval_ms: 1_000,
            ..Default::default()
        };
        let metadata = ClientMetadataService::new(pool, settings, &scheduler);
        metadata.refresh("orders").await.unwrap();

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert!(metadata.refresh_count("orders") >= 3);

        metadata.close();
        let count = metadata.refresh_count("orders");
        tokio::time::sleep(Duration::from_millis(3_000)).await;
        assert_eq!(metadata.refresh_count("orders"), count);
    }
}
