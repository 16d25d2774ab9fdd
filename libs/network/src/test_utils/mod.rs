//! # Simulated Cluster
//!
//! An in-memory cache cluster speaking the client protocol: servers,
//! locators, partitioned and replicated regions, subscription queues and
//! server-side functions. Tests drive the client against it and use the
//! control methods to kill servers, move primaries and inject failures.
//!
//! ```rust,no_run
//! # async fn demo() {
//! use cache_network::test_utils::SimulatedCluster;
//!
//! let cluster = SimulatedCluster::new();
//! let a = cluster.add_server("a", &[]);
//! let _b = cluster.add_server("b", &[]);
//! let locator = cluster.add_locator("locator");
//! cluster.create_partitioned_region("orders", 16, 1);
//!
//! let connector = cluster.connector();
//! // ...build pools with `connector` and `locator`...
//! cluster.kill_server(&a);
//! # let _ = (connector, locator);
//! # }
//! ```

mod server;
mod transport;

pub use server::{FunctionCall, QueueInfo, SimFunction, SimPartitioner, SimRouting};
pub use transport::{SimConnector, SimTransport};

use cache_codec::{Credentials, EncodedValue, ServerError};
use cache_types::{BucketId, Cacheable, CacheableKey, FixedPartition, Interest, ServerLocation};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use server::{ClusterState, SimRegion, SimServer};
use transport::ClusterInner;

use crate::transports::Connector;

pub const SERVER_PORT: u16 = 40404;
pub const LOCATOR_PORT: u16 = 10334;

#[derive(Clone)]
pub struct SimulatedCluster {
    inner: Arc<ClusterInner>,
}

impl Default for SimulatedCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCluster {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClusterInner {
                state: Mutex::new(ClusterState::new()),
            }),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(SimConnector {
            cluster: self.inner.clone(),
        })
    }

    // ---- membership ----

    /// Start a server named `name` in the given server groups
    pub fn add_server(&self, name: &str, groups: &[&str]) -> ServerLocation {
        let location = ServerLocation::new(name, SERVER_PORT);
        self.inner.state.lock().servers.insert(
            location.clone(),
            SimServer {
                member_id: format!("{}({})", name, SERVER_PORT),
                groups: groups.iter().map(|g| g.to_string()).collect(),
                alive: true,
                operations: 0,
                response_delay: None,
                fail_next: VecDeque::new(),
            },
        );
        location
    }

    pub fn add_locator(&self, name: &str) -> ServerLocation {
        let location = ServerLocation::new(name, LOCATOR_PORT);
        let mut state = self.inner.state.lock();
        if !state.locators.contains(&location) {
            state.locators.push(location.clone());
        }
        location
    }

    pub fn servers(&self) -> Vec<ServerLocation> {
        self.inner.state.lock().alive_servers()
    }

    /// Crash a server: its connections reset, its buckets fail over to the
    /// next owner and its subscription queues are lost
    pub fn kill_server(&self, location: &ServerLocation) {
        self.inner.state.lock().kill(location);
    }

    /// Bring a killed server back; it hosts no buckets until a rebalance
    pub fn restart_server(&self, location: &ServerLocation) {
        if let Some(server) = self.inner.state.lock().servers.get_mut(location) {
            server.alive = true;
        }
    }

    // ---- regions ----

    pub fn create_partitioned_region(&self, name: &str, total_buckets: u32, redundant_copies: usize) {
        let mut state = self.inner.state.lock();
        let owners = state.assign_buckets(total_buckets, redundant_copies);
        state.regions.insert(name.to_string(), region(total_buckets, owners));
    }

    /// Partitioned region routing keys through `routing` before hashing
    pub fn create_routed_region(
        &self,
        name: &str,
        total_buckets: u32,
        redundant_copies: usize,
        routing: SimRouting,
    ) {
        let mut state = self.inner.state.lock();
        let owners = state.assign_buckets(total_buckets, redundant_copies);
        let mut created = region(total_buckets, owners);
        created.routing = Some(routing);
        state.regions.insert(name.to_string(), created);
    }

    pub fn create_fixed_partitioned_region(
        &self,
        name: &str,
        partitions: Vec<FixedPartition>,
        partitioner: SimPartitioner,
        redundant_copies: usize,
    ) {
        let total = partitions
            .iter()
            .map(|p| p.starting_bucket + p.num_buckets)
            .max()
            .unwrap_or(0);
        let mut state = self.inner.state.lock();
        let owners = state.assign_buckets(total, redundant_copies);
        let mut created = region(total, owners);
        created.fixed_partitions = partitions;
        created.partitioner = Some(partitioner);
        state.regions.insert(name.to_string(), created);
    }

    /// Partitioned region sharing bucket placement with `parent`
    pub fn create_colocated_region(&self, name: &str, parent: &str) {
        let mut state = self.inner.state.lock();
        let total = state.regions.get(parent).map(|r| r.total_buckets).unwrap_or(0);
        let mut created = region(total, Vec::new());
        created.colocated_with = Some(parent.to_string());
        state.regions.insert(name.to_string(), created);
    }

    pub fn create_replicated_region(&self, name: &str) {
        self.inner
            .state
            .lock()
            .regions
            .insert(name.to_string(), region(0, Vec::new()));
    }

    /// Make `to` the primary of `bucket`, demoting the current primary to a
    /// replica
    pub fn move_primary(&self, region: &str, bucket: BucketId, to: &ServerLocation) {
        let mut state = self.inner.state.lock();
        if let Some(owners) = state
            .owners_mut(region)
            .and_then(|o| o.get_mut(bucket.get() as usize))
        {
            owners.retain(|s| s != to);
            owners.insert(0, to.clone());
        }
    }

    /// Spread every bucket of `region` over the live servers again
    pub fn rebalance(&self, region: &str, redundant_copies: usize) {
        let mut state = self.inner.state.lock();
        let root = state.ownership_root(region).to_string();
        let total = state.regions.get(&root).map(|r| r.total_buckets).unwrap_or(0);
        let owners = state.assign_buckets(total, redundant_copies);
        if let Some(r) = state.regions.get_mut(&root) {
            r.owners = owners;
        }
    }

    pub fn bucket_of(&self, region: &str, key: &CacheableKey) -> Option<BucketId> {
        self.inner.state.lock().bucket_of(region, key)
    }

    pub fn primary_of(&self, region: &str, key: &CacheableKey) -> Option<ServerLocation> {
        self.inner.state.lock().primary_of(region, key)
    }

    pub fn bucket_owners(&self, region: &str, bucket: BucketId) -> Vec<ServerLocation> {
        self.inner.state.lock().bucket_servers(region, bucket)
    }

    // ---- data ----

    /// Write from another member; interested subscribers get an event
    pub fn put_direct(&self, region: &str, key: impl Into<CacheableKey>, value: impl Into<Cacheable>) {
        let mut state = self.inner.state.lock();
        let event_id = state.next_server_event();
        let value = EncodedValue::from_value(&value.into());
        state.write(region, key.into(), Some(value), event_id, None);
    }

    pub fn destroy_direct(&self, region: &str, key: impl Into<CacheableKey>) {
        let mut state = self.inner.state.lock();
        let event_id = state.next_server_event();
        state.write(region, key.into(), None, event_id, None);
    }

    pub fn get_direct(&self, region: &str, key: impl Into<CacheableKey>) -> Option<Cacheable> {
        let state = self.inner.state.lock();
        let key = key.into();
        let encoded = state.regions.get(region)?.data.get(&key)?.clone();
        state.registry.decode(&encoded).ok()
    }

    pub fn entry_count(&self, region: &str) -> usize {
        self.inner
            .state
            .lock()
            .regions
            .get(region)
            .map(|r| r.data.len())
            .unwrap_or(0)
    }

    // ---- functions ----

    pub fn register_function<F>(&self, function_id: &str, body: F)
    where
        F: Fn(&FunctionCall) -> std::result::Result<Vec<Cacheable>, ServerError> + Send + Sync + 'static,
    {
        self.inner
            .state
            .lock()
            .functions
            .insert(function_id.to_string(), Arc::new(body));
    }

    pub fn function_calls(&self, function_id: &str) -> Vec<FunctionCall> {
        self.inner
            .state
            .lock()
            .function_calls
            .iter()
            .filter(|c| c.function_id == function_id)
            .cloned()
            .collect()
    }

    // ---- fault injection ----

    /// Fail the next `times` region operations served by `server`
    pub fn fail_next(&self, server: &ServerLocation, error: ServerError, times: usize) {
        if let Some(s) = self.inner.state.lock().servers.get_mut(server) {
            s.fail_next.extend(std::iter::repeat(error).take(times));
        }
    }

    /// Fail every operation touching `key` until cleared
    pub fn fail_key(&self, key: impl Into<CacheableKey>, error: ServerError) {
        self.inner.state.lock().failing_keys.insert(key.into(), error);
    }

    pub fn clear_key_failure(&self, key: impl Into<CacheableKey>) {
        self.inner.state.lock().failing_keys.remove(&key.into());
    }

    pub fn fail_metadata_requests(&self, times: u32) {
        self.inner.state.lock().metadata_failures = times;
    }

    pub fn deny_region(&self, region: &str) {
        self.inner.state.lock().denied_regions.insert(region.to_string());
    }

    pub fn require_credentials(&self, credentials: Credentials) {
        self.inner.state.lock().credentials = Some(credentials);
    }

    pub fn set_response_delay(&self, server: &ServerLocation, delay: Option<Duration>) {
        if let Some(s) = self.inner.state.lock().servers.get_mut(server) {
            s.response_delay = delay;
        }
    }

    // ---- observation ----

    /// Region operations served by `server`
    pub fn operations_on(&self, server: &ServerLocation) -> u64 {
        self.inner
            .state
            .lock()
            .servers
            .get(server)
            .map(|s| s.operations)
            .unwrap_or(0)
    }

    pub fn operations_by_server(&self) -> HashMap<ServerLocation, u64> {
        self.inner
            .state
            .lock()
            .servers
            .iter()
            .map(|(l, s)| (l.clone(), s.operations))
            .collect()
    }

    /// Responses flagged with a network hop
    pub fn hops(&self) -> u64 {
        self.inner.state.lock().counters.hops
    }

    pub fn metadata_requests(&self) -> u64 {
        self.inner.state.lock().counters.metadata_requests
    }

    /// Full server lists handed out by locators
    pub fn server_list_requests(&self) -> u64 {
        self.inner.state.lock().counters.server_list_requests
    }

    /// Server connections opened so far, locators excluded
    pub fn connections_opened(&self) -> u64 {
        self.inner.state.lock().counters.connections_opened
    }

    /// Operation connections currently open to `server`
    pub fn open_connections(&self, server: &ServerLocation) -> usize {
        self.inner.state.lock().load(server)
    }

    pub fn queues_of(&self, client: &str) -> Vec<QueueInfo> {
        self.inner
            .state
            .lock()
            .queues
            .iter()
            .filter(|((c, _), _)| c == client)
            .map(|((_, server), q)| QueueInfo {
                server: server.clone(),
                primary: q.primary,
                ready: q.ready,
                connected: q.connection.is_some(),
                pending: q.pending.len(),
            })
            .collect()
    }

    pub fn interests_of(&self, client: &str, region: &str) -> Vec<Interest> {
        self.inner
            .state
            .lock()
            .interests
            .get(client)
            .map(|list| {
                list.iter()
                    .filter(|i| i.region == region)
                    .map(|i| i.interest.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn region(total_buckets: u32, owners: Vec<Vec<ServerLocation>>) -> SimRegion {
    SimRegion {
        total_buckets,
        colocated_with: None,
        fixed_partitions: Vec::new(),
        routing: None,
        partitioner: None,
        owners,
        data: HashMap::new(),
    }
}
