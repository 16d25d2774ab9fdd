//! Server side of the simulated cluster
//!
//! One [`ClusterState`] holds every server, region, subscription queue and
//! open connection. Region data is shared cluster-wide; bucket ownership only
//! decides which server counts as primary, which drives the `network_hop`
//! flag and the bucket checks of function execution.

use bytes::Bytes;
use cache_codec::{
    BucketLocations, BucketServerLocation, ClientIdentity, ConnectionKind, Credentials,
    EncodedValue, Handshake, LocatorRequest, LocatorResponse, Operation, PartitionAttributes,
    RegionEvent, Request, Response, ResponseBody, ServerError, ServerMessage, TypeRegistry,
};
use cache_types::{
    BucketId, Cacheable, CacheableKey, EventId, EventIdGenerator, EventKind, EventSource,
    FixedPartition, Interest, ServerLocation,
};
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Server-side function body
pub type SimFunction =
    Arc<dyn Fn(&FunctionCall) -> std::result::Result<Vec<Cacheable>, ServerError> + Send + Sync>;

/// Routing object for a key, mirroring a client-side partition resolver
pub type SimRouting = Arc<dyn Fn(&CacheableKey) -> CacheableKey + Send + Sync>;

/// Fixed partition name for a key
pub type SimPartitioner = Arc<dyn Fn(&CacheableKey) -> String + Send + Sync>;

/// One function invocation as seen by a server
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub function_id: String,
    pub server: ServerLocation,
    pub region: String,
    pub buckets: Vec<BucketId>,
    pub filter: Vec<CacheableKey>,
    pub args: Option<Cacheable>,
}

/// Subscription queue as seen from outside the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub server: ServerLocation,
    pub primary: bool,
    pub ready: bool,
    pub connected: bool,
    pub pending: usize,
}

pub(crate) struct SimServer {
    pub(crate) member_id: String,
    pub(crate) groups: Vec<String>,
    pub(crate) alive: bool,
    pub(crate) operations: u64,
    pub(crate) response_delay: Option<Duration>,
    pub(crate) fail_next: VecDeque<ServerError>,
}

pub(crate) struct SimRegion {
    /// 0 for replicated regions
    pub(crate) total_buckets: u32,
    pub(crate) colocated_with: Option<String>,
    pub(crate) fixed_partitions: Vec<FixedPartition>,
    pub(crate) routing: Option<SimRouting>,
    pub(crate) partitioner: Option<SimPartitioner>,
    /// Per bucket, primary first. Empty for colocated regions.
    pub(crate) owners: Vec<Vec<ServerLocation>>,
    pub(crate) data: HashMap<CacheableKey, EncodedValue>,
}

pub(crate) struct SimConnection {
    pub(crate) peer: ServerLocation,
    pub(crate) locator: bool,
    pub(crate) tx: mpsc::UnboundedSender<Bytes>,
    pub(crate) alive: Arc<AtomicBool>,
    pub(crate) handshake: Option<Handshake>,
}

pub(crate) struct SimQueue {
    pub(crate) primary: bool,
    pub(crate) ready: bool,
    pub(crate) durable: bool,
    pub(crate) durable_timeout: Duration,
    pub(crate) connection: Option<u64>,
    pub(crate) pending: VecDeque<RegionEvent>,
    pub(crate) disconnected_at: Option<Instant>,
}

pub(crate) struct ClientInterest {
    pub(crate) region: String,
    pub(crate) interest: Interest,
    pub(crate) durable: bool,
    pub(crate) receive_values: bool,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) hops: u64,
    pub(crate) metadata_requests: u64,
    pub(crate) connections_opened: u64,
    pub(crate) server_list_requests: u64,
}

pub(crate) struct ClusterState {
    pub(crate) servers: BTreeMap<ServerLocation, SimServer>,
    pub(crate) locators: Vec<ServerLocation>,
    pub(crate) regions: HashMap<String, SimRegion>,
    pub(crate) functions: HashMap<String, SimFunction>,
    pub(crate) function_calls: Vec<FunctionCall>,
    pub(crate) queues: BTreeMap<(String, ServerLocation), SimQueue>,
    pub(crate) interests: HashMap<String, Vec<ClientInterest>>,
    pub(crate) connections: HashMap<u64, SimConnection>,
    pub(crate) failing_keys: HashMap<CacheableKey, ServerError>,
    pub(crate) denied_regions: HashSet<String>,
    pub(crate) metadata_failures: u32,
    pub(crate) credentials: Option<Credentials>,
    pub(crate) counters: Counters,
    pub(crate) event_ids: EventIdGenerator,
    pub(crate) registry: TypeRegistry,
    pub(crate) next_connection: u64,
}

impl ClusterState {
    pub(crate) fn new() -> Self {
        Self {
            servers: BTreeMap::new(),
            locators: Vec::new(),
            regions: HashMap::new(),
            functions: HashMap::new(),
            function_calls: Vec::new(),
            queues: BTreeMap::new(),
            interests: HashMap::new(),
            connections: HashMap::new(),
            failing_keys: HashMap::new(),
            denied_regions: HashSet::new(),
            metadata_failures: 0,
            credentials: None,
            counters: Counters::default(),
            event_ids: EventIdGenerator::new("cluster"),
            registry: TypeRegistry::with_builtins(),
            next_connection: 1,
        }
    }

    pub(crate) fn alive_servers(&self) -> Vec<ServerLocation> {
        self.servers
            .iter()
            .filter(|(_, s)| s.alive)
            .map(|(l, _)| l.clone())
            .collect()
    }

    fn in_group(&self, location: &ServerLocation, group: Option<&str>) -> bool {
        match (group, self.servers.get(location)) {
            (None, Some(server)) => server.alive,
            (Some(group), Some(server)) => server.alive && server.groups.iter().any(|g| g == group),
            (_, None) => false,
        }
    }

    /// Operation connections currently open to `location`
    pub(crate) fn load(&self, location: &ServerLocation) -> usize {
        self.connections
            .values()
            .filter(|c| !c.locator && &c.peer == location)
            .filter(|c| matches!(c.handshake.as_ref().map(|h| h.kind), Some(ConnectionKind::Operations)))
            .count()
    }

    // ---- bucket ownership ----

    pub(crate) fn assign_buckets(&self, total: u32, redundant_copies: usize) -> Vec<Vec<ServerLocation>> {
        let servers = self.alive_servers();
        if servers.is_empty() {
            return vec![Vec::new(); total as usize];
        }
        let copies = (redundant_copies + 1).min(servers.len());
        (0..total as usize)
            .map(|bucket| {
                (0..copies)
                    .map(|copy| servers[(bucket + copy) % servers.len()].clone())
                    .collect()
            })
            .collect()
    }

    /// Region whose bucket owners `region` follows
    pub(crate) fn ownership_root<'a>(&'a self, region: &'a str) -> &'a str {
        let mut current = region;
        for _ in 0..8 {
            match self.regions.get(current).and_then(|r| r.colocated_with.as_deref()) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        current
    }

    pub(crate) fn owners(&self, region: &str) -> Option<&Vec<Vec<ServerLocation>>> {
        let root = self.ownership_root(region);
        self.regions.get(root).map(|r| &r.owners)
    }

    pub(crate) fn owners_mut(&mut self, region: &str) -> Option<&mut Vec<Vec<ServerLocation>>> {
        let root = self.ownership_root(region).to_string();
        self.regions.get_mut(&root).map(|r| &mut r.owners)
    }

    pub(crate) fn bucket_of(&self, region: &str, key: &CacheableKey) -> Option<BucketId> {
        let region = self.regions.get(region)?;
        if region.total_buckets == 0 {
            return None;
        }
        let routed = match &region.routing {
            Some(routing) => routing(key),
            None => key.clone(),
        };
        if let Some(partitioner) = &region.partitioner {
            let name = partitioner(key);
            return region
                .fixed_partitions
                .iter()
                .find(|p| p.name == name)
                .and_then(|p| p.bucket_for_hash(routed.hash_code()));
        }
        routed.bucket(region.total_buckets)
    }

    pub(crate) fn bucket_servers(&self, region: &str, bucket: BucketId) -> Vec<ServerLocation> {
        self.owners(region)
            .and_then(|owners| owners.get(bucket.get() as usize))
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn primary_of(&self, region: &str, key: &CacheableKey) -> Option<ServerLocation> {
        let bucket = self.bucket_of(region, key)?;
        self.bucket_servers(region, bucket).into_iter().next()
    }

    fn is_hop(&self, region: &str, key: &CacheableKey, server: &ServerLocation, write: bool) -> bool {
        let Some(bucket) = self.bucket_of(region, key) else {
            return false;
        };
        let owners = self.bucket_servers(region, bucket);
        if write {
            owners.first() != Some(server)
        } else {
            !owners.contains(server)
        }
    }

    pub(crate) fn kill(&mut self, location: &ServerLocation) {
        if let Some(server) = self.servers.get_mut(location) {
            server.alive = false;
        }
        for region in self.regions.values_mut() {
            for owners in region.owners.iter_mut() {
                owners.retain(|s| s != location);
            }
        }
        let dead: Vec<u64> = self
            .connections
            .iter()
            .filter(|(_, c)| &c.peer == location)
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            if let Some(connection) = self.connections.remove(&id) {
                connection.alive.store(false, Ordering::Release);
            }
        }
        self.queues.retain(|(_, server), _| server != location);
        debug!(server = %location, "Simulated server killed");
    }

    // ---- connections ----

    pub(crate) fn disconnect(&mut self, connection: u64) {
        let Some(removed) = self.connections.remove(&connection) else {
            return;
        };
        removed.alive.store(false, Ordering::Release);
        let Some(handshake) = removed.handshake else {
            return;
        };
        if !matches!(handshake.kind, ConnectionKind::Queue { .. }) {
            return;
        }
        let client = handshake.client.queue_key().to_string();
        let key = (client.clone(), removed.peer.clone());
        let durable = match self.queues.get_mut(&key) {
            Some(queue) if queue.connection == Some(connection) => {
                if queue.durable {
                    queue.connection = None;
                    queue.ready = false;
                    queue.disconnected_at = Some(Instant::now());
                    true
                } else {
                    self.queues.remove(&key);
                    false
                }
            }
            _ => return,
        };
        if !durable && !self.queues.keys().any(|(c, _)| c == &client) {
            self.interests.remove(&client);
        }
        trace!(client = %client, server = %removed.peer, durable, "Queue connection closed");
    }

    // ---- requests ----

    pub(crate) fn handle_locator(&mut self, request: LocatorRequest) -> LocatorResponse {
        match request {
            LocatorRequest::ServerForConnection {
                server_group,
                excluded,
            } => {
                let chosen = self
                    .alive_servers()
                    .into_iter()
                    .filter(|s| self.in_group(s, server_group.as_deref()))
                    .filter(|s| !excluded.contains(s))
                    .min_by_key(|s| self.load(s));
                LocatorResponse::Server(chosen)
            }
            LocatorRequest::QueueServers {
                server_group,
                count,
                excluded,
            } => {
                let mut candidates: Vec<_> = self
                    .alive_servers()
                    .into_iter()
                    .filter(|s| self.in_group(s, server_group.as_deref()))
                    .filter(|s| !excluded.contains(s))
                    .collect();
                candidates.sort_by_key(|s| self.queues.keys().filter(|(_, q)| q == s).count());
                candidates.truncate(count.map(|c| c as usize).unwrap_or(usize::MAX));
                LocatorResponse::Servers(candidates)
            }
            LocatorRequest::ServerList { server_group } => {
                self.counters.server_list_requests += 1;
                LocatorResponse::Servers(
                    self.alive_servers()
                        .into_iter()
                        .filter(|s| self.in_group(s, server_group.as_deref()))
                        .collect(),
                )
            }
            LocatorRequest::LocatorList => LocatorResponse::Locators(self.locators.clone()),
        }
    }

    pub(crate) fn handle_request(
        &mut self,
        connection: u64,
        server: &ServerLocation,
        request: Request,
    ) -> Response {
        let correlation_id = request.correlation_id;
        let (body, hop) = self.dispatch(connection, server, request);
        if hop {
            self.counters.hops += 1;
        }
        Response::new(correlation_id, body).with_hop(hop)
    }

    fn dispatch(
        &mut self,
        connection: u64,
        server: &ServerLocation,
        request: Request,
    ) -> (ResponseBody, bool) {
        let Request {
            region,
            callback_arg,
            operation,
            ..
        } = request;

        if let Operation::Handshake(handshake) = operation {
            return (self.handshake(connection, server, handshake), false);
        }
        let Some(client) = self
            .connections
            .get(&connection)
            .and_then(|c| c.handshake.as_ref())
            .map(|h| h.client.clone())
        else {
            return (ResponseBody::Error(ServerError::AuthenticationRequired), false);
        };

        match operation {
            Operation::Handshake(_) => (
                ResponseBody::Error(ServerError::Application {
                    class: "ProtocolError".into(),
                    message: "connection already handshaked".into(),
                }),
                false,
            ),
            Operation::Ping => (ResponseBody::Pong, false),
            Operation::GetPartitionAttributes => (self.partition_attributes(&region), false),
            Operation::GetBucketLocations => (self.bucket_locations(&region), false),
            Operation::RegisterInterest {
                interest,
                durable,
                receive_values,
            } => (
                self.register_interest(&client, &region, interest, durable, receive_values),
                false,
            ),
            Operation::UnregisterInterest { interest } => {
                if let Some(list) = self.interests.get_mut(client.queue_key()) {
                    list.retain(|i| !(i.region == region && i.interest == interest));
                }
                (ResponseBody::Ok, false)
            }
            Operation::MakePrimary { ready_for_events } => {
                (self.make_primary(&client, server, ready_for_events), false)
            }
            Operation::ReadyForEvents => (self.ready_for_events(&client), false),
            Operation::PeriodicAck { events } => {
                // an ack covers every earlier event of the same source
                let mut acked: HashMap<EventSource, i64> = HashMap::new();
                for event in events {
                    let highest = acked.entry(event.source()).or_insert(event.sequence_id);
                    *highest = (*highest).max(event.sequence_id);
                }
                for ((owner, _), queue) in self.queues.iter_mut() {
                    if owner == client.queue_key() {
                        queue.pending.retain(|e| {
                            acked
                                .get(&e.event_id.source())
                                .map_or(true, |highest| e.event_id.sequence_id > *highest)
                        });
                    }
                }
                (ResponseBody::Ok, false)
            }
            Operation::CloseConnection { keep_alive } => {
                self.close_client(&client, keep_alive);
                (ResponseBody::Ok, false)
            }
            operation => self.region_operation(server, &region, callback_arg, operation),
        }
    }

    fn handshake(&mut self, connection: u64, server: &ServerLocation, handshake: Handshake) -> ResponseBody {
        if let Some(required) = &self.credentials {
            match &handshake.credentials {
                None => return ResponseBody::Error(ServerError::AuthenticationRequired),
                Some(given) if given != required => {
                    return ResponseBody::Error(ServerError::AuthenticationFailed {
                        message: format!("bad credentials for '{}'", given.username),
                    })
                }
                Some(_) => {}
            }
        }
        let Some(member_id) = self.servers.get(server).map(|s| s.member_id.clone()) else {
            return ResponseBody::Error(ServerError::ServerShuttingDown);
        };

        let client = handshake.client.queue_key().to_string();
        let mut durable_reconnect = false;
        if handshake.client.is_durable() {
            self.expire_durable_queues(&client);
            durable_reconnect = self
                .queues
                .iter()
                .any(|((c, _), q)| c == &client && q.disconnected_at.is_some())
                || self.interests.get(&client).is_some_and(|i| !i.is_empty());
        }

        if let ConnectionKind::Queue { primary } = handshake.kind {
            self.attach_queue(connection, server, &handshake.client, primary);
        }
        if let Some(entry) = self.connections.get_mut(&connection) {
            entry.handshake = Some(handshake);
        }
        ResponseBody::HandshakeAccepted {
            server_member_id: member_id,
            durable_reconnect,
        }
    }

    fn expire_durable_queues(&mut self, client: &str) {
        let now = Instant::now();
        let before = self.queues.len();
        self.queues.retain(|(c, _), q| {
            c != client
                || q.disconnected_at
                    .map_or(true, |at| now.duration_since(at) <= q.durable_timeout)
        });
        let client_has_queues = self.queues.keys().any(|(c, _)| c == client);
        if before != self.queues.len() && !client_has_queues {
            self.interests.remove(client);
            debug!(client, "Durable queues expired");
        }
    }

    fn attach_queue(
        &mut self,
        connection: u64,
        server: &ServerLocation,
        client: &ClientIdentity,
        primary: bool,
    ) {
        let owner = client.queue_key().to_string();
        if primary {
            for ((c, _), queue) in self.queues.iter_mut() {
                if c == &owner {
                    queue.primary = false;
                }
            }
        }
        let durable = client.is_durable();
        let queue = self
            .queues
            .entry((owner, server.clone()))
            .or_insert_with(|| SimQueue {
                primary,
                ready: false,
                durable,
                durable_timeout: Duration::from_millis(client.durable_timeout_ms),
                connection: None,
                pending: VecDeque::new(),
                disconnected_at: None,
            });
        queue.primary = primary;
        queue.ready = !durable;
        queue.connection = Some(connection);
        queue.disconnected_at = None;
    }

    fn register_interest(
        &mut self,
        client: &ClientIdentity,
        region: &str,
        interest: Interest,
        durable: bool,
        receive_values: bool,
    ) -> ResponseBody {
        if !self.regions.contains_key(region) {
            return ResponseBody::Error(ServerError::RegionNotFound {
                region: region.to_string(),
            });
        }
        if let Interest::Regex(pattern) = &interest {
            if Regex::new(pattern).is_err() {
                return ResponseBody::Error(ServerError::Application {
                    class: "InvalidRegex".into(),
                    message: pattern.clone(),
                });
            }
        }
        let list = self.interests.entry(client.queue_key().to_string()).or_default();
        if !list.iter().any(|i| i.region == region && i.interest == interest) {
            list.push(ClientInterest {
                region: region.to_string(),
                interest,
                durable,
                receive_values,
            });
        }
        ResponseBody::Ok
    }

    fn make_primary(&mut self, client: &ClientIdentity, server: &ServerLocation, ready: bool) -> ResponseBody {
        let owner = client.queue_key().to_string();
        if !self.queues.contains_key(&(owner.clone(), server.clone())) {
            return ResponseBody::Error(ServerError::Application {
                class: "QueueNotFound".into(),
                message: format!("no queue for {} on {}", owner, server),
            });
        }
        for ((c, location), queue) in self.queues.iter_mut() {
            if c == &owner {
                queue.primary = location == server;
                if queue.primary && (ready || !queue.durable) {
                    queue.ready = true;
                }
            }
        }
        self.flush(&owner, server);
        ResponseBody::Ok
    }

    fn ready_for_events(&mut self, client: &ClientIdentity) -> ResponseBody {
        let owner = client.queue_key().to_string();
        let mut primaries = Vec::new();
        for ((c, location), queue) in self.queues.iter_mut() {
            if c == &owner {
                queue.ready = true;
                if queue.primary {
                    primaries.push(location.clone());
                }
            }
        }
        for location in primaries {
            self.flush(&owner, &location);
        }
        ResponseBody::Ok
    }

    /// Deliver every unacknowledged event of a queue
    fn flush(&mut self, owner: &str, server: &ServerLocation) {
        let Some(queue) = self.queues.get(&(owner.to_string(), server.clone())) else {
            return;
        };
        if !(queue.primary && queue.ready) {
            return;
        }
        if let Some(connection) = queue.connection.and_then(|id| self.connections.get(&id)) {
            for event in &queue.pending {
                send_event(connection, event);
            }
        }
    }

    fn close_client(&mut self, client: &ClientIdentity, keep_alive: bool) {
        let owner = client.queue_key().to_string();
        if keep_alive && client.is_durable() {
            let now = Instant::now();
            for ((c, _), queue) in self.queues.iter_mut() {
                if c == &owner {
                    queue.connection = None;
                    queue.ready = false;
                    queue.disconnected_at = Some(now);
                }
            }
            if let Some(list) = self.interests.get_mut(&owner) {
                list.retain(|i| i.durable);
            }
        } else {
            self.queues.retain(|(c, _), _| c != &owner);
            self.interests.remove(&owner);
        }
        debug!(client = %owner, keep_alive, "Client closed its subscriptions");
    }

    fn partition_attributes(&self, region: &str) -> ResponseBody {
        match self.regions.get(region) {
            Some(r) => ResponseBody::PartitionAttributes(PartitionAttributes {
                total_buckets: r.total_buckets,
                colocated_with: r.colocated_with.clone(),
                fixed_partitions: r.fixed_partitions.clone(),
            }),
            None => ResponseBody::Error(ServerError::RegionNotFound {
                region: region.to_string(),
            }),
        }
    }

    fn bucket_locations(&mut self, region: &str) -> ResponseBody {
        self.counters.metadata_requests += 1;
        if self.metadata_failures > 0 {
            self.metadata_failures -= 1;
            return ResponseBody::Error(ServerError::Application {
                class: "InternalError".into(),
                message: "bucket locations unavailable".into(),
            });
        }
        let Some(owners) = self.owners(region) else {
            return ResponseBody::Error(ServerError::RegionNotFound {
                region: region.to_string(),
            });
        };
        let locations = owners
            .iter()
            .enumerate()
            .map(|(bucket, servers)| BucketLocations {
                bucket_id: BucketId::new(bucket as u32),
                servers: servers
                    .iter()
                    .enumerate()
                    .map(|(index, location)| BucketServerLocation {
                        location: location.clone(),
                        is_primary: index == 0,
                        server_groups: self
                            .servers
                            .get(location)
                            .map(|s| s.groups.clone())
                            .unwrap_or_default(),
                    })
                    .collect(),
            })
            .collect();
        ResponseBody::BucketLocations(locations)
    }

    fn region_operation(
        &mut self,
        server: &ServerLocation,
        region: &str,
        callback_arg: Option<EncodedValue>,
        operation: Operation,
    ) -> (ResponseBody, bool) {
        if !self.regions.contains_key(region) {
            return (
                ResponseBody::Error(ServerError::RegionNotFound {
                    region: region.to_string(),
                }),
                false,
            );
        }
        if self.denied_regions.contains(region) {
            return (
                ResponseBody::Error(ServerError::NotAuthorized {
                    message: format!("{} on region {}", operation.name(), region),
                }),
                false,
            );
        }
        if let Some(server_state) = self.servers.get_mut(server) {
            server_state.operations += 1;
            if let Some(error) = server_state.fail_next.pop_front() {
                return (ResponseBody::Error(error), false);
            }
        }

        match operation {
            Operation::Get { key } => {
                if let Some(error) = self.failing_keys.get(&key) {
                    return (ResponseBody::Error(error.clone()), false);
                }
                let hop = self.is_hop(region, &key, server, false);
                let value = self.regions.get(region).and_then(|r| r.data.get(&key).cloned());
                (ResponseBody::Value(value), hop)
            }
            Operation::Put {
                key,
                value,
                event_id,
            } => {
                if let Some(error) = self.failing_keys.get(&key) {
                    return (ResponseBody::Error(error.clone()), false);
                }
                let hop = self.is_hop(region, &key, server, true);
                self.write(region, key, Some(value), event_id, callback_arg);
                (ResponseBody::Ok, hop)
            }
            Operation::Destroy { key, event_id } => {
                if let Some(error) = self.failing_keys.get(&key) {
                    return (ResponseBody::Error(error.clone()), false);
                }
                let hop = self.is_hop(region, &key, server, true);
                self.write(region, key, None, event_id, callback_arg);
                (ResponseBody::Ok, hop)
            }
            Operation::GetAll { keys } => {
                let mut values = Vec::new();
                let mut failures = Vec::new();
                let mut hop = false;
                for key in keys {
                    if let Some(error) = self.failing_keys.get(&key) {
                        failures.push((key, error.clone()));
                        continue;
                    }
                    hop |= self.is_hop(region, &key, server, false);
                    let value = self.regions.get(region).and_then(|r| r.data.get(&key).cloned());
                    values.push((key, value));
                }
                (ResponseBody::Bulk { values, failures }, hop)
            }
            Operation::PutAll { entries, event_id } => {
                let mut failures = Vec::new();
                let mut hop = false;
                for (index, (key, value)) in entries.into_iter().enumerate() {
                    if let Some(error) = self.failing_keys.get(&key) {
                        failures.push((key, error.clone()));
                        continue;
                    }
                    hop |= self.is_hop(region, &key, server, true);
                    self.write(region, key, Some(value), event_id.for_bulk_entry(index), callback_arg.clone());
                }
                (
                    ResponseBody::Bulk {
                        values: Vec::new(),
                        failures,
                    },
                    hop,
                )
            }
            Operation::RemoveAll { keys, event_id } => {
                let mut failures = Vec::new();
                let mut hop = false;
                for (index, key) in keys.into_iter().enumerate() {
                    if let Some(error) = self.failing_keys.get(&key) {
                        failures.push((key, error.clone()));
                        continue;
                    }
                    hop |= self.is_hop(region, &key, server, true);
                    self.write(region, key, None, event_id.for_bulk_entry(index), callback_arg.clone());
                }
                (
                    ResponseBody::Bulk {
                        values: Vec::new(),
                        failures,
                    },
                    hop,
                )
            }
            Operation::ExecuteFunction {
                function_id,
                filter,
                buckets,
                args,
                options,
            } => (
                self.execute_function(server, region, function_id, filter, buckets, args, options.optimize_for_write),
                false,
            ),
            other => (
                ResponseBody::Error(ServerError::Application {
                    class: "UnsupportedOperation".into(),
                    message: other.name().to_string(),
                }),
                false,
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_function(
        &mut self,
        server: &ServerLocation,
        region: &str,
        function_id: String,
        filter: Vec<CacheableKey>,
        buckets: Vec<BucketId>,
        args: Option<EncodedValue>,
        primary_only: bool,
    ) -> ResponseBody {
        let Some(function) = self.functions.get(&function_id).cloned() else {
            return ResponseBody::Error(ServerError::Application {
                class: "FunctionException".into(),
                message: format!("function '{}' is not registered", function_id),
            });
        };
        let buckets = if buckets.is_empty() {
            let mut derived: Vec<BucketId> = filter
                .iter()
                .filter_map(|k| self.bucket_of(region, k))
                .collect();
            derived.sort();
            derived.dedup();
            derived
        } else {
            buckets
        };
        for bucket in &buckets {
            let owners = self.bucket_servers(region, *bucket);
            let hosted = if primary_only {
                owners.first() == Some(server)
            } else {
                owners.contains(server)
            };
            if !hosted {
                return ResponseBody::Error(ServerError::NotPrimary {
                    bucket: Some(*bucket),
                });
            }
        }
        let args = match args.map(|a| self.registry.decode(&a)).transpose() {
            Ok(args) => args,
            Err(e) => {
                return ResponseBody::Error(ServerError::Application {
                    class: "SerializationException".into(),
                    message: e.to_string(),
                })
            }
        };
        let call = FunctionCall {
            function_id,
            server: server.clone(),
            region: region.to_string(),
            buckets,
            filter,
            args,
        };
        let outcome = function(&call);
        self.function_calls.push(call);
        match outcome {
            Ok(results) => ResponseBody::FunctionResults {
                results: results.iter().map(EncodedValue::from_value).collect(),
            },
            Err(error) => ResponseBody::Error(error),
        }
    }

    /// Apply a write and fan out the resulting event to interested queues
    pub(crate) fn write(
        &mut self,
        region: &str,
        key: CacheableKey,
        value: Option<EncodedValue>,
        event_id: EventId,
        callback_arg: Option<EncodedValue>,
    ) {
        let Some(entries) = self.regions.get_mut(region).map(|r| &mut r.data) else {
            return;
        };
        let kind = match &value {
            Some(v) => match entries.insert(key.clone(), v.clone()) {
                Some(_) => EventKind::Update,
                None => EventKind::Create,
            },
            None => {
                entries.remove(&key);
                EventKind::Destroy
            }
        };

        let ClusterState {
            interests,
            queues,
            connections,
            servers,
            ..
        } = self;
        for (client, list) in interests.iter() {
            let matching: Vec<&ClientInterest> = list
                .iter()
                .filter(|i| i.region == region && interest_matches(&i.interest, &key))
                .collect();
            if matching.is_empty() {
                continue;
            }
            let with_values = matching.iter().any(|i| i.receive_values);
            let event = RegionEvent {
                event_id: event_id.clone(),
                region: region.to_string(),
                key: key.clone(),
                kind: if with_values || kind == EventKind::Destroy {
                    kind
                } else {
                    EventKind::Invalidate
                },
                value: if with_values { value.clone() } else { None },
                callback_arg: callback_arg.clone(),
            };
            for ((owner, location), queue) in queues.iter_mut() {
                if owner != client || !servers.get(location).is_some_and(|s| s.alive) {
                    continue;
                }
                queue.pending.push_back(event.clone());
                if queue.primary && queue.ready {
                    if let Some(connection) = queue.connection.and_then(|id| connections.get(&id)) {
                        send_event(connection, &event);
                    }
                }
            }
        }
    }

    pub(crate) fn next_server_event(&self) -> EventId {
        self.event_ids.next(1)
    }
}

fn interest_matches(interest: &Interest, key: &CacheableKey) -> bool {
    match interest {
        Interest::AllKeys => true,
        Interest::Keys(keys) => keys.contains(key),
        Interest::Regex(pattern) => Regex::new(pattern)
            .map(|r| r.is_match(&key.to_string()))
            .unwrap_or(false),
    }
}

fn send_event(connection: &SimConnection, event: &RegionEvent) {
    if let Ok(frame) = ServerMessage::Event(event.clone()).encode() {
        // receiver gone means the client is already closing
        let _ = connection.tx.send(frame);
    }
}
