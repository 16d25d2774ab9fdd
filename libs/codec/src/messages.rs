//! # Wire Messages
//!
//! Envelopes exchanged between the client and cache servers or locators.
//!
//! ```text
//! client ──Request{correlation_id, region, Operation}──▶ server
//! client ◀──ServerMessage::Response{correlation_id, network_hop, body}── server
//! client ◀──ServerMessage::Event(RegionEvent)── server (queue connections only)
//! client ──LocatorRequest──▶ locator ──LocatorResponse──▶ client
//! ```
//!
//! `network_hop` is set by a server that served a keyed operation for a bucket
//! it does not own as primary. The client treats it as a staleness signal for
//! its bucket map.

use cache_types::{
    BucketId, CacheableKey, EventId, EventKind, FixedPartition, Interest, ServerLocation,
};
use serde::{Deserialize, Serialize};

use crate::registry::EncodedValue;

pub type CorrelationId = u64;

/// Identity presented on every connection handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub member_id: String,
    pub durable_id: Option<String>,
    pub durable_timeout_ms: u64,
}

impl ClientIdentity {
    pub fn is_durable(&self) -> bool {
        self.durable_id.is_some()
    }

    /// Key servers use to find this client's subscription queues
    pub fn queue_key(&self) -> &str {
        self.durable_id.as_deref().unwrap_or(&self.member_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionKind {
    /// Request/response connection owned by a pool
    Operations,
    /// Server push stream carrying subscription events
    Queue { primary: bool },
}

/// Conflation requested for the subscription queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflationPreference {
    Server,
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub client: ClientIdentity,
    pub kind: ConnectionKind,
    pub conflation: ConflationPreference,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FunctionOptions {
    pub has_result: bool,
    pub is_ha: bool,
    pub optimize_for_write: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Handshake(Handshake),
    Ping,
    Get {
        key: CacheableKey,
    },
    Put {
        key: CacheableKey,
        value: EncodedValue,
        event_id: EventId,
    },
    Destroy {
        key: CacheableKey,
        event_id: EventId,
    },
    GetAll {
        keys: Vec<CacheableKey>,
    },
    PutAll {
        entries: Vec<(CacheableKey, EncodedValue)>,
        event_id: EventId,
    },
    RemoveAll {
        keys: Vec<CacheableKey>,
        event_id: EventId,
    },
    ExecuteFunction {
        function_id: String,
        filter: Vec<CacheableKey>,
        buckets: Vec<BucketId>,
        args: Option<EncodedValue>,
        options: FunctionOptions,
    },
    GetPartitionAttributes,
    GetBucketLocations,
    RegisterInterest {
        interest: Interest,
        durable: bool,
        receive_values: bool,
    },
    UnregisterInterest {
        interest: Interest,
    },
    MakePrimary {
        ready_for_events: bool,
    },
    ReadyForEvents,
    PeriodicAck {
        events: Vec<EventId>,
    },
    CloseConnection {
        keep_alive: bool,
    },
}

impl Operation {
    /// Short name used in logs and timeout errors
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Handshake(_) => "handshake",
            Operation::Ping => "ping",
            Operation::Get { .. } => "get",
            Operation::Put { .. } => "put",
            Operation::Destroy { .. } => "destroy",
            Operation::GetAll { .. } => "get_all",
            Operation::PutAll { .. } => "put_all",
            Operation::RemoveAll { .. } => "remove_all",
            Operation::ExecuteFunction { .. } => "execute_function",
            Operation::GetPartitionAttributes => "get_partition_attributes",
            Operation::GetBucketLocations => "get_bucket_locations",
            Operation::RegisterInterest { .. } => "register_interest",
            Operation::UnregisterInterest { .. } => "unregister_interest",
            Operation::MakePrimary { .. } => "make_primary",
            Operation::ReadyForEvents => "ready_for_events",
            Operation::PeriodicAck { .. } => "periodic_ack",
            Operation::CloseConnection { .. } => "close_connection",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub correlation_id: CorrelationId,
    pub region: String,
    pub callback_arg: Option<EncodedValue>,
    /// Set when the request replays a previously attempted write
    pub is_retry: bool,
    pub operation: Operation,
}

/// Failure reported by a server for a request or a single key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerError {
    NotPrimary { bucket: Option<BucketId> },
    Rebalancing,
    ServerShuttingDown,
    RegionNotFound { region: String },
    AuthenticationRequired,
    AuthenticationFailed { message: String },
    NotAuthorized { message: String },
    Application { class: String, message: String },
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::NotPrimary { bucket: Some(b) } => write!(f, "not primary for {}", b),
            ServerError::NotPrimary { bucket: None } => write!(f, "not primary"),
            ServerError::Rebalancing => write!(f, "bucket is rebalancing"),
            ServerError::ServerShuttingDown => write!(f, "server is shutting down"),
            ServerError::RegionNotFound { region } => write!(f, "region '{}' not found", region),
            ServerError::AuthenticationRequired => write!(f, "authentication required"),
            ServerError::AuthenticationFailed { message } => {
                write!(f, "authentication failed: {}", message)
            }
            ServerError::NotAuthorized { message } => write!(f, "not authorized: {}", message),
            ServerError::Application { class, message } => write!(f, "{}: {}", class, message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionAttributes {
    pub total_buckets: u32,
    pub colocated_with: Option<String>,
    pub fixed_partitions: Vec<FixedPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketServerLocation {
    pub location: ServerLocation,
    pub is_primary: bool,
    pub server_groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketLocations {
    pub bucket_id: BucketId,
    pub servers: Vec<BucketServerLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseBody {
    HandshakeAccepted {
        server_member_id: String,
        durable_reconnect: bool,
    },
    Pong,
    Ok,
    Value(Option<EncodedValue>),
    Bulk {
        values: Vec<(CacheableKey, Option<EncodedValue>)>,
        failures: Vec<(CacheableKey, ServerError)>,
    },
    FunctionResults {
        results: Vec<EncodedValue>,
    },
    PartitionAttributes(PartitionAttributes),
    BucketLocations(Vec<BucketLocations>),
    Error(ServerError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub correlation_id: CorrelationId,
    pub network_hop: bool,
    pub body: ResponseBody,
}

impl Response {
    pub fn new(correlation_id: CorrelationId, body: ResponseBody) -> Self {
        Self {
            correlation_id,
            network_hop: false,
            body,
        }
    }

    pub fn with_hop(mut self, network_hop: bool) -> Self {
        self.network_hop = network_hop;
        self
    }
}

/// Change pushed to a subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionEvent {
    pub event_id: EventId,
    pub region: String,
    pub key: CacheableKey,
    pub kind: EventKind,
    pub value: Option<EncodedValue>,
    pub callback_arg: Option<EncodedValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    Response(Response),
    Event(RegionEvent),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocatorRequest {
    ServerForConnection {
        server_group: Option<String>,
        excluded: Vec<ServerLocation>,
    },
    QueueServers {
        server_group: Option<String>,
        count: Option<u32>,
        excluded: Vec<ServerLocation>,
    },
    ServerList {
        server_group: Option<String>,
    },
    LocatorList,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocatorResponse {
    Server(Option<ServerLocation>),
    Servers(Vec<ServerLocation>),
    Locators(Vec<ServerLocation>),
}
