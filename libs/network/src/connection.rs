//! # Server Connections
//!
//! A [`Connection`] owns one transport stream to one server. Every connection
//! starts with a handshake carrying the client identity, so servers can tie
//! operations and subscription queues to the same client.
//!
//! Operation connections are used by one caller at a time (the pool enforces
//! that) and run strict request/response exchanges matched by correlation id.
//! Queue connections are receive-only after the handshake.
//!
//! ## State Transitions
//!
//! ```text
//! Idle ⇄ InUse → Closing → Closed
//!   └──────────────↗
//! ```

use cache_codec::{
    ConnectionKind, CorrelationId, Handshake, Operation, Request, Response, ResponseBody,
    ServerError, ServerMessage,
};
use cache_types::ServerLocation;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::transports::{Connector, Transport};
use crate::{Result, TransportError};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    InUse = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Idle,
            1 => ConnectionState::InUse,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Timeouts applied while opening and using a connection
#[derive(Debug, Clone, Copy)]
pub struct ConnectionTimeouts {
    pub connect: Duration,
    pub read: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            read: Duration::from_secs(10),
        }
    }
}

pub struct Connection {
    id: u64,
    location: ServerLocation,
    kind: ConnectionKind,
    transport: Box<dyn Transport>,
    read_timeout: Duration,
    created_at: Instant,
    last_used: Mutex<Instant>,
    state: AtomicU8,
    next_correlation: AtomicU64,
    server_member_id: String,
    durable_reconnect: bool,
}

impl Connection {
    /// Connect and complete the handshake
    pub async fn open(
        connector: &dyn Connector,
        location: &ServerLocation,
        handshake: Handshake,
        timeouts: ConnectionTimeouts,
    ) -> Result<Self> {
        let transport = connector.connect(location, timeouts.connect).await?;
        let now = Instant::now();
        let mut connection = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            location: location.clone(),
            kind: handshake.kind,
            transport,
            read_timeout: timeouts.read,
            created_at: now,
            last_used: Mutex::new(now),
            state: AtomicU8::new(ConnectionState::InUse as u8),
            next_correlation: AtomicU64::new(1),
            server_member_id: String::new(),
            durable_reconnect: false,
        };

        let accepted = match connection.request("", Operation::Handshake(handshake)).await {
            Ok(response) => response,
            Err(e) => {
                connection.close().await;
                return Err(e);
            }
        };

        match accepted.body {
            ResponseBody::HandshakeAccepted {
                server_member_id,
                durable_reconnect,
            } => {
                connection.server_member_id = server_member_id;
                connection.durable_reconnect = durable_reconnect;
            }
            ResponseBody::Error(
                error @ (ServerError::AuthenticationRequired
                | ServerError::AuthenticationFailed { .. }
                | ServerError::NotAuthorized { .. }),
            ) => {
                connection.close().await;
                return Err(TransportError::security(error.to_string()));
            }
            other => {
                connection.close().await;
                return Err(TransportError::protocol(format!(
                    "Unexpected handshake reply from {}: {:?}",
                    location, other
                )));
            }
        }

        debug!(
            connection = connection.id,
            peer = %connection.location,
            kind = ?connection.kind,
            durable_reconnect = connection.durable_reconnect,
            "Connection established"
        );
        Ok(connection)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn location(&self) -> &ServerLocation {
        &self.location
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Member id the server reported in the handshake
    pub fn server_member_id(&self) -> &str {
        &self.server_member_id
    }

    /// True when the server resumed an existing durable queue for this client
    pub fn is_durable_reconnect(&self) -> bool {
        self.durable_reconnect
    }

    pub fn is_usable(&self) -> bool {
        matches!(self.state(), ConnectionState::Idle | ConnectionState::InUse)
            && self.transport.is_healthy()
    }

    /// Send an operation for `region` and wait for its response
    pub async fn request(&self, region: &str, operation: Operation) -> Result<Response> {
        self.execute(Request {
            correlation_id: 0,
            region: region.to_string(),
            callback_arg: None,
            is_retry: false,
            operation,
        })
        .await
    }

    /// Send a fully built request; the correlation id is assigned here
    pub async fn execute(&self, mut request: Request) -> Result<Response> {
        if !self.is_usable() {
            return Err(TransportError::closed(format!("connection {} to {}", self.id, self.location)));
        }
        let correlation_id: CorrelationId = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        request.correlation_id = correlation_id;
        let operation = request.operation.name();
        let frame = request.encode()?;

        self.touch();
        self.transport.send_timeout(&frame, self.read_timeout).await?;
        trace!(connection = self.id, peer = %self.location, operation, correlation_id, "Request sent");

        let deadline = Instant::now() + self.read_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::timeout(operation, self.read_timeout.as_millis() as u64));
            }
            let frame = match self.transport.receive_timeout(remaining).await {
                Ok(frame) => frame,
                Err(TransportError::Timeout { .. }) => {
                    return Err(TransportError::timeout(
                        operation,
                        self.read_timeout.as_millis() as u64,
                    ))
                }
                Err(e) => return Err(e),
            };
            match ServerMessage::decode(&frame)? {
                ServerMessage::Response(response) if response.correlation_id == correlation_id => {
                    self.touch();
                    return Ok(response);
                }
                ServerMessage::Response(response) => {
                    warn!(
                        connection = self.id,
                        expected = correlation_id,
                        got = response.correlation_id,
                        "Discarding stale response"
                    );
                }
                ServerMessage::Event(event) => {
                    debug!(connection = self.id, event = %event.event_id, "Ignoring event on operation connection");
                }
            }
        }
    }

    /// Health probe
    pub async fn ping(&self) -> Result<()> {
        let response = self.request("", Operation::Ping).await?;
        match response.body {
            ResponseBody::Pong => Ok(()),
            other => Err(TransportError::protocol(format!(
                "Unexpected ping reply from {}: {:?}",
                self.location, other
            ))),
        }
    }

    /// Next pushed message on a queue connection; blocks until one arrives
    pub async fn next_message(&self) -> Result<ServerMessage> {
        let frame = self.transport.receive().await?;
        Ok(ServerMessage::decode(&frame)?)
    }

    pub async fn close(&self) {
        match self.state() {
            ConnectionState::Closing | ConnectionState::Closed => return,
            _ => self.set_state(ConnectionState::Closing),
        }
        if let Err(e) = self.transport.close().await {
            debug!(connection = self.id, error = %e, "Error closing transport");
        }
        self.set_state(ConnectionState::Closed);
        debug!(connection = self.id, peer = %self.location, "Connection closed");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}
