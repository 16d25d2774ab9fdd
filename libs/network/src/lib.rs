//! # Cache Network
//!
//! Everything between a region operation and the bytes on the wire:
//!
//! - [`transports`]: message transports and connectors (TCP)
//! - [`connection`]: handshaked request/response connections to one server
//! - [`discovery`]: locator queries and server selection
//! - [`pool`]: bounded connection pools with background maintenance
//! - [`scheduler`]: cancellable periodic tasks shared by the whole session
//! - [`test_utils`]: an in-memory cluster implementing the server side
//!
//! ```text
//! Pool ──acquire──▶ Connection ──Request──▶ Transport ──▶ server
//!   │                                            ▲
//!   └──select_server──▶ ServerSelector ──────────┘ (locators)
//! ```

pub mod connection;
pub mod discovery;
pub mod error;
pub mod pool;
pub mod scheduler;
pub mod test_utils;
pub mod transports;

pub use connection::{Connection, ConnectionState, ConnectionTimeouts};
pub use discovery::{LocatorClient, ServerSelector, ServerSource};
pub use error::{Result, TransportError};
pub use pool::{Pool, PoolContext, PoolRegistry, PoolStats, PooledConnection};
pub use scheduler::{Scheduler, StopSignal, TaskControl, TaskGroup};
pub use transports::{Connector, TcpConnector, Transport, TransportInfo, TransportType};
