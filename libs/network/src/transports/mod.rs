//! Transport Layer
//!
//! Byte-stream abstraction underneath every [`Connection`](crate::Connection).
//! A [`Connector`] opens a [`Transport`] to a server or locator; the TCP
//! implementation lives in [`tcp`], TLS implementations plug in behind the same
//! two traits, and the in-memory cluster in `test_utils` implements them for
//! tests.
//!
//! Transports move whole messages: framing is the transport's business, the
//! envelope format is the codec's.

use crate::{Result, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use cache_types::ServerLocation;
use std::time::Duration;

pub mod tcp;

pub use tcp::{TcpConfig, TcpConnector, TcpTransport};

/// Message transport to one peer
///
/// `send` and `receive` may be called concurrently from different tasks;
/// implementations serialize each direction independently.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send message over the transport
    async fn send(&self, message: &[u8]) -> Result<()>;

    /// Send message with timeout
    async fn send_timeout(&self, message: &[u8], timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.send(message))
            .await
            .map_err(|_| TransportError::timeout("send", timeout.as_millis() as u64))?
    }

    /// Receive the next message from the transport
    async fn receive(&self) -> Result<Bytes>;

    /// Receive message with timeout
    async fn receive_timeout(&self, timeout: Duration) -> Result<Bytes> {
        tokio::time::timeout(timeout, self.receive())
            .await
            .map_err(|_| TransportError::timeout("receive", timeout.as_millis() as u64))?
    }

    /// Close the transport; later sends and receives fail
    async fn close(&self) -> Result<()>;

    /// Check if transport is healthy
    fn is_healthy(&self) -> bool;

    /// Get transport-specific information
    fn transport_info(&self) -> TransportInfo;
}

/// Opens transports to servers and locators
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, location: &ServerLocation, timeout: Duration)
        -> Result<Box<dyn Transport>>;
}

/// Transport type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    Tcp,
    InMemory,
}

/// Transport information for diagnostics
#[derive(Debug, Clone)]
pub struct TransportInfo {
    pub transport_type: TransportType,
    pub remote: ServerLocation,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}
