//! TCP Transport Implementation
//!
//! Length-prefixed framing over a split `TcpStream`: a big-endian `u32` length
//! followed by the message bytes. The read and write halves are locked
//! separately so a queue reader can block in `receive` while requests go out.

use crate::{Result, TransportError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use cache_codec::MAX_FRAME_SIZE;
use cache_types::ServerLocation;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Connector, Transport, TransportInfo, TransportType};

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Maximum message size
    pub max_message_size: usize,
    /// Initial buffer size for reading and writing
    pub buffer_size: usize,
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_FRAME_SIZE,
            buffer_size: 64 * 1024, // 64KB
            nodelay: true,
        }
    }
}

struct ReadState {
    stream: OwnedReadHalf,
    buffer: BytesMut,
}

struct WriteState {
    stream: OwnedWriteHalf,
    buffer: BytesMut,
}

/// TCP connection to one peer
pub struct TcpTransport {
    remote: ServerLocation,
    config: TcpConfig,
    reader: Mutex<ReadState>,
    writer: Mutex<WriteState>,
    open: AtomicBool,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, remote: ServerLocation, config: TcpConfig) -> Self {
        if config.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY: {}", e);
            }
        }
        let (read_half, write_half) = stream.into_split();
        Self {
            remote,
            reader: Mutex::new(ReadState {
                stream: read_half,
                buffer: BytesMut::with_capacity(config.buffer_size),
            }),
            writer: Mutex::new(WriteState {
                stream: write_half,
                buffer: BytesMut::with_capacity(config.buffer_size),
            }),
            config,
            open: AtomicBool::new(true),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    fn fail(&self, message: &str, error: std::io::Error) -> TransportError {
        self.open.store(false, Ordering::Release);
        TransportError::connection_with_source(message, Some(&self.remote), error)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, message: &[u8]) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::closed(format!("connection to {}", self.remote)));
        }
        if message.len() > self.config.max_message_size {
            return Err(TransportError::protocol(format!(
                "Message size {} exceeds maximum {}",
                message.len(),
                self.config.max_message_size
            )));
        }

        let mut state = self.writer.lock().await;
        let WriteState { stream, buffer } = &mut *state;

        // Clear and reuse write buffer
        buffer.clear();
        buffer.extend_from_slice(&(message.len() as u32).to_be_bytes());
        buffer.extend_from_slice(message);

        // Single write call for better performance
        if let Err(e) = stream.write_all(&buffer[..]).await {
            return Err(self.fail("Failed to write message", e));
        }
        if let Err(e) = stream.flush().await {
            return Err(self.fail("Failed to flush TCP stream", e));
        }

        let total = self
            .bytes_sent
            .fetch_add(4 + message.len() as u64, Ordering::Relaxed);
        debug!(
            peer = %self.remote,
            bytes = message.len(),
            total_sent = total + 4 + message.len() as u64,
            "Sent message over TCP"
        );
        Ok(())
    }

    async fn receive(&self) -> Result<Bytes> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::closed(format!("connection to {}", self.remote)));
        }
        let mut state = self.reader.lock().await;
        let ReadState { stream, buffer } = &mut *state;

        // Read message length prefix
        let mut len_bytes = [0u8; 4];
        if let Err(e) = stream.read_exact(&mut len_bytes).await {
            return Err(self.fail("Failed to read message length", e));
        }
        let message_len = u32::from_be_bytes(len_bytes) as usize;

        if message_len > self.config.max_message_size {
            self.open.store(false, Ordering::Release);
            return Err(TransportError::protocol(format!(
                "Message size {} exceeds maximum {}",
                message_len, self.config.max_message_size
            )));
        }

        buffer.clear();
        buffer.resize(message_len, 0);
        if let Err(e) = stream.read_exact(&mut buffer[..]).await {
            return Err(self.fail("Failed to read message data", e));
        }

        self.bytes_received
            .fetch_add(4 + message_len as u64, Ordering::Relaxed);
        debug!(peer = %self.remote, bytes = message_len, "Received message over TCP");

        Ok(buffer.split_to(message_len).freeze())
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::AcqRel) {
            let mut state = self.writer.lock().await;
            if let Err(e) = state.stream.shutdown().await {
                warn!("Error shutting down TCP connection: {}", e);
            }
            info!("Closed TCP connection to {}", self.remote);
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn transport_info(&self) -> TransportInfo {
        TransportInfo {
            transport_type: TransportType::Tcp,
            remote: self.remote.clone(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Opens TCP transports
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: TcpConfig,
}

impl TcpConnector {
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        location: &ServerLocation,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>> {
        debug!(peer = %location, "Connecting over TCP");
        let stream = tokio::time::timeout(timeout, TcpStream::connect(location.address()))
            .await
            .map_err(|_| TransportError::timeout("TCP connect", timeout.as_millis() as u64))?
            .map_err(|e| {
                TransportError::connection_with_source("Failed to connect", Some(location), e)
            })?;
        Ok(Box::new(TcpTransport::new(
            stream,
            location.clone(),
            self.config.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn frames_round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let transport =
                TcpTransport::new(stream, ServerLocation::new("client", 0), TcpConfig::default());
            let message = transport.receive().await.unwrap();
            transport.send(&message).await.unwrap();
        });

        let connector = TcpConnector::default();
        let transport = connector
            .connect(&ServerLocation::new("127.0.0.1", port), Duration::from_secs(5))
            .await
            .unwrap();
        transport.send(b"echo me").await.unwrap();
        let reply = transport.receive_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(&reply[..], b"echo me");
        assert_eq!(transport.transport_info().bytes_sent, 4 + 7);

        server.await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_healthy());
        assert!(transport.send(b"late").await.is_err());
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = TcpConnector::default()
            .connect(&ServerLocation::new("127.0.0.1", port), Duration::from_secs(2))
            .await;
        let error = result.err().unwrap();
        assert!(error.is_retryable());
    }
}
