//! In-memory transport to the simulated cluster

use async_trait::async_trait;
use bytes::Bytes;
use cache_codec::{LocatorRequest, Request, ServerMessage};
use cache_types::ServerLocation;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::server::{ClusterState, SimConnection};
use crate::transports::{Connector, Transport, TransportInfo, TransportType};
use crate::{Result, TransportError};

pub(crate) struct ClusterInner {
    pub(crate) state: Mutex<ClusterState>,
}

impl ClusterInner {
    fn open(self: &Arc<Self>, location: &ServerLocation) -> Result<SimTransport> {
        let mut state = self.state.lock();
        let locator = state.locators.contains(location);
        let server_alive = state.servers.get(location).is_some_and(|s| s.alive);
        if !locator && !server_alive {
            return Err(TransportError::connection("connection refused", Some(location)));
        }
        let id = state.next_connection;
        state.next_connection += 1;
        if !locator {
            state.counters.connections_opened += 1;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        state.connections.insert(
            id,
            SimConnection {
                peer: location.clone(),
                locator,
                tx,
                alive: alive.clone(),
                handshake: None,
            },
        );
        Ok(SimTransport {
            id,
            peer: location.clone(),
            cluster: self.clone(),
            incoming: tokio::sync::Mutex::new(rx),
            open: AtomicBool::new(true),
            alive,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        })
    }

    /// Process one frame from a client and queue the reply
    fn deliver(&self, id: u64, frame: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let Some(connection) = state.connections.get(&id) else {
            return Err(TransportError::connection("connection reset by peer", None));
        };
        let peer = connection.peer.clone();
        let tx = connection.tx.clone();

        if connection.locator {
            let response = state.handle_locator(LocatorRequest::decode(frame)?);
            drop(state);
            let _ = tx.send(response.encode()?);
            return Ok(());
        }

        let request = Request::decode(frame)?;
        let response = state.handle_request(id, &peer, request);
        let delay = state.servers.get(&peer).and_then(|s| s.response_delay);
        drop(state);

        let reply = ServerMessage::Response(response).encode()?;
        match delay {
            Some(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(reply);
                });
            }
            None => {
                let _ = tx.send(reply);
            }
        }
        Ok(())
    }
}

pub struct SimTransport {
    id: u64,
    peer: ServerLocation,
    cluster: Arc<ClusterInner>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    open: AtomicBool,
    alive: Arc<AtomicBool>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

#[async_trait]
impl Transport for SimTransport {
    async fn send(&self, message: &[u8]) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::closed(format!("connection to {}", self.peer)));
        }
        if !self.alive.load(Ordering::Acquire) {
            return Err(TransportError::connection("connection reset by peer", Some(&self.peer)));
        }
        self.bytes_sent.fetch_add(message.len() as u64, Ordering::Relaxed);
        self.cluster.deliver(self.id, message).map_err(|e| match e {
            TransportError::Connection { message, .. } => {
                TransportError::connection(message, Some(&self.peer))
            }
            other => other,
        })
    }

    async fn receive(&self) -> Result<Bytes> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some(frame) => {
                self.bytes_received.fetch_add(frame.len() as u64, Ordering::Relaxed);
                Ok(frame)
            }
            None => Err(TransportError::connection(
                "connection closed by server",
                Some(&self.peer),
            )),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::AcqRel) {
            self.cluster.state.lock().disconnect(self.id);
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.open.load(Ordering::Acquire) && self.alive.load(Ordering::Acquire)
    }

    fn transport_info(&self) -> TransportInfo {
        TransportInfo {
            transport_type: TransportType::InMemory,
            remote: self.peer.clone(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.cluster.state.lock().disconnect(self.id);
        }
    }
}

/// Connector handing out [`SimTransport`]s
pub struct SimConnector {
    pub(crate) cluster: Arc<ClusterInner>,
}

#[async_trait]
impl Connector for SimConnector {
    async fn connect(
        &self,
        location: &ServerLocation,
        _timeout: Duration,
    ) -> Result<Box<dyn Transport>> {
        let transport = self.cluster.open(location)?;
        Ok(Box::new(transport))
    }
}
