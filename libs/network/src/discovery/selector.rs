//! Server selection
//!
//! Picks servers for new pool connections and subscription queues. With
//! locators the choice is delegated to them (they know server load and
//! server groups); with an explicit list the selector rotates through it.
//!
//! Every server a locator names is remembered, so callers that only need a
//! count of known servers read [`ServerSelector::known_servers`] instead of
//! asking a locator.

use cache_codec::{LocatorRequest, LocatorResponse};
use cache_config::PoolSettings;
use cache_types::ServerLocation;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::locator::LocatorClient;
use crate::connection::ConnectionTimeouts;
use crate::transports::Connector;
use crate::{Result, TransportError};

/// Where servers come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerSource {
    Locators(Vec<ServerLocation>),
    Servers(Vec<ServerLocation>),
}

impl ServerSource {
    /// Locators take precedence over explicit servers
    pub fn from_settings(settings: &PoolSettings) -> Result<Self> {
        let parse = |list: &[String], field: &str| -> Result<Vec<ServerLocation>> {
            list.iter()
                .map(|s| {
                    s.parse::<ServerLocation>()
                        .map_err(|e| TransportError::configuration(e.to_string(), Some(field)))
                })
                .collect()
        };
        if !settings.locators.is_empty() {
            return Ok(ServerSource::Locators(parse(&settings.locators, "locators")?));
        }
        if !settings.servers.is_empty() {
            return Ok(ServerSource::Servers(parse(&settings.servers, "servers")?));
        }
        Err(TransportError::configuration(
            "pool needs at least one locator or server",
            Some("locators"),
        ))
    }
}

enum Backend {
    Locators(LocatorClient),
    Servers(Vec<ServerLocation>),
}

pub struct ServerSelector {
    backend: Backend,
    server_group: Option<String>,
    cursor: AtomicUsize,
    known: RwLock<Vec<ServerLocation>>,
}

impl ServerSelector {
    pub fn new(
        source: ServerSource,
        server_group: Option<String>,
        connector: Arc<dyn Connector>,
        timeouts: ConnectionTimeouts,
    ) -> Result<Self> {
        let backend = match source {
            ServerSource::Locators(list) if !list.is_empty() => {
                Backend::Locators(LocatorClient::new(list, connector, timeouts))
            }
            ServerSource::Servers(list) if !list.is_empty() => Backend::Servers(list),
            _ => {
                return Err(TransportError::configuration(
                    "empty server source",
                    Some("servers"),
                ))
            }
        };
        Ok(Self {
            backend,
            server_group: server_group.filter(|g| !g.is_empty()),
            cursor: AtomicUsize::new(0),
            known: RwLock::new(Vec::new()),
        })
    }

    pub fn uses_locators(&self) -> bool {
        matches!(self.backend, Backend::Locators(_))
    }

    pub fn server_group(&self) -> Option<&str> {
        self.server_group.as_deref()
    }

    /// Server for a new connection, never one of `excluded`
    pub async fn select_server(&self, excluded: &HashSet<ServerLocation>) -> Result<ServerLocation> {
        match &self.backend {
            Backend::Locators(client) => {
                let request = LocatorRequest::ServerForConnection {
                    server_group: self.server_group.clone(),
                    excluded: excluded.iter().cloned().collect(),
                };
                match client.query(&request).await? {
                    LocatorResponse::Server(Some(server)) if !excluded.contains(&server) => {
                        self.remember(std::slice::from_ref(&server));
                        Ok(server)
                    }
                    LocatorResponse::Server(_) => Err(TransportError::no_servers(format!(
                        "locators found no server (group {:?}, {} excluded)",
                        self.server_group,
                        excluded.len()
                    ))),
                    other => Err(TransportError::protocol(format!(
                        "Unexpected locator reply: {:?}",
                        other
                    ))),
                }
            }
            Backend::Servers(servers) => {
                let start = self.cursor.fetch_add(1, Ordering::Relaxed);
                (0..servers.len())
                    .map(|offset| &servers[(start + offset) % servers.len()])
                    .find(|s| !excluded.contains(*s))
                    .cloned()
                    .ok_or_else(|| {
                        TransportError::no_servers(format!(
                            "all {} configured servers are excluded",
                            servers.len()
                        ))
                    })
            }
        }
    }

    /// Servers to host subscription queues; `None` asks for all of them
    pub async fn select_queue_servers(
        &self,
        count: Option<usize>,
        excluded: &HashSet<ServerLocation>,
    ) -> Result<Vec<ServerLocation>> {
        let selected = match &self.backend {
            Backend::Locators(client) => {
                let request = LocatorRequest::QueueServers {
                    server_group: self.server_group.clone(),
                    count: count.map(|c| c as u32),
                    excluded: excluded.iter().cloned().collect(),
                };
                match client.query(&request).await? {
                    LocatorResponse::Servers(list) => {
                        self.remember(&list);
                        list.into_iter()
                            .filter(|s| !excluded.contains(s))
                            .take(count.unwrap_or(usize::MAX))
                            .collect()
                    }
                    other => {
                        return Err(TransportError::protocol(format!(
                            "Unexpected locator reply: {:?}",
                            other
                        )))
                    }
                }
            }
            Backend::Servers(servers) => {
                let start = self.cursor.fetch_add(1, Ordering::Relaxed);
                (0..servers.len())
                    .map(|offset| servers[(start + offset) % servers.len()].clone())
                    .filter(|s| !excluded.contains(s))
                    .take(count.unwrap_or(usize::MAX))
                    .collect::<Vec<_>>()
            }
        };
        debug!(requested = ?count, selected = selected.len(), "Selected queue servers");
        Ok(selected)
    }

    /// Every server of the cluster, asking a locator when there are any.
    /// The answer replaces the remembered servers.
    pub async fn all_servers(&self) -> Result<Vec<ServerLocation>> {
        match &self.backend {
            Backend::Locators(client) => {
                let request = LocatorRequest::ServerList {
                    server_group: self.server_group.clone(),
                };
                match client.query(&request).await? {
                    LocatorResponse::Servers(list) => {
                        *self.known.write() = list.clone();
                        Ok(list)
                    }
                    other => Err(TransportError::protocol(format!(
                        "Unexpected locator reply: {:?}",
                        other
                    ))),
                }
            }
            Backend::Servers(servers) => Ok(servers.clone()),
        }
    }

    /// Servers seen so far without any network round trip. For an explicit
    /// list that is the list itself.
    pub fn known_servers(&self) -> Vec<ServerLocation> {
        match &self.backend {
            Backend::Locators(_) => self.known.read().clone(),
            Backend::Servers(servers) => servers.clone(),
        }
    }

    fn remember(&self, servers: &[ServerLocation]) {
        if servers.iter().all(|s| self.known.read().contains(s)) {
            return;
        }
        let mut known = self.known.write();
        for server in servers {
            if !known.contains(server) {
                known.push(server.clone());
            }
        }
    }

    /// Refresh the locator list and the remembered servers; a no-op for
    /// explicit server lists
    pub async fn update_locator_list(&self) -> Result<usize> {
        match &self.backend {
            Backend::Locators(client) => {
                let locators = client.refresh().await?;
                if let Err(e) = self.all_servers().await {
                    debug!(error = %e, "Server list refresh failed");
                }
                Ok(locators)
            }
            Backend::Servers(servers) => Ok(servers.len()),
        }
    }

    pub fn locators(&self) -> Vec<ServerLocation> {
        match &self.backend {
            Backend::Locators(client) => client.locators(),
            Backend::Servers(_) => Vec::new(),
        }
    }
}
