//! Locator queries
//!
//! Locators are asked over short-lived connections: connect, send one
//! request, read one reply, close. A locator that fails is skipped and the
//! next one in the list is tried.

use cache_codec::{LocatorRequest, LocatorResponse};
use cache_types::ServerLocation;
use parking_lot::RwLock;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::connection::ConnectionTimeouts;
use crate::transports::Connector;
use crate::{Result, TransportError};

pub struct LocatorClient {
    locators: RwLock<Vec<ServerLocation>>,
    connector: Arc<dyn Connector>,
    timeouts: ConnectionTimeouts,
    next: AtomicUsize,
}

impl LocatorClient {
    pub fn new(
        locators: Vec<ServerLocation>,
        connector: Arc<dyn Connector>,
        timeouts: ConnectionTimeouts,
    ) -> Self {
        // clients spread their first queries over the locator list
        let start = if locators.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..locators.len())
        };
        Self {
            locators: RwLock::new(locators),
            connector,
            timeouts,
            next: AtomicUsize::new(start),
        }
    }

    pub fn locators(&self) -> Vec<ServerLocation> {
        self.locators.read().clone()
    }

    /// Ask locators in turn until one answers
    pub async fn query(&self, request: &LocatorRequest) -> Result<LocatorResponse> {
        let locators = self.locators();
        if locators.is_empty() {
            return Err(TransportError::configuration("No locators configured", Some("locators")));
        }
        let start = self.next.load(Ordering::Relaxed);
        let frame = request.encode()?;
        let mut last_error = None;

        for offset in 0..locators.len() {
            let index = (start + offset) % locators.len();
            let locator = &locators[index];
            match self.ask(locator, &frame).await {
                Ok(response) => {
                    self.next.store(index, Ordering::Relaxed);
                    return Ok(response);
                }
                Err(e) => {
                    warn!(locator = %locator, error = %e, "Locator did not answer");
                    last_error = Some(e);
                }
            }
        }

        // move on so the next query starts with a different locator
        self.next.store(start.wrapping_add(1), Ordering::Relaxed);
        Err(TransportError::no_servers(format!(
            "no locator responded: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn ask(&self, locator: &ServerLocation, frame: &[u8]) -> Result<LocatorResponse> {
        let transport = self.connector.connect(locator, self.timeouts.connect).await?;
        let reply = async {
            transport.send_timeout(frame, self.timeouts.read).await?;
            let bytes = transport.receive_timeout(self.timeouts.read).await?;
            Ok::<_, TransportError>(LocatorResponse::decode(&bytes)?)
        }
        .await;
        if let Err(e) = transport.close().await {
            debug!(locator = %locator, error = %e, "Error closing locator connection");
        }
        reply
    }

    /// Replace the locator list with the membership the locators report
    pub async fn refresh(&self) -> Result<usize> {
        match self.query(&LocatorRequest::LocatorList).await? {
            LocatorResponse::Locators(list) if !list.is_empty() => {
                let count = list.len();
                let mut locators = self.locators.write();
                if *locators != list {
                    debug!(old = locators.len(), new = count, "Locator list changed");
                    *locators = list;
                }
                Ok(count)
            }
            LocatorResponse::Locators(_) => Ok(self.locators.read().len()),
            other => Err(TransportError::protocol(format!(
                "Unexpected locator list reply: {:?}",
                other
            ))),
        }
    }
}
