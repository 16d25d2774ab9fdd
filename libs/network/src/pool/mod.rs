//! # Connection Pool
//!
//! Named pool of operation connections to the servers of one cluster.
//!
//! ## Bounds
//!
//! While the pool is open, `min ≤ idle + in_use + pending ≤ max`, where
//! `pending` counts slots reserved for connections being opened or replaced.
//! Slots are reserved under the state lock; every connect, ping and close
//! happens after the lock is released.
//!
//! ## Acquire
//!
//! ```text
//! acquire(target, excluded)
//!   ├─ idle connection to target (or any server)        → InUse
//!   ├─ below max                                        → open new
//!   ├─ at max, target given, idle conn to other server  → close it, open to target
//!   └─ at max                                           → wait ≤ free_connection_timeout
//!                                                          then PoolExhausted
//! ```
//!
//! Connections come back through the [`PooledConnection`] guard. Background
//! maintenance lives in [`maintenance`].

pub mod guard;
pub mod maintenance;
pub mod registry;

pub use guard::PooledConnection;
pub use registry::PoolRegistry;

use cache_codec::{ClientIdentity, ConflationPreference, ConnectionKind, Credentials, Handshake};
use cache_config::PoolSettings;
use cache_types::ServerLocation;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionState, ConnectionTimeouts};
use crate::discovery::{ServerSelector, ServerSource};
use crate::scheduler::{Scheduler, TaskGroup};
use crate::transports::Connector;
use crate::{Result, TransportError};

/// What every pool of a session shares
#[derive(Clone)]
pub struct PoolContext {
    pub connector: Arc<dyn Connector>,
    pub identity: ClientIdentity,
    pub conflation: ConflationPreference,
    pub credentials: Option<Credentials>,
}

#[derive(Default)]
pub(crate) struct PoolState {
    pub(crate) idle: VecDeque<Connection>,
    pub(crate) in_use: usize,
    pub(crate) pending: usize,
}

impl PoolState {
    pub(crate) fn total(&self) -> usize {
        self.idle.len() + self.in_use + self.pending
    }
}

#[derive(Default)]
pub(crate) struct PoolCounters {
    pub(crate) created: AtomicU64,
    pub(crate) closed: AtomicU64,
    pub(crate) exhausted: AtomicU64,
    pub(crate) waits: AtomicU64,
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub pending: usize,
    pub live: usize,
    pub min: usize,
    pub max: Option<usize>,
    pub created: u64,
    pub closed: u64,
    pub exhausted: u64,
    pub waits: u64,
}

enum Checkout {
    Ready(Connection),
    Open { evict: Option<Connection> },
    Wait,
}

pub struct Pool {
    name: String,
    settings: PoolSettings,
    context: PoolContext,
    selector: ServerSelector,
    timeouts: ConnectionTimeouts,
    pub(crate) state: Mutex<PoolState>,
    available: Notify,
    closed: AtomicBool,
    tasks: TaskGroup,
    pub(crate) counters: PoolCounters,
}

impl Pool {
    /// Build a pool; maintenance starts with [`Pool::start`]
    pub fn new(
        name: impl Into<String>,
        settings: PoolSettings,
        context: PoolContext,
        scheduler: &Scheduler,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        if let Some(max) = settings.max_connections {
            if max == 0 || settings.min_connections > max {
                return Err(TransportError::configuration(
                    format!(
                        "pool '{}': min {} / max {} is not a valid range",
                        name, settings.min_connections, max
                    ),
                    Some("max_connections"),
                ));
            }
        }
        let timeouts = ConnectionTimeouts {
            connect: settings.connect_timeout(),
            read: settings.read_timeout(),
        };
        let selector = ServerSelector::new(
            ServerSource::from_settings(&settings)?,
            settings.server_group.clone(),
            context.connector.clone(),
            timeouts,
        )?;
        Ok(Arc::new(Self {
            tasks: scheduler.task_group(format!("pool:{}", name)),
            name,
            settings,
            context,
            selector,
            timeouts,
            state: Mutex::new(PoolState::default()),
            available: Notify::new(),
            closed: AtomicBool::new(false),
            counters: PoolCounters::default(),
        }))
    }

    /// Open the minimum connections and schedule maintenance
    pub async fn start(self: &Arc<Self>) {
        if self.selector.uses_locators() {
            if let Err(e) = self.selector.all_servers().await {
                warn!(pool = %self.name, error = %e, "Could not list servers");
            }
        }
        self.restore_min_connections().await;
        maintenance::schedule(self);
        info!(
            pool = %self.name,
            min = self.settings.min_connections,
            max = ?self.settings.max_connections,
            live = self.live_connections(),
            "Pool started"
        );
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn selector(&self) -> &ServerSelector {
        &self.selector
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.context.identity
    }

    pub fn tasks(&self) -> &TaskGroup {
        &self.tasks
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn max_connections(&self) -> usize {
        self.settings.max_connections.unwrap_or(usize::MAX)
    }

    /// Connection to any server chosen by the selector
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        self.acquire_to(None, &HashSet::new()).await
    }

    /// Connection to `target` when given, else to any server not in `excluded`
    pub async fn acquire_to(
        self: &Arc<Self>,
        target: Option<&ServerLocation>,
        excluded: &HashSet<ServerLocation>,
    ) -> Result<PooledConnection> {
        let deadline = Instant::now() + self.settings.free_connection_timeout();

        loop {
            // enabled before the closed check; close() wakes registered waiters only
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return Err(TransportError::closed(format!("pool '{}'", self.name)));
            }

            let (checkout, stale) = self.checkout(target, excluded);
            for connection in stale {
                self.discard(connection).await;
            }

            match checkout {
                Checkout::Ready(connection) => {
                    connection.set_state(ConnectionState::InUse);
                    connection.touch();
                    return Ok(PooledConnection::new(self.clone(), connection));
                }
                Checkout::Open { evict } => {
                    if let Some(old) = evict {
                        debug!(
                            pool = %self.name,
                            evicted = %old.location(),
                            target = ?target.map(|t| t.to_string()),
                            "Closing idle connection to make room"
                        );
                        self.discard(old).await;
                    }
                    let connection = match self.open_connection(target, excluded).await {
                        Ok(connection) => connection,
                        Err(e) => {
                            self.release_slot();
                            return Err(e);
                        }
                    };
                    {
                        let mut state = self.state.lock();
                        state.pending -= 1;
                        state.in_use += 1;
                    }
                    return Ok(PooledConnection::new(self.clone(), connection));
                }
                Checkout::Wait => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(self.exhausted());
                    }
                    self.counters.waits.fetch_add(1, Ordering::Relaxed);
                    if tokio::time::timeout(deadline - now, notified).await.is_err() {
                        return Err(self.exhausted());
                    }
                }
            }
        }
    }

    fn exhausted(&self) -> TransportError {
        self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
        warn!(
            pool = %self.name,
            live = self.live_connections(),
            waited_ms = self.settings.free_connection_timeout_ms,
            "Pool exhausted"
        );
        TransportError::resource_exhausted(
            format!("pool '{}'", self.name),
            format!(
                "no connection freed within {}ms",
                self.settings.free_connection_timeout_ms
            ),
        )
    }

    /// Decide under the lock; returns unusable idle connections to close
    fn checkout(
        &self,
        target: Option<&ServerLocation>,
        excluded: &HashSet<ServerLocation>,
    ) -> (Checkout, Vec<Connection>) {
        let mut state = self.state.lock();
        let mut stale = Vec::new();
        let mut index = 0;
        while index < state.idle.len() {
            if !state.idle[index].is_usable() {
                if let Some(connection) = state.idle.remove(index) {
                    stale.push(connection);
                }
                continue;
            }
            let location = state.idle[index].location();
            let matches = match target {
                Some(target) => location == target,
                None => !excluded.contains(location),
            };
            if matches {
                if let Some(connection) = state.idle.remove(index) {
                    state.in_use += 1;
                    return (Checkout::Ready(connection), stale);
                }
            }
            index += 1;
        }

        if state.total() < self.max_connections() {
            state.pending += 1;
            return (Checkout::Open { evict: None }, stale);
        }

        if target.is_some() {
            if let Some(evict) = state.idle.pop_front() {
                state.pending += 1;
                return (Checkout::Open { evict: Some(evict) }, stale);
            }
        }
        (Checkout::Wait, stale)
    }

    pub(crate) async fn open_connection(
        &self,
        target: Option<&ServerLocation>,
        excluded: &HashSet<ServerLocation>,
    ) -> Result<Connection> {
        let location = match target {
            Some(target) => target.clone(),
            None => self.selector.select_server(excluded).await?,
        };
        let connection = Connection::open(
            self.context.connector.as_ref(),
            &location,
            self.handshake(ConnectionKind::Operations),
            self.timeouts,
        )
        .await?;
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!(pool = %self.name, peer = %location, connection = connection.id(), "Opened pool connection");
        Ok(connection)
    }

    fn handshake(&self, kind: ConnectionKind) -> Handshake {
        Handshake {
            client: self.context.identity.clone(),
            kind,
            conflation: self.context.conflation,
            credentials: self.context.credentials.clone(),
        }
    }

    /// Open a subscription queue connection; it is not counted by the pool
    pub async fn connect_queue(&self, location: &ServerLocation, primary: bool) -> Result<Connection> {
        if self.is_closed() {
            return Err(TransportError::closed(format!("pool '{}'", self.name)));
        }
        Connection::open(
            self.context.connector.as_ref(),
            location,
            self.handshake(ConnectionKind::Queue { primary }),
            self.timeouts,
        )
        .await
    }

    /// Give back a reserved slot whose connection never materialized
    pub(crate) fn release_slot(&self) {
        self.state.lock().pending -= 1;
        self.available.notify_one();
    }

    /// Called by the guard when a connection comes back
    pub(crate) fn check_in(&self, connection: Connection, invalidate: bool) {
        let keep = !invalidate && !self.is_closed() && connection.is_usable();
        {
            let mut state = self.state.lock();
            state.in_use -= 1;
            if keep {
                connection.set_state(ConnectionState::Idle);
                connection.touch();
                state.idle.push_back(connection);
                drop(state);
                self.available.notify_one();
                return;
            }
        }
        self.available.notify_one();
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
        debug!(pool = %self.name, connection = connection.id(), invalidate, "Discarding connection");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { connection.close().await });
            }
            Err(_) => connection.set_state(ConnectionState::Closed),
        }
    }

    /// Close a connection that is no longer counted by the pool
    pub(crate) async fn discard(&self, connection: Connection) {
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
        connection.close().await;
    }

    /// Close every idle connection to a failed server
    pub async fn invalidate_server(&self, location: &ServerLocation) -> usize {
        let removed: Vec<Connection> = {
            let mut state = self.state.lock();
            let (gone, keep): (VecDeque<_>, VecDeque<_>) = state
                .idle
                .drain(..)
                .partition(|c| c.location() == location);
            state.idle = keep;
            gone.into_iter().collect()
        };
        let count = removed.len();
        for connection in removed {
            self.discard(connection).await;
        }
        if count > 0 {
            self.available.notify_waiters();
            info!(pool = %self.name, server = %location, closed = count, "Invalidated connections to server");
        }
        count
    }

    pub fn live_connections(&self) -> usize {
        self.state.lock().total()
    }

    /// Servers of the idle connections, one entry per connection
    pub fn idle_servers(&self) -> Vec<ServerLocation> {
        self.state
            .lock()
            .idle
            .iter()
            .map(|c| c.location().clone())
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            idle: state.idle.len(),
            in_use: state.in_use,
            pending: state.pending,
            live: state.total(),
            min: self.settings.min_connections,
            max: self.settings.max_connections,
            created: self.counters.created.load(Ordering::Relaxed),
            closed: self.counters.closed.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
            waits: self.counters.waits.load(Ordering::Relaxed),
        }
    }

    /// Stop maintenance, fail waiting acquires and close idle connections.
    /// Connections in use close when their guards are dropped.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tasks.cancel();
        self.available.notify_waiters();
        let idle: Vec<Connection> = self.state.lock().idle.drain(..).collect();
        let count = idle.len();
        for connection in idle {
            self.discard(connection).await;
        }
        info!(pool = %self.name, closed = count, "Pool closed");
    }

    pub(crate) fn notify_available(&self) {
        self.available.notify_one();
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests;
