//! Pool maintenance
//!
//! Periodic tasks scheduled on the pool's [`TaskGroup`](crate::scheduler::TaskGroup):
//!
//! | task               | period                          | effect                                   |
//! |--------------------|---------------------------------|------------------------------------------|
//! | idle sweep         | `idle_timeout`                  | close idle connections above `min`       |
//! | load conditioning  | `load_conditioning_interval`    | replace idle connections past lifetime   |
//! | ping               | `ping_interval`                 | probe quiet connections, drop dead peers |
//! | locator list       | `update_locator_list_interval`  | refresh locator membership               |
//!
//! Sweeps and pings end by restoring the minimum connection count. Tasks hold
//! weak references, so a dropped pool stops its own maintenance.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::Pool;
use crate::connection::Connection;
use crate::scheduler::TaskControl;

pub(crate) fn schedule(pool: &Arc<Pool>) {
    let settings = pool.settings();

    if let Some(period) = settings.idle_timeout() {
        every(pool, "idle-sweep", period, |pool| async move {
            pool.sweep_idle().await;
            pool.restore_min_connections().await;
        });
    }
    if let Some(period) = settings.load_conditioning_interval() {
        every(pool, "load-conditioning", period, |pool| async move {
            pool.condition_load().await;
        });
    }
    if let Some(period) = settings.ping_interval() {
        every(pool, "ping", period, |pool| async move {
            pool.ping_idle().await;
            pool.restore_min_connections().await;
        });
    }
    if pool.selector().uses_locators() {
        if let Some(period) = settings.update_locator_list_interval() {
            every(pool, "locator-list", period, |pool| async move {
                if let Err(e) = pool.selector().update_locator_list().await {
                    warn!(pool = %pool.name(), error = %e, "Locator list update failed");
                }
            });
        }
    }
}

fn every<F, Fut>(pool: &Arc<Pool>, task: &'static str, period: Duration, body: F)
where
    F: Fn(Arc<Pool>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let weak: Weak<Pool> = Arc::downgrade(pool);
    let body = Arc::new(body);
    pool.tasks().spawn_periodic(task, period, move || {
        let weak = weak.clone();
        let body = body.clone();
        async move {
            match weak.upgrade() {
                Some(pool) if !pool.is_closed() => {
                    body(pool).await;
                    TaskControl::Continue
                }
                _ => TaskControl::Stop,
            }
        }
    });
}

impl Pool {
    /// Close idle connections unused for `idle_timeout`, never dropping
    /// below `min_connections`
    pub async fn sweep_idle(&self) -> usize {
        let Some(idle_timeout) = self.settings().idle_timeout() else {
            return 0;
        };
        let now = Instant::now();
        let expired: Vec<Connection> = {
            let mut state = self.state.lock();
            let mut removable = state.total().saturating_sub(self.settings().min_connections);
            let mut keep = VecDeque::with_capacity(state.idle.len());
            let mut expired = Vec::new();
            for connection in state.idle.drain(..) {
                if removable > 0 && now.duration_since(connection.last_used()) >= idle_timeout {
                    removable -= 1;
                    expired.push(connection);
                } else {
                    keep.push_back(connection);
                }
            }
            state.idle = keep;
            expired
        };

        let count = expired.len();
        for connection in expired {
            self.discard(connection).await;
        }
        if count > 0 {
            debug!(pool = %self.name(), closed = count, live = self.live_connections(), "Closed idle connections");
        }
        count
    }

    /// Replace idle connections older than the load conditioning interval so
    /// connections rebalance as servers join. The slots stay reserved while
    /// replacements open, so the live count does not dip.
    pub async fn condition_load(&self) -> usize {
        let Some(lifetime) = self.settings().load_conditioning_interval() else {
            return 0;
        };
        let now = Instant::now();
        let expired: Vec<Connection> = {
            let mut state = self.state.lock();
            let (old, keep): (VecDeque<_>, VecDeque<_>) = state
                .idle
                .drain(..)
                .partition(|c| now.duration_since(c.created_at()) >= lifetime);
            state.idle = keep;
            state.pending += old.len();
            old.into_iter().collect()
        };

        let mut replaced = 0;
        for old in expired {
            let previous = old.location().clone();
            self.discard(old).await;
            match self.open_connection(None, &HashSet::new()).await {
                Ok(connection) => {
                    debug!(
                        pool = %self.name(),
                        previous = %previous,
                        replacement = %connection.location(),
                        "Load conditioned connection"
                    );
                    let mut state = self.state.lock();
                    state.pending -= 1;
                    state.idle.push_back(connection);
                    replaced += 1;
                }
                Err(e) => {
                    warn!(pool = %self.name(), error = %e, "Could not open replacement connection");
                    self.state.lock().pending -= 1;
                }
            }
            self.notify_available();
        }
        replaced
    }

    /// Ping idle connections that have been quiet for a ping interval.
    /// A failed ping invalidates every idle connection to that server.
    pub async fn ping_idle(&self) -> usize {
        let Some(interval) = self.settings().ping_interval() else {
            return 0;
        };
        let now = Instant::now();
        let quiet: Vec<Connection> = {
            let mut state = self.state.lock();
            let (quiet, keep): (VecDeque<_>, VecDeque<_>) = state
                .idle
                .drain(..)
                .partition(|c| now.duration_since(c.last_used()) >= interval);
            state.idle = keep;
            state.in_use += quiet.len();
            quiet.into_iter().collect()
        };

        let mut dead_servers = HashSet::new();
        for connection in quiet {
            match connection.ping().await {
                Ok(()) => self.check_in(connection, false),
                Err(e) => {
                    warn!(pool = %self.name(), server = %connection.location(), error = %e, "Ping failed");
                    dead_servers.insert(connection.location().clone());
                    self.check_in(connection, true);
                }
            }
        }
        for server in &dead_servers {
            self.invalidate_server(server).await;
        }
        dead_servers.len()
    }

    /// Open connections until `min_connections` is reached. Gives up after
    /// as many failures as connections were needed.
    pub async fn restore_min_connections(&self) -> usize {
        let min = self.settings().min_connections;
        let mut opened = 0;
        let mut failures = 0;
        loop {
            {
                let mut state = self.state.lock();
                if self.is_closed() || state.total() >= min {
                    break;
                }
                state.pending += 1;
            }
            match self.open_connection(None, &HashSet::new()).await {
                Ok(connection) => {
                    let mut state = self.state.lock();
                    state.pending -= 1;
                    state.idle.push_back(connection);
                    opened += 1;
                }
                Err(e) => {
                    self.state.lock().pending -= 1;
                    failures += 1;
                    warn!(pool = %self.name(), error = %e, "Could not open minimum connection");
                    if failures >= min {
                        break;
                    }
                }
            }
            self.notify_available();
        }
        if opened > 0 {
            info!(pool = %self.name(), opened, live = self.live_connections(), "Restored minimum connections");
        }
        opened
    }
}
