//! Named pool registry

use cache_config::PoolSettings;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::{Pool, PoolContext};
use crate::scheduler::Scheduler;
use crate::{Result, TransportError};

/// Pools of one session, keyed by name
#[derive(Default)]
pub struct PoolRegistry {
    pools: RwLock<HashMap<String, Arc<Pool>>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create, register and start a pool. A name may be registered once.
    pub async fn create_pool(
        &self,
        name: &str,
        settings: PoolSettings,
        context: PoolContext,
        scheduler: &Scheduler,
    ) -> Result<Arc<Pool>> {
        let pool = {
            let mut pools = self.pools.write();
            if pools.contains_key(name) {
                return Err(TransportError::illegal_state(format!(
                    "a pool named '{}' already exists",
                    name
                )));
            }
            let pool = Pool::new(name, settings, context, scheduler)?;
            pools.insert(name.to_string(), pool.clone());
            pool
        };
        pool.start().await;
        Ok(pool)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Pool>> {
        self.pools.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.pools.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.pools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.read().is_empty()
    }

    /// Remove a pool from the registry and close it
    pub async fn destroy(&self, name: &str) -> bool {
        let removed = self.pools.write().remove(name);
        match removed {
            Some(pool) => {
                pool.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let pools: Vec<_> = self.pools.write().drain().map(|(_, pool)| pool).collect();
        for pool in &pools {
            pool.close().await;
        }
        if !pools.is_empty() {
            info!(pools = pools.len(), "Closed all pools");
        }
    }
}
