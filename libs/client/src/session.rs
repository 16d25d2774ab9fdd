//! # Cache Session
//!
//! Owns everything a client process shares: the pool registry, the
//! maintenance scheduler, the type registry, partition resolvers and the
//! event id generator. Nothing here is global; two sessions in one process
//! are fully independent.
//!
//! ```rust,no_run
//! # async fn demo() -> cache_client::Result<()> {
//! use cache_client::CacheSession;
//! use cache_config::load_config;
//!
//! let config = load_config(None).map_err(|e| cache_client::ClientError::configuration(e.to_string()))?;
//! let session = CacheSession::builder().config(config).build().await?;
//! let orders = session.region("orders", "default")?;
//! orders.put("order-1", "pending").await?;
//! session.close(false).await;
//! # Ok(())
//! # }
//! ```

use cache_codec::{ClientIdentity, ConflationPreference, Credentials, TypeRegistry};
use cache_config::{ClientConfig, ConflationPolicy, MetadataSettings, PoolSettings};
use cache_network::{Connector, Pool, PoolContext, PoolRegistry, Scheduler, TcpConnector};
use cache_types::EventIdGenerator;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ClientError, Result};
use crate::metadata::{ClientMetadataService, RegionResolver};
use crate::region::Region;
use crate::router::Router;
use crate::subscription::SubscriptionManager;

/// Router and subscriptions of one pool
pub(crate) struct PoolClient {
    pub(crate) router: Router,
    pub(crate) subscriptions: Option<Arc<SubscriptionManager>>,
}

impl PoolClient {
    pub(crate) fn subscriptions(&self) -> Result<&Arc<SubscriptionManager>> {
        self.subscriptions.as_ref().ok_or_else(|| {
            ClientError::illegal_state(format!(
                "subscriptions are not enabled on pool '{}'",
                self.router.pool().name()
            ))
        })
    }
}

pub struct CacheSessionBuilder {
    config: ClientConfig,
    connector: Option<Arc<dyn Connector>>,
    resolvers: Vec<(String, RegionResolver)>,
    registry: Option<TypeRegistry>,
    credentials: Option<Credentials>,
    member_id: Option<String>,
}

impl CacheSessionBuilder {
    fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            connector: None,
            resolvers: Vec::new(),
            registry: None,
            credentials: None,
            member_id: None,
        }
    }

    /// Pools in the config are created by [`build`](Self::build)
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to plain TCP
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn resolver(mut self, region: impl Into<String>, resolver: RegionResolver) -> Self {
        self.resolvers.push((region.into(), resolver));
        self
    }

    pub fn type_registry(mut self, registry: TypeRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Defaults to a random id
    pub fn member_id(mut self, member_id: impl Into<String>) -> Self {
        self.member_id = Some(member_id.into());
        self
    }

    pub async fn build(self) -> Result<CacheSession> {
        let member_id = self
            .member_id
            .unwrap_or_else(|| format!("client-{}", Uuid::new_v4()));
        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(TcpConnector::new(Default::default())),
        };
        let session = CacheSession {
            event_ids: Arc::new(EventIdGenerator::new(member_id.clone())),
            member_id,
            metadata: self.config.metadata.clone(),
            connector,
            credentials: self.credentials,
            registry: Arc::new(self.registry.unwrap_or_default()),
            scheduler: Scheduler::new(),
            pools: PoolRegistry::new(),
            clients: DashMap::new(),
            resolvers: self.resolvers.into_iter().collect(),
            closed: AtomicBool::new(false),
        };
        for (name, settings) in &self.config.pools {
            if let Err(e) = session.create_pool(name, settings.clone()).await {
                session.close(false).await;
                return Err(e);
            }
        }
        info!(member = %session.member_id, pools = session.pools.len(), "Cache session started");
        Ok(session)
    }
}

/// A client process's connection to one cache cluster
pub struct CacheSession {
    member_id: String,
    metadata: MetadataSettings,
    connector: Arc<dyn Connector>,
    credentials: Option<Credentials>,
    registry: Arc<TypeRegistry>,
    event_ids: Arc<EventIdGenerator>,
    scheduler: Scheduler,
    pools: PoolRegistry,
    clients: DashMap<String, Arc<PoolClient>>,
    resolvers: DashMap<String, RegionResolver>,
    closed: AtomicBool,
}

impl CacheSession {
    pub fn builder() -> CacheSessionBuilder {
        CacheSessionBuilder::new()
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn type_registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Create and start a pool. A name can only be used once per session.
    pub async fn create_pool(&self, name: &str, settings: PoolSettings) -> Result<Arc<Pool>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::illegal_state("the session is closed"));
        }
        settings
            .validate(name)
            .map_err(|e| ClientError::configuration(e.to_string()))?;

        let context = PoolContext {
            connector: self.connector.clone(),
            identity: ClientIdentity {
                member_id: self.member_id.clone(),
                durable_id: settings.subscription.durable_client_id.clone(),
                durable_timeout_ms: settings.subscription.durable_timeout_ms,
            },
            conflation: match settings.subscription.conflate_events {
                ConflationPolicy::Server => ConflationPreference::Server,
                ConflationPolicy::Enabled => ConflationPreference::Enabled,
                ConflationPolicy::Disabled => ConflationPreference::Disabled,
            },
            credentials: self.credentials.clone(),
        };
        let pool = self
            .pools
            .create_pool(name, settings.clone(), context, &self.scheduler)
            .await?;

        let metadata = ClientMetadataService::new(pool.clone(), self.metadata.clone(), &self.scheduler);
        for entry in self.resolvers.iter() {
            metadata.set_resolver(entry.key(), entry.value().clone());
        }
        let router = Router::new(
            pool.clone(),
            metadata.clone(),
            self.registry.clone(),
            self.event_ids.clone(),
        );

        let subscriptions = if settings.subscription.enabled {
            match SubscriptionManager::start(
                pool.clone(),
                settings.subscription.clone(),
                self.registry.clone(),
                &self.scheduler,
            )
            .await
            {
                Ok(manager) => Some(manager),
                Err(e) => {
                    warn!(pool = name, error = %e, "Subscriptions failed to start");
                    metadata.close();
                    self.pools.destroy(name).await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        self.clients
            .insert(name.to_string(), Arc::new(PoolClient { router, subscriptions }));
        Ok(pool)
    }

    pub fn pool(&self, name: &str) -> Option<Arc<Pool>> {
        self.pools.get(name)
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.pools.names()
    }

    /// Handle to `region` whose operations go through pool `pool`
    pub fn region(&self, name: &str, pool: &str) -> Result<Region> {
        let client = self
            .clients
            .get(pool)
            .map(|c| c.value().clone())
            .ok_or_else(|| ClientError::illegal_state(format!("no pool named '{}'", pool)))?;
        Ok(Region::new(name, client))
    }

    /// Route `region` through `resolver` on every pool, present and future
    pub fn set_resolver(&self, region: &str, resolver: RegionResolver) {
        for client in self.clients.iter() {
            client.router.metadata().set_resolver(region, resolver.clone());
        }
        self.resolvers.insert(region.to_string(), resolver);
    }

    /// Subscriptions of pool `pool`, when enabled there
    pub fn subscriptions(&self, pool: &str) -> Option<Arc<SubscriptionManager>> {
        self.clients.get(pool).and_then(|c| c.subscriptions.clone())
    }

    pub fn metadata(&self, pool: &str) -> Option<Arc<ClientMetadataService>> {
        self.clients.get(pool).map(|c| c.router.metadata().clone())
    }

    /// Close subscriptions, pools and background tasks. With `keep_alive`
    /// durable subscription queues stay on the servers.
    pub async fn close(&self, keep_alive: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let clients: Vec<Arc<PoolClient>> = self.clients.iter().map(|c| c.value().clone()).collect();
        self.clients.clear();
        for client in &clients {
            if let Some(subscriptions) = &client.subscriptions {
                subscriptions.close(keep_alive).await;
            }
            client.router.metadata().close();
        }
        self.pools.close_all().await;
        self.scheduler.shutdown();
        info!(member = %self.member_id, keep_alive, "Cache session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for CacheSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheSession")
            .field("member_id", &self.member_id)
            .field("pools", &self.pools.names())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::settings;
    use cache_network::test_utils::SimulatedCluster;

    async fn session(cluster: &SimulatedCluster) -> CacheSession {
        CacheSession::builder()
            .config(ClientConfig {
                pools: Default::default(),
                ..ClientConfig::default()
            })
            .connector(cluster.connector())
            .member_id("client-1")
            .build()
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_pool_names_are_rejected() {
        let cluster = SimulatedCluster::new();
        cluster.add_server("a", &[]);
        let session = session(&cluster).await;

        let first = session.create_pool("orders", settings(&cluster.servers())).await.unwrap();
        let error = session
            .create_pool("orders", settings(&cluster.servers()))
            .await
            .unwrap_err();
        assert_eq!(error.category(), "illegal_state");
        assert!(!first.is_closed());
        assert!(Arc::ptr_eq(&session.pool("orders").unwrap(), &first));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_settings_are_a_configuration_error() {
        let cluster = SimulatedCluster::new();
        let session = session(&cluster).await;
        let error = session
            .create_pool("empty", PoolSettings::with_servers(Vec::<String>::new()))
            .await
            .unwrap_err();
        assert_eq!(error.category(), "configuration");
        assert!(session.pool("empty").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn regions_need_a_known_pool() {
        let cluster = SimulatedCluster::new();
        cluster.add_server("a", &[]);
        let session = session(&cluster).await;
        assert!(session.region("orders", "missing").is_err());
        session.create_pool("main", settings(&cluster.servers())).await.unwrap();
        assert_eq!(session.region("orders", "main").unwrap().name(), "orders");
    }

    #[tokio::test(start_paused = true)]
    async fn close_shuts_everything_down() {
        let cluster = SimulatedCluster::new();
        cluster.add_server("a", &[]);
        let session = session(&cluster).await;
        let pool = session.create_pool("main", settings(&cluster.servers())).await.unwrap();

        session.close(false).await;
        assert!(session.is_closed());
        assert!(pool.is_closed());
        assert!(session.pool_names().is_empty());
        let error = session
            .create_pool("late", settings(&cluster.servers()))
            .await
            .unwrap_err();
        assert_eq!(error.category(), "illegal_state");
    }
}
