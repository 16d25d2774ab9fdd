//! Application-facing handle to one region

use cache_types::{Cacheable, CacheableKey, Interest};
use std::fmt;
use std::sync::Arc;

use crate::context::OperationContext;
use crate::error::{ClientError, Result};
use crate::function::{Execution, FunctionResult};
use crate::metadata::{ClientMetadataService, PartitionMetadata};
use crate::router::BulkResult;
use crate::session::PoolClient;
use crate::subscription::{CacheListener, RegisteredInterest};

/// Cheap to clone; every clone shares the pool's router and subscriptions
#[derive(Clone)]
pub struct Region {
    name: String,
    client: Arc<PoolClient>,
}

impl Region {
    pub(crate) fn new(name: &str, client: Arc<PoolClient>) -> Self {
        Self {
            name: name.to_string(),
            client,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool_name(&self) -> &str {
        self.client.router.pool().name()
    }

    pub async fn get(&self, key: impl Into<CacheableKey>) -> Result<Option<Cacheable>> {
        self.get_with_context(key, &mut OperationContext::new()).await
    }

    /// Like [`get`](Self::get); `ctx` reports where the operation went
    pub async fn get_with_context(
        &self,
        key: impl Into<CacheableKey>,
        ctx: &mut OperationContext,
    ) -> Result<Option<Cacheable>> {
        self.client.router.get(&self.name, &key.into(), ctx).await
    }

    pub async fn put(&self, key: impl Into<CacheableKey>, value: impl Into<Cacheable>) -> Result<()> {
        self.put_with_context(key, value, &mut OperationContext::new())
            .await
    }

    pub async fn put_with_context(
        &self,
        key: impl Into<CacheableKey>,
        value: impl Into<Cacheable>,
        ctx: &mut OperationContext,
    ) -> Result<()> {
        self.client
            .router
            .put(&self.name, &key.into(), &value.into(), ctx)
            .await
    }

    pub async fn destroy(&self, key: impl Into<CacheableKey>) -> Result<()> {
        self.destroy_with_context(key, &mut OperationContext::new())
            .await
    }

    pub async fn destroy_with_context(
        &self,
        key: impl Into<CacheableKey>,
        ctx: &mut OperationContext,
    ) -> Result<()> {
        self.client.router.destroy(&self.name, &key.into(), ctx).await
    }

    /// Values of every distinct key; failures are reported per key
    pub async fn get_all<K: Into<CacheableKey>>(
        &self,
        keys: impl IntoIterator<Item = K>,
    ) -> BulkResult<Option<Cacheable>> {
        let keys = keys.into_iter().map(Into::into).collect();
        self.client
            .router
            .get_all(&self.name, keys, &mut OperationContext::new())
            .await
    }

    pub async fn put_all<K, V>(&self, entries: impl IntoIterator<Item = (K, V)>) -> BulkResult<()>
    where
        K: Into<CacheableKey>,
        V: Into<Cacheable>,
    {
        let entries = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.client
            .router
            .put_all(&self.name, entries, &mut OperationContext::new())
            .await
    }

    pub async fn remove_all<K: Into<CacheableKey>>(
        &self,
        keys: impl IntoIterator<Item = K>,
    ) -> BulkResult<()> {
        let keys = keys.into_iter().map(Into::into).collect();
        self.client
            .router
            .remove_all(&self.name, keys, &mut OperationContext::new())
            .await
    }

    /// Run a server-side function over this region's data
    pub async fn execute(&self, execution: &Execution) -> Result<FunctionResult> {
        self.client
            .router
            .execute_function(&self.name, execution, &mut OperationContext::new())
            .await
    }

    pub async fn register_interest(
        &self,
        interest: Interest,
        durable: bool,
        receive_values: bool,
    ) -> Result<()> {
        self.client
            .subscriptions()?
            .register_interest(&self.name, interest, durable, receive_values)
            .await
    }

    pub async fn register_interest_keys<K: Into<CacheableKey>>(
        &self,
        keys: impl IntoIterator<Item = K>,
    ) -> Result<()> {
        let keys: Vec<CacheableKey> = keys.into_iter().map(Into::into).collect();
        if keys.is_empty() {
            return Err(ClientError::illegal_state("interest needs at least one key"));
        }
        self.register_interest(Interest::Keys(keys), false, true)
            .await
    }

    pub async fn register_interest_regex(&self, pattern: impl Into<String>) -> Result<()> {
        self.register_interest(Interest::Regex(pattern.into()), false, true)
            .await
    }

    pub async fn register_interest_all(&self) -> Result<()> {
        self.register_interest(Interest::AllKeys, false, true).await
    }

    pub async fn unregister_interest(&self, interest: &Interest) -> Result<()> {
        self.client
            .subscriptions()?
            .unregister_interest(&self.name, interest)
            .await
    }

    pub fn interests(&self) -> Vec<RegisteredInterest> {
        self.client
            .subscriptions
            .as_ref()
            .map(|s| s.interests(&self.name))
            .unwrap_or_default()
    }

    /// Start delivery of queued events to a reconnected durable client
    pub async fn ready_for_events(&self) -> Result<()> {
        self.client.subscriptions()?.ready_for_events().await
    }

    pub fn add_listener(&self, listener: Arc<dyn CacheListener>) -> Result<()> {
        self.client.subscriptions()?.add_listener(&self.name, listener);
        Ok(())
    }

    /// `None` follows the pool's conflation policy
    pub fn set_conflation(&self, conflate: Option<bool>) -> Result<()> {
        self.client
            .subscriptions()?
            .set_conflation(&self.name, conflate);
        Ok(())
    }

    /// Fetch bucket locations now instead of waiting for a hop
    pub async fn refresh_metadata(&self) -> Result<Arc<PartitionMetadata>> {
        self.client.router.metadata().refresh(&self.name).await
    }

    /// Cached bucket locations, if any were fetched
    pub fn metadata(&self) -> Option<Arc<PartitionMetadata>> {
        self.client.router.metadata().snapshot(&self.name)
    }

    pub fn metadata_service(&self) -> &Arc<ClientMetadataService> {
        self.client.router.metadata()
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("name", &self.name)
            .field("pool", &self.pool_name())
            .finish()
    }
}
