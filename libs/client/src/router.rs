//! # Single-Hop Router
//!
//! Sends each region operation straight to the server owning the key's
//! bucket, falling back to any pool connection when the owner is unknown,
//! excluded, or single-hop routing is disabled.
//!
//! Bulk operations are split into one batch per primary plus a default batch
//! for keys without a known owner. Batches run concurrently, each with its
//! own retry loop, and their replies are merged so every distinct input key
//! ends up either in `values` or in `exceptions`.
//!
//! Writes carry an [`EventId`] allocated once per operation. Retries resend
//! the same id, which lets servers drop replays of writes they already
//! applied. The id's thread is leased for the length of the operation and
//! then reused by later writes.

use cache_codec::{EncodedValue, Operation, Request, ResponseBody, TypeRegistry};
use cache_network::{Pool, TransportError};
use cache_types::{Cacheable, CacheableKey, EventId, EventIdGenerator, ServerLocation, ThreadLease};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::context::OperationContext;
use crate::error::{ClientError, Result};
use crate::failure::{FailureCoordinator, Outcome, Step};
use crate::metadata::{ClientMetadataService, KeyGrouping};

/// Partial results of a bulk operation
#[derive(Debug, Clone, PartialEq)]
pub struct BulkResult<V> {
    pub values: HashMap<CacheableKey, V>,
    pub exceptions: HashMap<CacheableKey, ClientError>,
}

impl<V> Default for BulkResult<V> {
    fn default() -> Self {
        Self {
            values: HashMap::new(),
            exceptions: HashMap::new(),
        }
    }
}

impl<V> BulkResult<V> {
    /// Keys with either a value or an exception
    pub fn len(&self) -> usize {
        self.values.len() + self.exceptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.exceptions.is_empty()
    }

    pub fn is_success(&self) -> bool {
        self.exceptions.is_empty()
    }

    fn merge(&mut self, other: BulkResult<V>) {
        self.values.extend(other.values);
        self.exceptions.extend(other.exceptions);
    }

    fn fail_all(keys: Vec<CacheableKey>, error: &ClientError) -> Self {
        Self {
            values: HashMap::new(),
            exceptions: keys.into_iter().map(|k| (k, error.clone())).collect(),
        }
    }
}

enum BulkKind {
    GetAll,
    PutAll(HashMap<CacheableKey, EncodedValue>),
    RemoveAll,
}

impl BulkKind {
    fn name(&self) -> &'static str {
        match self {
            BulkKind::GetAll => "get_all",
            BulkKind::PutAll(_) => "put_all",
            BulkKind::RemoveAll => "remove_all",
        }
    }

    fn is_write(&self) -> bool {
        !matches!(self, BulkKind::GetAll)
    }

    /// A timed-out bulk write may have been partially applied
    fn replay_safe(&self) -> bool {
        !self.is_write()
    }

    fn operation(&self, keys: &[CacheableKey], event_id: Option<EventId>) -> Operation {
        let event_id = || event_id.clone().unwrap_or_else(|| EventId::new("", 0, 0));
        match self {
            BulkKind::GetAll => Operation::GetAll {
                keys: keys.to_vec(),
            },
            BulkKind::PutAll(values) => Operation::PutAll {
                entries: keys
                    .iter()
                    .filter_map(|k| values.get(k).map(|v| (k.clone(), v.clone())))
                    .collect(),
                event_id: event_id(),
            },
            BulkKind::RemoveAll => Operation::RemoveAll {
                keys: keys.to_vec(),
                event_id: event_id(),
            },
        }
    }
}

/// Routes and dispatches the operations of one pool's regions
pub struct Router {
    pool: Arc<Pool>,
    metadata: Arc<ClientMetadataService>,
    failures: FailureCoordinator,
    registry: Arc<TypeRegistry>,
    event_ids: Arc<EventIdGenerator>,
}

impl Router {
    pub fn new(
        pool: Arc<Pool>,
        metadata: Arc<ClientMetadataService>,
        registry: Arc<TypeRegistry>,
        event_ids: Arc<EventIdGenerator>,
    ) -> Self {
        Self {
            failures: FailureCoordinator::new(pool.clone(), metadata.clone()),
            pool,
            metadata,
            registry,
            event_ids,
        }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn metadata(&self) -> &Arc<ClientMetadataService> {
        &self.metadata
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub(crate) fn failures(&self) -> &FailureCoordinator {
        &self.failures
    }

    fn single_hop(&self) -> bool {
        self.pool.settings().single_hop_enabled
    }

    /// Thread for the event ids of one write. Concurrent writers hold
    /// different threads so they never reorder a shared sequence.
    fn lease_thread(&self) -> ThreadLease<'_> {
        self.event_ids.lease_thread()
    }

    /// Server a keyed operation should go to; `None` lets the pool choose.
    /// An unknown owner of a partitioned key counts as a hop.
    pub fn route(
        &self,
        region: &str,
        key: &CacheableKey,
        ctx: &mut OperationContext,
    ) -> Option<ServerLocation> {
        if !self.single_hop() {
            return None;
        }
        match self.metadata.primary_for_key(region, key, ctx.callback_arg()) {
            Some((_, primary)) if !ctx.excluded().contains(&primary) => Some(primary),
            Some(_) => None,
            None => {
                let partitioned = self
                    .metadata
                    .snapshot(region)
                    .map_or(true, |snapshot| snapshot.is_partitioned());
                if partitioned {
                    ctx.observe_hop();
                    self.metadata.record_hop(region);
                }
                None
            }
        }
    }

    pub async fn get(
        &self,
        region: &str,
        key: &CacheableKey,
        ctx: &mut OperationContext,
    ) -> Result<Option<Cacheable>> {
        let operation = Operation::Get { key: key.clone() };
        match self.execute_keyed(region, key, ctx, operation, true).await? {
            ResponseBody::Value(value) => Ok(value
                .map(|v| self.registry.decode(&v))
                .transpose()?),
            other => Err(unexpected("get", &other)),
        }
    }

    pub async fn put(
        &self,
        region: &str,
        key: &CacheableKey,
        value: &Cacheable,
        ctx: &mut OperationContext,
    ) -> Result<()> {
        let thread = self.lease_thread();
        let operation = Operation::Put {
            key: key.clone(),
            value: self.registry.encode(value),
            event_id: thread.next_id(),
        };
        expect_ok("put", self.execute_keyed(region, key, ctx, operation, true).await?)
    }

    pub async fn destroy(
        &self,
        region: &str,
        key: &CacheableKey,
        ctx: &mut OperationContext,
    ) -> Result<()> {
        let thread = self.lease_thread();
        let operation = Operation::Destroy {
            key: key.clone(),
            event_id: thread.next_id(),
        };
        expect_ok("destroy", self.execute_keyed(region, key, ctx, operation, true).await?)
    }

    async fn execute_keyed(
        &self,
        region: &str,
        key: &CacheableKey,
        ctx: &mut OperationContext,
        operation: Operation,
        replay_safe: bool,
    ) -> Result<ResponseBody> {
        ctx.begin_operation();
        let budget = self.failures.attempt_budget(region);
        let mut last = None;
        loop {
            ctx.begin_attempt();
            let target = self.route(region, key, ctx);
            let outcome = self
                .dispatch(region, target.as_ref(), ctx, operation.clone(), replay_safe)
                .await;
            match self.failures.assess(region, ctx, outcome, budget).await {
                Step::Done(body) => return Ok(body),
                Step::Retry(error) => last = Some(error),
                Step::Fail(error) => return Err(surface(error, last)),
            }
        }
    }

    /// One attempt: acquire a connection, send, classify the reply
    pub(crate) async fn dispatch(
        &self,
        region: &str,
        target: Option<&ServerLocation>,
        ctx: &mut OperationContext,
        operation: Operation,
        replay_safe: bool,
    ) -> Outcome<ResponseBody> {
        let mut connection = match self.pool.acquire_to(target, ctx.excluded()).await {
            Ok(connection) => connection,
            Err(error) => return self.acquire_failed(error, target),
        };
        let server = connection.location().clone();
        ctx.set_routed(server.clone(), target == Some(&server));

        let request = Request {
            correlation_id: 0,
            region: region.to_string(),
            callback_arg: ctx.callback_arg().map(|arg| self.registry.encode(arg)),
            is_retry: ctx.is_retry(),
            operation,
        };
        debug!(
            region,
            server = %server,
            operation = request.operation.name(),
            attempt = ctx.attempts(),
            single_hop = target.is_some(),
            "Dispatching"
        );

        match connection.execute(request).await {
            Ok(response) => {
                if response.network_hop {
                    ctx.observe_hop();
                    self.metadata.record_hop(region);
                }
                match response.body {
                    ResponseBody::Error(error) => Outcome::from_server(error, &server),
                    body => Outcome::Success(body),
                }
            }
            Err(error) => {
                connection.invalidate();
                Outcome::from_transport(error, &server, replay_safe)
            }
        }
    }

    fn acquire_failed<T>(&self, error: TransportError, target: Option<&ServerLocation>) -> Outcome<T> {
        match error.remote().or(target).cloned() {
            Some(server) if error.is_retryable() => Outcome::from_transport(error, &server, true),
            _ => Outcome::Fatal(ClientError::from_acquire(self.pool.name(), error)),
        }
    }

    pub async fn get_all(
        &self,
        region: &str,
        keys: Vec<CacheableKey>,
        ctx: &mut OperationContext,
    ) -> BulkResult<Option<Cacheable>> {
        let raw = self.bulk(region, dedup(keys), &BulkKind::GetAll, ctx).await;
        let mut result = BulkResult {
            values: HashMap::with_capacity(raw.values.len()),
            exceptions: raw.exceptions,
        };
        for (key, value) in raw.values {
            match value.map(|v| self.registry.decode(&v)).transpose() {
                Ok(value) => {
                    result.values.insert(key, value);
                }
                Err(e) => {
                    result.exceptions.insert(key, e.into());
                }
            }
        }
        result
    }

    /// Later entries for a key replace earlier ones
    pub async fn put_all(
        &self,
        region: &str,
        entries: Vec<(CacheableKey, Cacheable)>,
        ctx: &mut OperationContext,
    ) -> BulkResult<()> {
        let mut order = Vec::with_capacity(entries.len());
        let mut values = HashMap::with_capacity(entries.len());
        for (key, value) in entries {
            if values.insert(key.clone(), self.registry.encode(&value)).is_none() {
                order.push(key);
            }
        }
        let raw = self.bulk(region, order, &BulkKind::PutAll(values), ctx).await;
        discard_values(raw)
    }

    pub async fn remove_all(
        &self,
        region: &str,
        keys: Vec<CacheableKey>,
        ctx: &mut OperationContext,
    ) -> BulkResult<()> {
        let raw = self.bulk(region, dedup(keys), &BulkKind::RemoveAll, ctx).await;
        discard_values(raw)
    }

    async fn bulk(
        &self,
        region: &str,
        keys: Vec<CacheableKey>,
        kind: &BulkKind,
        ctx: &mut OperationContext,
    ) -> BulkResult<Option<EncodedValue>> {
        ctx.begin_operation();
        let grouping = if self.single_hop() {
            self.metadata.group_keys(region, keys, ctx.callback_arg())
        } else {
            KeyGrouping::all_unrouted(keys)
        };
        debug!(
            region,
            operation = kind.name(),
            batches = grouping.batch_count(),
            unrouted = grouping.unrouted.len(),
            "Dispatching bulk operation"
        );

        let mut batches: Vec<(Option<ServerLocation>, Vec<CacheableKey>)> = grouping
            .by_server
            .into_iter()
            .map(|(server, keys)| (Some(server), keys))
            .collect();
        if !grouping.unrouted.is_empty() {
            batches.push((None, grouping.unrouted));
        }

        let runs = batches.into_iter().map(|(target, keys)| {
            let mut batch_ctx = ctx.fork();
            async move {
                let result = self.bulk_batch(region, target, keys, kind, &mut batch_ctx).await;
                (result, batch_ctx)
            }
        });
        let mut merged = BulkResult::default();
        for (result, batch_ctx) in join_all(runs).await {
            ctx.absorb(&batch_ctx);
            merged.merge(result);
        }
        merged
    }

    async fn bulk_batch(
        &self,
        region: &str,
        mut target: Option<ServerLocation>,
        keys: Vec<CacheableKey>,
        kind: &BulkKind,
        ctx: &mut OperationContext,
    ) -> BulkResult<Option<EncodedValue>> {
        let thread = kind.is_write().then(|| self.lease_thread());
        let operation = kind.operation(&keys, thread.as_ref().map(ThreadLease::next_id));
        let budget = self.failures.attempt_budget(region);
        let mut last = None;

        let reply = loop {
            ctx.begin_attempt();
            let outcome = self
                .dispatch(region, target.as_ref(), ctx, operation.clone(), kind.replay_safe())
                .await;
            match self.failures.assess(region, ctx, outcome, budget).await {
                Step::Done(body) => break Ok(body),
                // the batch may span several new owners; let servers forward
                Step::Retry(error) => {
                    last = Some(error);
                    target = None;
                }
                Step::Fail(error) => break Err(surface(error, last)),
            }
        };

        match reply {
            Ok(ResponseBody::Bulk { values, failures }) => {
                let server = ctx.server().cloned();
                let mut result = BulkResult::default();
                let mut values: HashMap<CacheableKey, Option<EncodedValue>> = values.into_iter().collect();
                let failures: HashMap<CacheableKey, _> = failures.into_iter().collect();
                for key in keys {
                    match failures.get(&key) {
                        Some(error) => {
                            let error = ClientError::from_server(error.clone(), server.as_ref());
                            result.exceptions.insert(key, error);
                        }
                        None => {
                            let value = values.remove(&key).flatten();
                            result.values.insert(key, value);
                        }
                    }
                }
                result
            }
            Ok(other) => BulkResult::fail_all(keys, &unexpected(kind.name(), &other)),
            Err(error) => {
                debug!(region, operation = kind.name(), keys = keys.len(), error = %error, "Bulk batch failed");
                BulkResult::fail_all(keys, &error)
            }
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("pool", &self.pool.name())
            .field("single_hop", &self.single_hop())
            .finish()
    }
}

/// Prefer the last retryable error over running out of servers
pub(crate) fn surface(error: ClientError, last: Option<ClientError>) -> ClientError {
    match (error, last) {
        (ClientError::NoServersAvailable { .. }, Some(last)) => last,
        (error, _) => error,
    }
}

pub(crate) fn unexpected(operation: &str, body: &ResponseBody) -> ClientError {
    ClientError::Codec {
        message: format!("unexpected reply to {}: {:?}", operation, body),
    }
}

fn expect_ok(operation: &str, body: ResponseBody) -> Result<()> {
    match body {
        ResponseBody::Ok => Ok(()),
        other => Err(unexpected(operation, &other)),
    }
}

fn dedup(keys: Vec<CacheableKey>) -> Vec<CacheableKey> {
    let mut seen = HashSet::with_capacity(keys.len());
    keys.into_iter().filter(|k| seen.insert(k.clone())).collect()
}

fn discard_values(raw: BulkResult<Option<EncodedValue>>) -> BulkResult<()> {
    BulkResult {
        values: raw.values.into_keys().map(|k| (k, ())).collect(),
        exceptions: raw.exceptions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pool_with, settings, settle};
    use cache_codec::ServerError;
    use cache_config::MetadataSettings;
    use cache_network::test_utils::SimulatedCluster;
    use cache_network::Scheduler;
    use std::time::Duration;

    async fn router_with(
        cluster: &SimulatedCluster,
        settings: cache_config::PoolSettings,
        scheduler: &Scheduler,
    ) -> Router {
        let pool = pool_with(cluster, settings, scheduler).await;
        let metadata = ClientMetadataService::new(pool.clone(), MetadataSettings::default(), scheduler);
        Router::new(
            pool,
            metadata,
            Arc::new(TypeRegistry::default()),
            Arc::new(EventIdGenerator::new("client-1")),
        )
    }

    async fn router(cluster: &SimulatedCluster, scheduler: &Scheduler) -> Router {
        router_with(cluster, settings(&cluster.servers()), scheduler).await
    }

    fn three_servers() -> SimulatedCluster {
        let cluster = SimulatedCluster::new();
        for name in ["a", "b", "c"] {
            cluster.add_server(name, &[]);
        }
        cluster.create_partitioned_region("orders", 16, 1);
        cluster
    }

    #[tokio::test(start_paused = true)]
    async fn keyed_operations_go_to_the_primary() {
        let cluster = three_servers();
        let scheduler = Scheduler::new();
        let router = router(&cluster, &scheduler).await;
        router.metadata().refresh("orders").await.unwrap();

        for i in 0..20 {
            let key = CacheableKey::Int32(i);
            let mut ctx = OperationContext::new();
            router.put("orders", &key, &Cacheable::Int32(i * 10), &mut ctx).await.unwrap();
            assert!(ctx.routed_single_hop());
            assert!(!ctx.network_hop_observed());
            assert_eq!(ctx.server(), cluster.primary_of("orders", &key).as_ref());
        }
        assert_eq!(cluster.hops(), 0);

        let mut ctx = OperationContext::new();
        let value = router.get("orders", &CacheableKey::Int32(4), &mut ctx).await.unwrap();
        assert_eq!(value, Some(Cacheable::Int32(40)));
        router.destroy("orders", &CacheableKey::Int32(4), &mut ctx).await.unwrap();
        assert_eq!(cluster.get_direct("orders", 4), None);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_owner_falls_back_to_any_server() {
        let cluster = three_servers();
        let scheduler = Scheduler::new();
        let router = router(&cluster, &scheduler).await;

        let mut ctx = OperationContext::new();
        router.put("orders", &"k".into(), &"v".into(), &mut ctx).await.unwrap();
        assert!(!ctx.routed_single_hop());
        assert!(ctx.network_hop_observed());
        assert_eq!(ctx.attempts(), 1);

        settle().await;
        let mut ctx = OperationContext::new();
        router.get("orders", &"k".into(), &mut ctx).await.unwrap();
        assert!(ctx.routed_single_hop());
        assert!(!ctx.network_hop_observed());
    }

    #[tokio::test(start_paused = true)]
    async fn locator_pools_budget_retries_without_asking_locators() {
        let cluster = three_servers();
        let locator = cluster.add_locator("locator");
        let scheduler = Scheduler::new();
        let mut settings = settings(&[]);
        settings.locators = vec![locator.to_string()];
        settings.update_locator_list_interval_ms = 0;
        let router = router_with(&cluster, settings, &scheduler).await;
        router.metadata().refresh("orders").await.unwrap();
        assert_eq!(router.failures().attempt_budget("orders"), 3);

        let before = cluster.server_list_requests();
        for i in 0..50 {
            let mut ctx = OperationContext::new();
            router
                .put("orders", &CacheableKey::Int32(i), &Cacheable::Int32(i), &mut ctx)
                .await
                .unwrap();
            assert!(ctx.routed_single_hop());
        }
        assert_eq!(cluster.server_list_requests(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn a_reused_context_starts_every_operation_afresh() {
        let cluster = three_servers();
        let scheduler = Scheduler::new();
        let mut settings = settings(&cluster.servers());
        settings.retry_attempts = 1;
        let router = router_with(&cluster, settings, &scheduler).await;
        router.metadata().refresh("orders").await.unwrap();
        let key = CacheableKey::from("k");
        let primary = cluster.primary_of("orders", &key).unwrap();
        let other = (0..100)
            .map(CacheableKey::Int32)
            .find(|k| cluster.primary_of("orders", k).is_some_and(|p| p != primary))
            .unwrap();

        let mut ctx = OperationContext::new().with_callback_arg("audit");
        router.get("orders", &key, &mut ctx).await.unwrap();
        assert_eq!(ctx.attempts(), 1);

        cluster.kill_server(&primary);
        router.put("orders", &key, &"v".into(), &mut ctx).await.unwrap();
        assert_eq!(ctx.attempts(), 2);
        assert!(ctx.excluded().contains(&primary));

        router.get("orders", &other, &mut ctx).await.unwrap();
        assert_eq!(ctx.attempts(), 1);
        assert!(ctx.excluded().is_empty());
        assert_eq!(ctx.callback_arg(), Some(&Cacheable::from("audit")));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_single_hop_never_targets() {
        let cluster = three_servers();
        let scheduler = Scheduler::new();
        let mut settings = settings(&cluster.servers());
        settings.single_hop_enabled = false;
        let router = router_with(&cluster, settings, &scheduler).await;
        router.metadata().refresh("orders").await.unwrap();

        let mut ctx = OperationContext::new();
        router.put("orders", &1.into(), &1.into(), &mut ctx).await.unwrap();
        assert!(!ctx.routed_single_hop());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn not_primary_refreshes_and_retries() {
        let cluster = three_servers();
        let scheduler = Scheduler::new();
        let router = router(&cluster, &scheduler).await;
        router.metadata().refresh("orders").await.unwrap();
        let key = CacheableKey::from("moving");
        let primary = cluster.primary_of("orders", &key).unwrap();
        cluster.fail_next(&primary, ServerError::NotPrimary { bucket: None }, 1);

        let mut ctx = OperationContext::new();
        router.put("orders", &key, &"v".into(), &mut ctx).await.unwrap();
        assert_eq!(ctx.attempts(), 2);
        assert!(ctx.excluded().is_empty());
        assert_eq!(router.metadata().refresh_count("orders"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_primary_is_excluded_and_the_write_lands_once() {
        let cluster = three_servers();
        let scheduler = Scheduler::new();
        let router = router(&cluster, &scheduler).await;
        router.metadata().refresh("orders").await.unwrap();
        let key = CacheableKey::from("k");
        let primary = cluster.primary_of("orders", &key).unwrap();
        cluster.kill_server(&primary);

        let mut ctx = OperationContext::new();
        router.put("orders", &key, &"v".into(), &mut ctx).await.unwrap();
        assert_eq!(ctx.attempts(), 2);
        assert!(ctx.excluded().contains(&primary));
        assert_eq!(cluster.get_direct("orders", "k"), Some("v".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_a_connection_failure() {
        let cluster = SimulatedCluster::new();
        let a = cluster.add_server("a", &[]);
        let b = cluster.add_server("b", &[]);
        cluster.create_partitioned_region("orders", 4, 0);
        let scheduler = Scheduler::new();
        let router = router(&cluster, &scheduler).await;
        cluster.kill_server(&a);
        cluster.kill_server(&b);

        let mut ctx = OperationContext::new();
        let error = router.get("orders", &1.into(), &mut ctx).await.unwrap_err();
        assert_eq!(error.category(), "connection_failure");
        assert_eq!(ctx.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn application_errors_are_not_retried() {
        let cluster = three_servers();
        cluster.deny_region("orders");
        let scheduler = Scheduler::new();
        let router = router(&cluster, &scheduler).await;

        let mut ctx = OperationContext::new();
        let error = router.get("orders", &1.into(), &mut ctx).await.unwrap_err();
        assert_eq!(error.category(), "authorization");
        assert_eq!(ctx.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bulk_results_cover_every_distinct_key() {
        let cluster = three_servers();
        let scheduler = Scheduler::new();
        let router = router(&cluster, &scheduler).await;
        router.metadata().refresh("orders").await.unwrap();
        cluster.fail_key(7, ServerError::Application {
            class: "CacheWriterException".into(),
            message: "rejected".into(),
        });

        let entries: Vec<(CacheableKey, Cacheable)> =
            (0..30).map(|i| (CacheableKey::Int32(i % 20), Cacheable::Int32(i))).collect();
        let mut ctx = OperationContext::new();
        let written = router.put_all("orders", entries, &mut ctx).await;
        assert_eq!(written.len(), 20);
        assert_eq!(written.exceptions.len(), 1);
        assert!(written.exceptions.contains_key(&CacheableKey::Int32(7)));
        // later entries win
        assert_eq!(cluster.get_direct("orders", 3), Some(Cacheable::Int32(23)));

        let keys: Vec<CacheableKey> = (0..25).chain(0..5).map(CacheableKey::Int32).collect();
        let read = router.get_all("orders", keys, &mut ctx).await;
        assert_eq!(read.len(), 25);
        assert_eq!(read.values[&CacheableKey::Int32(24)], None);
        assert_eq!(read.values[&CacheableKey::Int32(2)], Some(Cacheable::Int32(22)));
        assert_eq!(cluster.hops(), 0);

        let removed = router
            .remove_all("orders", (0..10).map(CacheableKey::Int32).collect(), &mut ctx)
            .await;
        assert_eq!(removed.values.len(), 9);
        assert_eq!(cluster.entry_count("orders"), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn bulk_batches_fail_independently() {
        let cluster = three_servers();
        let scheduler = Scheduler::new();
        let mut settings = settings(&cluster.servers());
        settings.retry_attempts = 0;
        let router = router_with(&cluster, settings, &scheduler).await;
        router.metadata().refresh("orders").await.unwrap();

        let keys: Vec<CacheableKey> = (0..30).map(CacheableKey::Int32).collect();
        let victim = cluster.primary_of("orders", &keys[0]).unwrap();
        cluster.set_response_delay(&victim, Some(Duration::from_secs(5)));

        let mut ctx = OperationContext::new();
        let entries = keys.iter().map(|k| (k.clone(), Cacheable::Bool(true))).collect();
        let result = router.put_all("orders", entries, &mut ctx).await;
        assert_eq!(result.len(), 30);
        assert!(!result.exceptions.is_empty());
        assert!(!result.values.is_empty());
        for (key, error) in &result.exceptions {
            assert_eq!(cluster.primary_of("orders", key).as_ref(), Some(&victim));
            assert_eq!(error.category(), "timeout");
        }
    }
}
