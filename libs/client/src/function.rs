//! Server-side function execution
//!
//! A function over a partitioned region runs once per server, each run
//! covering a disjoint set of whole buckets. With a filter only the buckets of
//! the filter keys are covered and each server receives the keys of its own
//! buckets. Write-optimised functions run on primaries; others run on a
//! small covering set of servers.
//!
//! HA functions re-plan the buckets of failed runs onto the remaining servers.
//! Failures of other functions are reported per server and bucket set.

use cache_codec::{EncodedValue, FunctionOptions, Operation, ResponseBody};
use cache_types::{BucketId, Cacheable, CacheableKey, ServerLocation};
use futures::future::join_all;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

use crate::context::OperationContext;
use crate::error::{ClientError, Result};
use crate::failure::Step;
use crate::router::{surface, unexpected, Router};

type Plan = HashMap<ServerLocation, BTreeSet<BucketId>>;

/// A function invocation against a region
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    function_id: String,
    filter: Vec<CacheableKey>,
    args: Option<Cacheable>,
    options: FunctionOptions,
}

impl Execution {
    /// Defaults to an HA function with a result
    pub fn new(function_id: impl Into<String>) -> Self {
        Self {
            function_id: function_id.into(),
            filter: Vec::new(),
            args: None,
            options: FunctionOptions {
                has_result: true,
                is_ha: true,
                optimize_for_write: false,
            },
        }
    }

    pub fn with_filter(mut self, keys: impl IntoIterator<Item = impl Into<CacheableKey>>) -> Self {
        self.filter = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_args(mut self, args: impl Into<Cacheable>) -> Self {
        self.args = Some(args.into());
        self
    }

    pub fn optimize_for_write(mut self, enabled: bool) -> Self {
        self.options.optimize_for_write = enabled;
        self
    }

    pub fn ha(mut self, enabled: bool) -> Self {
        self.options.is_ha = enabled;
        self
    }

    pub fn has_result(mut self, enabled: bool) -> Self {
        self.options.has_result = enabled;
        self
    }

    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    pub fn filter(&self) -> &[CacheableKey] {
        &self.filter
    }

    pub fn options(&self) -> FunctionOptions {
        self.options
    }
}

/// Failure of one server's share of an execution
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionFailure {
    pub server: Option<ServerLocation>,
    pub buckets: BTreeSet<BucketId>,
    pub error: ClientError,
}

/// Results of every run that succeeded plus the failures of the rest
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionResult {
    pub results: Vec<Cacheable>,
    pub failures: Vec<FunctionFailure>,
}

impl FunctionResult {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// The results, or the first failure
    pub fn into_result(self) -> Result<Vec<Cacheable>> {
        match self.failures.into_iter().next() {
            Some(failure) => Err(failure.error),
            None => Ok(self.results),
        }
    }
}

impl Router {
    pub async fn execute_function(
        &self,
        region: &str,
        execution: &Execution,
        ctx: &mut OperationContext,
    ) -> Result<FunctionResult> {
        ctx.begin_operation();
        let args = execution.args.as_ref().map(|a| self.registry().encode(a));
        let budget = if execution.options.is_ha {
            self.failures().attempt_budget(region)
        } else {
            1
        };

        let Some((plan, keys_by_bucket)) = self.plan_function(region, execution, ctx) else {
            return self.execute_anywhere(region, execution, args, budget, ctx).await;
        };
        debug!(
            region,
            function = %execution.function_id,
            servers = plan.len(),
            filtered = !execution.filter.is_empty(),
            "Executing function"
        );

        let mut result = FunctionResult::default();
        let mut pending = plan;
        let mut last = None;
        while !pending.is_empty() {
            ctx.begin_attempt();
            let runs = pending.into_iter().map(|(server, buckets)| {
                let mut run_ctx = ctx.fork();
                let filter = filter_for(&keys_by_bucket, &buckets);
                let operation = Operation::ExecuteFunction {
                    function_id: execution.function_id.clone(),
                    filter,
                    buckets: buckets.iter().copied().collect(),
                    args: args.clone(),
                    options: execution.options,
                };
                async move {
                    let outcome = self
                        .dispatch(region, Some(&server), &mut run_ctx, operation, execution.options.is_ha)
                        .await;
                    (server, buckets, outcome, run_ctx)
                }
            });

            let mut retry = BTreeSet::new();
            for (server, buckets, outcome, run_ctx) in join_all(runs).await {
                ctx.absorb(&run_ctx);
                let outcome = outcome.map(|body| self.function_values(execution, body));
                match self.failures().assess(region, ctx, outcome, budget).await {
                    Step::Done(Ok(values)) => result.results.extend(values),
                    Step::Done(Err(error)) | Step::Fail(error) => result.failures.push(FunctionFailure {
                        server: Some(server),
                        buckets,
                        error: surface(error, last.clone()),
                    }),
                    Step::Retry(error) => {
                        last = Some(error);
                        retry.extend(buckets);
                    }
                }
            }

            if retry.is_empty() {
                break;
            }
            pending = match self.replan(region, execution, &retry, ctx) {
                Some(plan) => plan,
                None => {
                    let error = last.clone().unwrap_or_else(|| no_owner(region));
                    warn!(region, function = %execution.function_id, buckets = retry.len(), "No servers left for function buckets");
                    result.failures.push(FunctionFailure {
                        server: None,
                        buckets: retry,
                        error,
                    });
                    Plan::new()
                }
            };
        }
        Ok(result)
    }

    /// Per-server bucket sets plus the filter keys of each bucket. `None` when
    /// routing by bucket is not possible.
    fn plan_function(
        &self,
        region: &str,
        execution: &Execution,
        ctx: &OperationContext,
    ) -> Option<(Plan, HashMap<BucketId, Vec<CacheableKey>>)> {
        if !self.pool().settings().single_hop_enabled {
            return None;
        }
        let metadata = self.metadata();
        let primary_only = execution.options.optimize_for_write;
        if execution.filter.is_empty() {
            let plan = metadata.group_all_buckets(region, primary_only)?;
            return Some((plan, HashMap::new()));
        }

        let mut keys_by_bucket: HashMap<BucketId, Vec<CacheableKey>> = HashMap::new();
        for key in &execution.filter {
            let bucket = metadata.bucket_for_key(region, key, ctx.callback_arg())?;
            keys_by_bucket.entry(bucket).or_default().push(key.clone());
        }
        let buckets: BTreeSet<BucketId> = keys_by_bucket.keys().copied().collect();
        let plan = metadata.group_buckets(region, &buckets, primary_only, ctx.excluded())?;
        Some((plan, keys_by_bucket))
    }

    fn replan(
        &self,
        region: &str,
        execution: &Execution,
        buckets: &BTreeSet<BucketId>,
        ctx: &OperationContext,
    ) -> Option<Plan> {
        self.metadata().group_buckets(
            region,
            buckets,
            execution.options.optimize_for_write,
            ctx.excluded(),
        )
    }

    /// One run through any pool server, the server resolving buckets itself
    async fn execute_anywhere(
        &self,
        region: &str,
        execution: &Execution,
        args: Option<EncodedValue>,
        budget: u32,
        ctx: &mut OperationContext,
    ) -> Result<FunctionResult> {
        let operation = Operation::ExecuteFunction {
            function_id: execution.function_id.clone(),
            filter: execution.filter.clone(),
            buckets: Vec::new(),
            args,
            options: execution.options,
        };
        debug!(region, function = %execution.function_id, "Executing function through any server");
        let mut last = None;
        loop {
            ctx.begin_attempt();
            let outcome = self
                .dispatch(region, None, ctx, operation.clone(), execution.options.is_ha)
                .await;
            match self.failures().assess(region, ctx, outcome, budget).await {
                Step::Done(body) => {
                    return Ok(FunctionResult {
                        results: self.function_values(execution, body)?,
                        failures: Vec::new(),
                    })
                }
                Step::Retry(error) => last = Some(error),
                Step::Fail(error) => return Err(surface(error, last)),
            }
        }
    }

    fn function_values(&self, execution: &Execution, body: ResponseBody) -> Result<Vec<Cacheable>> {
        match body {
            ResponseBody::FunctionResults { .. } if !execution.options.has_result => Ok(Vec::new()),
            ResponseBody::FunctionResults { results } => results
                .iter()
                .map(|value| self.registry().decode(value).map_err(ClientError::from))
                .collect(),
            other => Err(unexpected("execute_function", &other)),
        }
    }
}

fn filter_for(
    keys_by_bucket: &HashMap<BucketId, Vec<CacheableKey>>,
    buckets: &BTreeSet<BucketId>,
) -> Vec<CacheableKey> {
    buckets
        .iter()
        .filter_map(|b| keys_by_bucket.get(b))
        .flatten()
        .cloned()
        .collect()
}

fn no_owner(region: &str) -> ClientError {
    ClientError::NoServersAvailable {
        message: format!("no server hosts the remaining buckets of '{}'", region),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ClientMetadataService;
    use crate::testing::{pool_with, settings};
    use cache_codec::{ServerError, TypeRegistry};
    use cache_config::MetadataSettings;
    use cache_network::test_utils::SimulatedCluster;
    use cache_network::Scheduler;
    use cache_types::EventIdGenerator;
    use std::sync::Arc;

    async fn router(cluster: &SimulatedCluster, scheduler: &Scheduler) -> Router {
        let pool = pool_with(cluster, settings(&cluster.servers()), scheduler).await;
        let metadata = ClientMetadataService::new(pool.clone(), MetadataSettings::default(), scheduler);
        Router::new(
            pool,
            metadata,
            Arc::new(TypeRegistry::default()),
            Arc::new(EventIdGenerator::new("client-1")),
        )
    }

    fn cluster(redundancy: usize) -> SimulatedCluster {
        let cluster = SimulatedCluster::new();
        for name in ["a", "b", "c"] {
            cluster.add_server(name, &[]);
        }
        cluster.create_partitioned_region("orders", 12, redundancy);
        cluster.register_function("count", |call| Ok(vec![Cacheable::Int32(call.buckets.len() as i32)]));
        cluster
    }

    fn covered(cluster: &SimulatedCluster, function: &str) -> Vec<BucketId> {
        let mut buckets: Vec<BucketId> = cluster
            .function_calls(function)
            .into_iter()
            .flat_map(|c| c.buckets)
            .collect();
        buckets.sort();
        buckets
    }

    #[tokio::test(start_paused = true)]
    async fn region_execution_covers_each_bucket_once() {
        let cluster = cluster(1);
        let scheduler = Scheduler::new();
        let router = router(&cluster, &scheduler).await;
        router.metadata().refresh("orders").await.unwrap();

        let mut ctx = OperationContext::new();
        let result = router
            .execute_function("orders", &Execution::new("count"), &mut ctx)
            .await
            .unwrap();
        assert!(result.is_success());
        let total: i32 = result
            .results
            .iter()
            .map(|r| match r {
                Cacheable::Int32(n) => *n,
                other => panic!("unexpected {:?}", other),
            })
            .sum();
        assert_eq!(total, 12);
        assert_eq!(covered(&cluster, "count"), (0..12).map(BucketId::new).collect::<Vec<_>>());
        assert!(cluster.function_calls("count").len() <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn filtered_write_execution_runs_on_primaries_with_their_keys() {
        let cluster = cluster(1);
        let scheduler = Scheduler::new();
        let router = router(&cluster, &scheduler).await;
        router.metadata().refresh("orders").await.unwrap();

        let keys: Vec<CacheableKey> = (0..10).map(CacheableKey::Int32).collect();
        let execution = Execution::new("count")
            .with_filter(keys.clone())
            .with_args("go")
            .optimize_for_write(true);
        let mut ctx = OperationContext::new();
        let result = router.execute_function("orders", &execution, &mut ctx).await.unwrap();
        assert!(result.is_success());

        let calls = cluster.function_calls("count");
        let mut seen = Vec::new();
        for call in &calls {
            assert_eq!(call.args, Some(Cacheable::from("go")));
            for key in &call.filter {
                assert_eq!(cluster.primary_of("orders", key).as_ref(), Some(&call.server));
                assert!(call.buckets.contains(&cluster.bucket_of("orders", key).unwrap()));
                seen.push(key.clone());
            }
        }
        seen.sort_by_key(|k| k.to_string());
        let mut expected = keys;
        expected.sort_by_key(|k| k.to_string());
        assert_eq!(seen, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn ha_execution_moves_buckets_off_a_dead_server() {
        let cluster = cluster(1);
        let scheduler = Scheduler::new();
        let router = router(&cluster, &scheduler).await;
        router.metadata().refresh("orders").await.unwrap();
        let dead = cluster.servers()[0].clone();
        cluster.kill_server(&dead);

        let mut ctx = OperationContext::new();
        let result = router
            .execute_function("orders", &Execution::new("count"), &mut ctx)
            .await
            .unwrap();
        assert!(result.is_success(), "{:?}", result.failures);
        assert!(ctx.excluded().contains(&dead));
        assert_eq!(covered(&cluster, "count"), (0..12).map(BucketId::new).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn non_ha_failures_are_reported_per_server() {
        let cluster = cluster(0);
        let scheduler = Scheduler::new();
        let router = router(&cluster, &scheduler).await;
        router.metadata().refresh("orders").await.unwrap();
        let broken = cluster.servers()[1].clone();
        cluster.fail_next(&broken, ServerError::ServerShuttingDown, 1);

        let mut ctx = OperationContext::new();
        let result = router
            .execute_function("orders", &Execution::new("count").ha(false), &mut ctx)
            .await
            .unwrap();
        assert_eq!(result.failures.len(), 1);
        let failure = &result.failures[0];
        assert_eq!(failure.server.as_ref(), Some(&broken));
        assert_eq!(failure.buckets.len(), 4);
        assert_eq!(result.results.len(), 2);
        assert!(result.clone().into_result().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn without_metadata_runs_once_anywhere() {
        let cluster = cluster(0);
        cluster.create_replicated_region("lookup");
        let scheduler = Scheduler::new();
        let router = router(&cluster, &scheduler).await;

        let mut ctx = OperationContext::new();
        let execution = Execution::new("count").has_result(false);
        let result = router.execute_function("lookup", &execution, &mut ctx).await.unwrap();
        assert!(result.results.is_empty());
        assert_eq!(cluster.function_calls("count").len(), 1);
        assert!(cluster.function_calls("count")[0].buckets.is_empty());
    }
}
