//! # Failure Coordinator
//!
//! Every dispatch attempt ends in an [`Outcome`]. The coordinator decides
//! whether a failed attempt is retried and prepares the retry:
//!
//! ```text
//! Routing → AwaitingConnection → InFlight ─┬─ Success ─────────────▶ done
//!    ▲                                     ├─ Retryable ─ budget? ─┐
//!    └─────────── exclude server / refresh ┘                       └─ no ─▶ last error
//!                                          └─ Fatal ───────────────▶ error
//! ```
//!
//! Transport failures exclude the server for the rest of the operation,
//! close the pool's idle connections to it and mark the region's metadata
//! stale. A not-primary reply keeps the server but waits for a bucket map
//! refresh before the next attempt.

use cache_codec::ServerError;
use cache_network::{Pool, TransportError};
use cache_types::ServerLocation;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::context::OperationContext;
use crate::error::ClientError;
use crate::metadata::ClientMetadataService;

/// Why an attempt may succeed elsewhere or later
#[derive(Debug, Clone, PartialEq)]
pub enum RetryReason {
    /// Reset, refused or otherwise unusable connection
    ConnectionLost {
        server: ServerLocation,
        error: ClientError,
    },
    ShuttingDown {
        server: ServerLocation,
        error: ClientError,
    },
    /// The server no longer hosts the bucket or is moving it
    NotPrimary {
        server: ServerLocation,
        error: ClientError,
    },
    /// Read timeout on an operation that is safe to replay
    Timeout {
        server: ServerLocation,
        error: ClientError,
    },
}

impl RetryReason {
    pub fn server(&self) -> &ServerLocation {
        match self {
            RetryReason::ConnectionLost { server, .. }
            | RetryReason::ShuttingDown { server, .. }
            | RetryReason::NotPrimary { server, .. }
            | RetryReason::Timeout { server, .. } => server,
        }
    }

    pub fn error(&self) -> &ClientError {
        match self {
            RetryReason::ConnectionLost { error, .. }
            | RetryReason::ShuttingDown { error, .. }
            | RetryReason::NotPrimary { error, .. }
            | RetryReason::Timeout { error, .. } => error,
        }
    }

    pub fn into_error(self) -> ClientError {
        match self {
            RetryReason::ConnectionLost { error, .. }
            | RetryReason::ShuttingDown { error, .. }
            | RetryReason::NotPrimary { error, .. }
            | RetryReason::Timeout { error, .. } => error,
        }
    }

    /// Whether the server itself is suspect
    fn is_transport(&self) -> bool {
        !matches!(self, RetryReason::NotPrimary { .. })
    }
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            RetryReason::ConnectionLost { .. } => "connection lost",
            RetryReason::ShuttingDown { .. } => "server shutting down",
            RetryReason::NotPrimary { .. } => "not primary",
            RetryReason::Timeout { .. } => "timeout",
        };
        write!(f, "{} ({})", kind, self.server())
    }
}

/// Result of one dispatch attempt
#[derive(Debug)]
pub enum Outcome<T> {
    Success(T),
    Retryable(RetryReason),
    Fatal(ClientError),
}

impl<T> Outcome<T> {
    /// Classify an error raised while talking to `server`. Timeouts are only
    /// retryable when the operation may safely be replayed.
    pub fn from_transport(error: TransportError, server: &ServerLocation, replay_safe: bool) -> Self {
        match error {
            TransportError::Timeout { .. } if replay_safe => Outcome::Retryable(RetryReason::Timeout {
                server: server.clone(),
                error: error.into(),
            }),
            TransportError::Timeout { .. } => Outcome::Fatal(error.into()),
            TransportError::Connection { .. }
            | TransportError::Closed { .. }
            | TransportError::Io { .. } => Outcome::Retryable(RetryReason::ConnectionLost {
                server: server.clone(),
                error: ClientError::connection_failure(error.to_string(), Some(server)),
            }),
            other => Outcome::Fatal(other.into()),
        }
    }

    /// Classify an error reply from `server`
    pub fn from_server(error: ServerError, server: &ServerLocation) -> Self {
        let client_error = ClientError::from_server(error.clone(), Some(server));
        match error {
            ServerError::NotPrimary { .. } | ServerError::Rebalancing => {
                Outcome::Retryable(RetryReason::NotPrimary {
                    server: server.clone(),
                    error: client_error,
                })
            }
            ServerError::ServerShuttingDown => Outcome::Retryable(RetryReason::ShuttingDown {
                server: server.clone(),
                error: client_error,
            }),
            _ => Outcome::Fatal(client_error),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Success(value) => Outcome::Success(f(value)),
            Outcome::Retryable(reason) => Outcome::Retryable(reason),
            Outcome::Fatal(error) => Outcome::Fatal(error),
        }
    }
}

/// What the caller does after an attempt
#[derive(Debug)]
pub enum Step<T> {
    Done(T),
    /// Try again; carries the error of the failed attempt
    Retry(ClientError),
    Fail(ClientError),
}

/// Retry policy of one pool
pub struct FailureCoordinator {
    pool: Arc<Pool>,
    metadata: Arc<ClientMetadataService>,
    retry_attempts: i32,
}

impl FailureCoordinator {
    pub fn new(pool: Arc<Pool>, metadata: Arc<ClientMetadataService>) -> Self {
        Self {
            retry_attempts: pool.settings().retry_attempts,
            pool,
            metadata,
        }
    }

    pub fn metadata(&self) -> &Arc<ClientMetadataService> {
        &self.metadata
    }

    /// Total attempts allowed for one operation. `-1` allows one attempt per
    /// known server: those the selector has seen, those in the region's bucket
    /// map and those the pool holds connections to. Nothing is fetched.
    pub fn attempt_budget(&self, region: &str) -> u32 {
        if self.retry_attempts >= 0 {
            return self.retry_attempts as u32 + 1;
        }
        let mut known: HashSet<ServerLocation> =
            self.pool.selector().known_servers().into_iter().collect();
        if let Some(snapshot) = self.metadata.cached(region) {
            known.extend(snapshot.servers());
        }
        known.extend(self.pool.idle_servers());
        known.len().max(1) as u32
    }

    /// Decide on the outcome of the attempt `ctx` just made
    pub async fn assess<T>(
        &self,
        region: &str,
        ctx: &mut OperationContext,
        outcome: Outcome<T>,
        budget: u32,
    ) -> Step<T> {
        let reason = match outcome {
            Outcome::Success(value) => return Step::Done(value),
            Outcome::Fatal(error) => {
                debug!(region, error = %error, attempts = ctx.attempts(), "Operation failed");
                return Step::Fail(error);
            }
            Outcome::Retryable(reason) => reason,
        };

        if reason.is_transport() {
            let server = reason.server().clone();
            ctx.exclude(server.clone());
            self.pool.invalidate_server(&server).await;
            self.metadata.mark_stale(region);
        }

        if ctx.attempts() >= budget {
            warn!(
                region,
                attempts = ctx.attempts(),
                reason = %reason,
                "Retry attempts exhausted"
            );
            return Step::Fail(reason.into_error());
        }

        warn!(
            region,
            attempt = ctx.attempts(),
            budget,
            reason = %reason,
            "Retrying operation"
        );
        if let RetryReason::NotPrimary { .. } = reason {
            if let Err(e) = self.metadata.refresh(region).await {
                debug!(region, error = %e, "Metadata refresh before retry failed");
            }
        }
        Step::Retry(reason.into_error())
    }
}

impl fmt::Debug for FailureCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureCoordinator")
            .field("pool", &self.pool.name())
            .field("retry_attempts", &self.retry_attempts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pool_with, settings};
    use cache_config::MetadataSettings;
    use cache_network::test_utils::SimulatedCluster;
    use cache_network::Scheduler;

    fn server() -> ServerLocation {
        ServerLocation::new("a", 40404)
    }

    #[test]
    fn transport_errors_are_classified() {
        let lost: Outcome<()> =
            Outcome::from_transport(TransportError::connection("reset", None), &server(), false);
        assert!(matches!(lost, Outcome::Retryable(RetryReason::ConnectionLost { .. })));

        let replayable: Outcome<()> =
            Outcome::from_transport(TransportError::timeout("get", 10), &server(), true);
        assert!(matches!(replayable, Outcome::Retryable(RetryReason::Timeout { .. })));

        let ambiguous: Outcome<()> =
            Outcome::from_transport(TransportError::timeout("put_all", 10), &server(), false);
        assert!(matches!(ambiguous, Outcome::Fatal(ClientError::Timeout { .. })));
    }

    #[test]
    fn server_errors_are_classified() {
        let moved: Outcome<()> = Outcome::from_server(ServerError::Rebalancing, &server());
        assert!(matches!(moved, Outcome::Retryable(RetryReason::NotPrimary { .. })));

        let closing: Outcome<()> = Outcome::from_server(ServerError::ServerShuttingDown, &server());
        match closing {
            Outcome::Retryable(reason) => assert_eq!(reason.error().category(), "connection_failure"),
            other => panic!("unexpected {:?}", other),
        }

        let denied: Outcome<()> = Outcome::from_server(
            ServerError::NotAuthorized {
                message: "get".into(),
            },
            &server(),
        );
        assert!(matches!(denied, Outcome::Fatal(ClientError::Authorization { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn budget_follows_retry_attempts() {
        let cluster = SimulatedCluster::new();
        for name in ["a", "b", "c"] {
            cluster.add_server(name, &[]);
        }
        let scheduler = Scheduler::new();

        let every_server = pool_with(&cluster, settings(&cluster.servers()), &scheduler).await;
        let metadata = ClientMetadataService::new(every_server.clone(), MetadataSettings::default(), &scheduler);
        assert_eq!(FailureCoordinator::new(every_server, metadata).attempt_budget("r"), 3);

        let mut bounded = settings(&cluster.servers());
        bounded.retry_attempts = 1;
        let bounded = pool_with(&cluster, bounded, &scheduler).await;
        let metadata = ClientMetadataService::new(bounded.clone(), MetadataSettings::default(), &scheduler);
        assert_eq!(FailureCoordinator::new(bounded, metadata).attempt_budget("r"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_exclude_the_server_until_the_budget_runs_out() {
        let cluster = SimulatedCluster::new();
        cluster.add_server("a", &[]);
        let scheduler = Scheduler::new();
        let pool = pool_with(&cluster, settings(&cluster.servers()), &scheduler).await;
        let metadata = ClientMetadataService::new(pool.clone(), MetadataSettings::default(), &scheduler);
        let coordinator = FailureCoordinator::new(pool, metadata);
        let mut ctx = OperationContext::new();

        let lost = || -> Outcome<()> {
            Outcome::from_transport(TransportError::connection("reset", None), &server(), true)
        };

        ctx.begin_attempt();
        assert!(matches!(coordinator.assess("r", &mut ctx, lost(), 2).await, Step::Retry(_)));
        assert!(ctx.excluded().contains(&server()));

        ctx.begin_attempt();
        match coordinator.assess("r", &mut ctx, lost(), 2).await {
            Step::Fail(error) => assert_eq!(error.category(), "connection_failure"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
