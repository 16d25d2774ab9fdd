//! Shared helpers for unit tests

use cache_codec::{ClientIdentity, ConflationPreference};
use cache_config::PoolSettings;
use cache_network::test_utils::SimulatedCluster;
use cache_network::{Pool, PoolContext, Scheduler};
use cache_types::ServerLocation;
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn context(cluster: &SimulatedCluster) -> PoolContext {
    PoolContext {
        connector: cluster.connector(),
        identity: ClientIdentity {
            member_id: "client-1".into(),
            durable_id: None,
            durable_timeout_ms: 300_000,
        },
        conflation: ConflationPreference::Server,
        credentials: None,
    }
}

/// Fast timeouts, no maintenance, no minimum
pub(crate) fn settings(servers: &[ServerLocation]) -> PoolSettings {
    let mut settings =
        PoolSettings::with_servers(servers.iter().map(|s| s.to_string())).fast_maintenance();
    settings.idle_timeout_ms = 0;
    settings.load_conditioning_interval_ms = 0;
    settings.ping_interval_ms = 0;
    settings.min_connections = 0;
    settings
}

pub(crate) async fn pool_with(
    cluster: &SimulatedCluster,
    settings: PoolSettings,
    scheduler: &Scheduler,
) -> Arc<Pool> {
    let pool = Pool::new("test", settings, context(cluster), scheduler).unwrap();
    pool.start().await;
    pool
}

/// Pool over every live server of the cluster
pub(crate) async fn pool(cluster: &SimulatedCluster, scheduler: &Scheduler) -> Arc<Pool> {
    pool_with(cluster, settings(&cluster.servers()), scheduler).await
}

/// Let background workers drain their queues
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
