//! Shared fixtures for the client integration tests

#![allow(dead_code)]

use cache_client::{CacheListener, CacheSession, EntryEvent};
use cache_config::{ClientConfig, PoolSettings, SubscriptionSettings};
use cache_network::test_utils::SimulatedCluster;
use cache_types::{Cacheable, CacheableKey};
use parking_lot::Mutex;
use std::time::Duration;

/// Cluster of `servers` servers named `s0`, `s1`, ...
pub fn cluster(servers: usize) -> SimulatedCluster {
    let cluster = SimulatedCluster::new();
    for i in 0..servers {
        cluster.add_server(&format!("s{}", i), &[]);
    }
    cluster
}

/// Pool over every live server with maintenance timers off
pub fn pool_settings(cluster: &SimulatedCluster) -> PoolSettings {
    let mut settings = PoolSettings::with_servers(cluster.servers().iter().map(|s| s.to_string()))
        .fast_maintenance();
    settings.idle_timeout_ms = 0;
    settings.load_conditioning_interval_ms = 0;
    settings.ping_interval_ms = 0;
    settings.min_connections = 0;
    settings
}

pub fn subscribed(mut settings: PoolSettings, redundancy: i32, durable_id: Option<&str>) -> PoolSettings {
    settings.subscription = SubscriptionSettings {
        enabled: true,
        redundancy,
        ack_interval_ms: 100,
        durable_client_id: durable_id.map(str::to_string),
        ..SubscriptionSettings::default()
    };
    settings
}

/// Session with a single pool named `main`
pub async fn session(cluster: &SimulatedCluster, member: &str, settings: PoolSettings) -> CacheSession {
    let mut config = ClientConfig::default();
    config.pools.clear();
    config.pools.insert("main".into(), settings);
    CacheSession::builder()
        .config(config)
        .connector(cluster.connector())
        .member_id(member)
        .build()
        .await
        .expect("session starts")
}

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Keeps `(key, value)` of every delivered event
#[derive(Debug, Default)]
pub struct Collector {
    events: Mutex<Vec<(CacheableKey, Option<Cacheable>)>>,
}

impl Collector {
    pub fn events(&self) -> Vec<(CacheableKey, Option<Cacheable>)> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    fn record(&self, event: &EntryEvent) {
        self.events.lock().push((event.key.clone(), event.new_value.clone()));
    }
}

impl CacheListener for Collector {
    fn after_create(&self, event: &EntryEvent) {
        self.record(event);
    }

    fn after_update(&self, event: &EntryEvent) {
        self.record(event);
    }

    fn after_destroy(&self, event: &EntryEvent) {
        self.record(event);
    }
}
