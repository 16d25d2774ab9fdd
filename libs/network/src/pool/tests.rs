use super::*;
use crate::test_utils::SimulatedCluster;
use cache_codec::{ClientIdentity, ConflationPreference};
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

fn context(cluster: &SimulatedCluster) -> PoolContext {
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

/// Fast timeouts with every maintenance task off
fn quiet(servers: &[ServerLocation]) -> PoolSettings {
    let mut settings = PoolSettings::with_servers(servers.iter().map(|s| s.to_string())).fast_maintenance();
    settings.idle_timeout_ms = 0;
    settings.load_conditioning_interval_ms = 0;
    settings.ping_interval_ms = 0;
    settings.min_connections = 0;
    settings
}

async fn start(cluster: &SimulatedCluster, settings: PoolSettings, scheduler: &Scheduler) -> Arc<Pool> {
    let pool = Pool::new("test", settings, context(cluster), scheduler).unwrap();
    pool.start().await;
    pool
}

#[test_log::test(tokio::test(start_paused = true))]
async fn minimum_connections_are_spread_over_servers() {
    let cluster = SimulatedCluster::new();
    let servers = [
        cluster.add_server("a", &[]),
        cluster.add_server("b", &[]),
        cluster.add_server("c", &[]),
    ];
    let locator = cluster.add_locator("locator");
    let scheduler = Scheduler::new();

    let mut settings = PoolSettings::with_locators([locator.to_string()]).fast_maintenance();
    settings.min_connections = 3;
    settings.idle_timeout_ms = 0;
    let pool = start(&cluster, settings, &scheduler).await;

    assert_eq!(pool.live_connections(), 3);
    for server in &servers {
        assert_eq!(cluster.open_connections(server), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn acquire_at_max_fails_after_free_connection_timeout() {
    let cluster = SimulatedCluster::new();
    let a = cluster.add_server("a", &[]);
    let scheduler = Scheduler::new();
    let mut settings = quiet(&[a]);
    settings.max_connections = Some(2);
    let pool = start(&cluster, settings, &scheduler).await;

    let _first = pool.acquire().await.unwrap();
    let _second = pool.acquire().await.unwrap();

    let started = Instant::now();
    let error = pool.acquire().await.unwrap_err();
    assert_eq!(error.category(), "resource_exhausted");
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(pool.live_connections(), 2);
    assert_eq!(pool.stats().exhausted, 1);
}

#[tokio::test(start_paused = true)]
async fn waiting_acquire_gets_the_released_connection() {
    let cluster = SimulatedCluster::new();
    let a = cluster.add_server("a", &[]);
    let scheduler = Scheduler::new();
    let mut settings = quiet(&[a]);
    settings.max_connections = Some(1);
    let pool = start(&cluster, settings, &scheduler).await;

    let held = pool.acquire().await.unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|c| c.id()) })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let id = held.id();
    drop(held);
    assert_eq!(waiter.await.unwrap().unwrap(), id);
    assert_eq!(pool.live_connections(), 1);
}

#[tokio::test(start_paused = true)]
async fn targeted_acquire_at_max_replaces_an_idle_connection() {
    let cluster = SimulatedCluster::new();
    let a = cluster.add_server("a", &[]);
    let b = cluster.add_server("b", &[]);
    let scheduler = Scheduler::new();
    let mut settings = quiet(&[a.clone(), b.clone()]);
    settings.max_connections = Some(1);
    let pool = start(&cluster, settings, &scheduler).await;

    let to_a = pool.acquire_to(Some(&a), &HashSet::new()).await.unwrap();
    assert_eq!(to_a.location(), &a);
    drop(to_a);

    let to_b = pool.acquire_to(Some(&b), &HashSet::new()).await.unwrap();
    assert_eq!(to_b.location(), &b);
    assert_eq!(pool.live_connections(), 1);
    assert_eq!(pool.stats().closed, 1);
}

#[tokio::test(start_paused = true)]
async fn untargeted_acquire_honours_exclusions() {
    let cluster = SimulatedCluster::new();
    let a = cluster.add_server("a", &[]);
    let b = cluster.add_server("b", &[]);
    let scheduler = Scheduler::new();
    let pool = start(&cluster, quiet(&[a.clone(), b.clone()]), &scheduler).await;

    let excluded: HashSet<_> = [a.clone()].into_iter().collect();
    for _ in 0..3 {
        let connection = pool.acquire_to(None, &excluded).await.unwrap();
        assert_eq!(connection.location(), &b);
    }
}

#[tokio::test(start_paused = true)]
async fn idle_sweep_never_drops_below_minimum() {
    let cluster = SimulatedCluster::new();
    let a = cluster.add_server("a", &[]);
    let scheduler = Scheduler::new();
    let mut settings = quiet(&[a]);
    settings.min_connections = 1;
    settings.idle_timeout_ms = 200;
    let pool = start(&cluster, settings, &scheduler).await;

    let held: Vec<_> = futures::future::join_all((0..3).map(|_| pool.acquire()))
        .await
        .into_iter()
        .collect::<Result<_>>()
        .unwrap();
    assert_eq!(pool.live_connections(), 3);
    drop(held);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(pool.live_connections(), 1);
    assert_eq!(pool.stats().closed, 2);
}

#[tokio::test(start_paused = true)]
async fn load_conditioning_keeps_the_connection_count() {
    let cluster = SimulatedCluster::new();
    let a = cluster.add_server("a", &[]);
    let b = cluster.add_server("b", &[]);
    let scheduler = Scheduler::new();
    let mut settings = quiet(&[a, b]);
    settings.min_connections = 4;
    settings.load_conditioning_interval_ms = 1_000;
    let pool = start(&cluster, settings, &scheduler).await;
    assert_eq!(pool.live_connections(), 4);

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(pool.live_connections(), 4);
    }
    assert!(pool.stats().created >= 8, "{:?}", pool.stats());
}

#[tokio::test(start_paused = true)]
async fn load_stays_within_bounds_and_settles_back_at_minimum() {
    let cluster = SimulatedCluster::new();
    let a = cluster.add_server("a", &[]);
    let b = cluster.add_server("b", &[]);
    let scheduler = Scheduler::new();
    let mut settings = quiet(&[a, b]);
    settings.min_connections = 4;
    settings.max_connections = Some(8);
    settings.idle_timeout_ms = 200;
    settings.load_conditioning_interval_ms = 1_000;
    let pool = start(&cluster, settings, &scheduler).await;
    assert_eq!(pool.live_connections(), 4);

    let peak = Arc::new(AtomicUsize::new(0));
    let monitor = {
        let pool = pool.clone();
        let peak = peak.clone();
        tokio::spawn(async move {
            loop {
                peak.fetch_max(pool.live_connections(), Ordering::Relaxed);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };
    let workers: Vec<_> = (0..16)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move {
                for _ in 0..3 {
                    let connection = pool.acquire().await.unwrap();
                    assert!(pool.live_connections() <= 8, "{:?}", pool.stats());
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    drop(connection);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.await.unwrap();
    }
    monitor.abort();
    assert_eq!(peak.load(Ordering::Relaxed), 8);
    assert_eq!(pool.stats().exhausted, 0);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(pool.live_connections(), 4);

    // through at least one load conditioning pass
    let created = pool.stats().created;
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(pool.live_connections(), 4, "{:?}", pool.stats());
    }
    assert!(pool.stats().created > created, "{:?}", pool.stats());
}

#[tokio::test(start_paused = true)]
async fn failed_ping_invalidates_the_server() {
    let cluster = SimulatedCluster::new();
    let a = cluster.add_server("a", &[]);
    let b = cluster.add_server("b", &[]);
    let scheduler = Scheduler::new();
    let mut settings = quiet(&[a.clone(), b.clone()]);
    settings.min_connections = 2;
    settings.ping_interval_ms = 500;
    let pool = start(&cluster, settings, &scheduler).await;
    assert_eq!(cluster.open_connections(&b), 1);

    cluster.kill_server(&b);
    tokio::time::sleep(Duration::from_millis(700)).await;

    assert_eq!(pool.live_connections(), 2);
    assert!(pool.idle_servers().iter().all(|s| s == &a));
}

#[tokio::test(start_paused = true)]
async fn invalidated_guard_closes_its_connection() {
    let cluster = SimulatedCluster::new();
    let a = cluster.add_server("a", &[]);
    let scheduler = Scheduler::new();
    let pool = start(&cluster, quiet(&[a.clone()]), &scheduler).await;

    let mut connection = pool.acquire().await.unwrap();
    connection.invalidate();
    drop(connection);
    tokio::task::yield_now().await;

    assert_eq!(pool.live_connections(), 0);
    assert_eq!(pool.stats().closed, 1);
}

#[tokio::test(start_paused = true)]
async fn closing_the_pool_fails_waiters() {
    let cluster = SimulatedCluster::new();
    let a = cluster.add_server("a", &[]);
    let scheduler = Scheduler::new();
    let mut settings = quiet(&[a]);
    settings.max_connections = Some(1);
    settings.free_connection_timeout_ms = 60_000;
    let pool = start(&cluster, settings, &scheduler).await;

    let _held = pool.acquire().await.unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    pool.close().await;
    let error = waiter.await.unwrap().unwrap_err();
    assert_eq!(error.category(), "closed");
    assert!(pool.acquire().await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_racing_new_waiters_fails_them_all_promptly() {
    let cluster = SimulatedCluster::new();
    let a = cluster.add_server("a", &[]);
    let scheduler = Scheduler::new();
    let mut settings = quiet(&[a]);
    settings.max_connections = Some(1);
    settings.free_connection_timeout_ms = 60_000;
    let pool = start(&cluster, settings, &scheduler).await;
    let _held = pool.acquire().await.unwrap();

    let waiters: Vec<_> = (0..64)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        })
        .collect();
    pool.close().await;

    for waiter in waiters {
        let error = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter outlived the pool")
            .unwrap()
            .unwrap_err();
        assert_eq!(error.category(), "closed");
    }
}

#[tokio::test]
async fn registry_rejects_duplicate_names() {
    let cluster = SimulatedCluster::new();
    let a = cluster.add_server("a", &[]);
    let scheduler = Scheduler::new();
    let registry = PoolRegistry::new();

    registry
        .create_pool("orders", quiet(&[a.clone()]), context(&cluster), &scheduler)
        .await
        .unwrap();
    let error = registry
        .create_pool("orders", quiet(&[a]), context(&cluster), &scheduler)
        .await
        .unwrap_err();
    assert_eq!(error.category(), "illegal_state");
    assert_eq!(registry.names(), vec!["orders".to_string()]);

    assert!(registry.destroy("orders").await);
    assert!(registry.is_empty());
}

#[test]
fn invalid_bounds_are_rejected() {
    let cluster = SimulatedCluster::new();
    let scheduler = Scheduler::new();
    let mut settings = PoolSettings::with_servers(["a:40404"]);
    settings.min_connections = 5;
    settings.max_connections = Some(2);
    let error = Pool::new("bad", settings, context(&cluster), &scheduler).unwrap_err();
    assert_eq!(error.category(), "configuration");
}
