//! Single-hop routing, bulk operations and failure handling through a
//! complete session

mod common;

use cache_client::OperationContext;
use cache_codec::ServerError;
use cache_types::{Cacheable, CacheableKey};
use common::{cluster, pool_settings, session, settle};
use proptest::prelude::*;
use std::collections::HashSet;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn warm_metadata_means_no_hops() {
    let cluster = cluster(3);
    cluster.create_partitioned_region("orders", 113, 1);
    let session = session(&cluster, "client-1", pool_settings(&cluster)).await;
    let orders = session.region("orders", "main").unwrap();
    orders.refresh_metadata().await.unwrap();

    for i in 0..200 {
        orders.put(i, i * 2).await.unwrap();
    }
    for i in 0..200 {
        assert_eq!(orders.get(i).await.unwrap(), Some(Cacheable::Int32(i * 2)));
    }
    assert_eq!(cluster.hops(), 0);
    assert_eq!(cluster.entry_count("orders"), 200);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn a_moved_primary_costs_at_most_one_hop() {
    let cluster = cluster(3);
    cluster.create_partitioned_region("orders", 13, 1);
    let session = session(&cluster, "client-1", pool_settings(&cluster)).await;
    let orders = session.region("orders", "main").unwrap();
    orders.refresh_metadata().await.unwrap();

    let key = CacheableKey::from("moving");
    let bucket = cluster.bucket_of("orders", &key).unwrap();
    let old_primary = cluster.primary_of("orders", &key).unwrap();
    let new_primary = cluster
        .bucket_owners("orders", bucket)
        .into_iter()
        .find(|s| s != &old_primary)
        .unwrap();
    cluster.move_primary("orders", bucket, &new_primary);

    let mut ctx = OperationContext::new();
    orders.put_with_context("moving", 1, &mut ctx).await.unwrap();
    assert!(ctx.network_hop_observed());
    assert_eq!(cluster.hops(), 1);

    settle().await;
    for value in 2..10 {
        let mut ctx = OperationContext::new();
        orders.put_with_context("moving", value, &mut ctx).await.unwrap();
        assert_eq!(ctx.server(), Some(&new_primary));
    }
    assert_eq!(cluster.hops(), 1);
}

#[tokio::test(start_paused = true)]
async fn cold_metadata_is_fetched_in_the_background() {
    let cluster = cluster(2);
    cluster.create_partitioned_region("orders", 13, 0);
    let session = session(&cluster, "client-1", pool_settings(&cluster)).await;
    let orders = session.region("orders", "main").unwrap();
    assert!(orders.metadata().is_none());

    orders.put("k", "v").await.unwrap();
    settle().await;
    assert!(orders.metadata().is_some());
    assert!(cluster.metadata_requests() >= 1);
}

#[tokio::test(start_paused = true)]
async fn a_dead_server_is_retried_around() {
    let cluster = cluster(3);
    cluster.create_partitioned_region("orders", 13, 1);
    let session = session(&cluster, "client-1", pool_settings(&cluster)).await;
    let orders = session.region("orders", "main").unwrap();
    orders.refresh_metadata().await.unwrap();

    let key = CacheableKey::from("k");
    let primary = cluster.primary_of("orders", &key).unwrap();
    cluster.kill_server(&primary);

    let mut ctx = OperationContext::new();
    orders.put_with_context("k", "v", &mut ctx).await.unwrap();
    assert!(ctx.attempts() >= 2);
    assert_ne!(ctx.server(), Some(&primary));
    assert_eq!(cluster.get_direct("orders", "k"), Some("v".into()));
}

#[tokio::test(start_paused = true)]
async fn slow_servers_surface_a_timeout() {
    let cluster = cluster(1);
    cluster.create_partitioned_region("orders", 13, 0);
    let mut settings = pool_settings(&cluster);
    settings.retry_attempts = 0;
    let session = session(&cluster, "client-1", settings).await;
    let orders = session.region("orders", "main").unwrap();
    cluster.set_response_delay(&cluster.servers()[0], Some(Duration::from_secs(5)));

    let error = orders.get("k").await.unwrap_err();
    assert_eq!(error.category(), "timeout");
}

#[tokio::test(start_paused = true)]
async fn server_errors_are_not_retried() {
    let cluster = cluster(2);
    cluster.create_partitioned_region("orders", 13, 0);
    let session = session(&cluster, "client-1", pool_settings(&cluster)).await;
    let orders = session.region("orders", "main").unwrap();
    cluster.fail_key(
        "bad",
        ServerError::Application {
            class: "CacheWriterException".into(),
            message: "rejected".into(),
        },
    );

    let mut ctx = OperationContext::new();
    let error = orders.put_with_context("bad", 1, &mut ctx).await.unwrap_err();
    assert_eq!(error.category(), "server_side");
    assert_eq!(ctx.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn bulk_operations_split_by_primary() {
    let cluster = cluster(3);
    cluster.create_partitioned_region("orders", 13, 1);
    let session = session(&cluster, "client-1", pool_settings(&cluster)).await;
    let orders = session.region("orders", "main").unwrap();
    orders.refresh_metadata().await.unwrap();

    let written = orders.put_all((0..60).map(|i| (i, i))).await;
    assert!(written.is_success());
    assert_eq!(cluster.entry_count("orders"), 60);
    assert_eq!(cluster.hops(), 0);

    let read = orders.get_all(0..60).await;
    assert_eq!(read.len(), 60);
    assert_eq!(read.values[&CacheableKey::Int32(7)], Some(Cacheable::Int32(7)));

    let removed = orders.remove_all(0..30).await;
    assert!(removed.is_success());
    assert_eq!(cluster.entry_count("orders"), 30);
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn bulk_results_cover_each_distinct_key_once(
        keys in prop::collection::vec(0i32..40, 1..60),
        failing in prop::collection::hash_set(0i32..40, 0..5),
    ) {
        let rt = runtime();
        let (values, exceptions) = rt.block_on(async {
            let cluster = cluster(3);
            cluster.create_partitioned_region("orders", 13, 1);
            for key in &failing {
                cluster.fail_key(*key, ServerError::Application {
                    class: "Rejected".into(),
                    message: String::new(),
                });
            }
            let session = session(&cluster, "client-1", pool_settings(&cluster)).await;
            let orders = session.region("orders", "main").unwrap();
            let result = orders.put_all(keys.iter().map(|k| (*k, *k))).await;
            let values: HashSet<CacheableKey> = result.values.keys().cloned().collect();
            let exceptions: HashSet<CacheableKey> = result.exceptions.keys().cloned().collect();
            session.close(false).await;
            (values, exceptions)
        });

        let distinct: HashSet<CacheableKey> = keys.iter().map(|k| CacheableKey::Int32(*k)).collect();
        prop_assert!(values.is_disjoint(&exceptions));
        let covered: HashSet<CacheableKey> = values.union(&exceptions).cloned().collect();
        prop_assert_eq!(&covered, &distinct);
        for key in &exceptions {
            prop_assert!(matches!(key, CacheableKey::Int32(k) if failing.contains(k)));
        }
    }
}
