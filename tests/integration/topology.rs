//! Topology discovery integration tests

use std::sync::Arc;
use std::time::Duration;

use clusterwatch::driver::dialect::{AuroraMySqlDialect, Dialect};
use clusterwatch::{
    ClusterHostListProvider, HostRole, MonitoringConfig, Properties, TopologyCache, TopologyError,
    TopologyMonitorRegistry,
};

use crate::mock::{host, instance_dns, row, MockCluster, MockConnectionService, CLUSTER_DNS, READER_DNS};

fn fast_config() -> MonitoringConfig {
    MonitoringConfig {
        topology_refresh_rate_ms: 50,
        topology_high_refresh_rate_ms: 10,
        topology_cache_expiration_ms: 60_000,
        cluster_instance_host_pattern: None,
    }
}

struct Fixture {
    cluster: Arc<MockCluster>,
    service: Arc<MockConnectionService>,
    cache: Arc<TopologyCache>,
    registry: Arc<TopologyMonitorRegistry>,
}

fn fixture() -> Fixture {
    crate::init_logging();
    let cluster = MockCluster::new();
    let service = MockConnectionService::new(cluster.clone());
    let cache = Arc::new(TopologyCache::new());
    let registry = TopologyMonitorRegistry::new(cache.clone(), service.clone(), &fast_config());
    Fixture {
        cluster,
        service,
        cache,
        registry,
    }
}

fn provider(f: &Fixture, url: &str) -> ClusterHostListProvider {
    ClusterHostListProvider::new(
        host(url),
        Properties::new(),
        &fast_config(),
        f.cache.clone(),
        f.registry.clone(),
        Arc::new(AuroraMySqlDialect),
    )
}

#[tokio::test]
async fn test_topology_fetched_once_then_served_from_cache() {
    let f = fixture();
    f.cluster
        .set_topology(vec![row("node-2", false), row("node-1", true)]);
    let p = provider(&f, CLUSTER_DNS);
    let conn = f.service.connect(&host(CLUSTER_DNS)).await;

    let (hosts, cached) = p.get_topology(&conn, false).await.unwrap();
    assert!(!cached);
    assert_eq!(hosts.len(), 2);
    assert_eq!(hosts[0].role(), HostRole::Writer);
    assert_eq!(hosts[0].host_id(), Some("node-1"));
    assert_eq!(hosts[0].host(), instance_dns("node-1"));

    let (again, cached) = p.get_topology(&conn, false).await.unwrap();
    assert!(cached);
    assert!(Arc::ptr_eq(&hosts, &again));

    f.registry.shutdown().await;
}

#[tokio::test]
async fn test_expired_cache_entry_triggers_a_fresh_query() {
    let f = fixture();
    f.cluster.set_topology(vec![row("node-1", true)]);
    let config = MonitoringConfig {
        topology_cache_expiration_ms: 50,
        ..fast_config()
    };
    let p = ClusterHostListProvider::new(
        host(CLUSTER_DNS),
        Properties::new(),
        &config,
        f.cache.clone(),
        f.registry.clone(),
        Arc::new(AuroraMySqlDialect),
    );
    let conn = f.service.connect(&host(CLUSTER_DNS)).await;

    p.get_topology(&conn, false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    f.cluster.set_topology(vec![row("node-2", true)]);
    let (hosts, cached) = p.get_topology(&conn, false).await.unwrap();
    assert!(!cached);
    assert_eq!(hosts[0].host_id(), Some("node-2"));

    f.registry.shutdown().await;
}

#[tokio::test]
async fn test_force_refresh_bypasses_cache() {
    let f = fixture();
    f.cluster.set_topology(vec![row("node-1", true)]);
    let p = provider(&f, CLUSTER_DNS);
    let conn = f.service.connect(&host(CLUSTER_DNS)).await;

    p.get_topology(&conn, false).await.unwrap();

    f.cluster
        .set_topology(vec![row("node-2", true), row("node-1", false)]);
    let (hosts, cached) = p.get_topology(&conn, true).await.unwrap();
    assert!(!cached);
    assert_eq!(hosts[0].host_id(), Some("node-2"));

    f.registry.shutdown().await;
}

#[tokio::test]
async fn test_no_writer_rows_cache_an_empty_list() {
    let f = fixture();
    f.cluster
        .set_topology(vec![row("node-1", true), row("node-2", false)]);
    let p = provider(&f, CLUSTER_DNS);
    let conn = f.service.connect(&host(CLUSTER_DNS)).await;

    // Seed the cache, then force a refresh during which no writer is known.
    p.get_topology(&conn, true).await.unwrap();
    f.cluster
        .set_topology(vec![row("node-1", false), row("node-2", false)]);
    let (hosts, cached) = p.get_topology(&conn, true).await.unwrap();
    assert!(hosts.is_empty());
    assert!(!cached);

    // Every sharer of the cluster id sees the writer is unknown.
    let (hosts, cached) = p.get_topology(&conn, false).await.unwrap();
    assert!(hosts.is_empty());
    assert!(cached);

    f.registry.shutdown().await;
}

#[tokio::test]
async fn test_fallback_to_original_host_when_nothing_cached() {
    let f = fixture();
    f.cluster.set_topology(Vec::new());
    let p = provider(&f, CLUSTER_DNS);
    let conn = f.service.connect(&host(CLUSTER_DNS)).await;

    let (hosts, cached) = p.get_topology(&conn, false).await.unwrap();
    assert!(!cached);
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].host(), CLUSTER_DNS);
    assert_eq!(hosts[0].role(), HostRole::Writer);

    // The fallback is provisional and never cached.
    let (_, cached) = p.get_topology(&conn, false).await.unwrap();
    assert!(!cached);

    f.registry.shutdown().await;
}

#[tokio::test]
async fn test_reader_and_writer_urls_share_a_cluster_id() {
    let f = fixture();
    let writer_url = provider(&f, CLUSTER_DNS);
    let reader_url = provider(&f, READER_DNS);

    assert_eq!(writer_url.cluster_id(), reader_url.cluster_id());
    assert!(writer_url.is_primary_cluster_id());
    assert!(reader_url.is_primary_cluster_id());

    f.registry.shutdown().await;
}

#[tokio::test]
async fn test_instance_url_converges_onto_the_primary_cluster_id() {
    let f = fixture();
    f.cluster
        .set_topology(vec![row("node-1", true), row("node-2", false)]);

    let primary = provider(&f, CLUSTER_DNS);
    let conn = f.service.connect(&host(CLUSTER_DNS)).await;
    let (hosts, _) = primary.get_topology(&conn, false).await.unwrap();

    // A provider built from one of the discovered instance endpoints adopts
    // the primary cluster id and shares its cache entry.
    let instance = provider(&f, &instance_dns("node-2"));
    assert_eq!(instance.cluster_id(), primary.cluster_id());
    assert!(instance.is_primary_cluster_id());

    let instance_conn = f.service.connect(&host(&instance_dns("node-2"))).await;
    let (shared, cached) = instance.get_topology(&instance_conn, false).await.unwrap();
    assert!(cached);
    assert!(Arc::ptr_eq(&hosts, &shared));

    f.registry.shutdown().await;
}

#[tokio::test]
async fn test_instance_url_seen_first_still_converges_after_a_primary_refresh() {
    let f = fixture();
    f.cluster
        .set_topology(vec![row("node-1", true), row("node-2", false)]);

    let instance = provider(&f, &instance_dns("node-2"));
    let instance_conn = f.service.connect(&host(&instance_dns("node-2"))).await;
    instance.get_topology(&instance_conn, false).await.unwrap();
    assert!(!instance.is_primary_cluster_id());

    let primary = provider(&f, CLUSTER_DNS);
    let conn = f.service.connect(&host(CLUSTER_DNS)).await;
    let (hosts, _) = primary.get_topology(&conn, false).await.unwrap();

    // The instance provider picks up the recorded suggestion on its next
    // refresh and lands on the primary's cache entry.
    let (shared, cached) = instance.get_topology(&instance_conn, false).await.unwrap();
    assert_eq!(instance.cluster_id(), primary.cluster_id());
    assert!(cached);
    assert!(Arc::ptr_eq(&hosts, &shared));

    f.registry.shutdown().await;
}

#[tokio::test]
async fn test_force_refresh_verified_races_probes_and_promotes_the_writer() {
    let f = fixture();
    f.cluster.set_topology(vec![
        row("node-1", false),
        row("node-2", true),
        row("node-3", false),
    ]);
    f.cluster.set_writer(Some("node-2"));
    let p = provider(&f, CLUSTER_DNS);

    let hosts = p
        .force_refresh_verified(true, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(hosts[0].role(), HostRole::Writer);
    assert_eq!(hosts[0].host_id(), Some("node-2"));

    // Losing probes close their connections; exactly the winner's connection
    // survives as the monitoring connection.
    tokio::time::sleep(Duration::from_millis(300)).await;
    for conn in f
        .cluster
        .connections_to("node-1")
        .into_iter()
        .chain(f.cluster.connections_to("node-3"))
    {
        assert!(conn.is_closed());
    }
    assert!(f
        .cluster
        .connections_to("node-2")
        .iter()
        .any(|c| !c.is_closed()));

    f.registry.shutdown().await;
}

#[tokio::test]
async fn test_force_refresh_with_zero_timeout_returns_cached_topology() {
    let f = fixture();
    f.cluster.set_topology(vec![row("node-1", true)]);
    f.cluster.set_writer(Some("node-1"));
    let p = provider(&f, CLUSTER_DNS);
    let conn = f.service.connect(&host(CLUSTER_DNS)).await;

    let (hosts, _) = p.get_topology(&conn, true).await.unwrap();

    let got = p.force_refresh_verified(true, Duration::ZERO).await.unwrap();
    assert!(Arc::ptr_eq(&hosts, &got));

    f.registry.shutdown().await;
}

#[tokio::test]
async fn test_force_refresh_times_out_when_the_cluster_is_unreachable() {
    let f = fixture();
    f.cluster.set_host_down(CLUSTER_DNS, true);
    let p = provider(&f, CLUSTER_DNS);

    let err = p
        .force_refresh_verified(true, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, TopologyError::RefreshTimeout(_)));

    f.registry.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_waits_for_monitor_loops_to_release_connections() {
    let f = fixture();
    f.cluster.set_topology(vec![row("node-1", true)]);
    f.cluster.set_writer(Some("node-1"));
    let p = provider(&f, CLUSTER_DNS);

    p.force_refresh_verified(true, Duration::from_secs(5))
        .await
        .unwrap();

    f.registry.shutdown().await;

    // By the time shutdown returns, the loop has closed every connection it
    // still owned: the monitoring connection and any unclaimed probe winner.
    assert!(f
        .cluster
        .connections_to("node-1")
        .iter()
        .all(|c| c.is_closed()));
    assert!(f
        .cluster
        .connections_to("mydb")
        .iter()
        .all(|c| c.is_closed()));
}

#[tokio::test]
async fn test_registry_shares_one_monitor_per_cluster_id() {
    let f = fixture();
    let dialect: Arc<dyn Dialect> = Arc::new(AuroraMySqlDialect);
    let initial = host(CLUSTER_DNS);
    let template = host("?.abc123.us-east-1.rds.amazonaws.com");

    let m1 = f
        .registry
        .get_or_create("cluster-a", &initial, &template, &dialect, &Properties::new());
    let m2 = f
        .registry
        .get_or_create("cluster-a", &initial, &template, &dialect, &Properties::new());
    assert!(Arc::ptr_eq(&m1, &m2));

    let other = f
        .registry
        .get_or_create("cluster-b", &initial, &template, &dialect, &Properties::new());
    assert!(!Arc::ptr_eq(&m1, &other));

    f.registry.shutdown().await;
}
