//! Failure detection integration tests

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use clusterwatch::{FailureDetectionConfig, HostMonitorService, Properties};

use crate::mock::{host, instance_dns, MockCluster, MockConnectionService};

fn fast_config() -> FailureDetectionConfig {
    FailureDetectionConfig {
        enabled: true,
        failure_detection_time_ms: 10,
        failure_detection_interval_ms: 20,
        failure_detection_count: 3,
        monitor_disposal_time_ms: 100,
    }
}

struct Fixture {
    cluster: Arc<MockCluster>,
    connections: Arc<MockConnectionService>,
    service: Arc<HostMonitorService>,
}

fn fixture(config: &FailureDetectionConfig) -> Fixture {
    crate::init_logging();
    let cluster = MockCluster::new();
    let connections = MockConnectionService::new(cluster.clone());
    let service = HostMonitorService::new(connections.clone(), config);
    Fixture {
        cluster,
        connections,
        service,
    }
}

#[tokio::test]
async fn test_unresponsive_node_flags_context_and_aborts_connection() {
    let f = fixture(&fast_config());
    let node = host(&instance_dns("node-1"));
    let conn = f.connections.connect(&node).await;

    let context = f
        .service
        .start_monitoring(&conn, &node, &Properties::new())
        .unwrap();
    f.cluster.set_ping_failing(&instance_dns("node-1"), true);

    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(context.is_node_unhealthy());
    assert!(f
        .cluster
        .connections_to("node-1")
        .iter()
        .any(|c| c.is_aborted()));

    f.service.shutdown();
}

#[tokio::test]
async fn test_context_registered_during_failure_streak_is_flagged() {
    let f = fixture(&fast_config());
    let node = host(&instance_dns("node-1"));
    let conn_a = f.connections.connect(&node).await;

    let ctx_a = f
        .service
        .start_monitoring(&conn_a, &node, &Properties::new())
        .unwrap();
    f.cluster.set_ping_failing(&instance_dns("node-1"), true);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(ctx_a.is_node_unhealthy());

    // The node still accepts connections but keeps failing pings. A
    // connection that starts monitoring now must be flagged as well.
    let conn_b = f.connections.connect(&node).await;
    let ctx_b = f
        .service
        .start_monitoring(&conn_b, &node, &Properties::new())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(ctx_b.is_node_unhealthy());
    let aborted = f
        .cluster
        .connections_to("node-1")
        .iter()
        .filter(|c| c.is_aborted())
        .count();
    assert!(aborted >= 2, "both monitored connections should be aborted");

    f.service.shutdown();
}

#[tokio::test]
async fn test_healthy_node_is_never_flagged() {
    let f = fixture(&fast_config());
    let node = host(&instance_dns("node-1"));
    let conn = f.connections.connect(&node).await;

    let context = f
        .service
        .start_monitoring(&conn, &node, &Properties::new())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!context.is_node_unhealthy());
    assert!(context.is_active());

    f.service.stop_monitoring(&context);
    assert!(!context.is_active());

    f.service.shutdown();
}

#[tokio::test]
async fn test_disabled_failure_detection_monitors_nothing() {
    let config = FailureDetectionConfig {
        enabled: false,
        ..fast_config()
    };
    let f = fixture(&config);
    let node = host(&instance_dns("node-1"));
    let conn = f.connections.connect(&node).await;

    assert!(f
        .service
        .start_monitoring(&conn, &node, &Properties::new())
        .is_none());

    f.service.shutdown();
}

#[tokio::test]
async fn test_connections_to_one_node_share_a_probe_connection() {
    let f = fixture(&fast_config());
    let node = host(&instance_dns("node-1"));
    let conn_a = f.connections.connect(&node).await;
    let conn_b = f.connections.connect(&node).await;

    let ctx_a = f
        .service
        .start_monitoring(&conn_a, &node, &Properties::new())
        .unwrap();
    let ctx_b = f
        .service
        .start_monitoring(&conn_b, &node, &Properties::new())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    // Two monitored connections, one shared monitor, one probe connection.
    assert_eq!(f.cluster.opens_total.load(Ordering::SeqCst), 3);
    assert!(ctx_a.is_active() && ctx_b.is_active());

    f.service.shutdown();
}

#[tokio::test]
async fn test_dropped_connection_deactivates_its_context() {
    let f = fixture(&fast_config());
    let node = host(&instance_dns("node-1"));
    let conn = f.connections.connect(&node).await;

    let context = f
        .service
        .start_monitoring(&conn, &node, &Properties::new())
        .unwrap();
    assert!(context.is_active());

    drop(conn);
    assert!(!context.is_active());

    f.service.shutdown();
}

#[tokio::test]
async fn test_idle_monitor_is_disposed_and_replaced_on_next_use() {
    let f = fixture(&fast_config());
    let node = host(&instance_dns("node-1"));
    let conn = f.connections.connect(&node).await;

    let context = f
        .service
        .start_monitoring(&conn, &node, &Properties::new())
        .unwrap();
    f.service.stop_monitoring(&context);

    // Idle past the disposal window; the monitor stops itself.
    tokio::time::sleep(Duration::from_millis(400)).await;

    // A fresh registration gets a working replacement monitor.
    let conn2 = f.connections.connect(&node).await;
    let context2 = f
        .service
        .start_monitoring(&conn2, &node, &Properties::new())
        .unwrap();
    f.cluster.set_ping_failing(&instance_dns("node-1"), true);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(context2.is_node_unhealthy());

    f.service.shutdown();
}
