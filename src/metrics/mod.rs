//! Prometheus metrics for topology and failure monitoring
//!
//! Collected into a crate-local registry; the embedding application decides
//! how to expose them.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Monitoring metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Topology metrics
    /// Topology lists published to the cache
    pub topology_updates_total: IntCounter,
    /// Times a cluster monitor entered panic mode
    pub panic_entries_total: IntCounter,
    /// Writers confirmed by a panic-mode node probe
    pub writer_promotions_total: IntCounter,
    /// Panic-mode probe connection attempts by result
    pub probe_connects_total: IntCounterVec,
    /// Currently running cluster topology monitors
    pub cluster_monitors: IntGauge,

    // Failure detection metrics
    /// Liveness probes by result
    pub liveness_probes_total: IntCounterVec,
    /// Nodes declared unhealthy by failure detection
    pub nodes_unhealthy_total: IntCounter,
    /// Currently running host monitors
    pub host_monitors: IntGauge,
}

impl Metrics {
    /// Create a new metrics collection
    pub fn new() -> Self {
        let registry = Registry::new();

        let topology_updates_total = IntCounter::new(
            "clusterwatch_topology_updates_total",
            "Total number of topology lists published to the cache",
        )
        .unwrap();

        let panic_entries_total = IntCounter::new(
            "clusterwatch_panic_entries_total",
            "Total number of times a cluster monitor entered panic mode",
        )
        .unwrap();

        let writer_promotions_total = IntCounter::new(
            "clusterwatch_writer_promotions_total",
            "Total number of writers confirmed by a panic-mode node probe",
        )
        .unwrap();

        let probe_connects_total = IntCounterVec::new(
            Opts::new(
                "clusterwatch_probe_connects_total",
                "Total number of panic-mode probe connection attempts",
            ),
            &["result"], // ok, error
        )
        .unwrap();

        let cluster_monitors = IntGauge::new(
            "clusterwatch_cluster_monitors",
            "Current number of running cluster topology monitors",
        )
        .unwrap();

        let liveness_probes_total = IntCounterVec::new(
            Opts::new(
                "clusterwatch_liveness_probes_total",
                "Total number of liveness probes",
            ),
            &["result"], // ok, error
        )
        .unwrap();

        let nodes_unhealthy_total = IntCounter::new(
            "clusterwatch_nodes_unhealthy_total",
            "Total number of nodes declared unhealthy by failure detection",
        )
        .unwrap();

        let host_monitors = IntGauge::new(
            "clusterwatch_host_monitors",
            "Current number of running host monitors",
        )
        .unwrap();

        registry
            .register(Box::new(topology_updates_total.clone()))
            .unwrap();
        registry
            .register(Box::new(panic_entries_total.clone()))
            .unwrap();
        registry
            .register(Box::new(writer_promotions_total.clone()))
            .unwrap();
        registry
            .register(Box::new(probe_connects_total.clone()))
            .unwrap();
        registry
            .register(Box::new(cluster_monitors.clone()))
            .unwrap();
        registry
            .register(Box::new(liveness_probes_total.clone()))
            .unwrap();
        registry
            .register(Box::new(nodes_unhealthy_total.clone()))
            .unwrap();
        registry.register(Box::new(host_monitors.clone())).unwrap();

        Self {
            registry,
            topology_updates_total,
            panic_entries_total,
            writer_promotions_total,
            probe_connects_total,
            cluster_monitors,
            liveness_probes_total,
            nodes_unhealthy_total,
            host_monitors,
        }
    }

    /// Record a liveness probe result
    pub fn record_liveness_probe(&self, result: &str) {
        self.liveness_probes_total.with_label_values(&[result]).inc();
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
