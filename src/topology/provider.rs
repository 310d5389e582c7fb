//! Per-connection topology façade
//!
//! Each wrapped connection owns one provider. The provider resolves the
//! cluster id for the endpoint it was opened against, serves topology out of
//! the shared cache, fetches directly over the caller's connection on a miss
//! or a forced refresh, and delegates writer-verified refreshes to the
//! cluster's background monitor.
//!
//! Cluster id resolution: writer and reader cluster endpoints normalize to
//! the writer cluster form and are primary; every other endpoint shape keys
//! by its own host and port and is non-primary. Primary providers record a
//! suggestion for every instance they discover, and non-primary providers
//! adopt such a suggestion on their next refresh, migrating their cache entry
//! and re-keying their monitor so all lineages of one cluster converge.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::MonitoringConfig;
use crate::driver::dialect::Dialect;
use crate::driver::{monitoring_properties, DriverConnection, Properties};
use crate::host::{writer_cluster_form, EndpointKind, HostRole, HostSpec};

use super::{
    instance_template, process_rows, ClusterTopologyMonitor, TopologyCache,
    TopologyMonitorRegistry, TopologyError,
};

pub struct ClusterHostListProvider {
    cluster_id: Mutex<String>,
    is_primary_cluster_id: AtomicBool,
    initial_host: HostSpec,
    template: HostSpec,
    cache: Arc<TopologyCache>,
    registry: Arc<TopologyMonitorRegistry>,
    dialect: Arc<dyn Dialect>,
    monitoring_props: Properties,
    cache_ttl: Duration,
}

impl ClusterHostListProvider {
    pub fn new(
        initial_host: HostSpec,
        properties: Properties,
        config: &MonitoringConfig,
        cache: Arc<TopologyCache>,
        registry: Arc<TopologyMonitorRegistry>,
        dialect: Arc<dyn Dialect>,
    ) -> Self {
        let template =
            instance_template(&initial_host, config.cluster_instance_host_pattern.as_deref());

        let (cluster_id, is_primary) = resolve_cluster_id(&initial_host);
        debug!(cluster_id = %cluster_id, primary = is_primary, "Resolved cluster id");

        let monitoring_props = monitoring_properties(&properties);
        let provider = Self {
            cluster_id: Mutex::new(cluster_id),
            is_primary_cluster_id: AtomicBool::new(is_primary),
            initial_host,
            template,
            cache,
            registry,
            dialect,
            monitoring_props,
            cache_ttl: Duration::from_millis(config.topology_cache_expiration_ms),
        };
        provider.adopt_suggested_cluster_id();
        provider
    }

    pub fn cluster_id(&self) -> String {
        self.cluster_id.lock().clone()
    }

    pub fn is_primary_cluster_id(&self) -> bool {
        self.is_primary_cluster_id.load(Ordering::SeqCst)
    }

    /// Topology for this cluster, with a flag telling whether it was served
    /// from the cache.
    ///
    /// `force` bypasses the cache read and fetches over the supplied
    /// connection; an empty fetch result is cached as-is so every sharer of
    /// the cluster id sees that the writer is currently unknown. Only when
    /// nothing is cached at all does the provider fall back to a provisional
    /// single-host list naming the original endpoint as writer, and that
    /// fallback is never cached.
    pub async fn get_topology(
        &self,
        connection: &Arc<dyn DriverConnection>,
        force: bool,
    ) -> Result<(Arc<Vec<HostSpec>>, bool), TopologyError> {
        self.adopt_suggested_cluster_id();
        let cluster_id = self.cluster_id();

        if !force {
            if let Some(hosts) = self.cache.get(&cluster_id) {
                return Ok((hosts, true));
            }
        }

        let rows = connection.query_topology(self.dialect.topology_query()).await?;
        let hosts = process_rows(rows, &self.template, &self.initial_host)?;

        if hosts.is_empty() && self.cache.get(&cluster_id).is_none() {
            debug!(host = %self.initial_host.host(), "No topology available, returning the original host as a provisional writer");
            return Ok((Arc::new(vec![provisional_writer(&self.initial_host)]), false));
        }

        let hosts = Arc::new(hosts);
        self.cache.set(&cluster_id, hosts.clone(), self.cache_ttl);
        if self.is_primary_cluster_id() {
            self.record_suggestions(&hosts, &cluster_id);
        }
        Ok((hosts, false))
    }

    /// Cached-first read; fetches over the connection only on a cache miss.
    pub async fn refresh(
        &self,
        connection: &Arc<dyn DriverConnection>,
    ) -> Result<Arc<Vec<HostSpec>>, TopologyError> {
        let (hosts, _) = self.get_topology(connection, false).await?;
        Ok(hosts)
    }

    /// Unconditional fetch over the caller's connection.
    pub async fn force_refresh(
        &self,
        connection: &Arc<dyn DriverConnection>,
    ) -> Result<Arc<Vec<HostSpec>>, TopologyError> {
        let (hosts, _) = self.get_topology(connection, true).await?;
        Ok(hosts)
    }

    /// Refresh through the background monitor. With `verify_writer` the
    /// topology must come from a connection re-verified to be attached to the
    /// writer; failover uses this to confirm a promotion took effect.
    pub async fn force_refresh_verified(
        &self,
        verify_writer: bool,
        timeout: Duration,
    ) -> Result<Arc<Vec<HostSpec>>, TopologyError> {
        self.monitor().force_refresh(verify_writer, timeout).await
    }

    /// Refresh through the background monitor using an existing connection as
    /// a hint when the monitor has no verified writer of its own.
    pub async fn monitor_refresh(
        &self,
        connection: &Arc<dyn DriverConnection>,
        timeout: Duration,
    ) -> Result<Arc<Vec<HostSpec>>, TopologyError> {
        self.monitor().force_refresh_with(connection, timeout).await
    }

    fn monitor(&self) -> Arc<ClusterTopologyMonitor> {
        self.registry.get_or_create(
            &self.cluster_id(),
            &self.initial_host,
            &self.template,
            &self.dialect,
            &self.monitoring_props,
        )
    }

    /// Non-primary providers adopt a recorded primary cluster id, moving
    /// their cache entry and monitor over to the shared lineage.
    fn adopt_suggested_cluster_id(&self) {
        if self.is_primary_cluster_id() {
            return;
        }

        let current = self.cluster_id();
        let Some(suggestion) = self.cache.suggested_primary(&current) else {
            return;
        };
        if !suggestion.is_primary || suggestion.cluster_id == current {
            return;
        }

        info!(old = %current, new = %suggestion.cluster_id, "Adopting suggested cluster id");
        self.registry.cluster_id_changed(&current, &suggestion.cluster_id);
        *self.cluster_id.lock() = suggestion.cluster_id;
        self.is_primary_cluster_id.store(true, Ordering::SeqCst);
    }

    fn record_suggestions(&self, hosts: &[HostSpec], cluster_id: &str) {
        for host in hosts {
            self.cache.suggest_primary(
                &host.host_and_port(),
                cluster_id,
                true,
                self.cache_ttl,
            );
        }
    }
}

/// Provisional writer entry for the endpoint the caller originally connected
/// to, used only while nothing better is known.
fn provisional_writer(initial: &HostSpec) -> HostSpec {
    HostSpec::builder()
        .host(initial.host())
        .maybe_port(initial.port())
        .role(HostRole::Writer)
        .build()
}

/// Resolve the cache key for an endpoint. Cluster DNS forms collapse onto
/// the writer endpoint; anything else keys by itself and relies on
/// suggestions to converge.
fn resolve_cluster_id(initial: &HostSpec) -> (String, bool) {
    match EndpointKind::classify(initial.host()) {
        EndpointKind::WriterCluster | EndpointKind::ReaderCluster => {
            match writer_cluster_form(initial.host()) {
                Some(writer_form) => {
                    let id = match initial.port() {
                        Some(port) => format!("{writer_form}:{port}"),
                        None => writer_form,
                    };
                    (id, true)
                }
                None => (initial.host_and_port(), false),
            }
        }
        _ => (initial.host_and_port(), false),
    }
}
