//! Registry of per-cluster topology monitors
//!
//! Monitors are created lazily on first use, shared by every provider that
//! resolves to the same cluster id, and reaped by a background task once no
//! provider has touched them for a while.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MonitoringConfig;
use crate::driver::dialect::Dialect;
use crate::driver::{ConnectionService, Properties};
use crate::host::HostSpec;

use super::{ClusterTopologyMonitor, TopologyCache};

const REAPER_INTERVAL: Duration = Duration::from_secs(60);
const MONITOR_IDLE_EXPIRATION: Duration = Duration::from_secs(15 * 60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct MonitorEntry {
    monitor: Arc<ClusterTopologyMonitor>,
    last_used: Mutex<Instant>,
}

/// Keyed set of running [`ClusterTopologyMonitor`]s.
pub struct TopologyMonitorRegistry {
    monitors: DashMap<String, Arc<MonitorEntry>>,
    cache: Arc<TopologyCache>,
    connections: Arc<dyn ConnectionService>,
    refresh_rate: Duration,
    high_refresh_rate: Duration,
    cache_ttl: Duration,
    cancel: CancellationToken,
}

impl TopologyMonitorRegistry {
    pub fn new(
        cache: Arc<TopologyCache>,
        connections: Arc<dyn ConnectionService>,
        config: &MonitoringConfig,
    ) -> Arc<Self> {
        let registry = Arc::new(Self {
            monitors: DashMap::new(),
            cache,
            connections,
            refresh_rate: Duration::from_millis(config.topology_refresh_rate_ms),
            high_refresh_rate: Duration::from_millis(config.topology_high_refresh_rate_ms),
            cache_ttl: Duration::from_millis(config.topology_cache_expiration_ms),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(reap_idle_monitors(registry.clone()));
        registry
    }

    /// The monitor for a cluster id, started on first request.
    pub fn get_or_create(
        &self,
        cluster_id: &str,
        initial_host: &HostSpec,
        template: &HostSpec,
        dialect: &Arc<dyn Dialect>,
        properties: &Properties,
    ) -> Arc<ClusterTopologyMonitor> {
        let entry = self
            .monitors
            .entry(cluster_id.to_string())
            .or_insert_with(|| {
                debug!(cluster_id = %cluster_id, "Starting topology monitor");
                let monitor = ClusterTopologyMonitor::start(
                    cluster_id.to_string(),
                    self.cache.clone(),
                    initial_host.clone(),
                    template.clone(),
                    self.connections.clone(),
                    dialect.clone(),
                    properties.clone(),
                    self.refresh_rate,
                    self.high_refresh_rate,
                    self.cache_ttl,
                );
                Arc::new(MonitorEntry {
                    monitor,
                    last_used: Mutex::new(Instant::now()),
                })
            })
            .clone();

        *entry.last_used.lock() = Instant::now();
        entry.monitor.clone()
    }

    /// Re-key everything tracked under a cluster id after a provider adopted
    /// a new one: the cache entry moves over, and a running monitor is
    /// re-keyed. When a monitor already runs under the new id the re-keyed
    /// one is redundant and is stopped instead.
    pub fn cluster_id_changed(&self, old_cluster_id: &str, new_cluster_id: &str) {
        self.cache.migrate(old_cluster_id, new_cluster_id);

        let Some((_, entry)) = self.monitors.remove(old_cluster_id) else {
            return;
        };

        entry.monitor.set_cluster_id(new_cluster_id.to_string());
        match self.monitors.entry(new_cluster_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!(cluster_id = %new_cluster_id, "Duplicate monitor after cluster id change, stopping it");
                entry.monitor.stop();
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!(old = %old_cluster_id, new = %new_cluster_id, "Topology monitor re-keyed");
                slot.insert(entry);
            }
        }
    }

    /// Stop every monitor and the idle reaper, waiting for the monitoring
    /// loops to wind down and release their connections. Each loop gets
    /// [`SHUTDOWN_GRACE`] before being abandoned.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut handles = Vec::new();
        for entry in self.monitors.iter() {
            if let Some(handle) = entry.monitor.stop_and_take_handle() {
                handles.push((entry.key().clone(), handle));
            }
        }
        self.monitors.clear();

        for (cluster_id, handle) in handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                warn!(cluster_id = %cluster_id, "Topology monitor did not stop within the shutdown grace period");
            }
        }
    }
}

async fn reap_idle_monitors(registry: Arc<TopologyMonitorRegistry>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(REAPER_INTERVAL) => {}
            _ = registry.cancel.cancelled() => return,
        }

        let Some(cutoff) = Instant::now().checked_sub(MONITOR_IDLE_EXPIRATION) else {
            continue;
        };
        let mut expired = Vec::new();
        for entry in registry.monitors.iter() {
            if *entry.last_used.lock() < cutoff {
                expired.push(entry.key().clone());
            }
        }

        for cluster_id in expired {
            if let Some((_, entry)) = registry
                .monitors
                .remove_if(&cluster_id, |_, e| *e.last_used.lock() < cutoff)
            {
                info!(cluster_id = %cluster_id, "Stopping idle topology monitor");
                if let Some(handle) = entry.monitor.stop_and_take_handle() {
                    if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                        warn!(cluster_id = %cluster_id, "Idle topology monitor did not stop within the grace period");
                    }
                }
            }
        }
    }
}
