//! Entry point for failure monitoring
//!
//! Owns the keyed set of [`HostMonitor`]s. Connections call
//! [`HostMonitorService::start_monitoring`] before running work and
//! [`HostMonitorService::stop_monitoring`] when the work completes; monitors
//! that stopped themselves after idling out are replaced on the next start
//! and purged by a background reaper.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::FailureDetectionConfig;
use crate::driver::{monitoring_properties, ConnectionService, DriverConnection, Properties};
use crate::host::HostSpec;

use super::{HostMonitor, HostMonitorConnectionContext, MonitorKey};

const REAPER_INTERVAL: Duration = Duration::from_secs(60);

pub struct HostMonitorService {
    monitors: DashMap<MonitorKey, Arc<HostMonitor>>,
    connections: Arc<dyn ConnectionService>,
    config: FailureDetectionConfig,
    cancel: CancellationToken,
}

impl HostMonitorService {
    pub fn new(
        connections: Arc<dyn ConnectionService>,
        config: &FailureDetectionConfig,
    ) -> Arc<Self> {
        let service = Arc::new(Self {
            monitors: DashMap::new(),
            connections,
            config: config.clone(),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(reap_stopped_monitors(service.clone()));
        service
    }

    /// Put a connection under monitoring for the duration of some work.
    ///
    /// Returns `None` when failure detection is disabled. The returned
    /// context must be polled for the unhealthy verdict and handed back to
    /// [`Self::stop_monitoring`] when the work completes.
    pub fn start_monitoring(
        &self,
        connection: &Arc<dyn DriverConnection>,
        host: &HostSpec,
        properties: &Properties,
    ) -> Option<Arc<HostMonitorConnectionContext>> {
        if !self.config.enabled {
            return None;
        }

        let key = MonitorKey::new(host, &self.config);
        let context = Arc::new(HostMonitorConnectionContext::new(connection));

        // A monitor can idle out between lookup and registration; retry with
        // a fresh one until the registration sticks.
        loop {
            let monitor = self.get_or_create_monitor(&key, host, properties);
            monitor.register(&context);
            if !monitor.is_stopped() {
                trace!(host = %host.host(), "Started monitoring a connection");
                return Some(context);
            }
            self.monitors.remove_if(&key, |_, m| m.is_stopped());
        }
    }

    /// End monitoring for a context. The context keeps its verdict.
    pub fn stop_monitoring(&self, context: &HostMonitorConnectionContext) {
        context.set_inactive();
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        for entry in self.monitors.iter() {
            entry.value().stop();
        }
        self.monitors.clear();
    }

    fn get_or_create_monitor(
        &self,
        key: &MonitorKey,
        host: &HostSpec,
        properties: &Properties,
    ) -> Arc<HostMonitor> {
        let mut entry = self.monitors.entry(key.clone()).or_insert_with(|| {
            HostMonitor::start(
                host.clone(),
                key,
                Duration::from_millis(self.config.monitor_disposal_time_ms),
                self.connections.clone(),
                monitoring_properties(properties),
            )
        });

        if entry.is_stopped() {
            let replacement = HostMonitor::start(
                host.clone(),
                key,
                Duration::from_millis(self.config.monitor_disposal_time_ms),
                self.connections.clone(),
                monitoring_properties(properties),
            );
            *entry.value_mut() = replacement;
        }

        entry.clone()
    }
}

async fn reap_stopped_monitors(service: Arc<HostMonitorService>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(REAPER_INTERVAL) => {}
            _ = service.cancel.cancelled() => return,
        }
        service.monitors.retain(|_, monitor| !monitor.is_stopped());
    }
}
