//! Per-node liveness monitor
//!
//! One monitor runs per (node, detection settings) pair and is shared by
//! every connection to that node using those settings. Each registered
//! context gets a grace period before its first probe; after that the node is
//! probed on the monitor's own lightweight connection at the detection
//! interval. Reaching the consecutive-failure threshold flags every active
//! context and aborts their connections. A monitor with no work for longer
//! than the disposal window stops itself; disposal never flags anything.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::FailureDetectionConfig;
use crate::driver::{ConnectionService, DriverConnection, Properties};
use crate::host::{HostAvailability, HostSpec};
use crate::metrics::metrics;

use super::HostMonitorConnectionContext;

/// Identity of a host monitor: same node, same detection settings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MonitorKey {
    pub host: String,
    pub failure_detection_time_ms: u64,
    pub failure_detection_interval_ms: u64,
    pub failure_detection_count: u32,
}

impl MonitorKey {
    pub fn new(host: &HostSpec, config: &FailureDetectionConfig) -> Self {
        Self {
            host: host.host_and_port(),
            failure_detection_time_ms: config.failure_detection_time_ms,
            failure_detection_interval_ms: config.failure_detection_interval_ms,
            failure_detection_count: config.failure_detection_count,
        }
    }
}

struct PendingContext {
    admit_at: Instant,
    context: Weak<HostMonitorConnectionContext>,
}

pub struct HostMonitor {
    host: HostSpec,
    detection_time: Duration,
    detection_interval: Duration,
    detection_count: u32,
    disposal_time: Duration,
    connections: Arc<dyn ConnectionService>,
    monitoring_props: Properties,

    new_contexts: Mutex<VecDeque<PendingContext>>,
    active_contexts: Mutex<Vec<Weak<HostMonitorConnectionContext>>>,
    idle_since: Mutex<Option<Instant>>,
    stopped: AtomicBool,
    cancel: CancellationToken,
}

impl HostMonitor {
    pub(crate) fn start(
        host: HostSpec,
        key: &MonitorKey,
        disposal_time: Duration,
        connections: Arc<dyn ConnectionService>,
        monitoring_props: Properties,
    ) -> Arc<Self> {
        let monitor = Arc::new(Self {
            host,
            detection_time: Duration::from_millis(key.failure_detection_time_ms),
            detection_interval: Duration::from_millis(key.failure_detection_interval_ms),
            detection_count: key.failure_detection_count,
            disposal_time,
            connections,
            monitoring_props,
            new_contexts: Mutex::new(VecDeque::new()),
            active_contexts: Mutex::new(Vec::new()),
            idle_since: Mutex::new(Some(Instant::now())),
            stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        metrics().host_monitors.inc();
        tokio::spawn(monitor.clone().run_loop());
        monitor
    }

    /// Queue a context for monitoring after the detection-time grace period.
    pub(crate) fn register(&self, context: &Arc<HostMonitorConnectionContext>) {
        self.new_contexts.lock().push_back(PendingContext {
            admit_at: Instant::now() + self.detection_time,
            context: Arc::downgrade(context),
        });
        *self.idle_since.lock() = None;
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Whether the monitor currently has nothing to watch: no context waiting
    /// out its grace period and no active context. Owners managing monitor
    /// lifetimes consult this before tearing one down.
    pub fn can_dispose(&self) -> bool {
        if self.is_stopped() {
            return true;
        }
        let has_pending = self
            .new_contexts
            .lock()
            .iter()
            .any(|p| p.context.upgrade().is_some_and(|c| c.is_active()));
        let has_active = self
            .active_contexts
            .lock()
            .iter()
            .any(|w| w.upgrade().is_some_and(|c| c.is_active()));
        !has_pending && !has_active
    }

    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }

    async fn run_loop(self: Arc<Self>) {
        debug!(host = %self.host.host(), "Host monitoring started");
        let mut conn: Option<Arc<dyn DriverConnection>> = None;
        let mut failures: u32 = 0;

        while !self.cancel.is_cancelled() {
            self.admit_due_contexts();
            let has_active = self.sweep_inactive_contexts();
            let has_pending = !self.new_contexts.lock().is_empty();

            if has_active {
                *self.idle_since.lock() = None;

                if conn.is_none() {
                    conn = self.open_probe_connection().await;
                }

                let healthy = match &conn {
                    Some(c) => {
                        let ping = tokio::time::timeout(self.detection_interval, c.ping()).await;
                        matches!(ping, Ok(Ok(())))
                    }
                    None => false,
                };

                if healthy {
                    metrics().record_liveness_probe("ok");
                    failures = 0;
                    self.connections
                        .set_availability(&self.host.as_aliases(), HostAvailability::Available);
                } else {
                    metrics().record_liveness_probe("error");
                    failures = failures.saturating_add(1);
                    if let Some(c) = conn.take() {
                        c.close().await;
                    }
                    trace!(host = %self.host.host(), failures, "Liveness probe failed");

                    // Every round past the threshold, so a context registered
                    // during an ongoing failure streak still gets flagged.
                    if failures >= self.detection_count {
                        self.declare_node_unhealthy();
                    }
                }
            } else {
                // Contexts in their grace period do not get probed yet, and a
                // failure streak never carries over between work periods.
                failures = 0;
                if let Some(c) = conn.take() {
                    c.close().await;
                }
                if has_pending {
                    *self.idle_since.lock() = None;
                } else if self.ready_to_dispose() {
                    debug!(host = %self.host.host(), "Disposing idle host monitor");
                    break;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.detection_interval) => {}
                _ = self.cancel.cancelled() => break,
            }
        }

        if let Some(c) = conn {
            c.close().await;
        }
        self.stopped.store(true, Ordering::SeqCst);
        metrics().host_monitors.dec();
        debug!(host = %self.host.host(), "Host monitoring stopped");
    }

    fn admit_due_contexts(&self) {
        let mut pending = self.new_contexts.lock();
        let now = Instant::now();
        while pending.front().is_some_and(|p| p.admit_at <= now) {
            if let Some(p) = pending.pop_front() {
                if p.context.strong_count() > 0 {
                    self.active_contexts.lock().push(p.context);
                }
            }
        }
    }

    /// Drop dropped or deactivated contexts; returns whether any remain.
    fn sweep_inactive_contexts(&self) -> bool {
        let mut active = self.active_contexts.lock();
        active.retain(|weak| weak.upgrade().is_some_and(|c| c.is_active()));
        !active.is_empty()
    }

    async fn open_probe_connection(&self) -> Option<Arc<dyn DriverConnection>> {
        match self
            .connections
            .open_connection(&self.host, &self.monitoring_props)
            .await
        {
            Ok(conn) => Some(conn),
            Err(e) => {
                trace!(host = %self.host.host(), error = %e, "Could not open a probe connection");
                None
            }
        }
    }

    /// Flag every active context not yet flagged and abort its connection.
    /// Idempotent per context, so repeated calls during one streak only touch
    /// newly admitted contexts.
    fn declare_node_unhealthy(&self) {
        let unflagged: Vec<_> = self
            .active_contexts
            .lock()
            .iter()
            .filter_map(|w| w.upgrade())
            .filter(|c| !c.is_node_unhealthy())
            .collect();
        if unflagged.is_empty() {
            return;
        }

        warn!(host = %self.host.host(), threshold = self.detection_count, "Node declared unhealthy, aborting its active connections");
        metrics().nodes_unhealthy_total.inc();
        self.connections
            .set_availability(&self.host.as_aliases(), HostAvailability::Unavailable);

        for context in unflagged {
            context.set_node_unhealthy();
            if let Some(conn) = context.connection() {
                conn.abort();
            }
        }
    }

    fn ready_to_dispose(&self) -> bool {
        let mut idle = self.idle_since.lock();
        match *idle {
            Some(since) => since.elapsed() >= self.disposal_time,
            None => {
                *idle = Some(Instant::now());
                false
            }
        }
    }
}
