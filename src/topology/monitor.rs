//! Per-cluster background topology monitor
//!
//! One monitor runs per cluster id and owns the authoritative write path into
//! the topology cache. In normal mode it refreshes topology over a single
//! connection verified to be attached to the writer. When that connection is
//! lost or unverified the monitor is in panic mode: it fans out one probe
//! task per candidate host and the first probe that proves it is talking to
//! the writer wins the race, its connection becoming the new monitoring
//! connection. Reader probes keep feeding observed topology into the cache in
//! the meantime so reader-only topology is not starved during a long
//! failover.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::driver::dialect::Dialect;
use crate::driver::{ConnectionService, DriverConnection, Properties};
use crate::host::{EndpointKind, HostAvailability, HostRole, HostSpec};
use crate::metrics::metrics;

use super::{create_host, process_rows, TopologyCache, TopologyError};

/// Keep refreshing at the high rate for a while after a failover resolves.
const HIGH_REFRESH_PERIOD_AFTER_PANIC: Duration = Duration::from_secs(30);
/// Absorb redundant refresh requests right after a forced-refresh failover.
const IGNORE_TOPOLOGY_REQUEST_PERIOD: Duration = Duration::from_secs(10);
/// Slice length for interruptible inter-tick sleeps.
const DELAY_SLICE: Duration = Duration::from_millis(50);
/// Pause between probe attempts against one node.
const PROBE_TICK: Duration = Duration::from_millis(100);
/// How long to wait for a cancelled probe task to wind down.
const PROBE_JOIN_GRACE: Duration = Duration::from_secs(1);

/// Shared state of one panic-mode probe race.
///
/// The winner slot is single-assignment: the first probe that observes a
/// positive writer answer claims it under the lock, every later claim fails
/// and the losing probe closes its own connection.
struct ProbeGroup {
    stop: CancellationToken,
    winner: Mutex<Option<(Arc<dyn DriverConnection>, HostSpec)>>,
    winner_found: AtomicBool,
    reader_claimed: AtomicBool,
    latest_topology: Mutex<Option<Vec<HostSpec>>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ProbeGroup {
    fn new(stop: CancellationToken) -> Self {
        Self {
            stop,
            winner: Mutex::new(None),
            winner_found: AtomicBool::new(false),
            reader_claimed: AtomicBool::new(false),
            latest_topology: Mutex::new(None),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn try_set_winner(&self, conn: Arc<dyn DriverConnection>, host: HostSpec) -> bool {
        let mut slot = self.winner.lock();
        if self.winner_found.load(Ordering::SeqCst) {
            return false;
        }
        *slot = Some((conn, host));
        self.winner_found.store(true, Ordering::SeqCst);
        true
    }

    fn take_winner(&self) -> Option<(Arc<dyn DriverConnection>, HostSpec)> {
        self.winner.lock().take()
    }

    fn has_winner(&self) -> bool {
        self.winner_found.load(Ordering::SeqCst)
    }
}

/// Background monitor for one cluster.
///
/// Created through [`super::TopologyMonitorRegistry`]; [`Self::start`] spawns
/// the monitoring loop which runs until [`Self::stop`] is called.
pub struct ClusterTopologyMonitor {
    cluster_id: Mutex<String>,
    cache: Arc<TopologyCache>,
    initial_host: HostSpec,
    template: HostSpec,
    connections: Arc<dyn ConnectionService>,
    dialect: Arc<dyn Dialect>,
    properties: Properties,
    refresh_rate: Duration,
    high_refresh_rate: Duration,
    cache_ttl: Duration,

    cancel: CancellationToken,
    topology_updated: Notify,
    request_to_update: AtomicBool,
    monitoring_conn: Mutex<Option<Arc<dyn DriverConnection>>>,
    is_verified_writer: AtomicBool,
    writer_host: Mutex<Option<HostSpec>>,
    high_refresh_until: Mutex<Option<Instant>>,
    ignore_requests_until: Mutex<Option<Instant>>,
    panic_from_forced_refresh: AtomicBool,
    probes: Mutex<Option<Arc<ProbeGroup>>>,
    run_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterTopologyMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        cluster_id: String,
        cache: Arc<TopologyCache>,
        initial_host: HostSpec,
        template: HostSpec,
        connections: Arc<dyn ConnectionService>,
        dialect: Arc<dyn Dialect>,
        properties: Properties,
        refresh_rate: Duration,
        high_refresh_rate: Duration,
        cache_ttl: Duration,
    ) -> Arc<Self> {
        let monitor = Arc::new(Self {
            cluster_id: Mutex::new(cluster_id),
            cache,
            initial_host,
            template,
            connections,
            dialect,
            properties,
            refresh_rate,
            high_refresh_rate,
            cache_ttl,
            cancel: CancellationToken::new(),
            topology_updated: Notify::new(),
            request_to_update: AtomicBool::new(false),
            monitoring_conn: Mutex::new(None),
            is_verified_writer: AtomicBool::new(false),
            writer_host: Mutex::new(None),
            high_refresh_until: Mutex::new(None),
            ignore_requests_until: Mutex::new(None),
            panic_from_forced_refresh: AtomicBool::new(false),
            probes: Mutex::new(None),
            run_handle: Mutex::new(None),
        });

        metrics().cluster_monitors.inc();
        let handle = tokio::spawn(monitor.clone().run_loop());
        *monitor.run_handle.lock() = Some(handle);
        monitor
    }

    pub fn cluster_id(&self) -> String {
        self.cluster_id.lock().clone()
    }

    /// Re-key the monitor when its provider adopts a new cluster id.
    pub fn set_cluster_id(&self, cluster_id: String) {
        *self.cluster_id.lock() = cluster_id;
    }

    /// Stop the monitoring loop and all outstanding probes. Connections are
    /// closed by their owning tasks on the way out.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop the loop and hand back its join handle so the caller can wait
    /// for it to wind down.
    pub(crate) fn stop_and_take_handle(&self) -> Option<JoinHandle<()>> {
        self.cancel.cancel();
        self.run_handle.lock().take()
    }

    /// Force a topology refresh and wait until a newer topology is published.
    ///
    /// With `verify_writer` the monitoring connection is dropped first so the
    /// refreshed topology comes from a connection re-verified as the writer.
    /// During the post-failover ignore window a cached result is returned
    /// as-is. A zero timeout returns whatever is currently cached without
    /// blocking; otherwise expiry surfaces as [`TopologyError::RefreshTimeout`].
    pub async fn force_refresh(
        &self,
        verify_writer: bool,
        timeout: Duration,
    ) -> Result<Arc<Vec<HostSpec>>, TopologyError> {
        let ignore_active =
            matches!(*self.ignore_requests_until.lock(), Some(t) if t > Instant::now());
        if ignore_active {
            let cluster_id = self.cluster_id();
            if let Some(hosts) = self.cache.get(&cluster_id) {
                trace!(cluster_id = %cluster_id, "Ignoring topology refresh request, failover just settled");
                return Ok(hosts);
            }
        }

        if verify_writer {
            let old = self.monitoring_conn.lock().take();
            self.is_verified_writer.store(false, Ordering::SeqCst);
            self.panic_from_forced_refresh.store(true, Ordering::SeqCst);
            if let Some(old) = old {
                old.close().await;
            }
        }

        self.wait_for_updated_topology(timeout).await
    }

    /// Force a refresh using an already-open connection.
    ///
    /// When the monitor's writer is verified this just waits for the
    /// background loop like [`Self::force_refresh`]; otherwise the supplied
    /// unverified connection is used for an immediate fetch without touching
    /// the monitor's own connection.
    pub async fn force_refresh_with(
        &self,
        connection: &Arc<dyn DriverConnection>,
        timeout: Duration,
    ) -> Result<Arc<Vec<HostSpec>>, TopologyError> {
        if self.is_verified_writer.load(Ordering::SeqCst) {
            return self.wait_for_updated_topology(timeout).await;
        }

        let hosts = self
            .fetch_topology_and_update(Some(connection))
            .await
            .unwrap_or_else(|| Arc::new(Vec::new()));
        Ok(hosts)
    }

    async fn wait_for_updated_topology(
        &self,
        timeout: Duration,
    ) -> Result<Arc<Vec<HostSpec>>, TopologyError> {
        let cluster_id = self.cluster_id();
        let current = self.cache.get(&cluster_id);

        self.request_to_update.store(true, Ordering::SeqCst);

        if timeout.is_zero() {
            trace!("Refresh timeout is zero, returning currently cached topology");
            return Ok(current.unwrap_or_else(|| Arc::new(Vec::new())));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Arm the waiter before re-reading the cache so a publish between
            // the check and the await is not lost.
            let notified = self.topology_updated.notified();

            if let Some(latest) = self.cache.get(&cluster_id) {
                let unchanged = current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &latest));
                if !unchanged {
                    return Ok(latest);
                }
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(TopologyError::RefreshTimeout(timeout));
                }
            }
        }
    }

    fn is_in_panic_mode(&self) -> bool {
        self.monitoring_conn.lock().is_none()
            || !self.is_verified_writer.load(Ordering::SeqCst)
    }

    async fn run_loop(self: Arc<Self>) {
        debug!(host = %self.initial_host.host(), "Topology monitoring started");

        while !self.cancel.is_cancelled() {
            if self.is_in_panic_mode() {
                self.panic_tick().await;
                self.delay(true).await;
            } else {
                self.normal_tick().await;
                self.delay(false).await;
            }

            let mut ignore = self.ignore_requests_until.lock();
            if matches!(*ignore, Some(t) if t <= Instant::now()) {
                *ignore = None;
            }
        }

        self.drain_probes().await;
        let conn = self.monitoring_conn.lock().take();
        if let Some(conn) = conn {
            conn.close().await;
        }
        metrics().cluster_monitors.dec();
        debug!(host = %self.initial_host.host(), "Topology monitoring stopped");
    }

    async fn normal_tick(&self) {
        let conn = self.monitoring_conn.lock().clone();
        match self.fetch_topology_and_update(conn.as_ref()).await {
            Some(hosts) => {
                let mut high = self.high_refresh_until.lock();
                if matches!(*high, Some(t) if t <= Instant::now()) {
                    *high = None;
                }
                drop(high);
                trace!(host_count = hosts.len(), "Topology refreshed");
            }
            None => {
                warn!(cluster_id = %self.cluster_id(), "Lost the writer monitoring connection, entering panic mode");
                let old = self.monitoring_conn.lock().take();
                self.is_verified_writer.store(false, Ordering::SeqCst);
                if let Some(old) = old {
                    old.close().await;
                }
            }
        }
    }

    async fn panic_tick(self: &Arc<Self>) {
        let group = self.probes.lock().clone();

        let Some(group) = group else {
            let cluster_id = self.cluster_id();
            let hosts = match self.cache.get(&cluster_id) {
                Some(hosts) => Some((*hosts).clone()),
                None => self.open_any_connection_and_update_topology().await,
            };

            if self.is_verified_writer.load(Ordering::SeqCst) {
                // The one-off connection turned out to be the writer already.
                return;
            }

            if let Some(hosts) = hosts {
                let group = Arc::new(ProbeGroup::new(self.cancel.child_token()));
                *self.probes.lock() = Some(group.clone());
                metrics().panic_entries_total.inc();
                info!(cluster_id = %cluster_id, candidates = hosts.len(), "Writer unknown, racing node probes");
                for host in hosts {
                    self.spawn_probe(&group, host);
                }
            }
            return;
        };

        if let Some((conn, host)) = group.take_winner() {
            let old = self.monitoring_conn.lock().replace(conn);
            if let Some(old) = old {
                old.close().await;
            }
            *self.writer_host.lock() = Some(host.clone());
            self.is_verified_writer.store(true, Ordering::SeqCst);
            *self.high_refresh_until.lock() =
                Some(Instant::now() + HIGH_REFRESH_PERIOD_AFTER_PANIC);
            if self.panic_from_forced_refresh.swap(false, Ordering::SeqCst) {
                *self.ignore_requests_until.lock() =
                    Some(Instant::now() + IGNORE_TOPOLOGY_REQUEST_PERIOD);
            }
            metrics().writer_promotions_total.inc();
            info!(writer = %host.host(), "Writer confirmed, leaving panic mode");
            self.drain_probes().await;
            return;
        }

        // Feed any hosts newly observed by a reader probe into the race.
        let latest = group.latest_topology.lock().clone();
        if let Some(hosts) = latest {
            if !group.stop.is_cancelled() {
                for host in hosts {
                    self.spawn_probe(&group, host);
                }
            }
        }
    }

    fn spawn_probe(self: &Arc<Self>, group: &Arc<ProbeGroup>, host: HostSpec) {
        let key = host.host_and_port();
        let mut tasks = group.tasks.lock();
        if tasks.contains_key(&key) {
            return;
        }
        let prior_writer = self.writer_host.lock().clone();
        let handle = tokio::spawn(probe_node(self.clone(), group.clone(), host, prior_writer));
        tasks.insert(key, handle);
    }

    /// Cancel the current probe race and wait for its tasks to finish,
    /// bounded per task by [`PROBE_JOIN_GRACE`].
    async fn drain_probes(&self) {
        let Some(group) = self.probes.lock().take() else {
            return;
        };
        group.stop.cancel();
        // An unclaimed winner connection must not leak.
        let unclaimed = group.winner.lock().take();
        if let Some((conn, _)) = unclaimed {
            conn.close().await;
        }

        let handles: Vec<_> = group.tasks.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            if tokio::time::timeout(PROBE_JOIN_GRACE, handle).await.is_err() {
                warn!("A node probe did not stop within the grace period");
            }
        }
    }

    /// One-off connection attempt to the originally configured host, used
    /// when panic mode has no cached topology to seed probes from.
    async fn open_any_connection_and_update_topology(&self) -> Option<Vec<HostSpec>> {
        let mut verified_here = false;

        if self.monitoring_conn.lock().is_none() {
            match self
                .connections
                .open_connection(&self.initial_host, &self.properties)
                .await
            {
                Ok(conn) => {
                    let installed = {
                        let mut slot = self.monitoring_conn.lock();
                        if slot.is_none() {
                            *slot = Some(conn.clone());
                            true
                        } else {
                            false
                        }
                    };

                    if installed {
                        debug!(host = %self.initial_host.host(), "Opened monitoring connection");
                        if let Ok(Some(writer_id)) =
                            conn.query_node_id(self.dialect.writer_id_query()).await
                        {
                            if !writer_id.is_empty() {
                                self.is_verified_writer.store(true, Ordering::SeqCst);
                                verified_here = true;
                                self.record_writer_host(&conn).await;
                            }
                        }
                    } else {
                        spawn_close(conn);
                    }
                }
                Err(e) => {
                    trace!(host = %self.initial_host.host(), error = %e, "Could not open a connection to the initial host");
                }
            }
        }

        let conn = self.monitoring_conn.lock().clone();
        let hosts = self.fetch_topology_and_update(conn.as_ref()).await;

        if verified_here && self.panic_from_forced_refresh.swap(false, Ordering::SeqCst) {
            *self.ignore_requests_until.lock() =
                Some(Instant::now() + IGNORE_TOPOLOGY_REQUEST_PERIOD);
        }

        match hosts {
            Some(hosts) => Some((*hosts).clone()),
            None => {
                let old = self.monitoring_conn.lock().take();
                self.is_verified_writer.store(false, Ordering::SeqCst);
                if let Some(old) = old {
                    old.close().await;
                }
                None
            }
        }
    }

    async fn record_writer_host(&self, conn: &Arc<dyn DriverConnection>) {
        if EndpointKind::classify(self.initial_host.host()) == EndpointKind::Instance {
            *self.writer_host.lock() = Some(self.initial_host.clone());
            return;
        }

        if let Ok(Some(node_id)) = conn.query_node_id(self.dialect.node_id_query()).await {
            if !node_id.is_empty() {
                let host =
                    create_host(&node_id, true, 0, None, &self.template, &self.initial_host);
                debug!(writer = %host.host(), "Writer identified through monitoring connection");
                *self.writer_host.lock() = Some(host);
            }
        }
    }

    /// Fetch topology through the given connection and publish a non-empty
    /// result. `None` means the fetch failed and the connection is suspect.
    async fn fetch_topology_and_update(
        &self,
        conn: Option<&Arc<dyn DriverConnection>>,
    ) -> Option<Arc<Vec<HostSpec>>> {
        let conn = conn?;

        let rows = match conn.query_topology(self.dialect.topology_query()).await {
            Ok(rows) => rows,
            Err(e) => {
                trace!(error = %e, "Topology query failed");
                return None;
            }
        };

        let hosts = match process_rows(rows, &self.template, &self.initial_host) {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!(error = %e, "Discarding malformed topology result");
                return None;
            }
        };

        let hosts = Arc::new(hosts);
        if !hosts.is_empty() {
            self.publish(hosts.clone());
        }
        Some(hosts)
    }

    /// The only write path into the topology cache: store under the current
    /// cluster id, clear the pending-request flag and wake every waiter.
    pub(crate) fn publish(&self, hosts: Arc<Vec<HostSpec>>) {
        let cluster_id = self.cluster_id();
        self.cache.set(&cluster_id, hosts, self.cache_ttl);
        self.request_to_update.store(false, Ordering::SeqCst);
        self.topology_updated.notify_waiters();
        metrics().topology_updates_total.inc();
    }

    /// Interruptible inter-tick delay: a pending refresh request collapses a
    /// long normal-mode sleep into the high-refresh cadence.
    async fn delay(&self, mut use_high_rate: bool) {
        if matches!(*self.high_refresh_until.lock(), Some(t) if t > Instant::now()) {
            use_high_rate = true;
        }
        if self.request_to_update.load(Ordering::SeqCst) {
            use_high_rate = true;
        }

        let period = if use_high_rate {
            self.high_refresh_rate
        } else {
            self.refresh_rate
        };
        let end = Instant::now() + period;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(DELAY_SLICE.min(period)) => {}
                _ = self.cancel.cancelled() => return,
            }
            if self.request_to_update.load(Ordering::SeqCst) || Instant::now() >= end {
                return;
            }
        }
    }
}

fn spawn_close(conn: Arc<dyn DriverConnection>) {
    tokio::spawn(async move {
        conn.close().await;
    });
}

/// One panic-mode probe: owns at most one connection attempt to one host.
///
/// Connect failures mark the host unavailable and retry next tick. A
/// positive writer answer races for the winner slot; losing the race closes
/// the connection and stands down. A reader answer may (once per group)
/// adopt the topology-fetcher role for the probe group.
async fn probe_node(
    monitor: Arc<ClusterTopologyMonitor>,
    group: Arc<ProbeGroup>,
    host: HostSpec,
    prior_writer: Option<HostSpec>,
) {
    let mut conn: Option<Arc<dyn DriverConnection>> = None;
    let mut fetch_as_reader = false;

    // Stagger the first attempts so a large cluster is not hit all at once.
    let jitter = rand::thread_rng().gen_range(0..50);
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(jitter)) => {}
        _ = group.stop.cancelled() => return,
    }

    loop {
        if group.stop.is_cancelled() || monitor.cancel.is_cancelled() {
            break;
        }

        if conn.is_none() {
            match monitor
                .connections
                .open_connection(&host, &monitor.properties)
                .await
            {
                Ok(c) => {
                    monitor
                        .connections
                        .set_availability(&host.as_aliases(), HostAvailability::Available);
                    metrics().probe_connects_total.with_label_values(&["ok"]).inc();
                    conn = Some(c);
                }
                Err(_) => {
                    monitor
                        .connections
                        .set_availability(&host.as_aliases(), HostAvailability::Unavailable);
                    metrics().probe_connects_total.with_label_values(&["error"]).inc();
                }
            }
        }

        if let Some(c) = conn.clone() {
            let writer_id = match c.query_node_id(monitor.dialect.writer_id_query()).await {
                Ok(id) => id,
                Err(_) => {
                    c.close().await;
                    conn = None;
                    None
                }
            };

            if let Some(writer_id) = writer_id.filter(|id| !id.is_empty()) {
                if group.try_set_winner(c.clone(), host.clone()) {
                    info!(writer_id = %writer_id, host = %host.host(), "Node probe detected the writer");
                    monitor.fetch_topology_and_update(Some(&c)).await;
                } else {
                    c.close().await;
                }
                return;
            }

            if conn.is_some() && !group.has_winner() {
                if fetch_as_reader {
                    reader_fetch_topology(&monitor, &group, &c, prior_writer.as_ref()).await;
                } else if !group.reader_claimed.swap(true, Ordering::SeqCst) {
                    fetch_as_reader = true;
                    reader_fetch_topology(&monitor, &group, &c, prior_writer.as_ref()).await;
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(PROBE_TICK) => {}
            _ = group.stop.cancelled() => break,
        }
    }

    if let Some(c) = conn {
        c.close().await;
    }
    trace!(host = %host.host(), "Node probe finished");
}

/// Topology fetch performed by the designated reader probe while the writer
/// is still unknown. Publishes to the cache when the writer is observed to
/// have changed, or when no writer was known at all.
async fn reader_fetch_topology(
    monitor: &Arc<ClusterTopologyMonitor>,
    group: &Arc<ProbeGroup>,
    conn: &Arc<dyn DriverConnection>,
    prior_writer: Option<&HostSpec>,
) {
    let rows = match conn.query_topology(monitor.dialect.topology_query()).await {
        Ok(rows) => rows,
        Err(_) => return,
    };
    let hosts = match process_rows(rows, &monitor.template, &monitor.initial_host) {
        Ok(hosts) => hosts,
        Err(_) => return,
    };
    if hosts.is_empty() {
        return;
    }

    *group.latest_topology.lock() = Some(hosts.clone());

    let new_writer = hosts.iter().find(|h| h.role() == HostRole::Writer);
    match (new_writer, prior_writer) {
        (Some(new_writer), Some(prior)) if new_writer.host_and_port() != prior.host_and_port() => {
            debug!(old = %prior.host(), new = %new_writer.host(), "Writer change observed through a reader");
            monitor.publish(Arc::new(hosts));
        }
        (_, None) => {
            // Nothing was known; reader-observed topology is better than none.
            monitor.publish(Arc::new(hosts));
        }
        _ => {}
    }
}
