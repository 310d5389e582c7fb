//! Scriptable mock cluster
//!
//! One shared [`MockCluster`] plays the part of every node: tests script the
//! topology rows, which node currently answers as the writer, and which
//! hosts refuse connections or fail pings. Every connection handed out is
//! logged by weak reference so tests can assert on close/abort behavior
//! without keeping dropped connections alive.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;

use clusterwatch::{
    ConnectionService, DriverConnection, DriverError, HostAvailability, HostSpec, Properties,
    TopologyRow,
};

#[derive(Default)]
struct ClusterState {
    topology: Vec<TopologyRow>,
    writer_id: Option<String>,
    down_hosts: HashSet<String>,
    failing_pings: HashSet<String>,
}

#[derive(Default)]
pub struct MockCluster {
    state: Mutex<ClusterState>,
    connections: Mutex<Vec<Weak<MockConnection>>>,
    pub opens_total: AtomicUsize,
    availability_changes: Mutex<Vec<(HashSet<String>, HostAvailability)>>,
}

impl MockCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_topology(&self, rows: Vec<TopologyRow>) {
        self.state.lock().topology = rows;
    }

    pub fn set_writer(&self, node_id: Option<&str>) {
        self.state.lock().writer_id = node_id.map(str::to_string);
    }

    pub fn set_host_down(&self, host: &str, down: bool) {
        let mut state = self.state.lock();
        if down {
            state.down_hosts.insert(host.to_string());
        } else {
            state.down_hosts.remove(host);
        }
    }

    pub fn set_ping_failing(&self, host: &str, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing_pings.insert(host.to_string());
        } else {
            state.failing_pings.remove(host);
        }
    }

    /// Still-referenced connections for hosts whose name starts with `prefix`.
    /// The log holds weak references so dropping a connection stays
    /// observable to the code under test.
    pub fn connections_to(&self, prefix: &str) -> Vec<Arc<MockConnection>> {
        self.connections
            .lock()
            .iter()
            .filter_map(|w| w.upgrade())
            .filter(|c| c.host.starts_with(prefix))
            .collect()
    }

    pub fn availability_changes(&self) -> Vec<(HashSet<String>, HostAvailability)> {
        self.availability_changes.lock().clone()
    }
}

pub struct MockConnection {
    pub host: String,
    cluster: Arc<MockCluster>,
    closed: AtomicBool,
    aborted: AtomicBool,
}

impl MockConnection {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn node_id(&self) -> String {
        self.host.split('.').next().unwrap_or_default().to_string()
    }

    fn check_up(&self) -> Result<(), DriverError> {
        if self.closed.load(Ordering::SeqCst) || self.aborted.load(Ordering::SeqCst) {
            return Err(DriverError::Query("connection is closed".into()));
        }
        if self.cluster.state.lock().down_hosts.contains(&self.host) {
            return Err(DriverError::Query(format!("{} is down", self.host)));
        }
        Ok(())
    }
}

#[async_trait]
impl DriverConnection for MockConnection {
    async fn query_topology(&self, _sql: &str) -> Result<Vec<TopologyRow>, DriverError> {
        self.check_up()?;
        Ok(self.cluster.state.lock().topology.clone())
    }

    async fn query_node_id(&self, sql: &str) -> Result<Option<String>, DriverError> {
        self.check_up()?;
        // The writer-id query answers only on the writer; the plain node-id
        // query answers everywhere.
        if sql.contains("MASTER_SESSION_ID") {
            let my_id = self.node_id();
            let writer = self.cluster.state.lock().writer_id.clone();
            return Ok(writer.filter(|w| *w == my_id));
        }
        Ok(Some(self.node_id()))
    }

    async fn ping(&self) -> Result<(), DriverError> {
        self.check_up()?;
        if self.cluster.state.lock().failing_pings.contains(&self.host) {
            return Err(DriverError::Query(format!("{} did not answer", self.host)));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

pub struct MockConnectionService {
    pub cluster: Arc<MockCluster>,
}

impl MockConnectionService {
    pub fn new(cluster: Arc<MockCluster>) -> Arc<Self> {
        Arc::new(Self { cluster })
    }

    pub async fn connect(&self, host: &HostSpec) -> Arc<dyn DriverConnection> {
        self.open_connection(host, &Properties::new())
            .await
            .unwrap()
    }
}

#[async_trait]
impl ConnectionService for MockConnectionService {
    async fn open_connection(
        &self,
        host: &HostSpec,
        _properties: &Properties,
    ) -> Result<Arc<dyn DriverConnection>, DriverError> {
        if self.cluster.state.lock().down_hosts.contains(host.host()) {
            return Err(DriverError::Connect(format!("{} refused", host.host())));
        }

        self.cluster.opens_total.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(MockConnection {
            host: host.host().to_string(),
            cluster: self.cluster.clone(),
            closed: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
        });
        self.cluster.connections.lock().push(Arc::downgrade(&connection));
        Ok(connection)
    }

    fn set_availability(&self, aliases: &HashSet<String>, availability: HostAvailability) {
        self.cluster
            .availability_changes
            .lock()
            .push((aliases.clone(), availability));
    }
}

pub fn row(node_id: &str, is_writer: bool) -> TopologyRow {
    TopologyRow {
        node_id: node_id.to_string(),
        is_writer,
        cpu_utilization: 10.0,
        replica_lag_ms: 0.0,
        last_update_time: Some(SystemTime::now()),
    }
}

pub fn host(name: &str) -> HostSpec {
    HostSpec::builder().host(name).port(5432).build()
}

pub const CLUSTER_DNS: &str = "mydb.cluster-abc123.us-east-1.rds.amazonaws.com";
pub const READER_DNS: &str = "mydb.cluster-ro-abc123.us-east-1.rds.amazonaws.com";

pub fn instance_dns(node_id: &str) -> String {
    format!("{node_id}.abc123.us-east-1.rds.amazonaws.com")
}
