//! The seam between this crate and the wrapped database driver
//!
//! The topology and failure monitors never speak a wire protocol themselves;
//! they drive an abstract connection that can execute the handful of
//! dialect-specific queries they need. The plugin pipeline supplies real
//! implementations backed by the wrapped driver; tests supply mocks.

pub mod dialect;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use thiserror::Error;

use crate::host::{HostAvailability, HostSpec};

/// Connection properties passed through to the wrapped driver.
pub type Properties = HashMap<String, String>;

/// Keys prefixed with this override their base counterparts when a monitor
/// opens its own lightweight probing connection, e.g. `monitoring-connect_timeout`.
pub const MONITORING_PROPERTY_PREFIX: &str = "monitoring-";

/// Build the property set for a monitoring connection by applying
/// `monitoring-` prefixed overrides.
pub fn monitoring_properties(properties: &Properties) -> Properties {
    let mut result: Properties = properties
        .iter()
        .filter(|(k, _)| !k.starts_with(MONITORING_PROPERTY_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    for (key, value) in properties {
        if let Some(base_key) = key.strip_prefix(MONITORING_PROPERTY_PREFIX) {
            result.insert(base_key.to_string(), value.clone());
        }
    }

    result
}

/// Error from the wrapped driver
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Query failed: {0}")]
    Query(String),
    #[error("Malformed topology row: {0}")]
    InvalidRow(String),
}

/// One row of the dialect topology query, already decoded by the driver.
#[derive(Debug, Clone)]
pub struct TopologyRow {
    /// Node identifier used to correlate rows across queries
    pub node_id: String,
    pub is_writer: bool,
    pub cpu_utilization: f64,
    pub replica_lag_ms: f64,
    /// Absent when the server did not report a timestamp or it failed to parse
    pub last_update_time: Option<SystemTime>,
}

/// A live connection to one cluster node.
///
/// `close` is the graceful path; `abort` must be callable while another task
/// is blocked inside a read on the same connection, since aborting hung
/// connections is the entire point of failure monitoring.
#[async_trait]
pub trait DriverConnection: Send + Sync {
    /// Execute the dialect topology query and decode its rows.
    async fn query_topology(&self, sql: &str) -> Result<Vec<TopologyRow>, DriverError>;

    /// Execute a single-value query returning a node identifier, used for
    /// both the "who am I" and "who is the writer" dialect queries. No rows
    /// decode as `None`.
    async fn query_node_id(&self, sql: &str) -> Result<Option<String>, DriverError>;

    /// Lightweight liveness check.
    async fn ping(&self) -> Result<(), DriverError>;

    /// Graceful close. Best effort; errors are swallowed by callers.
    async fn close(&self);

    /// Forced close, safe to call while the connection is in use.
    fn abort(&self);
}

/// Factory and shared availability bookkeeping, implemented by the plugin
/// pipeline around the wrapped driver.
#[async_trait]
pub trait ConnectionService: Send + Sync {
    async fn open_connection(
        &self,
        host: &HostSpec,
        properties: &Properties,
    ) -> Result<Arc<dyn DriverConnection>, DriverError>;

    /// Record the observed availability of every alias of a host. Consumed by
    /// host-selection policies outside this crate.
    fn set_availability(&self, aliases: &HashSet<String>, availability: HostAvailability);
}
