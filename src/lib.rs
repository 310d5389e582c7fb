//! Cluster topology discovery and host health monitoring for database failover.
//!
//! This crate is the resilience core of a database connectivity wrapper. It
//! learns which cluster node is currently the writer and which are readers,
//! races candidate nodes to find a new writer after a failover, caches the
//! resulting topology per logical cluster, and independently watches active
//! connections for silent unresponsiveness via periodic liveness probes.
//!
//! The wrapped database driver is abstracted behind the [`driver`] traits;
//! failover policy, read/write splitting and the plugin pipeline that decides
//! *when* to consult this crate live elsewhere and consume its outputs: an
//! ordered host list per cluster id, and a `node_unhealthy` flag per monitored
//! connection.

pub mod config;
pub mod driver;
pub mod efm;
pub mod host;
pub mod metrics;
pub mod topology;

pub use config::{Config, FailureDetectionConfig, MonitoringConfig};
pub use driver::{ConnectionService, DriverConnection, DriverError, Properties, TopologyRow};
pub use efm::{HostMonitorConnectionContext, HostMonitorService};
pub use host::{EndpointKind, HostAvailability, HostRole, HostSpec, HostSpecBuilder};
pub use topology::{
    ClusterHostListProvider, ClusterTopologyMonitor, TopologyCache, TopologyError,
    TopologyMonitorRegistry,
};
