//! Cluster topology discovery
//!
//! This module owns the shared [`TopologyCache`], the per-connection
//! [`ClusterHostListProvider`] façade, and the per-cluster background
//! [`ClusterTopologyMonitor`] with its panic-mode writer race. Monitors are
//! created lazily and reaped on idle by the [`TopologyMonitorRegistry`].

mod cache;
mod monitor;
mod provider;
mod registry;

pub use cache::{SuggestedPrimary, TopologyCache};
pub use monitor::ClusterTopologyMonitor;
pub use provider::ClusterHostListProvider;
pub use registry::TopologyMonitorRegistry;

use std::time::{Duration, SystemTime};

use thiserror::Error;

use crate::driver::{DriverError, TopologyRow};
use crate::host::{endpoint_rest, HostAvailability, HostRole, HostSpec};

/// Error surfaced to callers of the topology API.
///
/// Transient probe failures never appear here; they are retried locally.
/// "No writer known" is an empty host list, not an error.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("Topology was not updated within {0:?}")]
    RefreshTimeout(Duration),
    #[error("Malformed topology data: {0}")]
    InvalidTopology(String),
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Build the instance endpoint template for a cluster.
///
/// A configured host pattern wins; otherwise the template is derived from the
/// initial host's DNS shape (`?` replacing its first label). For bare
/// hostnames and IP addresses the node id itself becomes the endpoint.
pub(crate) fn instance_template(initial: &HostSpec, pattern: Option<&str>) -> HostSpec {
    let host = match pattern {
        Some(p) => p.to_string(),
        None => match endpoint_rest(initial.host()) {
            Some(rest) => format!("?.{rest}"),
            None => "?".to_string(),
        },
    };

    HostSpec::builder().host(host).maybe_port(initial.port()).build()
}

/// Build one [`HostSpec`] from a topology row, substituting the node id into
/// the endpoint template.
pub(crate) fn create_host(
    node_id: &str,
    is_writer: bool,
    weight: i64,
    last_update_time: Option<SystemTime>,
    template: &HostSpec,
    initial: &HostSpec,
) -> HostSpec {
    let endpoint = template.host().replace('?', node_id);
    let port = template.port().or(initial.port());

    HostSpec::builder()
        .host(endpoint)
        .maybe_port(port)
        .host_id(node_id)
        .role(if is_writer { HostRole::Writer } else { HostRole::Reader })
        .availability(HostAvailability::Available)
        .weight(weight)
        .maybe_last_update_time(last_update_time)
        .alias(node_id)
        .build()
}

/// Translate raw topology rows into an ordered host list, writer first.
///
/// At most one writer survives: with multiple writer rows (split-brain during
/// failover) the most recently updated one wins; with none the result is
/// empty, which callers read as "topology unknown". A row without a node id
/// is a data-shape violation and fails the whole batch, since it indicates a
/// dialect or engine-version mismatch that must not be masked.
pub(crate) fn process_rows(
    rows: Vec<TopologyRow>,
    template: &HostSpec,
    initial: &HostSpec,
) -> Result<Vec<HostSpec>, TopologyError> {
    let mut readers = Vec::new();
    let mut writers = Vec::new();

    for row in rows {
        if row.node_id.is_empty() {
            return Err(TopologyError::InvalidTopology(
                "topology row is missing a node id".to_string(),
            ));
        }

        let weight =
            (row.replica_lag_ms.round() as i64) * 100 + row.cpu_utilization.round() as i64;
        let last_update = row.last_update_time.or_else(|| Some(SystemTime::now()));
        let host = create_host(&row.node_id, row.is_writer, weight, last_update, template, initial);

        if row.is_writer {
            writers.push(host);
        } else {
            readers.push(host);
        }
    }

    let mut hosts = Vec::with_capacity(readers.len() + 1);
    match writers.len() {
        0 => return Ok(Vec::new()),
        1 => hosts.extend(writers),
        _ => {
            let latest = writers
                .into_iter()
                .max_by_key(|w| w.last_update_time())
                .into_iter();
            hosts.extend(latest);
        }
    }
    hosts.extend(readers);
    Ok(hosts)
}
