//! Host descriptions and cluster endpoint classification
//!
//! [`HostSpec`] is the value type the rest of the crate trades in: one entry
//! per cluster node, built fresh on every topology query and superseded
//! wholesale when a newer topology is published. [`EndpointKind`] classifies
//! a hostname into writer-cluster / reader-cluster / instance endpoint forms
//! so that connections opened via different URL shapes of the same cluster
//! can converge onto one cache lineage.

mod endpoint;
mod spec;

pub use endpoint::{endpoint_rest, instance_id, writer_cluster_form, EndpointKind};
pub use spec::{HostAvailability, HostRole, HostSpec, HostSpecBuilder};
