use std::net::IpAddr;

/// Classification of a cluster endpoint hostname.
///
/// RDS-style DNS names have the shape
/// `<name>.<dns-group><hash>.<region>.rds.amazonaws.com` where the dns group
/// distinguishes writer cluster (`cluster-`), reader cluster (`cluster-ro-`),
/// custom cluster (`cluster-custom-`) and proxy (`proxy-`) endpoints; a name
/// with no dns group prefix is an individual instance endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    WriterCluster,
    ReaderCluster,
    CustomCluster,
    Proxy,
    Instance,
    IpAddress,
    Other,
}

impl EndpointKind {
    pub fn classify(host: &str) -> Self {
        if host.is_empty() {
            return Self::Other;
        }

        if host.parse::<IpAddr>().is_ok() {
            return Self::IpAddress;
        }

        let Some(dns_group) = dns_group(host) else {
            // ELB and arbitrary hostnames land here
            return Self::Other;
        };

        if dns_group.starts_with("cluster-ro-") {
            Self::ReaderCluster
        } else if dns_group.starts_with("cluster-custom-") {
            Self::CustomCluster
        } else if dns_group.starts_with("cluster-") {
            Self::WriterCluster
        } else if dns_group.starts_with("proxy-") {
            Self::Proxy
        } else {
            Self::Instance
        }
    }

    /// Cluster endpoints (writer, reader, custom) all identify one cluster.
    pub fn is_cluster(&self) -> bool {
        matches!(
            self,
            Self::WriterCluster | Self::ReaderCluster | Self::CustomCluster
        )
    }
}

const RDS_DOMAIN_SUFFIXES: &[&str] = &[
    ".rds.amazonaws.com",
    ".amazonaws.com.cn",
    ".c2s.ic.gov",
    ".sc2s.sgov.gov",
];

fn is_rds_dns(host: &str) -> bool {
    let lower = host.to_ascii_lowercase();
    RDS_DOMAIN_SUFFIXES.iter().any(|s| lower.ends_with(s))
}

/// The label following the instance name, e.g. `cluster-ro-abc123` in
/// `mydb.cluster-ro-abc123.us-east-1.rds.amazonaws.com`.
fn dns_group(host: &str) -> Option<String> {
    if !is_rds_dns(host) {
        return None;
    }

    let mut labels = host.split('.');
    let _instance = labels.next()?;
    labels.next().map(|l| l.to_ascii_lowercase())
}

const DNS_GROUP_PREFIXES: &[&str] =
    &["cluster-ro-", "cluster-custom-", "cluster-", "proxy-", "shardgrp-"];

/// The DNS domain after the instance label and any dns group prefix, used to
/// build instance endpoint templates of the form `?.<rest>`. Instance
/// endpoints carry no dns group, so `node-1.abc123.us-east-1.rds.amazonaws.com`
/// and `mydb.cluster-abc123.us-east-1.rds.amazonaws.com` both yield
/// `abc123.us-east-1.rds.amazonaws.com`.
pub fn endpoint_rest(host: &str) -> Option<&str> {
    if !is_rds_dns(host) {
        return None;
    }
    let (_, rest) = host.split_once('.')?;
    let rest = DNS_GROUP_PREFIXES
        .iter()
        .find(|p| rest.len() >= p.len() && rest[..p.len()].eq_ignore_ascii_case(p))
        .map_or(rest, |p| &rest[p.len()..]);
    Some(rest)
}

/// Instance short name of an RDS DNS endpoint (the first label).
pub fn instance_id(host: &str) -> Option<&str> {
    if !is_rds_dns(host) {
        return None;
    }
    host.split('.').next().filter(|l| !l.is_empty())
}

/// Rewrite a reader cluster endpoint to its writer cluster form.
///
/// Returns the host unchanged for writer cluster endpoints and `None` for
/// anything that is not a cluster endpoint.
pub fn writer_cluster_form(host: &str) -> Option<String> {
    match EndpointKind::classify(host) {
        EndpointKind::WriterCluster => Some(host.to_string()),
        EndpointKind::ReaderCluster => {
            let (instance, rest) = host.split_once('.')?;
            let rewritten = rest.to_ascii_lowercase().replacen("cluster-ro-", "cluster-", 1);
            Some(format!("{instance}.{rewritten}"))
        }
        _ => None,
    }
}
