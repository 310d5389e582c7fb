use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::SystemTime;

/// Role of a host within its cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRole {
    Writer,
    Reader,
}

/// Reachability of a host as last observed by a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAvailability {
    Available,
    Unavailable,
}

/// Connection info for a single cluster node.
///
/// Immutable once built; a newer topology list replaces earlier specs
/// wholesale rather than mutating them in place. Equality and hashing are by
/// host and port only, so the same node observed with different weights or
/// timestamps compares equal.
#[derive(Debug, Clone)]
pub struct HostSpec {
    host: String,
    port: Option<u16>,
    host_id: Option<String>,
    role: HostRole,
    availability: HostAvailability,
    /// Derived from replica lag and CPU utilization; lower is preferred.
    weight: i64,
    last_update_time: Option<SystemTime>,
    aliases: HashSet<String>,
}

impl HostSpec {
    pub fn builder() -> HostSpecBuilder {
        HostSpecBuilder::new()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn is_port_specified(&self) -> bool {
        self.port.is_some()
    }

    pub fn host_id(&self) -> Option<&str> {
        self.host_id.as_deref()
    }

    pub fn role(&self) -> HostRole {
        self.role
    }

    pub fn availability(&self) -> HostAvailability {
        self.availability
    }

    pub fn weight(&self) -> i64 {
        self.weight
    }

    pub fn last_update_time(&self) -> Option<SystemTime> {
        self.last_update_time
    }

    pub fn aliases(&self) -> &HashSet<String> {
        &self.aliases
    }

    pub fn add_alias(&mut self, alias: impl Into<String>) {
        self.aliases.insert(alias.into());
    }

    /// All names this host answers to, including its own endpoint.
    pub fn as_aliases(&self) -> HashSet<String> {
        let mut all = self.aliases.clone();
        all.insert(self.host_and_port());
        all
    }

    /// `host:port`, or just `host` when no port is specified.
    pub fn host_and_port(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }
}

impl PartialEq for HostSpec {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for HostSpec {}

impl Hash for HostSpec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{:?}]", self.host_and_port(), self.role)
    }
}

/// Builder for [`HostSpec`]
#[derive(Debug, Clone)]
pub struct HostSpecBuilder {
    host: String,
    port: Option<u16>,
    host_id: Option<String>,
    role: HostRole,
    availability: HostAvailability,
    weight: i64,
    last_update_time: Option<SystemTime>,
    aliases: HashSet<String>,
}

impl HostSpecBuilder {
    pub fn new() -> Self {
        Self {
            host: String::new(),
            port: None,
            host_id: None,
            role: HostRole::Writer,
            availability: HostAvailability::Available,
            weight: 0,
            last_update_time: None,
            aliases: HashSet::new(),
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn maybe_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    pub fn host_id(mut self, host_id: impl Into<String>) -> Self {
        self.host_id = Some(host_id.into());
        self
    }

    pub fn role(mut self, role: HostRole) -> Self {
        self.role = role;
        self
    }

    pub fn availability(mut self, availability: HostAvailability) -> Self {
        self.availability = availability;
        self
    }

    pub fn weight(mut self, weight: i64) -> Self {
        self.weight = weight;
        self
    }

    pub fn last_update_time(mut self, time: SystemTime) -> Self {
        self.last_update_time = Some(time);
        self
    }

    pub fn maybe_last_update_time(mut self, time: Option<SystemTime>) -> Self {
        self.last_update_time = time;
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.insert(alias.into());
        self
    }

    pub fn build(self) -> HostSpec {
        HostSpec {
            host: self.host,
            port: self.port,
            host_id: self.host_id,
            role: self.role,
            availability: self.availability,
            weight: self.weight,
            last_update_time: self.last_update_time,
            aliases: self.aliases,
        }
    }
}

impl Default for HostSpecBuilder {
    fn default() -> Self {
        Self::new()
    }
}
