use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Topology monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    /// Enhanced failure monitoring configuration
    #[serde(default)]
    pub failure_detection: FailureDetectionConfig,
}

// ============================================================================
// Topology Monitoring Configuration
// ============================================================================

/// Cluster topology monitoring configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    /// Interval between topology refreshes in normal mode (milliseconds)
    #[serde(default = "default_refresh_rate_ms")]
    pub topology_refresh_rate_ms: u64,
    /// Interval between topology refreshes while failover is settling (milliseconds)
    #[serde(default = "default_high_refresh_rate_ms")]
    pub topology_high_refresh_rate_ms: u64,
    /// Lifetime of a cached topology entry (milliseconds)
    #[serde(default = "default_cache_expiration_ms")]
    pub topology_cache_expiration_ms: u64,
    /// Endpoint template for building instance endpoints from node short names.
    /// A `?` placeholder is substituted with the node id, e.g.
    /// `?.abc123.us-east-1.rds.amazonaws.com`.
    #[serde(default)]
    pub cluster_instance_host_pattern: Option<String>,
}

fn default_refresh_rate_ms() -> u64 {
    30_000
}

fn default_high_refresh_rate_ms() -> u64 {
    100
}

fn default_cache_expiration_ms() -> u64 {
    300_000
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            topology_refresh_rate_ms: default_refresh_rate_ms(),
            topology_high_refresh_rate_ms: default_high_refresh_rate_ms(),
            topology_cache_expiration_ms: default_cache_expiration_ms(),
            cluster_instance_host_pattern: None,
        }
    }
}

// ============================================================================
// Failure Detection Configuration
// ============================================================================

/// Enhanced failure monitoring (per-connection liveness probing) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FailureDetectionConfig {
    /// Whether failure detection is enabled
    #[serde(default = "default_detection_enabled")]
    pub enabled: bool,
    /// Grace period after monitoring starts before the first probe (milliseconds)
    #[serde(default = "default_detection_time_ms")]
    pub failure_detection_time_ms: u64,
    /// Interval between liveness probes (milliseconds)
    #[serde(default = "default_detection_interval_ms")]
    pub failure_detection_interval_ms: u64,
    /// Consecutive probe failures before a node is declared unhealthy
    #[serde(default = "default_detection_count")]
    pub failure_detection_count: u32,
    /// Idle time without active contexts before a host monitor is disposed (milliseconds)
    #[serde(default = "default_disposal_time_ms")]
    pub monitor_disposal_time_ms: u64,
}

fn default_detection_enabled() -> bool {
    true
}

fn default_detection_time_ms() -> u64 {
    30_000
}

fn default_detection_interval_ms() -> u64 {
    5_000
}

fn default_detection_count() -> u32 {
    3
}

fn default_disposal_time_ms() -> u64 {
    600_000
}

impl Default for FailureDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: default_detection_enabled(),
            failure_detection_time_ms: default_detection_time_ms(),
            failure_detection_interval_ms: default_detection_interval_ms(),
            failure_detection_count: default_detection_count(),
            monitor_disposal_time_ms: default_disposal_time_ms(),
        }
    }
}
