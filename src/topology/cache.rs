//! Process-wide topology cache shared by all connections of a cluster
//!
//! Maps a canonical cluster id to its most recently published host list with
//! an absolute expiration. Lists are stored behind `Arc` so that refresh
//! waiters can detect a newer publication by pointer identity rather than by
//! comparing contents. A second keyed cache records suggested-primary
//! cluster-id hints used to converge providers constructed from different
//! endpoint forms of the same cluster.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::host::HostSpec;

#[derive(Clone)]
struct TopologyEntry {
    hosts: Arc<Vec<HostSpec>>,
    expires_at: Instant,
}

/// A recorded hint that a non-primary cluster id belongs to a primary one.
#[derive(Debug, Clone)]
pub struct SuggestedPrimary {
    pub cluster_id: String,
    pub is_primary: bool,
}

#[derive(Clone)]
struct SuggestionEntry {
    suggestion: SuggestedPrimary,
    expires_at: Instant,
}

/// TTL-keyed cache of cluster topologies and suggested-primary cluster ids.
///
/// All mutation is a single keyed set-with-expiration; expired entries read
/// as misses and are dropped lazily.
pub struct TopologyCache {
    topologies: DashMap<String, TopologyEntry>,
    suggestions: DashMap<String, SuggestionEntry>,
}

impl TopologyCache {
    pub fn new() -> Self {
        Self {
            topologies: DashMap::new(),
            suggestions: DashMap::new(),
        }
    }

    /// Current topology for a cluster id, or `None` when absent or expired.
    pub fn get(&self, cluster_id: &str) -> Option<Arc<Vec<HostSpec>>> {
        let entry = self.topologies.get(cluster_id)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.topologies
                .remove_if(cluster_id, |_, e| e.expires_at <= Instant::now());
            return None;
        }
        Some(entry.hosts.clone())
    }

    pub fn set(&self, cluster_id: &str, hosts: Arc<Vec<HostSpec>>, ttl: Duration) {
        self.topologies.insert(
            cluster_id.to_string(),
            TopologyEntry {
                hosts,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn invalidate(&self, cluster_id: &str) {
        self.topologies.remove(cluster_id);
    }

    /// Re-key a topology entry when a provider adopts a new cluster id. The
    /// old key is always removed; the entry carries over with its remaining
    /// lifetime only when the adopted lineage has nothing cached yet, so a
    /// fresher entry under the new id is never clobbered.
    pub fn migrate(&self, old_cluster_id: &str, new_cluster_id: &str) {
        if let Some((_, entry)) = self.topologies.remove(old_cluster_id) {
            if entry.expires_at > Instant::now() && self.get(new_cluster_id).is_none() {
                self.topologies.insert(new_cluster_id.to_string(), entry);
            }
        }
    }

    pub fn suggest_primary(
        &self,
        cluster_id: &str,
        primary_cluster_id: &str,
        is_primary: bool,
        ttl: Duration,
    ) {
        self.suggestions.insert(
            cluster_id.to_string(),
            SuggestionEntry {
                suggestion: SuggestedPrimary {
                    cluster_id: primary_cluster_id.to_string(),
                    is_primary,
                },
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn suggested_primary(&self, cluster_id: &str) -> Option<SuggestedPrimary> {
        let entry = self.suggestions.get(cluster_id)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.suggestions
                .remove_if(cluster_id, |_, e| e.expires_at <= Instant::now());
            return None;
        }
        Some(entry.suggestion.clone())
    }

    pub fn clear(&self) {
        self.topologies.clear();
        self.suggestions.clear();
    }
}

impl Default for TopologyCache {
    fn default() -> Self {
        Self::new()
    }
}
