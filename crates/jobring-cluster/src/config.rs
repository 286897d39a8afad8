//! Construction-time configuration for a [`NodePool`](crate::NodePool).
//!
//! Every value here is fixed for the life of the pool; there is no reload.

use std::collections::BTreeSet;
use std::time::Duration;

use jobring_placement::RingHasher;
use serde::Deserialize;

/// Default period between membership refreshes.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of virtual nodes per member.
pub const DEFAULT_HASH_REPLICAS: usize = 50;

/// How a freshly fetched member list is compared with the last applied one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipComparison {
    /// Element-by-element in the order given. Requires a source that returns
    /// members in a stable order; a reordering triggers a rebuild.
    #[default]
    Ordered,
    /// As sets: reordering (and duplicate entries) never trigger a rebuild.
    Unordered,
}

impl MembershipComparison {
    /// Whether `current` describes the same membership as `previous`.
    pub fn unchanged(&self, previous: &[String], current: &[String]) -> bool {
        match self {
            Self::Ordered => previous == current,
            Self::Unordered => {
                previous.iter().collect::<BTreeSet<_>>() == current.iter().collect::<BTreeSet<_>>()
            }
        }
    }
}

/// Configuration for a [`NodePool`](crate::NodePool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Logical group shared by all cooperating processes.
    pub service_name: String,
    /// Period between membership refreshes. Also handed to the driver as
    /// its fetch timeout.
    pub refresh_interval: Duration,
    /// Virtual nodes per member.
    pub hash_replicas: usize,
    /// Ring hash function; `None` selects the default.
    pub hasher: Option<RingHasher>,
    /// No-op detection strategy for refreshes.
    pub comparison: MembershipComparison,
}

impl PoolConfig {
    /// Create a config with defaults for everything but the service name.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            hash_replicas: DEFAULT_HASH_REPLICAS,
            hasher: None,
            comparison: MembershipComparison::default(),
        }
    }

    /// Create a config suitable for fast test execution.
    pub fn test_config(service_name: impl Into<String>) -> Self {
        Self::new(service_name).with_refresh_interval(Duration::from_millis(50))
    }

    pub fn with_refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = refresh_interval;
        self
    }

    pub fn with_hash_replicas(mut self, hash_replicas: usize) -> Self {
        self.hash_replicas = hash_replicas;
        self
    }

    pub fn with_hasher(mut self, hasher: RingHasher) -> Self {
        self.hasher = Some(hasher);
        self
    }

    pub fn with_comparison(mut self, comparison: MembershipComparison) -> Self {
        self.comparison = comparison;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_ordered_comparison_is_order_sensitive() {
        let cmp = MembershipComparison::Ordered;
        assert!(cmp.unchanged(&list(&["a", "b"]), &list(&["a", "b"])));
        assert!(!cmp.unchanged(&list(&["a", "b"]), &list(&["b", "a"])));
        assert!(!cmp.unchanged(&list(&["a", "b"]), &list(&["a", "b", "c"])));
        assert!(cmp.unchanged(&[], &[]));
    }

    #[test]
    fn test_unordered_comparison_ignores_order() {
        let cmp = MembershipComparison::Unordered;
        assert!(cmp.unchanged(&list(&["a", "b"]), &list(&["b", "a"])));
        assert!(!cmp.unchanged(&list(&["a", "b"]), &list(&["a", "c"])));
        assert!(!cmp.unchanged(&list(&["a"]), &[]));
    }

    #[test]
    fn test_builder_overrides_defaults() {
        let config = PoolConfig::new("svc")
            .with_refresh_interval(Duration::from_millis(10))
            .with_hash_replicas(3)
            .with_comparison(MembershipComparison::Unordered);

        assert_eq!(config.service_name, "svc");
        assert_eq!(config.refresh_interval, Duration::from_millis(10));
        assert_eq!(config.hash_replicas, 3);
        assert!(config.hasher.is_none());
        assert_eq!(config.comparison, MembershipComparison::Unordered);
    }
}
