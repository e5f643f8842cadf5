//! Resolution of remote authority instances.
//!
//! The engine asks a resolver for the one node a hash key maps to. Discovery
//! integrations implement [`InstanceResolver`] on top of their registry
//! cache; [`StaticResolver`] covers fixed address lists and the config
//! fallback addresses.

use crate::ring::HashRing;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;

/// Address of one remote quota-authority node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteNode {
    pub host: String,
    pub port: u16,
}

impl RemoteNode {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for RemoteNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Maps `(cluster, hash key)` to one authority node via ring-hash policy.
pub trait InstanceResolver: Send + Sync + fmt::Debug {
    /// `None` when the cluster is unknown or currently has no instances;
    /// the affected windows then run local-only.
    fn resolve_one(&self, cluster: &str, hash_key: &str) -> Option<RemoteNode>;
}

/// Ring-hash resolver over fixed per-cluster address lists.
#[derive(Debug, Default)]
pub struct StaticResolver {
    rings: DashMap<String, Arc<HashRing>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience: one cluster named `cluster` with the given nodes.
    pub fn with_cluster(cluster: impl Into<String>, nodes: &[RemoteNode]) -> Self {
        let resolver = Self::new();
        resolver.put_cluster(cluster, nodes);
        resolver
    }

    /// Install or replace a cluster's node set.
    pub fn put_cluster(&self, cluster: impl Into<String>, nodes: &[RemoteNode]) {
        self.rings.insert(cluster.into(), Arc::new(HashRing::new(nodes)));
    }

    /// Drop a cluster entirely.
    pub fn remove_cluster(&self, cluster: &str) {
        self.rings.remove(cluster);
    }
}

impl InstanceResolver for StaticResolver {
    fn resolve_one(&self, cluster: &str, hash_key: &str) -> Option<RemoteNode> {
        let ring = self.rings.get(cluster)?.clone();
        ring.select(hash_key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_cluster_resolves_to_none() {
        let resolver = StaticResolver::new();
        assert!(resolver.resolve_one("limiters", "key").is_none());
    }

    #[test]
    fn resolution_is_stable_for_an_unchanged_set() {
        let nodes =
            vec![RemoteNode::new("a", 7000), RemoteNode::new("b", 7000), RemoteNode::new("c", 7000)];
        let resolver = StaticResolver::with_cluster("limiters", &nodes);
        let first = resolver.resolve_one("limiters", "orders#v1#");
        assert!(first.is_some());
        for _ in 0..50 {
            assert_eq!(resolver.resolve_one("limiters", "orders#v1#"), first);
        }
    }

    #[test]
    fn replacing_the_cluster_can_move_keys() {
        let resolver = StaticResolver::with_cluster(
            "limiters",
            &[RemoteNode::new("a", 7000), RemoteNode::new("b", 7000)],
        );
        resolver.put_cluster("limiters", &[RemoteNode::new("c", 7000)]);
        assert_eq!(
            resolver.resolve_one("limiters", "any"),
            Some(RemoteNode::new("c", 7000))
        );
    }

    #[test]
    fn empty_cluster_resolves_to_none() {
        let resolver = StaticResolver::with_cluster("limiters", &[]);
        assert!(resolver.resolve_one("limiters", "key").is_none());
    }
}
