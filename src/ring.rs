//! Consistent-hash ring over remote authority nodes.
//!
//! Keeps a window's hash key pinned to the same node while the node set is
//! unchanged, which preserves counter locality on the authority side. Hash
//! placement only needs to be stable within one process lifetime, so the
//! standard `DefaultHasher` is sufficient.

use crate::resolver::RemoteNode;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// Virtual points per node; evens out the key distribution.
pub const DEFAULT_REPLICAS: usize = 100;

/// Ring of hashed virtual node points.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    points: BTreeMap<u64, RemoteNode>,
}

fn hash_value<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

impl HashRing {
    /// Build a ring with [`DEFAULT_REPLICAS`] virtual points per node.
    pub fn new(nodes: &[RemoteNode]) -> Self {
        Self::with_replicas(nodes, DEFAULT_REPLICAS)
    }

    pub fn with_replicas(nodes: &[RemoteNode], replicas: usize) -> Self {
        let mut points = BTreeMap::new();
        for node in nodes {
            for replica in 0..replicas.max(1) {
                points.insert(hash_value(&(node, replica)), node.clone());
            }
        }
        Self { points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Clockwise lookup: first point at or after the key's hash, wrapping to
    /// the ring start. Deterministic for an unchanged node set.
    pub fn select(&self, key: &str) -> Option<&RemoteNode> {
        if self.points.is_empty() {
            return None;
        }
        let hashed = hash_value(&key);
        self.points
            .range(hashed..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, node)| node)
    }
}
