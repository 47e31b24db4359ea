//! Weighted consistent-hash ring
//!
//! Each node contributes `replicas` virtual points hashed with the leading 64
//! bits of `md5("{node}#{i}")`. Lookup is a lower-bound binary search that wraps
//! around to the first point. Rings are immutable; membership changes build a
//! fresh ring that is published through a [`RingHandle`].

use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::{ArcSwap, Guard};

use crate::point::hash64;

pub const DEFAULT_REPLICAS: usize = 500;

#[derive(Debug, Clone, Default)]
pub struct HashRing {
    /// Sorted by `(hash, node)`
    points: Vec<(u64, Arc<str>)>,
    nodes: BTreeSet<String>,
    replicas: usize,
}

impl HashRing {
    pub fn new<I, S>(nodes: I, replicas: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let nodes: BTreeSet<String> = nodes.into_iter().map(Into::into).collect();
        let mut points = Vec::with_capacity(nodes.len() * replicas);

        for node in &nodes {
            let id: Arc<str> = Arc::from(node.as_str());
            for i in 0..replicas {
                points.push((hash64(&format!("{node}#{i}")), id.clone()));
            }
        }

        points.sort_unstable_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        Self {
            points,
            nodes,
            replicas,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Node owning `key`, or `None` for an empty ring
    pub fn node_for(&self, key: u64) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }

        let idx = self.points.partition_point(|(hash, _)| *hash < key);
        let idx = if idx == self.points.len() { 0 } else { idx };
        Some(&self.points[idx].1)
    }

    pub fn node_for_str(&self, key: &str) -> Option<&str> {
        self.node_for(hash64(key))
    }

    pub fn nodes(&self) -> &BTreeSet<String> {
        &self.nodes
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True if rebuilding with these inputs would produce the same ring
    pub fn same_shape(&self, nodes: &BTreeSet<String>, replicas: usize) -> bool {
        self.replicas == replicas && &self.nodes == nodes
    }
}

/// Single-pointer publication of the current ring
#[derive(Debug)]
pub struct RingHandle {
    current: ArcSwap<HashRing>,
}

impl RingHandle {
    pub fn new(ring: HashRing) -> Self {
        Self {
            current: ArcSwap::from_pointee(ring),
        }
    }

    pub fn load(&self) -> Guard<Arc<HashRing>> {
        self.current.load()
    }

    pub fn install(&self, ring: HashRing) {
        self.current.store(Arc::new(ring));
    }
}

impl Default for RingHandle {
    fn default() -> Self {
        Self::new(HashRing::empty())
    }
}
