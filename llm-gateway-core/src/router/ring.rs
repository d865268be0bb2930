//! Consistent-hash ring with virtual nodes. Keys and vnode positions hash
//! through SHA-1 truncated to the first eight bytes; lookups walk clockwise
//! and wrap past the end of the ring to the lowest position. Rebuilds are
//! atomic: the new ring replaces the old one in a single swap, and feeding
//! the same node set twice yields an identical ring.

use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

/// Virtual nodes per provider unless configured otherwise.
pub const DEFAULT_VIRTUAL_NODES: usize = 150;

pub struct HashRing {
    virtual_nodes: usize,
    positions: BTreeMap<u64, String>,
    nodes: Vec<String>,
}

impl HashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            positions: BTreeMap::new(),
            nodes: Vec::new(),
        }
    }

    /// Rebuild the ring for a node set. A no-op when the (deduplicated,
    /// sorted) set is unchanged.
    pub fn update_nodes(&mut self, nodes: &[String]) {
        let mut sorted = nodes.to_vec();
        sorted.sort();
        sorted.dedup();
        if sorted == self.nodes {
            return;
        }

        let mut positions = BTreeMap::new();
        for node in &sorted {
            for index in 0..self.virtual_nodes {
                positions.insert(hash_key(&format!("{node}#{index}")), node.clone());
            }
        }
        self.positions = positions;
        self.nodes = sorted;
    }

    /// Clockwise-next-node lookup; wraps to the lowest position past the
    /// end of the ring.
    pub fn lookup(&self, key: &str) -> Option<&str> {
        if self.positions.is_empty() {
            return None;
        }
        let point = hash_key(key);
        self.positions
            .range(point..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, node)| node.as_str())
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

fn hash_key(input: &str) -> u64 {
    let digest = Sha1::digest(input.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("sha1 digest is 20 bytes"))
}
