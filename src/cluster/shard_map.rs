//! Consistent-hash shard map.
//!
//! The key space is carved into a fixed number of shards. Each physical
//! node contributes a fixed number of virtual nodes to the hash ring so
//! ownership moves smoothly when membership changes. The map itself is a
//! plain value: the replicated state machine owns the authoritative copy
//! and every mutation bumps `version`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::cluster::hash::{murmur3_32, murmur3_64};

/// Number of shards in the key space. Routing breaks if two nodes ever
/// disagree on this, so it is a compile-time constant rather than config.
pub const SHARD_COUNT: u32 = 256;

/// Virtual nodes each physical node places on the ring.
pub const VNODES_PER_NODE: u32 = 256;

/// Map a key to its shard id, always in `[0, SHARD_COUNT)`.
pub fn hash_key(key: &str) -> u32 {
    murmur3_32(key.as_bytes(), 0) % SHARD_COUNT
}

/// Ring position for one virtual node of `node_id`.
fn vnode_hash(node_id: &str, index: u32) -> u64 {
    let mut input = Vec::with_capacity(node_id.len() + 4);
    input.extend_from_slice(node_id.as_bytes());
    input.extend_from_slice(&index.to_be_bytes());
    murmur3_64(&input)
}

/// Shard ownership map plus the consistent-hash ring it is derived from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardMap {
    /// Shard id → owning node. Sparse: unassigned shards are absent.
    shards: HashMap<u32, String>,
    /// Shard id → replica nodes (owner excluded).
    replicas: HashMap<u32, Vec<String>>,
    /// Bumped on every structural change.
    version: u64,
    /// Ring position → node id.
    virtual_nodes: HashMap<u64, String>,
    /// Sorted ring positions, kept in lockstep with `virtual_nodes`.
    sorted_hashes: Vec<u64>,
}

impl ShardMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Place `VNODES_PER_NODE` virtual nodes for `node_id` on the ring.
    ///
    /// Adding a node that is already present refreshes its ring entries
    /// (a no-op structurally) but still bumps the version.
    pub fn add_node(&mut self, node_id: &str) {
        for i in 0..VNODES_PER_NODE {
            self.virtual_nodes
                .insert(vnode_hash(node_id, i), node_id.to_owned());
        }
        self.rebuild_sorted_hashes();
        self.version += 1;
    }

    /// Remove a node's virtual nodes and clear every shard it owned.
    pub fn remove_node(&mut self, node_id: &str) {
        for i in 0..VNODES_PER_NODE {
            self.virtual_nodes.remove(&vnode_hash(node_id, i));
        }
        self.shards.retain(|_, owner| owner != node_id);
        self.rebuild_sorted_hashes();
        self.version += 1;
    }

    fn rebuild_sorted_hashes(&mut self) {
        self.sorted_hashes = self.virtual_nodes.keys().copied().collect();
        self.sorted_hashes.sort_unstable();
    }

    /// Walk the ring clockwise from `hash` to the first virtual node.
    ///
    /// Deterministic for a given set of added nodes, independent of the
    /// order they were added in. Returns `None` on an empty ring.
    pub fn node_for_hash(&self, hash: u64) -> Option<&str> {
        if self.sorted_hashes.is_empty() {
            return None;
        }
        let idx = self.sorted_hashes.partition_point(|&h| h < hash);
        let chosen = self.sorted_hashes[idx % self.sorted_hashes.len()];
        self.virtual_nodes.get(&chosen).map(String::as_str)
    }

    /// Ring owner for a key (ignores explicit shard assignments).
    pub fn node_for_key(&self, key: &str) -> Option<&str> {
        self.node_for_hash(murmur3_64(key.as_bytes()))
    }

    /// Assigned owner of the shard a key hashes to, if any.
    pub fn shard_owner_for_key(&self, key: &str) -> Option<&str> {
        self.owner(hash_key(key))
    }

    /// Assigned owner of a shard, if any.
    pub fn owner(&self, shard_id: u32) -> Option<&str> {
        self.shards.get(&shard_id).map(String::as_str)
    }

    /// Replica set of a shard (empty when none were assigned).
    pub fn replicas(&self, shard_id: u32) -> &[String] {
        self.replicas.get(&shard_id).map_or(&[], Vec::as_slice)
    }

    /// Directly assign a shard to an owner, optionally with replicas.
    pub fn assign_shard(&mut self, shard_id: u32, owner: &str, replicas: &[String]) {
        self.shards.insert(shard_id, owner.to_owned());
        if !replicas.is_empty() {
            self.replicas.insert(shard_id, replicas.to_vec());
        }
        self.version += 1;
    }

    /// Snapshot of the shard → owner table.
    pub fn assignments(&self) -> &HashMap<u32, String> {
        &self.shards
    }

    /// Distinct physical nodes currently on the ring.
    pub fn ring_nodes(&self) -> Vec<&str> {
        let mut nodes: Vec<&str> = self.virtual_nodes.values().map(String::as_str).collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }

    pub fn ring_len(&self) -> usize {
        self.sorted_hashes.len()
    }
}
