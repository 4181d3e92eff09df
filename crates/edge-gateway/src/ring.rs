//! Consistent-hash ring assigning devices to gateway nodes.
//!
//! Each node occupies `replicas` virtual positions on a 32-bit ring, at the
//! CRC-32C of `"{node}#{i}"`. A key belongs to the first position at or
//! after its own hash, wrapping to the start of the ring.
//!
//! Readers clone an `Arc` snapshot of the ring and search it without
//! holding the lock; membership changes build a new snapshot and swap it in.

use std::sync::Arc;

use edge_proto::NodeId;
use parking_lot::RwLock;
use tracing::info;

/// Default number of virtual positions per node.
pub const DEFAULT_REPLICAS: usize = 50;

#[derive(Debug, Default)]
struct RingState {
    /// Members in insertion order.
    members: Vec<NodeId>,
    /// `(hash, node)` sorted by hash, one entry per distinct hash.
    positions: Vec<(u32, NodeId)>,
}

impl RingState {
    fn build(members: Vec<NodeId>, replicas: usize) -> Self {
        let mut positions = Vec::with_capacity(members.len() * replicas);
        for node in &members {
            for i in 0..replicas {
                positions.push((position_hash(node, i), node.clone()));
            }
        }
        // Stable sort keeps insertion order among equal hashes, so dedup
        // leaves the position with the node that was added first.
        positions.sort_by_key(|(hash, _)| *hash);
        positions.dedup_by_key(|(hash, _)| *hash);
        Self { members, positions }
    }

    fn start_index(&self, key: &str) -> usize {
        let hash = key_hash(key);
        let idx = self.positions.partition_point(|(h, _)| *h < hash);
        if idx == self.positions.len() { 0 } else { idx }
    }
}

fn key_hash(key: &str) -> u32 {
    crc32c::crc32c(key.as_bytes())
}

fn position_hash(node: &NodeId, replica: usize) -> u32 {
    key_hash(&format!("{node}#{replica}"))
}

/// Consistent-hash ring of gateway nodes.
#[derive(Debug)]
pub struct NodeRing {
    replicas: usize,
    state: RwLock<Arc<RingState>>,
}

impl NodeRing {
    /// Create an empty ring with `replicas` virtual positions per node.
    #[must_use]
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
            state: RwLock::new(Arc::new(RingState::default())),
        }
    }

    /// Create a ring holding the given nodes.
    #[must_use]
    pub fn with_nodes<I, N>(replicas: usize, nodes: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeId>,
    {
        let ring = Self::new(replicas);
        for node in nodes {
            ring.add_node(node.into());
        }
        ring
    }

    /// Get the number of virtual positions per node.
    #[must_use]
    pub const fn replicas(&self) -> usize {
        self.replicas
    }

    fn snapshot(&self) -> Arc<RingState> {
        Arc::clone(&self.state.read())
    }

    /// Add a node. Returns `false` if it was already a member.
    pub fn add_node(&self, node: NodeId) -> bool {
        let mut state = self.state.write();
        if state.members.contains(&node) {
            return false;
        }
        let mut members = state.members.clone();
        members.push(node.clone());
        *state = Arc::new(RingState::build(members, self.replicas));
        drop(state);

        info!(node = %node, replicas = self.replicas, "Node added to ring");
        true
    }

    /// Remove a node. Returns `false` if it was not a member.
    pub fn remove_node(&self, node: &NodeId) -> bool {
        let mut state = self.state.write();
        if !state.members.contains(node) {
            return false;
        }
        let members = state
            .members
            .iter()
            .filter(|member| *member != node)
            .cloned()
            .collect();
        *state = Arc::new(RingState::build(members, self.replicas));
        drop(state);

        info!(node = %node, "Node removed from ring");
        true
    }

    /// Get the node owning `key`, or `None` if the ring is empty.
    #[must_use]
    pub fn node_for(&self, key: &str) -> Option<NodeId> {
        let state = self.snapshot();
        if state.positions.is_empty() {
            return None;
        }
        let idx = state.start_index(key);
        Some(state.positions[idx].1.clone())
    }

    /// Get up to `count` distinct nodes for `key`, walking clockwise from
    /// its owner. The first entry equals [`node_for`](Self::node_for).
    #[must_use]
    pub fn nodes_for(&self, key: &str, count: usize) -> Vec<NodeId> {
        let state = self.snapshot();
        let mut nodes: Vec<NodeId> = Vec::with_capacity(count.min(state.members.len()));
        if state.positions.is_empty() || count == 0 {
            return nodes;
        }

        let start = state.start_index(key);
        let len = state.positions.len();
        for step in 0..len {
            let node = &state.positions[(start + step) % len].1;
            if !nodes.contains(node) {
                nodes.push(node.clone());
                if nodes.len() == count || nodes.len() == state.members.len() {
                    break;
                }
            }
        }
        nodes
    }

    /// Get all members in insertion order.
    #[must_use]
    pub fn nodes(&self) -> Vec<NodeId> {
        self.snapshot().members.clone()
    }

    /// Check whether a node is a member.
    #[must_use]
    pub fn contains(&self, node: &NodeId) -> bool {
        self.snapshot().members.contains(node)
    }

    /// Get the number of member nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().members.len()
    }

    /// Check whether the ring has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot().members.is_empty()
    }
}

impl Default for NodeRing {
    fn default() -> Self {
        Self::new(DEFAULT_REPLICAS)
    }
}
