use super::types::{KeyRange, NodeAddr, NodeDescriptor};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Total copies of every key: the primary plus its replicas.
pub const REPLICATION_FACTOR: usize = 3;
/// Replicas per primary (and, symmetrically, coordinators per node).
pub const REPLICA_COUNT: usize = REPLICATION_FACTOR - 1;

/// Hashes a node address or a key onto the ring.
pub fn hash_position(value: &str) -> u64 {
    let digest = Sha256::digest(value.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// The partition map: all active nodes sorted by ring position, each carrying
/// the range it is primary for.
///
/// Never edited in place. Every topology change builds a fresh value with
/// [`PartitionMetadata::compute`] and ships it to the nodes as a unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionMetadata {
    nodes: Vec<NodeDescriptor>,
}

impl PartitionMetadata {
    pub fn empty() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Places `nodes` on the ring and assigns every node `(predecessor, self]`.
    ///
    /// Duplicate addresses are collapsed and input order does not matter.
    pub fn compute<I>(nodes: I) -> Self
    where
        I: IntoIterator<Item = NodeDescriptor>,
    {
        let mut placed: Vec<(u64, NodeDescriptor)> = nodes
            .into_iter()
            .map(|node| (node.addr.position(), node))
            .collect();
        placed.sort_by(|(pa, a), (pb, b)| pa.cmp(pb).then_with(|| a.addr.cmp(&b.addr)));
        placed.dedup_by(|(_, a), (_, b)| a.addr == b.addr);

        let count = placed.len();
        let positions: Vec<u64> = placed.iter().map(|(position, _)| *position).collect();

        let nodes = placed
            .into_iter()
            .enumerate()
            .map(|(idx, (position, mut node))| {
                let predecessor = positions[(idx + count - 1) % count];
                node.range = KeyRange::new(predecessor, position);
                node
            })
            .collect();

        Self { nodes }
    }

    pub fn nodes(&self) -> &[NodeDescriptor] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn addrs(&self) -> Vec<NodeAddr> {
        self.nodes.iter().map(|node| node.addr.clone()).collect()
    }

    pub fn contains(&self, addr: &NodeAddr) -> bool {
        self.index_of(addr).is_some()
    }

    pub fn get(&self, addr: &NodeAddr) -> Option<&NodeDescriptor> {
        self.nodes.iter().find(|node| &node.addr == addr)
    }

    pub fn index_of(&self, addr: &NodeAddr) -> Option<usize> {
        self.nodes.iter().position(|node| &node.addr == addr)
    }

    /// Rebuilds the map with `node` added.
    pub fn with(&self, node: NodeDescriptor) -> Self {
        Self::compute(self.nodes.iter().cloned().chain(std::iter::once(node)))
    }

    /// Rebuilds the map with `addr` left out.
    pub fn without(&self, addr: &NodeAddr) -> Self {
        Self::compute(
            self.nodes
                .iter()
                .filter(|node| &node.addr != addr)
                .cloned(),
        )
    }

    /// Primary for a ring position.
    pub fn responsible_for_position(&self, position: u64) -> Option<&NodeDescriptor> {
        self.nodes
            .iter()
            .find(|node| node.range.contains(position))
    }

    pub fn responsible_for(&self, key: &str) -> Option<&NodeDescriptor> {
        self.responsible_for_position(hash_position(key))
    }

    /// Up to `count` distinct nodes following `addr` clockwise, nearest first.
    pub fn successors(&self, addr: &NodeAddr, count: usize) -> Vec<&NodeDescriptor> {
        self.walk(addr, count, |idx, step, len| (idx + step) % len)
    }

    /// Up to `count` distinct nodes preceding `addr`, nearest first.
    pub fn predecessors(&self, addr: &NodeAddr, count: usize) -> Vec<&NodeDescriptor> {
        self.walk(addr, count, |idx, step, len| (idx + len - step) % len)
    }

    fn walk<F>(&self, addr: &NodeAddr, count: usize, step_fn: F) -> Vec<&NodeDescriptor>
    where
        F: Fn(usize, usize, usize) -> usize,
    {
        let Some(idx) = self.index_of(addr) else {
            return Vec::new();
        };
        let len = self.nodes.len();
        (1..len)
            .take(count)
            .map(|step| &self.nodes[step_fn(idx, step, len)])
            .collect()
    }

    /// Nodes whose primary data `addr` holds a replica of.
    pub fn coordinators_of(&self, addr: &NodeAddr) -> Vec<&NodeDescriptor> {
        self.predecessors(addr, REPLICA_COUNT)
    }

    /// Nodes holding a replica of `addr`'s primary data.
    pub fn replicas_of(&self, addr: &NodeAddr) -> Vec<&NodeDescriptor> {
        self.successors(addr, REPLICA_COUNT)
    }

    pub fn successor_of(&self, addr: &NodeAddr) -> Option<&NodeDescriptor> {
        self.successors(addr, 1).into_iter().next()
    }

    /// Whether `addr` may serve reads for `key` (primary or one of its replicas).
    pub fn serves_reads(&self, key: &str, addr: &NodeAddr) -> bool {
        let Some(primary) = self.responsible_for(key) else {
            return false;
        };
        &primary.addr == addr
            || self
                .replicas_of(&primary.addr)
                .iter()
                .any(|replica| &replica.addr == addr)
    }

    /// Ring segment `addr` stores: its own range plus its coordinators' ranges.
    pub fn stored_range(&self, addr: &NodeAddr) -> Option<KeyRange> {
        let node = self.get(addr)?;
        if self.nodes.len() <= REPLICATION_FACTOR {
            return Some(KeyRange::full(node.position()));
        }
        let farthest = self
            .predecessors(addr, REPLICATION_FACTOR)
            .last()
            .map(|pred| pred.position())?;
        Some(KeyRange::new(farthest, node.position()))
    }

    /// Data `addr` stored under `old` that it no longer has to keep under `new`.
    ///
    /// Both segments end at the node's own position, so the difference is the
    /// single leading piece `(old.start, new.start]` when the segment shrank.
    pub fn stale_range(old: &Self, new: &Self, addr: &NodeAddr) -> Option<KeyRange> {
        let before = old.stored_range(addr)?;
        let after = new.stored_range(addr)?;
        if after.span() >= before.span() {
            return None;
        }
        Some(KeyRange::new(before.start, after.start))
    }
}
