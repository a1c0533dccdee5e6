//! Hash Ring & Partition Metadata
//!
//! Places storage nodes on a 64-bit consistent-hash ring and derives the
//! partition map every other component routes by.
//!
//! ## Core Concepts
//! - **Position**: SHA-256 of `host:port` (or of a key), first 8 bytes big-endian.
//! - **Range**: each node owns `(predecessor, self]`; a single node owns the whole ring.
//! - **Replication**: primary + two ring-successors. A node's coordinators are its
//!   two ring-predecessors, its replicas are its two ring-successors.
//! - **Determinism**: the same node set always yields the same metadata, so every
//!   node derives the same coordinator/replica view independently.

pub mod metadata;
pub mod types;

pub use metadata::{PartitionMetadata, REPLICA_COUNT, REPLICATION_FACTOR, hash_position};
pub use types::{KeyRange, NodeAddr, NodeDescriptor};
