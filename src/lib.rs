//! Partitioned, Replicated Key-Value Store
//!
//! This library crate holds the cluster-coordination and replication subsystem
//! of the store. The binary (`main.rs`) runs either a storage node or the
//! operator-facing configuration service on top of it.
//!
//! ## Architecture Modules
//!
//! - **`ring`**: Consistent hashing. Places nodes on a 64-bit ring and derives
//!   key ranges, coordinators and replicas from the partition map.
//! - **`admin`**: The admin protocol between the orchestrator and the nodes
//!   (JSON over HTTP) plus the client that sends it.
//! - **`node`**: A storage node: in-memory store, client GET/PUT handling,
//!   admin message handling and the bulk-transfer source/sink.
//! - **`replication`**: Per-node heartbeats (UDP), failure reporting and
//!   gossip of primary writes to the two replicas.
//! - **`ecs`**: The External Configuration Service. Launches nodes, sequences
//!   migrations on add/remove and repairs the ring after failures.
//! - **`client`**: A routing client that follows `SERVER_NOT_RESPONSIBLE`
//!   redirects.

pub mod admin;
pub mod client;
pub mod ecs;
pub mod node;
pub mod replication;
pub mod ring;

#[cfg(test)]
pub(crate) mod testkit;
