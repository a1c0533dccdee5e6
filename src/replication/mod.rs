//! Node-local Replication
//!
//! Every storage node runs one [`ReplicationHandler`]. It derives, from the
//! partition map the orchestrator pushes, which peers this node replicates
//! (its coordinators) and which peers replicate it (its replicas).
//!
//! ## Core Mechanisms
//! - **Heartbeats**: UDP request/reply with each coordinator on a fixed interval.
//!   A per-coordinator watcher reports the coordinator to the orchestrator's
//!   failure listener once no reply arrived within the heartbeat timeout.
//! - **Gossip**: primary writes accumulate in a deduplicating journal that a
//!   ticker flushes to every replica, tagged with a monotonically increasing serial.
//! - **Cancellation**: every background task watches a `CancellationToken` and
//!   exits on its next wake-up.

pub mod journal;
pub mod service;
pub mod types;

pub use journal::UpdateBatch;
pub use service::ReplicationHandler;
pub use types::{GossipAck, GossipBatch, GossipEntry, HeartbeatMessage, ReplicationConfig};

#[cfg(test)]
mod tests;
