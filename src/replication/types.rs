use crate::ring::{NodeAddr, NodeDescriptor};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
pub const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);

/// Gossip batches are delivered to the replica's HTTP listener.
pub const ENDPOINT_GOSSIP: &str = "/internal/gossip";

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub heartbeat_interval: Duration,
    /// A coordinator silent for longer than this is reported as failed.
    pub heartbeat_timeout: Duration,
    pub gossip_interval: Duration,
    /// Orchestrator failure listener. Without it failures are only logged.
    pub failure_report_addr: Option<SocketAddr>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            gossip_interval: GOSSIP_INTERVAL,
            failure_report_addr: None,
        }
    }
}

/// A peer whose primary data this node holds a replica of.
#[derive(Debug)]
pub struct Coordinator {
    pub descriptor: NodeDescriptor,
    pub last_heartbeat: Instant,
    /// Stops this coordinator's heartbeat sender and timeout watcher.
    pub cancel: CancellationToken,
}

/// A peer holding a replica of this node's primary data.
#[derive(Debug, Clone)]
pub struct Replica {
    pub descriptor: NodeDescriptor,
}

/// UDP heartbeat datagrams, bincode encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum HeartbeatMessage {
    Request { from: NodeAddr },
    Reply { from: NodeAddr },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GossipEntry {
    pub key: String,
    /// `None` propagates a delete.
    pub value: Option<String>,
}

/// One flushed journal, as sent to a replica.
///
/// `epoch` identifies the sending process; `serial` increases with every flush
/// of that process, so a replica can drop duplicates and out-of-date batches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GossipBatch {
    pub from: NodeAddr,
    pub epoch: String,
    pub serial: u64,
    pub entries: Vec<GossipEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GossipAck {
    pub applied: bool,
}
