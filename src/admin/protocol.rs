//! Admin message definitions and endpoints.

use crate::ring::{KeyRange, NodeAddr, NodeDescriptor, PartitionMetadata};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Orchestrator -> node control messages.
pub const ENDPOINT_ADMIN: &str = "/admin";
/// Node -> orchestrator failure reports.
pub const ENDPOINT_FAILURE: &str = "/failure";

/// Cache eviction policy a node is configured with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum CachePolicy {
    Fifo,
    Lru,
    Lfu,
}

impl FromStr for CachePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FIFO" => Ok(Self::Fifo),
            "LRU" => Ok(Self::Lru),
            "LFU" => Ok(Self::Lfu),
            other => Err(anyhow::anyhow!("unknown cache policy '{}'", other)),
        }
    }
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Fifo => "FIFO",
            Self::Lru => "LRU",
            Self::Lfu => "LFU",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    pub size: usize,
    pub policy: CachePolicy,
}

/// The four migration primitives.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferKind {
    /// Copy the range to the target, then delete it from the source.
    Move,
    /// Upsert the range into the target, source untouched.
    Replicate,
    /// Re-populate the target from a surviving copy of a failed node's range.
    Restore,
    /// Delete the range from the source; no target.
    Remove,
}

impl TransferKind {
    /// Kinds that take data away from the source and so run under its write lock.
    pub fn locks_source(self) -> bool {
        matches!(self, Self::Move | Self::Remove)
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Move => "MOVE",
            Self::Replicate => "REPLICATE",
            Self::Restore => "RESTORE",
            Self::Remove => "REMOVE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdminMessage {
    Init {
        metadata: PartitionMetadata,
        cache: CacheConfig,
    },
    Start,
    Stop,
    ShutDown,
    LockWrite,
    UnlockWrite,
    MoveData {
        range: KeyRange,
        target: NodeAddr,
    },
    ReplicateData {
        range: KeyRange,
        target: NodeAddr,
    },
    RestoreData {
        range: KeyRange,
        target: NodeAddr,
    },
    RemoveData {
        range: KeyRange,
    },
    UpdateMetadata {
        metadata: PartitionMetadata,
    },
    /// Sent on the failure-report channel, never to a node.
    ServerFailure {
        reporter: NodeAddr,
        failed: NodeDescriptor,
    },
}

impl AdminMessage {
    /// Builds the transfer message for `kind`. `target` is ignored for REMOVE.
    pub fn transfer(kind: TransferKind, range: KeyRange, target: NodeAddr) -> Self {
        match kind {
            TransferKind::Move => Self::MoveData { range, target },
            TransferKind::Replicate => Self::ReplicateData { range, target },
            TransferKind::Restore => Self::RestoreData { range, target },
            TransferKind::Remove => Self::RemoveData { range },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Init { .. } => "INIT",
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::ShutDown => "SHUT_DOWN",
            Self::LockWrite => "LOCK_WRITE",
            Self::UnlockWrite => "UNLOCK_WRITE",
            Self::MoveData { .. } => "MOVE_DATA",
            Self::ReplicateData { .. } => "REPLICATE_DATA",
            Self::RestoreData { .. } => "RESTORE_DATA",
            Self::RemoveData { .. } => "REMOVE_DATA",
            Self::UpdateMetadata { .. } => "UPDATE_METADATA",
            Self::ServerFailure { .. } => "SERVER_FAILURE",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdminReply {
    InitSuccess,
    OperationSuccess,
    OperationFailed { reason: String },
    GeneralError { reason: String },
}

impl AdminReply {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::InitSuccess | Self::OperationSuccess)
    }

    pub fn failed(reason: impl fmt::Display) -> Self {
        Self::OperationFailed {
            reason: reason.to_string(),
        }
    }
}
