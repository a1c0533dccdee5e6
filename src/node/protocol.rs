//! Storage Node Network Protocol
//!
//! Client and peer-to-peer DTOs. Admin messages are defined in
//! [`crate::admin::protocol`], gossip batches in [`crate::replication::types`].

use crate::ring::PartitionMetadata;
use serde::{Deserialize, Serialize};

// --- API Endpoints ---

/// Client reads.
pub const ENDPOINT_GET: &str = "/kv/get";
/// Client writes and deletes.
pub const ENDPOINT_PUT: &str = "/kv/put";
/// Bulk range data pushed by a peer during a migration.
pub const ENDPOINT_TRANSFER: &str = "/internal/transfer";

/// Pairs per bulk-transfer request.
pub const TRANSFER_CHUNK: usize = 512;

// --- Data Transfer Objects ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    pub key: String,
}

/// A write; `value: None` deletes the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: String,
    pub value: Option<String>,
}

/// Outcome of a client request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KvReply {
    GetSuccess { key: String, value: String },
    GetError { key: String },
    PutSuccess { key: String },
    PutUpdate { key: String },
    PutError { key: String, reason: String },
    DeleteSuccess { key: String },
    DeleteError { key: String },
    ServerStopped,
    ServerWriteLock,
    /// The key belongs elsewhere; carries the map the client should route by.
    ServerNotResponsible { metadata: PartitionMetadata },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub entries: Vec<KeyValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResponse {
    pub success: bool,
    pub applied: usize,
}
