//! Storage Node
//!
//! The per-node side of the system: a key/value store fronted by an HTTP
//! listener that answers three audiences.
//!
//! - **Orchestrator**: admin messages (init, start/stop, write lock, metadata
//!   updates and the MOVE / REPLICATE / RESTORE / REMOVE transfers).
//! - **Clients**: GET/PUT, answered with `SERVER_NOT_RESPONSIBLE` plus fresh
//!   metadata when the key belongs elsewhere.
//! - **Peers**: bulk range transfers and gossip batches.
//!
//! Replica bookkeeping, heartbeats and gossip live in [`crate::replication`].

pub mod handlers;
pub mod protocol;
pub mod server;
pub mod service;
pub mod store;

pub use server::{RunningNode, spawn_node};
pub use service::{ServingState, StorageNode};
pub use store::{KvStore, MemoryStore};

#[cfg(test)]
mod tests;
