//! External Configuration Service (ECS)
//!
//! The cluster orchestrator. It owns the partition map, drives node lifecycle
//! and sequences every data migration that a topology change requires.
//!
//! ## Responsibilities
//! - **Lifecycle**: init / start / stop / shutdown of the whole cluster.
//! - **Topology**: add and remove nodes with lock -> transfer -> publish -> unlock
//!   ordering, rolling back a failed join.
//! - **Repair**: the [`failure::FailureDetector`] listener receives `SERVER_FAILURE`
//!   reports from nodes; the orchestrator restores the dead node's range from a
//!   surviving replica, re-replicates and launches a replacement.
//!
//! Topology operations are serialized by a single async mutex; per-node steps
//! inside one operation run sequentially.

pub mod config;
pub mod error;
pub mod failure;
pub mod launcher;
pub mod migration;
pub mod service;

pub use config::{EcsConfig, NodePool, PoolEntry};
pub use error::EcsError;
pub use failure::FailureDetector;
pub use launcher::{InProcessLauncher, LocalLauncher, NodeLauncher, SshLauncher};
pub use migration::{MigrationProtocol, TransferOperation, WriteLocks};
pub use service::{ClusterOrchestrator, ClusterStatus, EcsState};
