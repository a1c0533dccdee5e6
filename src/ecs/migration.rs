//! The transfer primitive the orchestrator sequences during topology changes.

use super::error::{EcsError, EcsResult};
use crate::admin::{AdminClient, AdminMessage, TransferKind};
use crate::ring::{KeyRange, NodeAddr};

use std::collections::BTreeSet;
use std::fmt;

/// One migration step. Exists only while it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOperation {
    pub kind: TransferKind,
    pub from: NodeAddr,
    /// Receiving node; unused for REMOVE.
    pub to: NodeAddr,
    pub range: KeyRange,
}

impl TransferOperation {
    pub fn new(kind: TransferKind, from: &NodeAddr, to: &NodeAddr, range: KeyRange) -> Self {
        Self {
            kind,
            from: from.clone(),
            to: to.clone(),
            range,
        }
    }

    pub fn remove(from: &NodeAddr, range: KeyRange) -> Self {
        Self::new(TransferKind::Remove, from, from, range)
    }
}

impl fmt::Display for TransferOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TransferKind::Remove => write!(f, "REMOVE {} on {}", self.range, self.from),
            kind => write!(f, "{} {} {} -> {}", kind, self.range, self.from, self.to),
        }
    }
}

/// Nodes write-locked during the current topology change.
///
/// There is no unlock-on-drop; [`MigrationProtocol::release`] must run on every
/// exit path of the operation that collected the locks.
#[derive(Debug, Default)]
pub struct WriteLocks {
    nodes: BTreeSet<NodeAddr>,
}

impl WriteLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, addr: &NodeAddr) -> bool {
        self.nodes.contains(addr)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Clone)]
pub struct MigrationProtocol {
    admin: AdminClient,
}

impl MigrationProtocol {
    pub fn new(admin: AdminClient) -> Self {
        Self { admin }
    }

    /// Write-locks `node` unless this operation already holds its lock.
    pub async fn lock(&self, node: &NodeAddr, locks: &mut WriteLocks) -> EcsResult<()> {
        if locks.contains(node) {
            return Ok(());
        }
        self.admin
            .execute(node, &AdminMessage::LockWrite)
            .await
            .map_err(|e| EcsError::Admin {
                message: "LOCK_WRITE",
                addr: node.clone(),
                reason: e.to_string(),
            })?;
        // Recorded only once the lock is known to be held.
        locks.nodes.insert(node.clone());
        Ok(())
    }

    /// Runs one step: lock the source for MOVE/REMOVE, send the transfer
    /// directive, wait for the source's verdict.
    pub async fn transfer(&self, op: &TransferOperation, locks: &mut WriteLocks) -> EcsResult<()> {
        if op.kind.locks_source() {
            self.lock(&op.from, locks).await.map_err(|e| EcsError::Transfer {
                kind: op.kind,
                from: op.from.clone(),
                reason: e.to_string(),
            })?;
        }

        tracing::info!("Migration: {}", op);
        let msg = AdminMessage::transfer(op.kind, op.range, op.to.clone());
        self.admin
            .execute(&op.from, &msg)
            .await
            .map_err(|e| EcsError::Transfer {
                kind: op.kind,
                from: op.from.clone(),
                reason: e.to_string(),
            })
    }

    /// Like [`MigrationProtocol::transfer`] but only logs a failure. For steps
    /// that leave at least one other copy of the data behind.
    pub async fn transfer_best_effort(&self, op: &TransferOperation, locks: &mut WriteLocks) -> bool {
        match self.transfer(op, locks).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Continuing after failed step ({}): {}", op, e);
                false
            }
        }
    }

    /// Unlocks every node in `locks`. Unreachable nodes are logged and skipped.
    pub async fn release(&self, locks: WriteLocks) {
        for node in locks.nodes {
            if let Err(e) = self.admin.execute(&node, &AdminMessage::UnlockWrite).await {
                tracing::warn!("Failed to unlock {}: {}", node, e);
            }
        }
    }
}
