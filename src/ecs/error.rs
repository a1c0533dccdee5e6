use super::service::EcsState;
use crate::admin::TransferKind;
use crate::ring::NodeAddr;
use thiserror::Error;

pub type EcsResult<T> = Result<T, EcsError>;

/// Why an orchestrator operation did not go through.
///
/// Connection problems with a single node never escape as anything worse
/// than one of these.
#[derive(Debug, Error)]
pub enum EcsError {
    #[error("{operation} is not allowed while the cluster is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: EcsState,
    },

    #[error("requested {requested} node(s) but the pool only has {available}")]
    PoolTooSmall { requested: usize, available: usize },

    #[error("only {launched} of {requested} node(s) could be launched")]
    NotEnoughNodes { requested: usize, launched: usize },

    #[error("no unused node left in the pool")]
    NoFreeNode,

    #[error("refusing to remove the last active node, use shutdown instead")]
    LastNode,

    #[error("node {0} is not active")]
    UnknownNode(NodeAddr),

    #[error("failed to launch {addr}: {reason}")]
    Launch { addr: NodeAddr, reason: String },

    #[error("{message} to {addr} failed: {reason}")]
    Admin {
        message: &'static str,
        addr: NodeAddr,
        reason: String,
    },

    #[error("{kind} from {from} failed: {reason}")]
    Transfer {
        kind: TransferKind,
        from: NodeAddr,
        reason: String,
    },

    #[error("{message} failed on {failed} of {total} node(s)")]
    Broadcast {
        message: &'static str,
        failed: usize,
        total: usize,
    },

    #[error("node {0} failed without a surviving replica, its data is lost")]
    DataLoss(NodeAddr),
}
