use axum::{Json, extract::Extension, http::StatusCode};
use std::sync::Arc;

use super::protocol::{GetRequest, KvReply, PutRequest, TransferRequest, TransferResponse};
use super::service::StorageNode;
use crate::admin::{AdminMessage, AdminReply};
use crate::replication::{GossipAck, GossipBatch};

pub async fn handle_admin(
    Extension(node): Extension<Arc<StorageNode>>,
    Json(msg): Json<AdminMessage>,
) -> (StatusCode, Json<AdminReply>) {
    let reply = node.handle_admin(msg).await;
    (StatusCode::OK, Json(reply))
}

pub async fn handle_get(
    Extension(node): Extension<Arc<StorageNode>>,
    Json(req): Json<GetRequest>,
) -> (StatusCode, Json<KvReply>) {
    let reply = node.get(&req.key).await;
    (status_for(&reply), Json(reply))
}

pub async fn handle_put(
    Extension(node): Extension<Arc<StorageNode>>,
    Json(req): Json<PutRequest>,
) -> (StatusCode, Json<KvReply>) {
    if req.key.is_empty() {
        let reply = KvReply::PutError {
            key: req.key,
            reason: "empty key".to_string(),
        };
        return (StatusCode::BAD_REQUEST, Json(reply));
    }

    let reply = node.put(&req.key, req.value).await;
    (status_for(&reply), Json(reply))
}

pub async fn handle_transfer(
    Extension(node): Extension<Arc<StorageNode>>,
    Json(req): Json<TransferRequest>,
) -> (StatusCode, Json<TransferResponse>) {
    let applied = node.apply_transfer(req.entries);
    tracing::debug!("{} received {} transferred pairs", node.addr(), applied);
    (
        StatusCode::OK,
        Json(TransferResponse {
            success: true,
            applied,
        }),
    )
}

pub async fn handle_gossip(
    Extension(node): Extension<Arc<StorageNode>>,
    Json(batch): Json<GossipBatch>,
) -> (StatusCode, Json<GossipAck>) {
    let applied = node.apply_gossip(batch).await;
    (StatusCode::OK, Json(GossipAck { applied }))
}

fn status_for(reply: &KvReply) -> StatusCode {
    match reply {
        KvReply::GetError { .. } | KvReply::DeleteError { .. } => StatusCode::NOT_FOUND,
        KvReply::PutError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        KvReply::ServerStopped | KvReply::ServerWriteLock => StatusCode::SERVICE_UNAVAILABLE,
        KvReply::ServerNotResponsible { .. } => StatusCode::MISDIRECTED_REQUEST,
        _ => StatusCode::OK,
    }
}
