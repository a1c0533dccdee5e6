//! Wires a [`StorageNode`] to its HTTP listener and heartbeat socket.

use super::handlers::{handle_admin, handle_get, handle_gossip, handle_put, handle_transfer};
use super::protocol::{ENDPOINT_GET, ENDPOINT_PUT, ENDPOINT_TRANSFER};
use super::service::StorageNode;
use super::store::{KvStore, MemoryStore};
use crate::admin::protocol::ENDPOINT_ADMIN;
use crate::replication::{ReplicationConfig, ReplicationHandler, types::ENDPOINT_GOSSIP};
use crate::ring::NodeAddr;

use anyhow::Result;
use axum::{Extension, Router, routing::post};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Printed on stdout once a node accepts connections; launchers wait for it.
pub const READY_MARKER: &str = "RINGKV_NODE_READY";

pub struct RunningNode {
    pub node: Arc<StorageNode>,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

impl RunningNode {
    pub fn addr(&self) -> &NodeAddr {
        self.node.addr()
    }

    /// Stops the listener and all background tasks, as if the process died.
    pub fn kill(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once the HTTP listener has shut down.
    pub async fn wait(self) {
        if let Err(e) = self.server.await {
            tracing::error!("Node server task failed: {}", e);
        }
    }
}

pub fn router(node: Arc<StorageNode>) -> Router {
    Router::new()
        .route(ENDPOINT_ADMIN, post(handle_admin))
        .route(ENDPOINT_GET, post(handle_get))
        .route(ENDPOINT_PUT, post(handle_put))
        .route(ENDPOINT_TRANSFER, post(handle_transfer))
        .route(ENDPOINT_GOSSIP, post(handle_gossip))
        .layer(Extension(node))
}

/// Binds `addr` (TCP for HTTP, UDP for heartbeats) and serves until killed or
/// told to SHUT_DOWN.
pub async fn spawn_node(addr: NodeAddr, config: ReplicationConfig) -> Result<RunningNode> {
    spawn_node_with_store(addr, config, Arc::new(MemoryStore::new())).await
}

pub async fn spawn_node_with_store(
    addr: NodeAddr,
    config: ReplicationConfig,
    store: Arc<dyn KvStore>,
) -> Result<RunningNode> {
    let shutdown = CancellationToken::new();
    let listener = tokio::net::TcpListener::bind((addr.host.as_str(), addr.port)).await?;
    let replication =
        ReplicationHandler::bind(addr.clone(), config, shutdown.child_token()).await?;
    let node = StorageNode::new(addr.clone(), store, replication.clone(), shutdown.clone());

    let app = router(node.clone());
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await;
        if let Err(e) = result {
            tracing::error!("HTTP server stopped with error: {}", e);
        }
    });

    replication.start();
    tracing::info!("Storage node listening on {}", addr);

    Ok(RunningNode {
        node,
        shutdown,
        server,
    })
}
