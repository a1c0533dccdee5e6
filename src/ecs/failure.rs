//! Listener for `SERVER_FAILURE` reports sent by storage nodes.

use super::service::ClusterOrchestrator;
use crate::admin::protocol::ENDPOINT_FAILURE;
use crate::admin::{AdminMessage, AdminReply};

use anyhow::Result;
use axum::{Extension, Json, Router, http::StatusCode, routing::post};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct FailureDetector {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl FailureDetector {
    /// Binds the listener. Binding before the nodes launch lets them be handed
    /// the real address, port 0 included.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves reports until the orchestrator shuts down.
    pub fn serve(self, orchestrator: Arc<ClusterOrchestrator>) -> JoinHandle<()> {
        let shutdown = CancellationToken::new();
        orchestrator.attach_failure_listener(shutdown.clone());

        let app = Router::new()
            .route(ENDPOINT_FAILURE, post(handle_report))
            .layer(Extension(orchestrator));

        tracing::info!("Failure detector listening on {}", self.local_addr);
        let listener = self.listener;
        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await;
            if let Err(e) = result {
                tracing::error!("Failure detector stopped with error: {}", e);
            }
        })
    }
}

/// Acknowledges at once; the repair runs in the background because it
/// outlives the reporter's request timeout.
async fn handle_report(
    Extension(orchestrator): Extension<Arc<ClusterOrchestrator>>,
    Json(msg): Json<AdminMessage>,
) -> (StatusCode, Json<AdminReply>) {
    let name = msg.name();
    let AdminMessage::ServerFailure { reporter, failed } = msg else {
        let reply = AdminReply::GeneralError {
            reason: format!("unexpected {} on the failure endpoint", name),
        };
        return (StatusCode::BAD_REQUEST, Json(reply));
    };

    tracing::warn!("{} reports {} as failed", reporter, failed.addr);
    tokio::spawn(async move {
        if let Err(e) = orchestrator.handle_failure(failed).await {
            tracing::error!("Failure handling did not complete: {}", e);
        }
    });

    (StatusCode::OK, Json(AdminReply::OperationSuccess))
}
