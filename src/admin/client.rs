//! HTTP transport for admin messages.

use super::protocol::{AdminMessage, AdminReply, ENDPOINT_ADMIN, ENDPOINT_FAILURE};
use crate::ring::NodeAddr;

use anyhow::Result;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_ADMIN_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_ADMIN_ATTEMPTS: usize = 2;

/// Sends admin messages with a bounded round-trip timeout. A timeout and a
/// refused connection look the same to the caller: an `Err`.
#[derive(Clone)]
pub struct AdminClient {
    http_client: reqwest::Client,
    timeout: Duration,
    attempts: usize,
}

impl AdminClient {
    pub fn new(timeout: Duration, attempts: usize) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            timeout,
            attempts: attempts.max(1),
        }
    }

    /// Sends one admin message and returns the node's reply.
    pub async fn send(&self, node: &NodeAddr, msg: &AdminMessage) -> Result<AdminReply> {
        tracing::debug!("-> {} {}", node, msg.name());
        let reply = self
            .post_with_retry(node.http_url(ENDPOINT_ADMIN), msg)
            .await?;
        tracing::debug!("<- {} {:?}", node, reply);
        Ok(reply)
    }

    /// Sends one admin message and turns anything but a success reply into an error.
    pub async fn execute(&self, node: &NodeAddr, msg: &AdminMessage) -> Result<()> {
        match self.send(node, msg).await? {
            reply if reply.is_success() => Ok(()),
            AdminReply::OperationFailed { reason } | AdminReply::GeneralError { reason } => Err(
                anyhow::anyhow!("{} rejected {}: {}", node, msg.name(), reason),
            ),
            other => Err(anyhow::anyhow!(
                "{} sent unexpected reply to {}: {:?}",
                node,
                msg.name(),
                other
            )),
        }
    }

    /// Delivers a `SERVER_FAILURE` report to the orchestrator's failure listener.
    pub async fn report_failure(&self, ecs: SocketAddr, msg: &AdminMessage) -> Result<AdminReply> {
        self.post_with_retry(format!("http://{}{}", ecs, ENDPOINT_FAILURE), msg)
            .await
    }

    async fn post_with_retry(&self, url: String, payload: &AdminMessage) -> Result<AdminReply> {
        let mut delay_ms = 150u64;

        for attempt in 0..self.attempts {
            let response = self
                .http_client
                .post(url.clone())
                .json(payload)
                .timeout(self.timeout)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    if !resp.status().is_success() {
                        return Err(anyhow::anyhow!("{} answered {}", url, resp.status()));
                    }
                    return Ok(resp.json().await?);
                }
                Err(e) => {
                    if attempt + 1 == self.attempts {
                        return Err(anyhow::anyhow!(e));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(anyhow::anyhow!("Retry attempts exhausted"))
    }
}

impl Default for AdminClient {
    fn default() -> Self {
        Self::new(DEFAULT_ADMIN_TIMEOUT, DEFAULT_ADMIN_ATTEMPTS)
    }
}
