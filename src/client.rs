//! Metadata-aware KV client.
//!
//! Starts from any known node and learns the partition map from
//! `SERVER_NOT_RESPONSIBLE` replies, retrying the request at the node the
//! fresh map names.

use crate::node::protocol::{ENDPOINT_GET, ENDPOINT_PUT, GetRequest, KvReply, PutRequest};
use crate::ring::{NodeAddr, PartitionMetadata};

use anyhow::Result;
use std::time::Duration;
use tokio::sync::RwLock;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_REDIRECTS: usize = 4;

pub struct KvClient {
    entry: NodeAddr,
    metadata: RwLock<Option<PartitionMetadata>>,
    http_client: reqwest::Client,
}

impl KvClient {
    pub fn new(entry: NodeAddr) -> Self {
        Self {
            entry,
            metadata: RwLock::new(None),
            http_client: reqwest::Client::new(),
        }
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<KvReply> {
        self.send_put(key, Some(value.to_string())).await
    }

    pub async fn delete(&self, key: &str) -> Result<KvReply> {
        self.send_put(key, None).await
    }

    pub async fn get(&self, key: &str) -> Result<KvReply> {
        let payload = GetRequest {
            key: key.to_string(),
        };
        self.route(key, ENDPOINT_GET, &payload).await
    }

    /// Map learned so far, if any redirect has happened.
    pub async fn metadata(&self) -> Option<PartitionMetadata> {
        self.metadata.read().await.clone()
    }

    async fn send_put(&self, key: &str, value: Option<String>) -> Result<KvReply> {
        let payload = PutRequest {
            key: key.to_string(),
            value,
        };
        self.route(key, ENDPOINT_PUT, &payload).await
    }

    async fn route<T: serde::Serialize>(&self, key: &str, endpoint: &str, payload: &T) -> Result<KvReply> {
        let mut target = self.target_for(key).await;

        for _ in 0..=MAX_REDIRECTS {
            let reply: KvReply = match self
                .http_client
                .post(target.http_url(endpoint))
                .json(payload)
                .timeout(CLIENT_TIMEOUT)
                .send()
                .await
            {
                Ok(response) => response.json().await?,
                Err(e) => {
                    // The cached owner may be gone; fall back to the entry node once.
                    if target != self.entry {
                        tracing::debug!("{} unreachable ({}), retrying via {}", target, e, self.entry);
                        *self.metadata.write().await = None;
                        target = self.entry.clone();
                        continue;
                    }
                    return Err(e.into());
                }
            };

            match reply {
                KvReply::ServerNotResponsible { metadata } => {
                    let next = metadata
                        .responsible_for(key)
                        .map(|node| node.addr.clone())
                        .ok_or_else(|| anyhow::anyhow!("empty metadata from {}", target))?;
                    *self.metadata.write().await = Some(metadata);
                    target = next;
                }
                other => return Ok(other),
            }
        }

        Err(anyhow::anyhow!("too many redirects for key '{}'", key))
    }

    async fn target_for(&self, key: &str) -> NodeAddr {
        self.metadata
            .read()
            .await
            .as_ref()
            .and_then(|metadata| metadata.responsible_for(key))
            .map(|node| node.addr.clone())
            .unwrap_or_else(|| self.entry.clone())
    }
}
