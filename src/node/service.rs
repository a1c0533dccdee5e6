use super::protocol::{
    ENDPOINT_TRANSFER, KeyValue, KvReply, TRANSFER_CHUNK, TransferRequest, TransferResponse,
};
use super::store::KvStore;
use crate::admin::{AdminMessage, AdminReply, CacheConfig, TransferKind};
use crate::replication::{GossipBatch, ReplicationHandler};
use crate::ring::{KeyRange, NodeAddr, PartitionMetadata};

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

const TRANSFER_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether the node accepts client traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingState {
    /// Launched, waiting for INIT.
    Idle,
    /// Initialized or stopped: admin traffic only.
    Stopped,
    Started,
    ShuttingDown,
}

#[derive(Debug)]
struct NodeState {
    serving: ServingState,
    write_locked: bool,
    metadata: PartitionMetadata,
    cache: Option<CacheConfig>,
}

pub struct StorageNode {
    addr: NodeAddr,
    state: RwLock<NodeState>,
    store: Arc<dyn KvStore>,
    replication: Arc<ReplicationHandler>,
    http_client: reqwest::Client,
    shutdown: CancellationToken,
}

impl StorageNode {
    pub fn new(
        addr: NodeAddr,
        store: Arc<dyn KvStore>,
        replication: Arc<ReplicationHandler>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            addr,
            state: RwLock::new(NodeState {
                serving: ServingState::Idle,
                write_locked: false,
                metadata: PartitionMetadata::empty(),
                cache: None,
            }),
            store,
            replication,
            http_client: reqwest::Client::new(),
            shutdown,
        })
    }

    pub fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn replication(&self) -> &Arc<ReplicationHandler> {
        &self.replication
    }

    pub async fn serving_state(&self) -> ServingState {
        self.state.read().await.serving
    }

    pub async fn is_write_locked(&self) -> bool {
        self.state.read().await.write_locked
    }

    pub async fn metadata(&self) -> PartitionMetadata {
        self.state.read().await.metadata.clone()
    }

    pub async fn cache_config(&self) -> Option<CacheConfig> {
        self.state.read().await.cache
    }

    // ============================================================
    // ADMIN
    // ============================================================

    pub async fn handle_admin(self: &Arc<Self>, msg: AdminMessage) -> AdminReply {
        tracing::debug!("{} <- {}", self.addr, msg.name());

        match msg {
            AdminMessage::Init { metadata, cache } => {
                {
                    let mut state = self.state.write().await;
                    state.metadata = metadata.clone();
                    state.cache = Some(cache);
                    if state.serving == ServingState::Idle {
                        state.serving = ServingState::Stopped;
                    }
                }
                self.replication.update_metadata(&metadata).await;
                info!(
                    "{} initialized: {} node(s), cache {} {}",
                    self.addr,
                    metadata.len(),
                    cache.size,
                    cache.policy
                );
                AdminReply::InitSuccess
            }
            AdminMessage::Start => self.set_serving(ServingState::Started).await,
            AdminMessage::Stop => self.set_serving(ServingState::Stopped).await,
            AdminMessage::ShutDown => {
                self.state.write().await.serving = ServingState::ShuttingDown;
                info!("{} shutting down", self.addr);
                self.replication.shutdown();
                self.shutdown.cancel();
                AdminReply::OperationSuccess
            }
            AdminMessage::LockWrite => {
                self.state.write().await.write_locked = true;
                tracing::debug!("{} write-locked", self.addr);
                AdminReply::OperationSuccess
            }
            AdminMessage::UnlockWrite => {
                self.state.write().await.write_locked = false;
                tracing::debug!("{} write-unlocked", self.addr);
                AdminReply::OperationSuccess
            }
            AdminMessage::UpdateMetadata { metadata } => {
                self.state.write().await.metadata = metadata.clone();
                self.replication.update_metadata(&metadata).await;
                AdminReply::OperationSuccess
            }
            AdminMessage::MoveData { range, target } => {
                self.run_transfer(TransferKind::Move, range, Some(target)).await
            }
            AdminMessage::ReplicateData { range, target } => {
                self.run_transfer(TransferKind::Replicate, range, Some(target))
                    .await
            }
            AdminMessage::RestoreData { range, target } => {
                self.run_transfer(TransferKind::Restore, range, Some(target))
                    .await
            }
            AdminMessage::RemoveData { range } => {
                self.run_transfer(TransferKind::Remove, range, None).await
            }
            AdminMessage::ServerFailure { .. } => AdminReply::GeneralError {
                reason: "SERVER_FAILURE is only accepted by the orchestrator".to_string(),
            },
        }
    }

    async fn set_serving(&self, serving: ServingState) -> AdminReply {
        let mut state = self.state.write().await;
        match state.serving {
            ServingState::Idle => AdminReply::failed("node has not been initialized"),
            ServingState::ShuttingDown => AdminReply::failed("node is shutting down"),
            _ => {
                state.serving = serving;
                info!("{} is now {:?}", self.addr, serving);
                AdminReply::OperationSuccess
            }
        }
    }

    async fn run_transfer(
        &self,
        kind: TransferKind,
        range: KeyRange,
        target: Option<NodeAddr>,
    ) -> AdminReply {
        match self.transfer(kind, range, target.as_ref()).await {
            Ok(count) => {
                info!("{} {} {} done ({} pairs)", self.addr, kind, range, count);
                AdminReply::OperationSuccess
            }
            Err(e) => {
                tracing::error!("{} {} {} failed: {}", self.addr, kind, range, e);
                AdminReply::failed(e)
            }
        }
    }

    /// Executes one migration step with this node as the source.
    pub async fn transfer(
        &self,
        kind: TransferKind,
        range: KeyRange,
        target: Option<&NodeAddr>,
    ) -> Result<usize> {
        if kind == TransferKind::Remove {
            return Ok(self.store.remove_range(&range));
        }

        let target = target.ok_or_else(|| anyhow::anyhow!("{} needs a target node", kind))?;
        if target == &self.addr {
            // Restoring onto the surviving holder itself: the copy is already here.
            return Ok(self.store.scan(&range).len());
        }

        let entries = self.store.scan(&range);
        let count = entries.len();
        self.send_entries(target, entries).await?;

        if kind == TransferKind::Move {
            self.store.remove_range(&range);
        }
        Ok(count)
    }

    async fn send_entries(&self, target: &NodeAddr, entries: Vec<(String, String)>) -> Result<()> {
        let url = target.http_url(ENDPOINT_TRANSFER);
        let chunks: Vec<Vec<KeyValue>> = entries
            .chunks(TRANSFER_CHUNK)
            .map(|chunk| {
                chunk
                    .iter()
                    .map(|(key, value)| KeyValue {
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .collect()
            })
            .collect();

        // An empty range still makes one round trip so an unreachable target is noticed.
        let requests = if chunks.is_empty() {
            vec![Vec::new()]
        } else {
            chunks
        };

        for entries in requests {
            let response = self
                .http_client
                .post(url.clone())
                .json(&TransferRequest { entries })
                .timeout(TRANSFER_TIMEOUT)
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(anyhow::anyhow!("Transfer to {} failed: {}", target, response.status()));
            }
            let ack: TransferResponse = response.json().await?;
            if !ack.success {
                return Err(anyhow::anyhow!("Transfer to {} rejected", target));
            }
        }

        Ok(())
    }

    // ============================================================
    // PEERS
    // ============================================================

    /// Upserts a bulk transfer from a peer. Not subject to the write lock.
    pub fn apply_transfer(&self, entries: Vec<KeyValue>) -> usize {
        let count = entries.len();
        for entry in entries {
            self.store.put(&entry.key, entry.value);
        }
        count
    }

    /// Applies a gossip batch from a coordinator if it is new.
    pub async fn apply_gossip(&self, batch: GossipBatch) -> bool {
        if !self.replication.accept_batch(&batch).await {
            return false;
        }
        for entry in batch.entries {
            match entry.value {
                Some(value) => {
                    self.store.put(&entry.key, value);
                }
                None => {
                    self.store.remove(&entry.key);
                }
            }
        }
        tracing::debug!("{} applied gossip #{} from {}", self.addr, batch.serial, batch.from);
        true
    }

    // ============================================================
    // CLIENTS
    // ============================================================

    pub async fn get(&self, key: &str) -> KvReply {
        let state = self.state.read().await;
        if state.serving != ServingState::Started {
            return KvReply::ServerStopped;
        }
        if !state.metadata.serves_reads(key, &self.addr) {
            return KvReply::ServerNotResponsible {
                metadata: state.metadata.clone(),
            };
        }

        match self.store.get(key) {
            Some(value) => KvReply::GetSuccess {
                key: key.to_string(),
                value,
            },
            None => KvReply::GetError {
                key: key.to_string(),
            },
        }
    }

    /// Writes or deletes `key` as its primary and queues the change for gossip.
    pub async fn put(&self, key: &str, value: Option<String>) -> KvReply {
        // Held across the store write so LOCK_WRITE waits for in-flight writes.
        let state = self.state.read().await;
        if state.serving != ServingState::Started {
            return KvReply::ServerStopped;
        }
        let responsible = state
            .metadata
            .responsible_for(key)
            .is_some_and(|node| node.addr == self.addr);
        if !responsible {
            return KvReply::ServerNotResponsible {
                metadata: state.metadata.clone(),
            };
        }
        if state.write_locked {
            return KvReply::ServerWriteLock;
        }

        let key_owned = key.to_string();
        let reply = match &value {
            Some(value) => match self.store.put(key, value.clone()) {
                Some(_) => KvReply::PutUpdate { key: key_owned },
                None => KvReply::PutSuccess { key: key_owned },
            },
            None => match self.store.remove(key) {
                Some(_) => KvReply::DeleteSuccess { key: key_owned },
                None => {
                    return KvReply::DeleteError {
                        key: key.to_string(),
                    };
                }
            },
        };

        self.replication.record(key.to_string(), value);
        reply
    }
}
