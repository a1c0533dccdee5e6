use super::journal::UpdateBatch;
use super::types::{
    Coordinator, ENDPOINT_GOSSIP, GossipBatch, HeartbeatMessage, Replica, ReplicationConfig,
};
use crate::admin::{AdminClient, AdminMessage};
use crate::ring::{NodeAddr, NodeDescriptor, PartitionMetadata};

use anyhow::Result;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

const GOSSIP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct PeerSet {
    coordinators: HashMap<NodeAddr, Coordinator>,
    replicas: HashMap<NodeAddr, Replica>,
}

pub struct ReplicationHandler {
    local: NodeAddr,
    config: ReplicationConfig,
    socket: Arc<UdpSocket>,
    peers: Mutex<PeerSet>,
    journal: UpdateBatch,
    /// Distinguishes this process's serials from those of an earlier process
    /// that ran on the same address.
    epoch: String,
    serial: AtomicU64,
    /// Last `(epoch, serial)` applied per coordinator.
    applied: DashMap<NodeAddr, (String, u64)>,
    admin: AdminClient,
    http_client: reqwest::Client,
    shutdown: CancellationToken,
}

impl ReplicationHandler {
    /// Binds the heartbeat socket on the node's own port. Nothing runs until
    /// [`ReplicationHandler::start`].
    pub async fn bind(
        local: NodeAddr,
        config: ReplicationConfig,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind((local.host.as_str(), local.port)).await?;

        Ok(Arc::new(Self {
            local,
            config,
            socket: Arc::new(socket),
            peers: Mutex::new(PeerSet::default()),
            journal: UpdateBatch::new(),
            epoch: uuid::Uuid::new_v4().to_string(),
            serial: AtomicU64::new(0),
            applied: DashMap::new(),
            admin: AdminClient::default(),
            http_client: reqwest::Client::new(),
            shutdown,
        }))
    }

    pub fn start(self: &Arc<Self>) {
        let _receive_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.receive_loop().await;
            })
        };

        let _gossip_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.gossip_loop().await;
            })
        };

        tracing::debug!("Replication tasks started for {}", self.local);
    }

    pub fn local_addr(&self) -> &NodeAddr {
        &self.local
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Re-derives coordinators and replicas from a freshly pushed map and
    /// restarts every heartbeat sender and timeout watcher.
    pub async fn update_metadata(self: &Arc<Self>, metadata: &PartitionMetadata) {
        let coordinators: Vec<NodeDescriptor> = metadata
            .coordinators_of(&self.local)
            .into_iter()
            .cloned()
            .collect();
        let replicas: HashMap<NodeAddr, Replica> = metadata
            .replicas_of(&self.local)
            .into_iter()
            .map(|descriptor| {
                (
                    descriptor.addr.clone(),
                    Replica {
                        descriptor: descriptor.clone(),
                    },
                )
            })
            .collect();

        let mut peers = self.peers.lock().await;
        // Coordinators that stay keep their clock; a refresh is not a heartbeat.
        let mut last_seen: HashMap<NodeAddr, Instant> = HashMap::new();
        for (addr, stale) in peers.coordinators.drain() {
            stale.cancel.cancel();
            last_seen.insert(addr, stale.last_heartbeat);
        }
        peers.replicas = replicas;

        for descriptor in coordinators {
            let addr = descriptor.addr.clone();
            let cancel = self.shutdown.child_token();
            peers.coordinators.insert(
                addr.clone(),
                Coordinator {
                    descriptor,
                    last_heartbeat: last_seen.get(&addr).copied().unwrap_or_else(Instant::now),
                    cancel: cancel.clone(),
                },
            );

            let sender = self.clone();
            let sender_addr = addr.clone();
            let sender_cancel = cancel.clone();
            tokio::spawn(async move {
                sender.heartbeat_loop(sender_addr, sender_cancel).await;
            });

            let watcher = self.clone();
            tokio::spawn(async move {
                watcher.timeout_watcher(addr, cancel).await;
            });
        }

        info!(
            "{}: coordinators {:?}, replicas {:?}",
            self.local,
            peers
                .coordinators
                .keys()
                .map(|addr| addr.to_string())
                .collect::<Vec<_>>(),
            peers
                .replicas
                .keys()
                .map(|addr| addr.to_string())
                .collect::<Vec<_>>(),
        );
    }

    pub async fn coordinators(&self) -> Vec<NodeAddr> {
        let mut addrs: Vec<NodeAddr> = self.peers.lock().await.coordinators.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    pub async fn replicas(&self) -> Vec<NodeAddr> {
        let mut addrs: Vec<NodeAddr> = self.peers.lock().await.replicas.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    /// Queues a successful primary write for the next gossip round.
    pub fn record(&self, key: String, value: Option<String>) {
        self.journal.record(key, value);
    }

    pub fn pending_updates(&self) -> usize {
        self.journal.len()
    }

    /// Sends everything pending to every current replica.
    ///
    /// The journal is emptied whether or not delivery succeeds; a replica that
    /// misses a round catches up on the next full resynchronization. Returns the
    /// number of replicas that acknowledged.
    pub async fn flush(&self) -> usize {
        let entries = self.journal.take();
        if entries.is_empty() {
            return 0;
        }

        let replicas: Vec<NodeAddr> = self.peers.lock().await.replicas.keys().cloned().collect();
        let batch = GossipBatch {
            from: self.local.clone(),
            epoch: self.epoch.clone(),
            serial: self.serial.fetch_add(1, Ordering::SeqCst) + 1,
            entries,
        };

        let mut delivered = 0;
        for replica in replicas {
            let response = self
                .http_client
                .post(replica.http_url(ENDPOINT_GOSSIP))
                .json(&batch)
                .timeout(GOSSIP_TIMEOUT)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => delivered += 1,
                Ok(resp) => {
                    tracing::warn!("Gossip #{} to {} answered {}", batch.serial, replica, resp.status());
                }
                Err(e) => {
                    tracing::warn!("Gossip #{} to {} failed: {}", batch.serial, replica, e);
                }
            }
        }

        tracing::debug!(
            "Gossip #{}: {} updates delivered to {} replica(s)",
            batch.serial,
            batch.entries.len(),
            delivered
        );
        delivered
    }

    /// Decides whether an incoming batch should be applied.
    ///
    /// Only batches from a current coordinator are taken, and only when their
    /// serial is newer than the last one applied for the sender's epoch.
    pub async fn accept_batch(&self, batch: &GossipBatch) -> bool {
        if !self.peers.lock().await.coordinators.contains_key(&batch.from) {
            tracing::debug!("Ignoring gossip from non-coordinator {}", batch.from);
            return false;
        }

        let mut entry = self
            .applied
            .entry(batch.from.clone())
            .or_insert_with(|| (batch.epoch.clone(), 0));
        let (epoch, last) = entry.value_mut();

        if *epoch != batch.epoch {
            *epoch = batch.epoch.clone();
            *last = batch.serial;
            return true;
        }
        if batch.serial <= *last {
            tracing::debug!(
                "Dropping gossip #{} from {} (already at #{})",
                batch.serial,
                batch.from,
                last
            );
            return false;
        }
        *last = batch.serial;
        true
    }

    async fn heartbeat_loop(self: Arc<Self>, coordinator: NodeAddr, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        let msg = HeartbeatMessage::Request {
            from: self.local.clone(),
        };
        let encoded = match bincode::serialize(&msg) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Failed to serialize heartbeat request: {}", e);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Err(e) = self
                .socket
                .send_to(&encoded, (coordinator.host.as_str(), coordinator.port))
                .await
            {
                tracing::debug!("Failed to send heartbeat to {}: {}", coordinator, e);
            }
        }
    }

    async fn timeout_watcher(self: Arc<Self>, coordinator: NodeAddr, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let expired = {
                let mut peers = self.peers.lock().await;
                // A metadata refresh may have replaced this coordinator while we waited.
                if cancel.is_cancelled() {
                    break;
                }
                let Some(entry) = peers.coordinators.get(&coordinator) else {
                    break;
                };
                let elapsed = entry.last_heartbeat.elapsed();
                if elapsed > self.config.heartbeat_timeout {
                    tracing::warn!(
                        "{}: coordinator {} silent for {:?}",
                        self.local,
                        coordinator,
                        elapsed
                    );
                    peers.coordinators.remove(&coordinator).map(|dead| {
                        dead.cancel.cancel();
                        dead.descriptor
                    })
                } else {
                    None
                }
            };

            if let Some(descriptor) = expired {
                self.report_failure(descriptor).await;
                break;
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 1024];

        loop {
            let (len, src) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::error!("Failed to receive UDP packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            match bincode::deserialize::<HeartbeatMessage>(&buf[..len]) {
                Ok(HeartbeatMessage::Request { from }) => {
                    tracing::trace!("Heartbeat request from {}", from);
                    let reply = HeartbeatMessage::Reply {
                        from: self.local.clone(),
                    };
                    match bincode::serialize(&reply) {
                        Ok(encoded) => {
                            if let Err(e) = self.socket.send_to(&encoded, src).await {
                                tracing::debug!("Failed to answer heartbeat from {}: {}", from, e);
                            }
                        }
                        Err(e) => tracing::error!("Failed to serialize heartbeat reply: {}", e),
                    }
                }
                Ok(HeartbeatMessage::Reply { from }) => {
                    if let Some(coordinator) = self.peers.lock().await.coordinators.get_mut(&from) {
                        coordinator.last_heartbeat = Instant::now();
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to deserialize heartbeat from {}: {}", src, e);
                }
            }
        }
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.gossip_interval);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.flush().await;
        }
    }

    async fn report_failure(&self, failed: NodeDescriptor) {
        let Some(ecs) = self.config.failure_report_addr else {
            tracing::warn!("{} presumed dead, no failure listener configured", failed.addr);
            return;
        };

        let msg = AdminMessage::ServerFailure {
            reporter: self.local.clone(),
            failed,
        };
        match self.admin.report_failure(ecs, &msg).await {
            Ok(reply) => info!("Failure report delivered to {}: {:?}", ecs, reply),
            Err(e) => tracing::error!("Failed to report failure to {}: {}", ecs, e),
        }
    }
}
