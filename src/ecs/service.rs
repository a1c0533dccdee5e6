use super::config::{EcsConfig, NodePool, PoolEntry};
use super::error::{EcsError, EcsResult};
use super::launcher::NodeLauncher;
use super::migration::{MigrationProtocol, TransferOperation, WriteLocks};
use crate::admin::{AdminClient, AdminMessage, CacheConfig, TransferKind};
use crate::ring::{KeyRange, NodeAddr, NodeDescriptor, PartitionMetadata};

use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, PoisonError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cluster lifecycle. `ShutDown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcsState {
    Uninitialized,
    Initialized,
    Started,
    Stopped,
    ShutDown,
}

#[derive(Debug, Clone)]
pub struct ClusterStatus {
    pub state: EcsState,
    pub metadata: PartitionMetadata,
    pub cache: Option<CacheConfig>,
    /// Every launched node, including ones a failed init left behind.
    pub tracked: Vec<NodeAddr>,
}

struct Topology {
    state: EcsState,
    launched: BTreeMap<NodeAddr, PoolEntry>,
    /// The active set. Replaced wholesale, never patched.
    metadata: PartitionMetadata,
    cache: Option<CacheConfig>,
    /// Reported dead; never picked again.
    failed: HashSet<NodeAddr>,
}

/// How far a join got, for rollback.
#[derive(Default)]
struct JoinProgress {
    moved: Option<(NodeAddr, KeyRange)>,
    published: bool,
}

pub struct ClusterOrchestrator {
    config: EcsConfig,
    pool: NodePool,
    launcher: Arc<dyn NodeLauncher>,
    admin: AdminClient,
    migration: MigrationProtocol,
    /// Topology lock: one add/remove/repair at a time.
    topology: Mutex<Topology>,
    failure_listener: std::sync::Mutex<Option<CancellationToken>>,
}

impl ClusterOrchestrator {
    pub fn new(config: EcsConfig, pool: NodePool, launcher: Arc<dyn NodeLauncher>) -> Arc<Self> {
        let admin = AdminClient::new(config.admin_timeout, config.admin_attempts);

        Arc::new(Self {
            config,
            pool,
            launcher,
            migration: MigrationProtocol::new(admin.clone()),
            admin,
            topology: Mutex::new(Topology {
                state: EcsState::Uninitialized,
                launched: BTreeMap::new(),
                metadata: PartitionMetadata::empty(),
                cache: None,
                failed: HashSet::new(),
            }),
            failure_listener: std::sync::Mutex::new(None),
        })
    }

    /// Registers the failure listener so `shutdown` can stop it.
    pub fn attach_failure_listener(&self, token: CancellationToken) {
        let previous = self
            .failure_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    pub fn config(&self) -> &EcsConfig {
        &self.config
    }

    pub async fn status(&self) -> ClusterStatus {
        let topo = self.topology.lock().await;
        ClusterStatus {
            state: topo.state,
            metadata: topo.metadata.clone(),
            cache: topo.cache,
            tracked: topo.launched.keys().cloned().collect(),
        }
    }

    pub async fn state(&self) -> EcsState {
        self.topology.lock().await.state
    }

    pub async fn metadata(&self) -> PartitionMetadata {
        self.topology.lock().await.metadata.clone()
    }

    // ============================================================
    // LIFECYCLE
    // ============================================================

    /// Launches `count` pool nodes, sends them INIT and sets up replication.
    ///
    /// Nodes launched by an earlier failed attempt stay tracked and are reused.
    pub async fn init_service(&self, count: usize, cache: CacheConfig) -> EcsResult<()> {
        let mut topo = self.topology.lock().await;
        require(&topo, "init", &[EcsState::Uninitialized])?;
        if count == 0 || count > self.pool.len() {
            return Err(EcsError::PoolTooSmall {
                requested: count,
                available: self.pool.len(),
            });
        }

        let missing = count.saturating_sub(topo.launched.len());
        let mut candidates = self.free_entries(&topo);
        candidates.shuffle(&mut rand::thread_rng());

        for entry in candidates.into_iter().take(missing) {
            match self.launch(&entry).await {
                Ok(()) => {
                    topo.launched.insert(entry.addr.clone(), entry);
                }
                Err(e) => tracing::error!("{}", e),
            }
        }

        if topo.launched.len() < count {
            return Err(EcsError::NotEnoughNodes {
                requested: count,
                launched: topo.launched.len(),
            });
        }

        let metadata = PartitionMetadata::compute(
            topo.launched
                .values()
                .take(count)
                .map(PoolEntry::descriptor),
        );
        let init = AdminMessage::Init {
            metadata: metadata.clone(),
            cache,
        };
        for addr in metadata.addrs() {
            self.admin
                .execute(&addr, &init)
                .await
                .map_err(|e| admin_error("INIT", &addr, e))?;
        }

        let mut locks = WriteLocks::new();
        let replicated = self.replicate_primaries(&metadata, &mut locks).await;
        self.migration.release(locks).await;
        replicated?;

        topo.metadata = metadata;
        topo.cache = Some(cache);
        topo.state = EcsState::Initialized;
        info!(
            "Cluster initialized with {} node(s), cache {} {}",
            topo.metadata.len(),
            cache.size,
            cache.policy
        );
        Ok(())
    }

    pub async fn start(&self) -> EcsResult<()> {
        let mut topo = self.topology.lock().await;
        require(
            &topo,
            "start",
            &[EcsState::Initialized, EcsState::Started, EcsState::Stopped],
        )?;
        let result = self.broadcast(&topo.metadata, &AdminMessage::Start).await;
        topo.state = EcsState::Started;
        info!("Cluster started");
        result
    }

    pub async fn stop(&self) -> EcsResult<()> {
        let mut topo = self.topology.lock().await;
        require(
            &topo,
            "stop",
            &[EcsState::Initialized, EcsState::Started, EcsState::Stopped],
        )?;
        let result = self.broadcast(&topo.metadata, &AdminMessage::Stop).await;
        topo.state = EcsState::Stopped;
        info!("Cluster stopped");
        result
    }

    /// Shuts every tracked node down, forgets them and closes the failure listener.
    pub async fn shutdown(&self) -> EcsResult<()> {
        let mut topo = self.topology.lock().await;
        if topo.state == EcsState::ShutDown {
            return Err(EcsError::InvalidState {
                operation: "shutdown",
                state: topo.state,
            });
        }

        let targets: Vec<NodeAddr> = topo.launched.keys().cloned().collect();
        let mut failed = 0;
        for addr in &targets {
            if let Err(e) = self.admin.execute(addr, &AdminMessage::ShutDown).await {
                tracing::warn!("SHUT_DOWN to {} failed: {}", addr, e);
                failed += 1;
            }
        }

        topo.launched.clear();
        topo.metadata = PartitionMetadata::empty();
        topo.state = EcsState::ShutDown;

        let listener = self
            .failure_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = listener {
            token.cancel();
        }
        info!("Cluster shut down");

        if failed > 0 {
            return Err(EcsError::Broadcast {
                message: "SHUT_DOWN",
                failed,
                total: targets.len(),
            });
        }
        Ok(())
    }

    pub async fn lock_write(&self) -> EcsResult<()> {
        let topo = self.topology.lock().await;
        require(
            &topo,
            "lock_write",
            &[EcsState::Initialized, EcsState::Started, EcsState::Stopped],
        )?;
        self.broadcast(&topo.metadata, &AdminMessage::LockWrite).await
    }

    pub async fn unlock_write(&self) -> EcsResult<()> {
        let topo = self.topology.lock().await;
        require(
            &topo,
            "unlock_write",
            &[EcsState::Initialized, EcsState::Started, EcsState::Stopped],
        )?;
        self.broadcast(&topo.metadata, &AdminMessage::UnlockWrite)
            .await
    }

    // ============================================================
    // TOPOLOGY
    // ============================================================

    /// Launches one more pool node and hands it its slice of the ring.
    pub async fn add_node(&self, cache: CacheConfig) -> EcsResult<NodeAddr> {
        let mut topo = self.topology.lock().await;
        require(&topo, "add_node", &[EcsState::Started, EcsState::Stopped])?;
        self.add_node_locked(&mut topo, cache).await
    }

    /// Removes `target`, or a random active node when `None`.
    pub async fn remove_node(&self, target: Option<NodeAddr>) -> EcsResult<NodeAddr> {
        let mut topo = self.topology.lock().await;
        require(&topo, "remove_node", &[EcsState::Started, EcsState::Stopped])?;
        if topo.metadata.len() <= 1 {
            return Err(EcsError::LastNode);
        }

        let target = match target {
            Some(target) => target,
            None => topo
                .metadata
                .addrs()
                .choose(&mut rand::thread_rng())
                .cloned()
                .ok_or(EcsError::LastNode)?,
        };
        if !topo.metadata.contains(&target) {
            return Err(EcsError::UnknownNode(target));
        }

        self.remove_node_locked(&mut topo, &target).await?;
        Ok(target)
    }

    /// Repairs the cluster after `failed` died, then launches a replacement.
    ///
    /// Reports about nodes that are no longer active are ignored, so the same
    /// failure observed by several replicas is repaired once.
    pub async fn handle_failure(&self, failed: NodeDescriptor) -> EcsResult<()> {
        let mut topo = self.topology.lock().await;
        require(
            &topo,
            "handle_failure",
            &[EcsState::Initialized, EcsState::Started, EcsState::Stopped],
        )?;

        let addr = failed.addr;
        if !topo.metadata.contains(&addr) {
            tracing::debug!("Ignoring failure report for inactive node {}", addr);
            return Ok(());
        }
        tracing::warn!("Repairing cluster after failure of {}", addr);

        topo.failed.insert(addr.clone());
        topo.launched.remove(&addr);
        let old = topo.metadata.clone();

        if old.len() == 1 {
            topo.metadata = PartitionMetadata::empty();
            tracing::error!("{} was the only node; its data cannot be recovered", addr);
            return Err(EcsError::DataLoss(addr));
        }

        let range = old
            .get(&addr)
            .map(|node| node.range)
            .ok_or_else(|| EcsError::UnknownNode(addr.clone()))?;
        let holders: Vec<NodeAddr> = old
            .replicas_of(&addr)
            .iter()
            .map(|node| node.addr.clone())
            .collect();
        let primary = holders
            .first()
            .cloned()
            .ok_or_else(|| EcsError::DataLoss(addr.clone()))?;
        let new = old.without(&addr);
        let mut locks = WriteLocks::new();

        if !self.restore(&holders, &primary, range, &mut locks).await {
            tracing::error!("No replica could restore {} of {}", range, addr);
        }

        topo.metadata = new.clone();
        self.publish(&new).await;

        if old.len() < 4 {
            if new.len() == 2 {
                for node in new.nodes() {
                    for replica in new.replicas_of(&node.addr) {
                        let op = TransferOperation::new(
                            TransferKind::Replicate,
                            &node.addr,
                            &replica.addr,
                            node.range,
                        );
                        self.migration.transfer_best_effort(&op, &mut locks).await;
                    }
                }
            }
        } else {
            let failed_steps = self.rereplicate(&old, &new, &primary, &mut locks).await;
            if failed_steps > 0 {
                tracing::warn!("{} re-replication step(s) failed during repair", failed_steps);
            }
        }

        self.migration.release(locks).await;
        info!(
            "Repair after {} done; {} now primary for {}",
            addr, primary, range
        );

        let replacement = self
            .add_node_locked(&mut topo, self.config.default_cache)
            .await?;
        info!("Replacement {} launched for {}", replacement, addr);
        Ok(())
    }

    async fn add_node_locked(&self, topo: &mut Topology, cache: CacheConfig) -> EcsResult<NodeAddr> {
        let entry = self
            .free_entries(topo)
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(EcsError::NoFreeNode)?;
        let addr = entry.addr.clone();

        self.launch(&entry).await?;
        topo.launched.insert(addr.clone(), entry.clone());

        let old = topo.metadata.clone();
        let new = old.with(entry.descriptor());
        let init = AdminMessage::Init {
            metadata: new.clone(),
            cache,
        };
        if let Err(e) = self.admin.execute(&addr, &init).await {
            self.discard(topo, &addr).await;
            return Err(admin_error("INIT", &addr, e));
        }

        let start = topo.state == EcsState::Started;
        let mut locks = WriteLocks::new();
        let mut progress = JoinProgress::default();

        match self
            .integrate(&old, &new, &addr, start, &mut locks, &mut progress)
            .await
        {
            Ok(()) => {
                topo.metadata = new;
                self.migration.release(locks).await;
                info!(
                    "{} joined, cluster has {} node(s)",
                    addr,
                    topo.metadata.len()
                );
                Ok(addr)
            }
            Err(e) => {
                tracing::error!("Join of {} failed, rolling back: {}", addr, e);
                self.rollback_join(&old, &addr, &progress, &mut locks).await;
                self.migration.release(locks).await;
                self.discard(topo, &addr).await;
                Err(e)
            }
        }
    }

    /// Data and metadata steps of a join, in order.
    async fn integrate(
        &self,
        old: &PartitionMetadata,
        new: &PartitionMetadata,
        addr: &NodeAddr,
        start: bool,
        locks: &mut WriteLocks,
        progress: &mut JoinProgress,
    ) -> EcsResult<()> {
        let range = new
            .get(addr)
            .map(|node| node.range)
            .ok_or_else(|| EcsError::UnknownNode(addr.clone()))?;

        if let Some(donor) = new.successor_of(addr).map(|node| node.addr.clone()) {
            self.migration.lock(&donor, locks).await?;
            let op = TransferOperation::new(TransferKind::Move, &donor, addr, range);
            self.migration.transfer(&op, locks).await?;
            progress.moved = Some((donor, range));
        }

        for coordinator in new.coordinators_of(addr) {
            let op = TransferOperation::new(
                TransferKind::Replicate,
                &coordinator.addr,
                addr,
                coordinator.range,
            );
            self.migration.transfer(&op, locks).await?;
        }

        if start && let Err(e) = self.admin.execute(addr, &AdminMessage::Start).await {
            tracing::warn!("START to new node {} failed: {}", addr, e);
        }

        self.publish(new).await;
        progress.published = true;

        for replica in new.replicas_of(addr) {
            let op = TransferOperation::new(TransferKind::Replicate, addr, &replica.addr, range);
            self.migration.transfer(&op, locks).await?;
        }

        if new.len() >= 4 {
            for node in old.nodes() {
                if let Some(stale) = PartitionMetadata::stale_range(old, new, &node.addr) {
                    let op = TransferOperation::remove(&node.addr, stale);
                    self.migration.transfer_best_effort(&op, locks).await;
                }
            }
        }

        Ok(())
    }

    async fn rollback_join(
        &self,
        old: &PartitionMetadata,
        addr: &NodeAddr,
        progress: &JoinProgress,
        locks: &mut WriteLocks,
    ) {
        if let Some((donor, range)) = &progress.moved {
            let op = TransferOperation::new(TransferKind::Replicate, addr, donor, *range);
            self.migration.transfer_best_effort(&op, locks).await;
        }
        if progress.published {
            self.publish(old).await;
        }
    }

    async fn remove_node_locked(&self, topo: &mut Topology, target: &NodeAddr) -> EcsResult<()> {
        let old = topo.metadata.clone();
        let range = old
            .get(target)
            .map(|node| node.range)
            .ok_or_else(|| EcsError::UnknownNode(target.clone()))?;
        let successor = old
            .successor_of(target)
            .map(|node| node.addr.clone())
            .ok_or(EcsError::LastNode)?;
        let new = old.without(target);
        let mut locks = WriteLocks::new();

        let op = TransferOperation::new(TransferKind::Move, target, &successor, range);
        if let Err(e) = self.migration.transfer(&op, &mut locks).await {
            self.migration.release(locks).await;
            return Err(e);
        }

        self.publish(&new).await;
        topo.metadata = new.clone();

        let failed_steps = self.rereplicate(&old, &new, &successor, &mut locks).await;
        if failed_steps > 0 {
            tracing::warn!("{} re-replication step(s) failed removing {}", failed_steps, target);
        }
        self.migration.release(locks).await;

        if let Err(e) = self.admin.execute(target, &AdminMessage::ShutDown).await {
            tracing::warn!("SHUT_DOWN to removed node {} failed: {}", target, e);
        }
        topo.launched.remove(target);
        info!(
            "{} removed, {} took over {}; cluster has {} node(s)",
            target,
            successor,
            range,
            topo.metadata.len()
        );
        Ok(())
    }

    // ============================================================
    // MIGRATION HELPERS
    // ============================================================

    async fn replicate_primaries(
        &self,
        metadata: &PartitionMetadata,
        locks: &mut WriteLocks,
    ) -> EcsResult<()> {
        for node in metadata.nodes() {
            for replica in metadata.replicas_of(&node.addr) {
                let op = TransferOperation::new(
                    TransferKind::Replicate,
                    &node.addr,
                    &replica.addr,
                    node.range,
                );
                self.migration.transfer(&op, locks).await?;
            }
        }
        Ok(())
    }

    /// Tries each surviving holder in turn until one restores `range` onto `primary`.
    ///
    /// `primary` is the failed node's successor. If it is dead too, every attempt
    /// fails and the range stays unrestored until the successor's own failure
    /// report, whose repair promotes the next replica, which also holds `range`.
    async fn restore(
        &self,
        holders: &[NodeAddr],
        primary: &NodeAddr,
        range: KeyRange,
        locks: &mut WriteLocks,
    ) -> bool {
        for holder in holders {
            let op = TransferOperation::new(TransferKind::Restore, holder, primary, range);
            match self.migration.transfer(&op, locks).await {
                Ok(()) => return true,
                Err(e) => tracing::warn!("{}; trying the next replica", e),
            }
        }
        false
    }

    /// Rebuilds replica copies after a node vacated the position in front of
    /// `primary`. Returns how many steps failed.
    ///
    /// `primary`'s range grew, so all its replicas receive it again; each of its
    /// coordinators sends its range to replicas it did not have under `old`.
    async fn rereplicate(
        &self,
        old: &PartitionMetadata,
        new: &PartitionMetadata,
        primary: &NodeAddr,
        locks: &mut WriteLocks,
    ) -> usize {
        let mut steps = Vec::new();

        if let Some(node) = new.get(primary) {
            for replica in new.replicas_of(primary) {
                steps.push(TransferOperation::new(
                    TransferKind::Replicate,
                    primary,
                    &replica.addr,
                    node.range,
                ));
            }
        }

        for coordinator in new.coordinators_of(primary) {
            let before: Vec<NodeAddr> = old
                .replicas_of(&coordinator.addr)
                .iter()
                .map(|node| node.addr.clone())
                .collect();
            for replica in new.replicas_of(&coordinator.addr) {
                if !before.contains(&replica.addr) {
                    steps.push(TransferOperation::new(
                        TransferKind::Replicate,
                        &coordinator.addr,
                        &replica.addr,
                        coordinator.range,
                    ));
                }
            }
        }

        let mut failed = 0;
        for op in &steps {
            if !self.migration.transfer_best_effort(op, locks).await {
                failed += 1;
            }
        }
        failed
    }

    /// Pushes `metadata` to every node in it. Returns the number of nodes missed.
    async fn publish(&self, metadata: &PartitionMetadata) -> usize {
        let msg = AdminMessage::UpdateMetadata {
            metadata: metadata.clone(),
        };
        let mut missed = 0;
        for addr in metadata.addrs() {
            if let Err(e) = self.admin.execute(&addr, &msg).await {
                tracing::warn!("UPDATE_METADATA to {} failed: {}", addr, e);
                missed += 1;
            }
        }
        missed
    }

    async fn broadcast(&self, metadata: &PartitionMetadata, msg: &AdminMessage) -> EcsResult<()> {
        let targets = metadata.addrs();
        let mut failed = 0;
        for addr in &targets {
            if let Err(e) = self.admin.execute(addr, msg).await {
                tracing::warn!("{} to {} failed: {}", msg.name(), addr, e);
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(EcsError::Broadcast {
                message: msg.name(),
                failed,
                total: targets.len(),
            });
        }
        Ok(())
    }

    async fn launch(&self, entry: &PoolEntry) -> EcsResult<()> {
        self.launcher
            .launch(
                &entry.addr,
                &self.config.node_command,
                &self.config.node_args(&entry.addr),
            )
            .await
            .map_err(|e| EcsError::Launch {
                addr: entry.addr.clone(),
                reason: e.to_string(),
            })
    }

    /// Untracks a node that never fully joined and asks it to exit.
    async fn discard(&self, topo: &mut Topology, addr: &NodeAddr) {
        topo.launched.remove(addr);
        if let Err(e) = self.admin.execute(addr, &AdminMessage::ShutDown).await {
            tracing::warn!("{} left running untracked: {}", addr, e);
        }
    }

    fn free_entries(&self, topo: &Topology) -> Vec<PoolEntry> {
        self.pool
            .entries()
            .iter()
            .filter(|entry| {
                !topo.launched.contains_key(&entry.addr) && !topo.failed.contains(&entry.addr)
            })
            .cloned()
            .collect()
    }
}

fn require(topo: &Topology, operation: &'static str, allowed: &[EcsState]) -> EcsResult<()> {
    if allowed.contains(&topo.state) {
        Ok(())
    } else {
        Err(EcsError::InvalidState {
            operation,
            state: topo.state,
        })
    }
}

fn admin_error(message: &'static str, addr: &NodeAddr, e: anyhow::Error) -> EcsError {
    EcsError::Admin {
        message,
        addr: addr.clone(),
        reason: e.to_string(),
    }
}
