//! Storage Node Tests
//!
//! ## Test Scopes
//! - **MemoryStore**: range scans and range removal by ring position.
//! - **Lifecycle**: IDLE -> STOPPED -> STARTED, write lock, shutdown.
//! - **Routing**: writes only at the primary, reads at primary or replicas.
//! - **Transfers**: MOVE / REPLICATE / REMOVE between two live nodes.
//! - **Gossip**: primary writes reach the replicas.

#[cfg(test)]
mod tests {
    use crate::admin::{AdminMessage, AdminReply, CacheConfig, CachePolicy, TransferKind};
    use crate::node::protocol::{ENDPOINT_PUT, KvReply, PutRequest};
    use crate::node::{KvStore, MemoryStore, RunningNode, ServingState, spawn_node};
    use crate::ring::{KeyRange, NodeAddr, NodeDescriptor, PartitionMetadata, hash_position};
    use crate::testkit::{eventually, free_port, quick_replication};

    use std::time::Duration;

    const CACHE: CacheConfig = CacheConfig {
        size: 10,
        policy: CachePolicy::Fifo,
    };

    fn ring_of(addrs: &[NodeAddr]) -> PartitionMetadata {
        PartitionMetadata::compute(
            addrs
                .iter()
                .map(|addr| NodeDescriptor::unplaced(format!("server{}", addr.port), addr.clone())),
        )
    }

    async fn launch() -> RunningNode {
        let addr = NodeAddr::new("127.0.0.1", free_port());
        spawn_node(addr, quick_replication()).await.unwrap()
    }

    async fn init(running: &RunningNode, metadata: &PartitionMetadata) {
        let reply = running
            .node
            .handle_admin(AdminMessage::Init {
                metadata: metadata.clone(),
                cache: CACHE,
            })
            .await;
        assert_eq!(reply, AdminReply::InitSuccess);
    }

    /// First generated key whose primary is `owner`.
    fn key_owned_by(metadata: &PartitionMetadata, owner: &NodeAddr) -> String {
        (0..)
            .map(|i| format!("key-{}", i))
            .find(|key| metadata.responsible_for(key).is_some_and(|n| &n.addr == owner))
            .unwrap()
    }

    // ============================================================
    // MEMORY STORE
    // ============================================================

    #[test]
    fn test_scan_and_remove_range() {
        let store = MemoryStore::new();
        for i in 0..200 {
            store.put(&format!("k{}", i), format!("v{}", i));
        }
        let mid = u64::MAX / 2;
        let lower = KeyRange::new(0, mid);
        let upper = KeyRange::new(mid, 0);

        let low = store.scan(&lower);
        let high = store.scan(&upper);
        assert_eq!(low.len() + high.len() + store.scan(&KeyRange::new(0, 0)).len(), 400);
        assert!(low.iter().all(|(key, _)| lower.contains(hash_position(key))));
        assert!(low.windows(2).all(|pair| pair[0].0 < pair[1].0), "scan is sorted");

        let removed = store.remove_range(&lower);
        assert_eq!(removed, low.len());
        assert_eq!(store.len(), high.len());
        assert!(store.scan(&lower).is_empty());

        // Idempotent.
        assert_eq!(store.remove_range(&lower), 0);
        assert_eq!(store.remove_range(&KeyRange::full(7)), high.len());
        assert!(store.is_empty());
    }

    #[test]
    fn test_remove_range_while_writes_land() {
        const WRITES: usize = 50_000;
        let store = MemoryStore::new();
        let everything = KeyRange::new(0, 0);
        let half = KeyRange::new(0, u64::MAX / 2);

        let removed = std::thread::scope(|scope| {
            let writer = scope.spawn(|| {
                for i in 0..WRITES {
                    store.put(&format!("incoming-{}", i), "v".to_string());
                }
            });

            let mut removed = 0;
            while !writer.is_finished() {
                removed += store.remove_range(&half);
                removed += store.remove_range(&everything);
            }
            writer.join().unwrap();
            removed
        });

        // Every key went in once, so each one is either counted as removed or still stored.
        assert_eq!(removed + store.len(), WRITES);
        assert_eq!(store.remove_range(&everything), WRITES - removed);
        assert!(store.is_empty());
    }

    #[test]
    fn test_put_returns_previous_value() {
        let store = MemoryStore::new();
        assert_eq!(store.put("a", "1".to_string()), None);
        assert_eq!(store.put("a", "2".to_string()), Some("1".to_string()));
        assert_eq!(store.get("a"), Some("2".to_string()));
        assert_eq!(store.remove("a"), Some("2".to_string()));
        assert_eq!(store.remove("a"), None);
    }

    // ============================================================
    // LIFECYCLE
    // ============================================================

    #[tokio::test]
    async fn test_node_lifecycle_and_write_lock() {
        let running = launch().await;
        let node = running.node.clone();
        let metadata = ring_of(&[node.addr().clone()]);

        assert_eq!(node.serving_state().await, ServingState::Idle);
        assert_eq!(node.put("a", Some("1".to_string())).await, KvReply::ServerStopped);
        assert!(!node.handle_admin(AdminMessage::Start).await.is_success());

        init(&running, &metadata).await;
        assert_eq!(node.serving_state().await, ServingState::Stopped);
        assert_eq!(node.cache_config().await, Some(CACHE));
        assert_eq!(node.get("a").await, KvReply::ServerStopped);

        assert!(node.handle_admin(AdminMessage::Start).await.is_success());
        let key = "a".to_string();
        assert_eq!(
            node.put("a", Some("1".to_string())).await,
            KvReply::PutSuccess { key: key.clone() }
        );
        assert_eq!(
            node.put("a", Some("2".to_string())).await,
            KvReply::PutUpdate { key: key.clone() }
        );
        assert_eq!(
            node.get("a").await,
            KvReply::GetSuccess {
                key: key.clone(),
                value: "2".to_string()
            }
        );

        assert!(node.handle_admin(AdminMessage::LockWrite).await.is_success());
        assert!(node.is_write_locked().await);
        assert_eq!(node.put("a", Some("3".to_string())).await, KvReply::ServerWriteLock);
        assert_eq!(node.put("a", None).await, KvReply::ServerWriteLock);
        // Reads continue under the lock.
        assert!(matches!(node.get("a").await, KvReply::GetSuccess { .. }));

        assert!(node.handle_admin(AdminMessage::UnlockWrite).await.is_success());
        assert_eq!(
            node.put("a", None).await,
            KvReply::DeleteSuccess { key: key.clone() }
        );
        assert_eq!(node.put("a", None).await, KvReply::DeleteError { key: key.clone() });
        assert_eq!(node.get("a").await, KvReply::GetError { key });

        assert!(node.handle_admin(AdminMessage::Stop).await.is_success());
        assert_eq!(node.get("a").await, KvReply::ServerStopped);

        assert!(node.handle_admin(AdminMessage::ShutDown).await.is_success());
        assert_eq!(node.serving_state().await, ServingState::ShuttingDown);
        assert!(running.is_stopped());
        tokio::time::timeout(Duration::from_secs(5), running.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failure_report_is_refused_by_nodes() {
        let running = launch().await;
        let reply = running
            .node
            .handle_admin(AdminMessage::ServerFailure {
                reporter: running.addr().clone(),
                failed: NodeDescriptor::unplaced("x", NodeAddr::new("127.0.0.1", 1)),
            })
            .await;
        assert!(matches!(reply, AdminReply::GeneralError { .. }));
        running.kill();
    }

    #[tokio::test]
    async fn test_empty_key_is_rejected_over_http() {
        let running = launch().await;
        init(&running, &ring_of(&[running.addr().clone()])).await;
        running.node.handle_admin(AdminMessage::Start).await;

        let response = reqwest::Client::new()
            .post(running.addr().http_url(ENDPOINT_PUT))
            .json(&PutRequest {
                key: String::new(),
                value: Some("v".to_string()),
            })
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let reply: KvReply = response.json().await.unwrap();
        assert!(matches!(reply, KvReply::PutError { .. }));

        running.kill();
    }

    // ============================================================
    // ROUTING
    // ============================================================

    #[tokio::test]
    async fn test_writes_only_at_primary_reads_at_replicas() {
        let running = launch().await;
        let me = running.addr().clone();
        let others: Vec<NodeAddr> = (0..4)
            .map(|i| NodeAddr::new("127.0.0.1", 1 + i))
            .collect();
        let mut all = others.clone();
        all.push(me.clone());
        let metadata = ring_of(&all);

        init(&running, &metadata).await;
        running.node.handle_admin(AdminMessage::Start).await;

        let coordinator = metadata.coordinators_of(&me)[0].addr.clone();
        let foreign_primary = others
            .iter()
            .find(|addr| {
                **addr != coordinator
                    && !metadata.coordinators_of(&me).iter().any(|c| &c.addr == *addr)
            })
            .unwrap();

        // A key whose primary is a coordinator of ours: readable, not writable.
        let replicated = key_owned_by(&metadata, &coordinator);
        assert!(matches!(
            running.node.put(&replicated, Some("v".to_string())).await,
            KvReply::ServerNotResponsible { .. }
        ));
        assert_eq!(
            running.node.get(&replicated).await,
            KvReply::GetError { key: replicated }
        );

        // A key owned by a node we don't replicate: neither.
        let foreign = key_owned_by(&metadata, foreign_primary);
        match running.node.get(&foreign).await {
            KvReply::ServerNotResponsible { metadata: carried } => assert_eq!(carried, metadata),
            other => panic!("unexpected {:?}", other),
        }

        let own = key_owned_by(&metadata, &me);
        assert_eq!(
            running.node.put(&own, Some("v".to_string())).await,
            KvReply::PutSuccess { key: own }
        );

        running.kill();
    }

    // ============================================================
    // TRANSFERS
    // ============================================================

    #[tokio::test]
    async fn test_move_replicate_remove_between_nodes() {
        let a = launch().await;
        let b = launch().await;
        let metadata = ring_of(&[a.addr().clone(), b.addr().clone()]);
        init(&a, &metadata).await;
        init(&b, &metadata).await;

        for i in 0..50 {
            a.node.store().put(&format!("k{}", i), format!("v{}", i));
        }
        let range = metadata.get(a.addr()).unwrap().range;
        let in_range = a.node.store().scan(&range).len();
        let elsewhere = 50 - in_range;

        // REPLICATE copies and keeps.
        let copied = a
            .node
            .transfer(TransferKind::Replicate, range, Some(b.addr()))
            .await
            .unwrap();
        assert_eq!(copied, in_range);
        assert_eq!(a.node.store().len(), 50);
        assert_eq!(b.node.store().len(), in_range);

        // MOVE the rest over; the source drops it.
        let other = metadata.get(b.addr()).unwrap().range;
        let moved = a
            .node
            .transfer(TransferKind::Move, other, Some(b.addr()))
            .await
            .unwrap();
        assert_eq!(moved, elsewhere);
        assert_eq!(a.node.store().len(), in_range);
        assert_eq!(b.node.store().len(), 50);

        // REMOVE is local and idempotent.
        let reply = b
            .node
            .handle_admin(AdminMessage::RemoveData { range })
            .await;
        assert!(reply.is_success());
        assert_eq!(b.node.store().len(), elsewhere);
        assert!(b.node.handle_admin(AdminMessage::RemoveData { range }).await.is_success());
        assert_eq!(b.node.store().len(), elsewhere);

        a.kill();
        b.kill();
    }

    #[tokio::test]
    async fn test_failed_move_keeps_source_data() {
        let a = launch().await;
        init(&a, &ring_of(&[a.addr().clone()])).await;
        for i in 0..10 {
            a.node.store().put(&format!("k{}", i), "v".to_string());
        }

        let unreachable = NodeAddr::new("127.0.0.1", free_port());
        let reply = a
            .node
            .handle_admin(AdminMessage::MoveData {
                range: KeyRange::full(0),
                target: unreachable,
            })
            .await;
        assert!(matches!(reply, AdminReply::OperationFailed { .. }));
        assert_eq!(a.node.store().len(), 10);

        a.kill();
    }

    #[tokio::test]
    async fn test_restore_onto_self_is_noop() {
        let a = launch().await;
        init(&a, &ring_of(&[a.addr().clone()])).await;
        a.node.store().put("k", "v".to_string());

        let count = a
            .node
            .transfer(TransferKind::Restore, KeyRange::full(0), Some(a.addr()))
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(a.node.store().get("k"), Some("v".to_string()));

        a.kill();
    }

    // ============================================================
    // GOSSIP
    // ============================================================

    #[tokio::test]
    async fn test_primary_writes_reach_replicas() {
        let a = launch().await;
        let b = launch().await;
        let c = launch().await;
        let metadata = ring_of(&[a.addr().clone(), b.addr().clone(), c.addr().clone()]);
        for running in [&a, &b, &c] {
            init(running, &metadata).await;
            running.node.handle_admin(AdminMessage::Start).await;
        }

        let key = key_owned_by(&metadata, a.addr());
        assert!(matches!(
            a.node.put(&key, Some("v1".to_string())).await,
            KvReply::PutSuccess { .. }
        ));

        for replica in [&b, &c] {
            let node = replica.node.clone();
            let key = key.clone();
            assert!(
                eventually(Duration::from_secs(3), || {
                    let node = node.clone();
                    let key = key.clone();
                    async move { node.store().get(&key).as_deref() == Some("v1") }
                })
                .await,
                "{} never received the write",
                replica.addr()
            );
        }

        // Deletes propagate too.
        assert!(matches!(
            a.node.put(&key, None).await,
            KvReply::DeleteSuccess { .. }
        ));
        let node = b.node.clone();
        assert!(
            eventually(Duration::from_secs(3), || {
                let node = node.clone();
                let key = key.clone();
                async move { node.store().get(&key).is_none() }
            })
            .await
        );

        for running in [a, b, c] {
            running.kill();
        }
    }
}
