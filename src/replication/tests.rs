//! Replication Module Tests
//!
//! ## Test Scopes
//! - **UpdateBatch**: last-write-wins per key, atomic take.
//! - **Gossip ordering**: batches are applied once, in serial order, and only
//!   from current coordinators.
//! - **Heartbeats**: real UDP exchange between two handlers; a silent
//!   coordinator is reported to the failure listener.

#[cfg(test)]
mod tests {
    use crate::admin::protocol::ENDPOINT_FAILURE;
    use crate::admin::{AdminMessage, AdminReply};
    use crate::replication::{
        GossipBatch, GossipEntry, ReplicationConfig, ReplicationHandler, UpdateBatch,
    };
    use crate::ring::{NodeAddr, NodeDescriptor, PartitionMetadata};
    use crate::testkit::{eventually, free_port, quick_replication};

    use axum::{Extension, Json, Router, routing::post};
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn local(port: u16) -> NodeAddr {
        NodeAddr::new("127.0.0.1", port)
    }

    fn ring_of(addrs: &[NodeAddr]) -> PartitionMetadata {
        PartitionMetadata::compute(
            addrs
                .iter()
                .map(|addr| NodeDescriptor::unplaced(format!("server{}", addr.port), addr.clone())),
        )
    }

    fn batch(from: &NodeAddr, epoch: &str, serial: u64) -> GossipBatch {
        GossipBatch {
            from: from.clone(),
            epoch: epoch.to_string(),
            serial,
            entries: vec![GossipEntry {
                key: format!("k{}", serial),
                value: Some("v".to_string()),
            }],
        }
    }

    async fn failure_sink() -> (std::net::SocketAddr, mpsc::UnboundedReceiver<AdminMessage>) {
        async fn capture(
            Extension(tx): Extension<mpsc::UnboundedSender<AdminMessage>>,
            Json(msg): Json<AdminMessage>,
        ) -> Json<AdminReply> {
            let _ = tx.send(msg);
            Json(AdminReply::OperationSuccess)
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route(ENDPOINT_FAILURE, post(capture))
            .layer(Extension(tx));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, rx)
    }

    // ============================================================
    // UPDATE BATCH
    // ============================================================

    #[test]
    fn test_batch_keeps_latest_value_per_key() {
        let journal = UpdateBatch::new();
        journal.record("b".to_string(), Some("1".to_string()));
        journal.record("a".to_string(), Some("1".to_string()));
        journal.record("b".to_string(), Some("2".to_string()));
        journal.record("a".to_string(), None);
        assert_eq!(journal.len(), 2);

        let taken = journal.take();
        assert_eq!(
            taken,
            vec![
                GossipEntry {
                    key: "a".to_string(),
                    value: None
                },
                GossipEntry {
                    key: "b".to_string(),
                    value: Some("2".to_string())
                },
            ]
        );
        assert!(journal.is_empty());
        assert!(journal.take().is_empty());
    }

    #[test]
    fn test_replica_converges_to_primary() {
        // Random writes on a primary, flushed at random points; the replica
        // applying every batch in order must end equal to the primary.
        let mut rng = StdRng::seed_from_u64(7);

        for _round in 0..20 {
            let journal = UpdateBatch::new();
            let mut primary: HashMap<String, String> = HashMap::new();
            let mut replica: HashMap<String, String> = HashMap::new();

            let apply = |replica: &mut HashMap<String, String>, entries: Vec<GossipEntry>| {
                for entry in entries {
                    match entry.value {
                        Some(value) => {
                            replica.insert(entry.key, value);
                        }
                        None => {
                            replica.remove(&entry.key);
                        }
                    }
                }
            };

            for step in 0..200 {
                let key = format!("key{}", rng.gen_range(0..12));
                if rng.gen_bool(0.3) {
                    if primary.remove(&key).is_some() {
                        journal.record(key, None);
                    }
                } else {
                    let value = format!("v{}", step);
                    primary.insert(key.clone(), value.clone());
                    journal.record(key, Some(value));
                }

                if rng.gen_bool(0.1) {
                    apply(&mut replica, journal.take());
                }
            }
            apply(&mut replica, journal.take());

            assert_eq!(replica, primary);
        }
    }

    // ============================================================
    // GOSSIP ORDERING
    // ============================================================

    #[tokio::test]
    async fn test_accept_batch_orders_by_serial_and_epoch() {
        let me = local(free_port());
        let others: Vec<NodeAddr> = (0..3).map(|_| local(free_port())).collect();
        let mut all = others.clone();
        all.push(me.clone());
        let metadata = ring_of(&all);

        let handler = ReplicationHandler::bind(me.clone(), quick_replication(), CancellationToken::new())
            .await
            .unwrap();
        handler.update_metadata(&metadata).await;

        let coordinator = metadata.coordinators_of(&me)[0].addr.clone();
        let replica = metadata.replicas_of(&me)[0].addr.clone();
        let outsider = others
            .iter()
            .find(|addr| !metadata.coordinators_of(&me).iter().any(|c| &c.addr == *addr))
            .unwrap()
            .clone();
        assert_eq!(outsider, replica);

        assert!(handler.accept_batch(&batch(&coordinator, "e1", 1)).await);
        assert!(!handler.accept_batch(&batch(&coordinator, "e1", 1)).await, "duplicate");
        assert!(handler.accept_batch(&batch(&coordinator, "e1", 3)).await);
        assert!(!handler.accept_batch(&batch(&coordinator, "e1", 2)).await, "out of date");

        // A restarted coordinator starts a new epoch at serial 1.
        assert!(handler.accept_batch(&batch(&coordinator, "e2", 1)).await);
        assert!(handler.accept_batch(&batch(&coordinator, "e2", 2)).await);

        assert!(!handler.accept_batch(&batch(&outsider, "e1", 1)).await);

        handler.shutdown();
    }

    #[tokio::test]
    async fn test_flush_without_replicas_drops_pending() {
        let me = local(free_port());
        let handler = ReplicationHandler::bind(me.clone(), quick_replication(), CancellationToken::new())
            .await
            .unwrap();
        handler.update_metadata(&ring_of(&[me])).await;

        handler.record("k".to_string(), Some("v".to_string()));
        assert_eq!(handler.pending_updates(), 1);
        assert_eq!(handler.flush().await, 0);
        assert_eq!(handler.pending_updates(), 0);
        assert!(handler.coordinators().await.is_empty());
        assert!(handler.replicas().await.is_empty());

        handler.shutdown();
    }

    // ============================================================
    // HEARTBEATS
    // ============================================================

    #[tokio::test]
    async fn test_silent_coordinator_is_reported() {
        let (sink, mut reports) = failure_sink().await;
        let config = ReplicationConfig {
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_millis(400),
            gossip_interval: Duration::from_millis(50),
            failure_report_addr: Some(sink),
        };

        let a = local(free_port());
        let b = local(free_port());
        let metadata = ring_of(&[a.clone(), b.clone()]);

        let handler_a = ReplicationHandler::bind(a.clone(), config.clone(), CancellationToken::new())
            .await
            .unwrap();
        let handler_b = ReplicationHandler::bind(b.clone(), config, CancellationToken::new())
            .await
            .unwrap();
        handler_a.start();
        handler_b.start();
        handler_a.update_metadata(&metadata).await;
        handler_b.update_metadata(&metadata).await;

        // In a two-node ring each is the other's coordinator and replica.
        assert_eq!(handler_b.coordinators().await, vec![a.clone()]);
        assert_eq!(handler_b.replicas().await, vec![a.clone()]);

        // Replies keep the coordinator alive well past the timeout.
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(handler_b.coordinators().await, vec![a.clone()]);
        assert!(reports.try_recv().is_err());

        handler_a.shutdown();

        let report = tokio::time::timeout(Duration::from_secs(5), reports.recv())
            .await
            .expect("failure report within timeout")
            .unwrap();
        match report {
            AdminMessage::ServerFailure { reporter, failed } => {
                assert_eq!(reporter, b);
                assert_eq!(failed.addr, a);
            }
            other => panic!("unexpected report {:?}", other),
        }

        let handler_b = Arc::clone(&handler_b);
        assert!(
            eventually(Duration::from_secs(1), || {
                let handler_b = handler_b.clone();
                async move { handler_b.coordinators().await.is_empty() }
            })
            .await
        );
        handler_b.shutdown();
    }

    #[tokio::test]
    async fn test_metadata_refresh_keeps_silence_clock() {
        let (sink, mut reports) = failure_sink().await;
        let config = ReplicationConfig {
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_millis(600),
            gossip_interval: Duration::from_millis(50),
            failure_report_addr: Some(sink),
        };

        let me = local(free_port());
        let ghost = local(free_port());
        let metadata = ring_of(&[me.clone(), ghost.clone()]);

        let handler = ReplicationHandler::bind(me.clone(), config, CancellationToken::new())
            .await
            .unwrap();
        handler.start();
        handler.update_metadata(&metadata).await;

        tokio::time::sleep(Duration::from_millis(450)).await;
        assert!(reports.try_recv().is_err());

        // Same coordinator again: the 600ms of silence still ends 150ms from now.
        handler.update_metadata(&metadata).await;
        assert_eq!(handler.coordinators().await, vec![ghost.clone()]);

        let report = tokio::time::timeout(Duration::from_millis(400), reports.recv())
            .await
            .expect("refresh must not restart the heartbeat timeout")
            .unwrap();
        match report {
            AdminMessage::ServerFailure { reporter, failed } => {
                assert_eq!(reporter, me);
                assert_eq!(failed.addr, ghost);
            }
            other => panic!("unexpected report {:?}", other),
        }

        handler.shutdown();
    }

    #[tokio::test]
    async fn test_metadata_refresh_replaces_watchers() {
        let (sink, mut reports) = failure_sink().await;
        let config = ReplicationConfig {
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_millis(300),
            gossip_interval: Duration::from_millis(50),
            failure_report_addr: Some(sink),
        };

        let me = local(free_port());
        let ghost = local(free_port());
        let handler = ReplicationHandler::bind(me.clone(), config, CancellationToken::new())
            .await
            .unwrap();
        handler.start();

        // `ghost` never answers, but is dropped from the map before it times out.
        handler.update_metadata(&ring_of(&[me.clone(), ghost])).await;
        assert_eq!(handler.coordinators().await.len(), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        handler.update_metadata(&ring_of(&[me])).await;
        assert!(handler.coordinators().await.is_empty());

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(reports.try_recv().is_err(), "cancelled watcher must not report");

        handler.shutdown();
    }
}
