use std::net::{TcpListener, UdpSocket};
use std::time::Duration;

use crate::replication::ReplicationConfig;

/// A port that is free for both TCP and UDP on the loopback interface.
pub(crate) fn free_port() -> u16 {
    loop {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral tcp port");
        let port = listener.local_addr().expect("local addr").port();
        if UdpSocket::bind(("127.0.0.1", port)).is_ok() {
            return port;
        }
    }
}

/// Fast heartbeats and gossip, no failure reports.
pub(crate) fn quick_replication() -> ReplicationConfig {
    ReplicationConfig {
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_secs(60),
        gossip_interval: Duration::from_millis(50),
        failure_report_addr: None,
    }
}

/// Polls `check` until it holds or `timeout` passes.
pub(crate) async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
