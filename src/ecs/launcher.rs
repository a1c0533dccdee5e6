//! Starting storage-node processes.
//!
//! A launch succeeds once the node prints [`READY_MARKER`] on stdout within
//! the launch timeout.

use crate::node::server::READY_MARKER;
use crate::node::{RunningNode, StorageNode, spawn_node};
use crate::replication::ReplicationConfig;
use crate::ring::NodeAddr;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

const KILL_GRACE: Duration = Duration::from_secs(5);

#[async_trait]
pub trait NodeLauncher: Send + Sync {
    /// Starts the node for `addr` by running `command args...`.
    async fn launch(&self, addr: &NodeAddr, command: &str, args: &[String]) -> Result<()>;
}

/// Spawns the node binary on this machine.
pub struct LocalLauncher {
    timeout: Duration,
}

impl LocalLauncher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl NodeLauncher for LocalLauncher {
    async fn launch(&self, addr: &NodeAddr, command: &str, args: &[String]) -> Result<()> {
        tracing::info!("Launching {} locally: {} {}", addr, command, args.join(" "));
        let child = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        wait_for_marker(addr, child, self.timeout).await
    }
}

/// Runs the node command on the node's host over ssh.
pub struct SshLauncher {
    timeout: Duration,
    ssh_program: String,
}

impl SshLauncher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ssh_program: "ssh".to_string(),
        }
    }
}

#[async_trait]
impl NodeLauncher for SshLauncher {
    async fn launch(&self, addr: &NodeAddr, command: &str, args: &[String]) -> Result<()> {
        let remote = std::iter::once(command.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        tracing::info!("Launching {} over ssh: {}", addr, remote);

        let child = Command::new(&self.ssh_program)
            .arg("-n")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(&addr.host)
            .arg(remote)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        wait_for_marker(addr, child, self.timeout).await
    }
}

async fn wait_for_marker(addr: &NodeAddr, mut child: Child, timeout: Duration) -> Result<()> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("no stdout from launched process"))?;
    let mut lines = BufReader::new(stdout).lines();

    let ready = tokio::time::timeout(timeout, async {
        while let Some(line) = lines.next_line().await? {
            if line.contains(READY_MARKER) {
                return Ok::<bool, std::io::Error>(true);
            }
        }
        Ok(false)
    })
    .await;

    match ready {
        Ok(Ok(true)) => {
            // Keep draining so the child never blocks on a full pipe.
            let label = addr.to_string();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("[{}] {}", label, line);
                }
                let _ = child.wait().await;
            });
            Ok(())
        }
        Ok(Ok(false)) => {
            let status = child.wait().await?;
            Err(anyhow::anyhow!("{} exited before becoming ready ({})", addr, status))
        }
        Ok(Err(e)) => {
            let _ = child.kill().await;
            Err(e.into())
        }
        Err(_) => {
            let _ = child.kill().await;
            Err(anyhow::anyhow!("{} not ready within {:?}", addr, timeout))
        }
    }
}

/// Runs nodes as tasks inside the current process.
///
/// The command and arguments are ignored; every node gets the launcher's
/// replication settings. [`InProcessLauncher::kill`] simulates a crash.
pub struct InProcessLauncher {
    config: ReplicationConfig,
    nodes: Mutex<HashMap<NodeAddr, RunningNode>>,
}

impl InProcessLauncher {
    pub fn new(config: ReplicationConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            nodes: Mutex::new(HashMap::new()),
        })
    }

    pub async fn node(&self, addr: &NodeAddr) -> Option<Arc<StorageNode>> {
        self.nodes
            .lock()
            .await
            .get(addr)
            .filter(|running| !running.is_stopped())
            .map(|running| running.node.clone())
    }

    /// Nodes that are still serving.
    pub async fn running(&self) -> Vec<NodeAddr> {
        let mut addrs: Vec<NodeAddr> = self
            .nodes
            .lock()
            .await
            .iter()
            .filter(|(_, running)| !running.is_stopped())
            .map(|(addr, _)| addr.clone())
            .collect();
        addrs.sort();
        addrs
    }

    /// Stops a node without telling anyone.
    pub async fn kill(&self, addr: &NodeAddr) -> bool {
        match self.nodes.lock().await.remove(addr) {
            Some(running) => {
                running.kill();
                if tokio::time::timeout(KILL_GRACE, running.wait()).await.is_err() {
                    tracing::warn!("{} still draining connections after {:?}", addr, KILL_GRACE);
                }
                tracing::warn!("Killed in-process node {}", addr);
                true
            }
            None => false,
        }
    }

    pub async fn kill_all(&self) {
        let drained: Vec<RunningNode> = self.nodes.lock().await.drain().map(|(_, n)| n).collect();
        for running in drained {
            running.kill();
            let _ = tokio::time::timeout(KILL_GRACE, running.wait()).await;
        }
    }
}

impl InProcessLauncher {
    /// Spawns the node, retrying while a previous incarnation on the same
    /// address is still releasing its ports.
    async fn spawn_rebinding(&self, addr: &NodeAddr) -> Result<RunningNode> {
        let deadline = tokio::time::Instant::now() + KILL_GRACE;
        let mut delay_ms = 25u64;

        loop {
            match spawn_node(addr.clone(), self.config.clone()).await {
                Ok(running) => return Ok(running),
                Err(e) if is_addr_in_use(&e) && tokio::time::Instant::now() < deadline => {
                    tracing::debug!("{} still bound, retrying in {}ms", addr, delay_ms);
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = (delay_ms * 2).min(400);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_addr_in_use(e: &anyhow::Error) -> bool {
    e.chain()
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .any(|io| io.kind() == std::io::ErrorKind::AddrInUse)
}

#[async_trait]
impl NodeLauncher for InProcessLauncher {
    async fn launch(&self, addr: &NodeAddr, _command: &str, _args: &[String]) -> Result<()> {
        let mut nodes = self.nodes.lock().await;
        if let Some(existing) = nodes.get(addr)
            && !existing.is_stopped()
        {
            anyhow::bail!("{} is already running", addr);
        }

        // A node that was shut down earlier still holds its sockets until its
        // tasks notice the cancellation.
        if let Some(stopped) = nodes.remove(addr)
            && tokio::time::timeout(KILL_GRACE, stopped.wait()).await.is_err()
        {
            tracing::warn!("{} still draining connections after {:?}", addr, KILL_GRACE);
        }

        let running = self.spawn_rebinding(addr).await?;
        nodes.insert(addr.clone(), running);
        tracing::info!("Launched in-process node {}", addr);
        Ok(())
    }
}
