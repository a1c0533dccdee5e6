//! Orchestrator configuration and the node pool file.

use crate::admin::client::{DEFAULT_ADMIN_ATTEMPTS, DEFAULT_ADMIN_TIMEOUT};
use crate::admin::{CacheConfig, CachePolicy};
use crate::ring::{NodeAddr, NodeDescriptor};

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_FAILURE_PORT: u16 = 40000;
pub const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_CACHE_SIZE: usize = 100;
pub const DEFAULT_CACHE_POLICY: CachePolicy = CachePolicy::Fifo;

#[derive(Debug, Clone)]
pub struct EcsConfig {
    /// Where nodes send `SERVER_FAILURE` reports.
    pub failure_addr: SocketAddr,
    /// Program started for every node (local path or remote command).
    pub node_command: String,
    /// Passed to every node after the generated arguments.
    pub node_extra_args: Vec<String>,
    pub launch_timeout: Duration,
    pub admin_timeout: Duration,
    pub admin_attempts: usize,
    /// Cache settings of replacement nodes launched during repair.
    pub default_cache: CacheConfig,
}

impl Default for EcsConfig {
    fn default() -> Self {
        Self {
            failure_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_FAILURE_PORT)),
            node_command: "ringkv".to_string(),
            node_extra_args: Vec::new(),
            launch_timeout: DEFAULT_LAUNCH_TIMEOUT,
            admin_timeout: DEFAULT_ADMIN_TIMEOUT,
            admin_attempts: DEFAULT_ADMIN_ATTEMPTS,
            default_cache: CacheConfig {
                size: DEFAULT_CACHE_SIZE,
                policy: DEFAULT_CACHE_POLICY,
            },
        }
    }
}

impl EcsConfig {
    /// Command line handed to the launcher for one node.
    pub fn node_args(&self, addr: &NodeAddr) -> Vec<String> {
        let mut args = vec![
            "node".to_string(),
            "--host".to_string(),
            addr.host.clone(),
            "--port".to_string(),
            addr.port.to_string(),
            "--ecs".to_string(),
            self.failure_addr.to_string(),
        ];
        args.extend(self.node_extra_args.iter().cloned());
        args
    }
}

/// One launchable node from the pool file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEntry {
    pub name: String,
    pub addr: NodeAddr,
}

impl PoolEntry {
    pub fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor::unplaced(self.name.clone(), self.addr.clone())
    }
}

/// The universe of nodes the orchestrator may launch.
#[derive(Debug, Clone, Default)]
pub struct NodePool {
    entries: Vec<PoolEntry>,
}

impl NodePool {
    pub fn new(entries: Vec<PoolEntry>) -> Result<Self> {
        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.addr.clone()) {
                anyhow::bail!("duplicate pool address {}", entry.addr);
            }
        }
        Ok(Self { entries })
    }

    /// Parses `name host port` lines. Blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            let [name, host, port] = fields.as_slice() else {
                anyhow::bail!("line {}: expected 'name host port', got '{}'", idx + 1, line);
            };
            let port: u16 = port
                .parse()
                .with_context(|| format!("line {}: bad port '{}'", idx + 1, port))?;

            entries.push(PoolEntry {
                name: name.to_string(),
                addr: NodeAddr::new(*host, port),
            });
        }

        Self::new(entries)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading node pool {}", path.display()))?;
        Self::parse(&text)
    }

    pub fn entries(&self) -> &[PoolEntry] {
        &self.entries
    }

    pub fn get(&self, addr: &NodeAddr) -> Option<&PoolEntry> {
        self.entries.iter().find(|entry| &entry.addr == addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
