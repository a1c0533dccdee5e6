use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Network identity of a storage node. Also its identity on the ring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Ring position of this node.
    pub fn position(&self) -> u64 {
        super::hash_position(&self.to_string())
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("expected host:port, got '{}'", s))?;
        if host.is_empty() {
            anyhow::bail!("empty host in '{}'", s);
        }
        Ok(Self::new(host, port.parse()?))
    }
}

/// A segment of the hash ring, `(start, end]`.
///
/// `start > end` wraps past `u64::MAX`; `start == end` covers the whole ring
/// (the range of a node that is alone on the ring).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct KeyRange {
    pub start: u64,
    pub end: u64,
}

impl KeyRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// The whole ring, anchored at `position`.
    pub fn full(position: u64) -> Self {
        Self {
            start: position,
            end: position,
        }
    }

    pub fn is_full(&self) -> bool {
        self.start == self.end
    }

    pub fn is_wrapping(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, position: u64) -> bool {
        if self.start < self.end {
            self.start < position && position <= self.end
        } else if self.start > self.end {
            position > self.start || position <= self.end
        } else {
            true
        }
    }

    /// Number of ring positions covered.
    pub fn span(&self) -> u128 {
        if self.is_full() {
            1u128 << 64
        } else {
            self.end.wrapping_sub(self.start) as u128
        }
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:016x}, {:016x}]", self.start, self.end)
    }
}

/// A storage node as it appears in the partition map.
///
/// `addr` is immutable identity; `range` is only ever assigned by
/// `PartitionMetadata::compute`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub name: String,
    pub addr: NodeAddr,
    pub range: KeyRange,
}

impl NodeDescriptor {
    /// A descriptor that has not been placed yet. Its range is a placeholder
    /// until the node goes through `PartitionMetadata::compute`.
    pub fn unplaced(name: impl Into<String>, addr: NodeAddr) -> Self {
        let position = addr.position();
        Self {
            name: name.into(),
            addr,
            range: KeyRange::full(position),
        }
    }

    pub fn position(&self) -> u64 {
        self.range.end
    }
}
