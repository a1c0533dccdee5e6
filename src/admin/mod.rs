//! Admin Protocol
//!
//! The control channel between the orchestrator and storage nodes. Every admin
//! message is one HTTP request carrying a JSON-encoded [`AdminMessage`] and
//! answered with one [`AdminReply`].
//!
//! Each message kind carries only its own fields; the `status` tag on the wire
//! names the kind.

pub mod client;
pub mod protocol;

pub use client::AdminClient;
pub use protocol::{AdminMessage, AdminReply, CacheConfig, CachePolicy, TransferKind};
