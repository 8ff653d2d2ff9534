//! Write visibility between nodes.
//!
//! Nodes share no cache coherence over the region, so a write becomes
//! visible to a peer only after the writer flushes its lines and the reader
//! invalidates its own copies. This module holds the cache primitives, the
//! per-core write logs, barriers, and the background flush server.

pub(crate) mod cache;

/// Barrier operations and the startup hand-off on [`crate::Region`].
pub mod barrier;
/// Background flush server.
pub mod server;
/// Per-core write logs.
pub mod wlog;

pub use server::{FlushServer, FlushServerConfig, FlushServerStats, IdleStrategy};
pub use wlog::WriteLogs;
