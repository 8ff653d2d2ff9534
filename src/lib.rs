//! Shared persistent region for multi-node graph jobs.
//!
//! Every node process maps one backing file. The region carries a small
//! descriptor, a bump-and-free-list pool that standard-shaped containers
//! allocate from, barrier words used to hand off startup, and a clock
//! published by node 0. Writes reach peers only through explicit flushes,
//! issued by hand or by a [`FlushServer`] thread. The [`archive`] module
//! saves and reloads region-resident containers, copying plain element
//! types as one byte range.

#![warn(missing_docs)]

pub mod alloc;
pub mod archive;
pub mod config;
pub mod flush;
pub mod primitives;
pub mod region;
pub mod types;

pub use alloc::{RegionAlloc, RegionAllocator, RegionBox, RegionVec};
pub use archive::{Archive, Elementwise, Plain};
pub use config::{FlushMode, RegionConfig};
pub use flush::{FlushServer, FlushServerConfig, FlushServerStats, IdleStrategy};
pub use region::{Region, RegionStats};
pub use types::{CoreId, NodeId, RegionError, RegionOffset, RegionPtr, Result, Topology};
