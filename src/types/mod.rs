#![forbid(unsafe_code)]
//! Identifiers, process topology, and the error type shared by every layer.

use std::fmt;
use std::marker::PhantomData;
use std::path::PathBuf;

use crate::config::ConfigError;

/// Rank of a node process within the job.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId(pub u32);

/// Index of a worker core within one node.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct CoreId(pub u32);

/// Byte offset from the start of the shared region.
///
/// Offsets are the only form in which locations inside the region are shared
/// between nodes; each node translates them against its own mapping base.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct RegionOffset(pub u64);

impl RegionOffset {
    /// The null offset. It always falls inside the descriptor, so no pool
    /// allocation can ever be located there.
    pub const NULL: RegionOffset = RegionOffset(0);

    /// Returns true for the null offset.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the raw offset value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RegionOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(value: u32) -> Self {
        NodeId(value)
    }
}

impl From<u32> for CoreId {
    fn from(value: u32) -> Self {
        CoreId(value)
    }
}

/// Typed offset of a `T` living inside the region.
pub struct RegionPtr<T> {
    offset: RegionOffset,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RegionPtr<T> {
    /// Wraps a raw offset.
    pub const fn from_offset(offset: RegionOffset) -> Self {
        Self {
            offset,
            _marker: PhantomData,
        }
    }

    /// Returns the untyped offset.
    pub const fn offset(self) -> RegionOffset {
        self.offset
    }
}

impl<T> Clone for RegionPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RegionPtr<T> {}

impl<T> PartialEq for RegionPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}

impl<T> Eq for RegionPtr<T> {}

impl<T> fmt::Debug for RegionPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RegionPtr").field(&self.offset).finish()
    }
}

/// Static description of the job: which node this process is and how large
/// the job is. Built once at startup and passed by reference.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Topology {
    node: NodeId,
    node_count: u32,
    core_count: u32,
}

impl Topology {
    /// Validates and builds a topology.
    pub fn new(node: NodeId, node_count: u32, core_count: u32) -> Result<Self> {
        if node_count == 0 {
            return Err(RegionError::Invalid("node count must be at least 1"));
        }
        if core_count == 0 {
            return Err(RegionError::Invalid("core count must be at least 1"));
        }
        if node.0 >= node_count {
            return Err(RegionError::Invalid("node id must be below node count"));
        }
        Ok(Self {
            node,
            node_count,
            core_count,
        })
    }

    /// Single node, single core. Handy for tools and tests.
    pub fn single() -> Self {
        Self {
            node: NodeId(0),
            node_count: 1,
            core_count: 1,
        }
    }

    /// This process's node id.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Number of nodes in the job.
    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    /// Number of worker cores on each node.
    pub fn core_count(&self) -> u32 {
        self.core_count
    }

    /// Node 0 owns the global clock and initializes the region.
    pub fn is_clock_owner(&self) -> bool {
        self.node.0 == 0
    }

    /// Iterates the cores of this node.
    pub fn cores(&self) -> impl Iterator<Item = CoreId> {
        (0..self.core_count).map(CoreId)
    }
}

/// Errors produced by the region, allocator, flush, and archive layers.
#[derive(thiserror::Error, Debug)]
pub enum RegionError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// The backing file could not be mapped or does not match expectations.
    #[error("failed to attach region {path}: {reason}")]
    Attach {
        /// Backing file path.
        path: PathBuf,
        /// Human-readable cause.
        reason: String,
    },
    /// The descriptor carries a foreign magic value.
    #[error("region magic mismatch: expected {expected:#018x}, found {found:#018x}")]
    MagicMismatch {
        /// Magic this build understands.
        expected: u64,
        /// Magic found in the region.
        found: u64,
    },
    /// The backing file exists but the initializer has not sized it yet.
    #[error("region {0} is not initialized yet")]
    NotReady(PathBuf),
    /// Another initializer holds the region.
    #[error("region {0} is already held by an initializer")]
    Locked(PathBuf),
    /// The pool has no block large enough for the request.
    #[error("region capacity exceeded: requested {requested} bytes, {remaining} bytes remaining")]
    CapacityExceeded {
        /// Block size the request rounded up to.
        requested: u64,
        /// Bytes left between the bump cursor and the end of the pool.
        remaining: u64,
    },
    /// A container could not reserve room for more elements.
    #[error("could not reserve room for {0} elements")]
    ReserveFailed(usize),
    /// Requested alignment is larger than the pool supports.
    #[error("unsupported alignment {0}")]
    Alignment(usize),
    /// The flush server thread could not be started.
    #[error("failed to spawn flush server for node {node}: {source}")]
    Spawn {
        /// Node whose server failed.
        node: NodeId,
        /// Spawn error.
        source: std::io::Error,
    },
    /// `wait_barrier_timeout` gave up.
    #[error("barrier {id} not signalled within {waited_ms} ms")]
    BarrierTimeout {
        /// Barrier id.
        id: u32,
        /// Time spent waiting.
        waited_ms: u64,
    },
    /// Serialized input is malformed or truncated.
    #[error("corrupt archive: {0}")]
    Corrupt(String),
    /// Invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RegionError {
    /// Startup failures after which the node cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RegionError::Attach { .. }
                | RegionError::MagicMismatch { .. }
                | RegionError::Locked(_)
                | RegionError::Spawn { .. }
        )
    }

    pub(crate) fn attach(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        RegionError::Attach {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RegionError>;
