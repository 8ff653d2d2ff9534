#![allow(unsafe_code)]
//! The mapped region handle.
//!
//! One node creates the region ([`Region::create`]); every other node
//! attaches to the same backing file ([`Region::attach`]). Locations inside
//! the region are exchanged as [`RegionOffset`]s and resolved against each
//! process's own mapping, so nodes need not map at the same address.

/// Region descriptor: magic, topology, capacity and the global clock.
pub mod descriptor;
/// Layout of the control block in the header page.
pub mod layout;

use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use memmap2::{MmapOptions, MmapRaw};
use serde::Serialize;
use tracing::{debug, info};

use crate::alloc::pool::{size_class, Pool, PoolStats};
use crate::alloc::RegionAllocator;
use crate::config::{FlushMode, RegionConfig};
use crate::flush::cache;
use crate::flush::wlog::WriteLogs;
use crate::primitives::concurrency::InitLock;
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{CoreId, RegionError, RegionOffset, RegionPtr, Result, Topology};

use self::descriptor::{DescriptorSnapshot, CACHE_LINE, DESCRIPTOR_LEN, REGION_MAGIC, REGION_VERSION};
use self::layout::{
    free_list_offset, BarrierSlot, ControlBlock, CLOCK_OFFSET, DATA_OFFSET, HEADER_PAGE,
    POOL_OFFSET, ROOTS_OFFSET, ROOT_SLOTS,
};

/// Shared handle to a mapped region. Cloning is cheap; the mapping is
/// released when the last clone drops.
#[derive(Clone)]
pub struct Region {
    inner: Arc<RegionInner>,
}

struct RegionInner {
    map: MmapRaw,
    io: StdFileIo,
    path: PathBuf,
    topology: Topology,
    config: RegionConfig,
    init_lock: Option<InitLock>,
    logs: WriteLogs,
    observed_clock: AtomicU64,
    server_active: AtomicBool,
}

/// Point-in-time view of a region for one node.
#[derive(Debug, Clone, Serialize)]
pub struct RegionStats {
    /// Node that took the snapshot.
    pub node: u32,
    /// Region size in bytes.
    pub capacity: u64,
    /// Global clock as stored in the region.
    pub clock: u64,
    /// Last clock value this node pulled or published.
    pub observed_clock: u64,
    /// Pool counters.
    pub pool: PoolStats,
    /// Ranges waiting in this node's write logs.
    pub pending_writes: usize,
}

impl Region {
    /// Creates and initializes the region as the job's initializer.
    ///
    /// Takes the exclusive initializer lock, resizes the backing file to
    /// `config.size` with every byte zeroed, maps it, and writes the
    /// descriptor and pool control. The magic is stored last. Only node 0,
    /// the clock owner, may initialize.
    pub fn create(topology: &Topology, config: &RegionConfig) -> Result<Self> {
        if !topology.is_clock_owner() {
            return Err(RegionError::Invalid("only node 0 may initialize the region"));
        }
        config.validate()?;
        let io = StdFileIo::open(&config.path)?;
        let lock = InitLock::try_acquire(io.file(), &config.path)?;
        io.truncate(0)?;
        io.truncate(config.size)?;
        let map = map_file(&io, config.size, &config.path)?;
        let region = Self::assemble(map, io, topology, config, Some(lock));
        region.format()?;
        info!(
            path = %config.path.display(),
            node = topology.node().0,
            nodes = topology.node_count(),
            cores = topology.core_count(),
            size = config.size,
            "region.create"
        );
        Ok(region)
    }

    /// Maps an existing region as a joiner.
    ///
    /// The backing file must already have `config.size` bytes; an empty
    /// file means the initializer is still sizing it and yields
    /// [`RegionError::NotReady`], which is worth retrying. A foreign
    /// magic is rejected at once; a zero magic is accepted because the
    /// initializer may still be writing the header, and is checked again by
    /// [`Region::join_startup`].
    pub fn attach(topology: &Topology, config: &RegionConfig) -> Result<Self> {
        config.validate()?;
        let io = StdFileIo::open_existing(&config.path)?;
        let len = io.len()?;
        if len == 0 {
            // The initializer empties the file before sizing it.
            return Err(RegionError::NotReady(config.path.clone()));
        }
        if len != config.size {
            return Err(RegionError::attach(
                &config.path,
                format!("backing file is {len} bytes, expected {}", config.size),
            ));
        }
        let map = map_file(&io, config.size, &config.path)?;
        let region = Self::assemble(map, io, topology, config, None);
        region.invalidate(RegionOffset::NULL, DESCRIPTOR_LEN as u64)?;
        let magic = region.control().descriptor.magic();
        if magic != 0 && magic != REGION_MAGIC {
            return Err(RegionError::MagicMismatch {
                expected: REGION_MAGIC,
                found: magic,
            });
        }
        if magic == 0 {
            debug!(path = %config.path.display(), "region.attach.descriptor_pending");
        }
        info!(
            path = %config.path.display(),
            node = topology.node().0,
            size = config.size,
            "region.attach"
        );
        Ok(region)
    }

    fn assemble(
        map: MmapRaw,
        io: StdFileIo,
        topology: &Topology,
        config: &RegionConfig,
        init_lock: Option<InitLock>,
    ) -> Self {
        Self {
            inner: Arc::new(RegionInner {
                map,
                io,
                path: config.path.clone(),
                topology: *topology,
                config: config.clone(),
                init_lock,
                logs: WriteLogs::new(topology.core_count()),
                observed_clock: AtomicU64::new(0),
                server_active: AtomicBool::new(false),
            }),
        }
    }

    fn format(&self) -> Result<()> {
        let control = self.control();
        let topology = &self.inner.topology;
        control.descriptor.write_head(
            topology.node_count(),
            topology.core_count(),
            self.capacity(),
            DATA_OFFSET,
            &self.inner.config.label,
        );
        self.pool().format(self.capacity());
        for slot in &control.roots.slots {
            slot.store(0, Ordering::Relaxed);
        }
        for barrier in &control.barriers {
            barrier.state.store(0, Ordering::Relaxed);
        }
        cache::full_fence();
        self.writeback(0, HEADER_PAGE as usize);
        control.descriptor.publish_magic();
        self.flush(RegionOffset::NULL, HEADER_PAGE)
    }

    /// Checks the descriptor against this build and this node's topology.
    pub fn validate_descriptor(&self) -> Result<DescriptorSnapshot> {
        let snapshot = self.snapshot()?;
        if snapshot.magic != REGION_MAGIC {
            return Err(RegionError::MagicMismatch {
                expected: REGION_MAGIC,
                found: snapshot.magic,
            });
        }
        if snapshot.version != REGION_VERSION {
            return Err(RegionError::attach(
                self.path(),
                format!("layout version {} is not supported", snapshot.version),
            ));
        }
        if snapshot.capacity != self.capacity() || snapshot.data_offset != DATA_OFFSET {
            return Err(RegionError::attach(
                self.path(),
                format!("descriptor records capacity {}", snapshot.capacity),
            ));
        }
        let topology = &self.inner.topology;
        if snapshot.node_count != topology.node_count() || snapshot.core_count != topology.core_count() {
            return Err(RegionError::attach(
                self.path(),
                format!(
                    "region was created for {} nodes x {} cores",
                    snapshot.node_count, snapshot.core_count
                ),
            ));
        }
        Ok(snapshot)
    }

    /// Re-reads the descriptor from the backing medium.
    pub fn snapshot(&self) -> Result<DescriptorSnapshot> {
        self.invalidate(RegionOffset::NULL, DESCRIPTOR_LEN as u64)?;
        Ok(self.control().descriptor.snapshot())
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Topology this handle was opened with.
    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    /// Configuration this handle was opened with.
    pub fn config(&self) -> &RegionConfig {
        &self.inner.config
    }

    /// Region size in bytes.
    pub fn capacity(&self) -> u64 {
        self.inner.map.len() as u64
    }

    /// True for the handle that created the region.
    pub fn is_initializer(&self) -> bool {
        self.inner.init_lock.is_some()
    }

    /// Positioned I/O over the backing file.
    pub fn file(&self) -> &StdFileIo {
        &self.inner.io
    }

    /// Allocator drawing from this region's pool.
    pub fn allocator(&self) -> RegionAllocator {
        RegionAllocator::new(self)
    }

    /// Start of this process's mapping.
    pub fn base_ptr(&self) -> *mut u8 {
        self.inner.map.as_mut_ptr()
    }

    /// Offset of `ptr` if it points into the region.
    pub fn offset_of<T: ?Sized>(&self, ptr: *const T) -> Option<RegionOffset> {
        let addr = ptr as *const u8 as usize;
        let base = self.base_ptr() as usize;
        if addr < base || addr >= base + self.inner.map.len() {
            return None;
        }
        Some(RegionOffset((addr - base) as u64))
    }

    /// Local address of `len` bytes at `offset`.
    pub fn ptr_at(&self, offset: RegionOffset, len: u64) -> Result<NonNull<u8>> {
        let (start, _) = self.bounds(offset, len)?;
        // In bounds of a live mapping, which is never null.
        NonNull::new(unsafe { self.base_ptr().add(start) })
            .ok_or(RegionError::Invalid("region mapping is null"))
    }

    /// Local address of a typed offset.
    pub fn resolve<T>(&self, ptr: RegionPtr<T>) -> Result<NonNull<T>> {
        if ptr.offset().is_null() {
            return Err(RegionError::Invalid("cannot resolve the null offset"));
        }
        let raw = self.ptr_at(ptr.offset(), std::mem::size_of::<T>() as u64)?;
        if raw.as_ptr() as usize % std::mem::align_of::<T>() != 0 {
            return Err(RegionError::Invalid("offset is misaligned for the target type"));
        }
        Ok(raw.cast())
    }

    /// Typed offset of a region-resident value.
    pub fn pointer_to<T>(&self, value: &T) -> Option<RegionPtr<T>> {
        self.offset_of(value as *const T).map(RegionPtr::from_offset)
    }

    /// Publishes `offset` in root slot `slot` and flushes it.
    pub fn set_root(&self, slot: usize, offset: RegionOffset) -> Result<()> {
        let word = self
            .control()
            .roots
            .slots
            .get(slot)
            .ok_or(RegionError::Invalid("root slot out of range"))?;
        word.store(offset.get(), Ordering::Release);
        self.flush(RegionOffset(ROOTS_OFFSET + (slot * 8) as u64), 8)
    }

    /// Reads root slot `slot` from the backing medium.
    pub fn root(&self, slot: usize) -> Result<RegionOffset> {
        if slot >= ROOT_SLOTS {
            return Err(RegionError::Invalid("root slot out of range"));
        }
        self.invalidate(RegionOffset(ROOTS_OFFSET + (slot * 8) as u64), 8)?;
        Ok(RegionOffset(
            self.control().roots.slots[slot].load(Ordering::Acquire),
        ))
    }

    /// Makes this node's writes to `[offset, offset + len)` visible to other
    /// nodes.
    pub fn flush(&self, offset: RegionOffset, len: u64) -> Result<()> {
        let (start, len) = self.bounds(offset, len)?;
        if len == 0 {
            return Ok(());
        }
        self.writeback(start, len);
        if self.inner.config.flush_mode == FlushMode::Msync {
            self.inner.map.flush_range(start, len)?;
        }
        Ok(())
    }

    /// Discards local cached copies of `[offset, offset + len)`.
    pub fn invalidate(&self, offset: RegionOffset, len: u64) -> Result<()> {
        let (start, len) = self.bounds(offset, len)?;
        if len > 0 {
            unsafe { cache::invalidate(self.base_ptr().add(start), len) };
        }
        Ok(())
    }

    /// Flushes the header page and every pool byte handed out so far.
    pub fn flush_all(&self) -> Result<()> {
        let used = self.control().pool.bump.load(Ordering::Acquire).max(DATA_OFFSET);
        debug!(bytes = used, "region.flush_all");
        self.flush(RegionOffset::NULL, used.min(self.capacity()))
    }

    /// Invalidates the header page, then every pool byte the initializer
    /// has handed out.
    pub fn invalidate_all(&self) -> Result<()> {
        self.invalidate(RegionOffset::NULL, HEADER_PAGE)?;
        let used = self.control().pool.bump.load(Ordering::Acquire).max(DATA_OFFSET);
        self.invalidate(RegionOffset::NULL, used.min(self.capacity()))
    }

    fn writeback(&self, start: usize, len: usize) {
        unsafe { cache::writeback(self.base_ptr().add(start), len) };
    }

    fn bounds(&self, offset: RegionOffset, len: u64) -> Result<(usize, usize)> {
        let start = offset.get();
        match start.checked_add(len) {
            Some(end) if end <= self.capacity() => Ok((start as usize, len as usize)),
            _ => Err(RegionError::Invalid("range extends past the end of the region")),
        }
    }

    /// Global clock as currently visible to this node.
    pub fn clock(&self) -> u64 {
        self.control().descriptor.clock.value.load(Ordering::Acquire)
    }

    /// Last value this node published or pulled.
    pub fn observed_clock(&self) -> u64 {
        self.inner.observed_clock.load(Ordering::Acquire)
    }

    /// Advances the global clock by one tick and flushes it. Clock owner
    /// only.
    pub fn advance_clock(&self) -> Result<u64> {
        if !self.inner.topology.is_clock_owner() {
            return Err(RegionError::Invalid("only node 0 advances the global clock"));
        }
        let value = self
            .control()
            .descriptor
            .clock
            .value
            .fetch_add(1, Ordering::AcqRel)
            + 1;
        self.flush(RegionOffset(CLOCK_OFFSET), CACHE_LINE as u64)?;
        self.inner.observed_clock.store(value, Ordering::Release);
        Ok(value)
    }

    /// Pulls the global clock from the backing medium.
    pub fn refresh_clock(&self) -> Result<u64> {
        self.invalidate(RegionOffset(CLOCK_OFFSET), CACHE_LINE as u64)?;
        let value = self.clock();
        self.inner.observed_clock.store(value, Ordering::Release);
        Ok(value)
    }

    /// Records that `core` wrote `len` bytes at `offset`.
    pub fn record_write(&self, core: CoreId, offset: RegionOffset, len: u64) -> Result<()> {
        self.bounds(offset, len)?;
        self.inner.logs.record(core, offset, len)
    }

    /// Flushes and clears the write log of `core`. Returns the bytes
    /// flushed.
    pub fn flush_core_log(&self, core: CoreId) -> Result<u64> {
        let mut flushed = 0;
        for range in self.inner.logs.drain(core)? {
            let len = range.end.min(self.capacity()) - range.start;
            self.flush(RegionOffset(range.start), len)?;
            flushed += len;
        }
        Ok(flushed)
    }

    /// Flushes the write logs of every local core.
    pub fn flush_write_logs(&self) -> Result<u64> {
        let mut flushed = 0;
        for core in self.inner.topology.cores() {
            flushed += self.flush_core_log(core)?;
        }
        Ok(flushed)
    }

    /// Ranges waiting in the write log of `core`.
    pub fn pending_writes(&self, core: CoreId) -> Result<usize> {
        self.inner.logs.pending(core)
    }

    pub(crate) fn claim_server(&self) -> Result<()> {
        self.inner
            .server_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| RegionError::Invalid("a flush server is already running for this node"))
    }

    pub(crate) fn release_server(&self) {
        self.inner.server_active.store(false, Ordering::Release);
    }

    pub(crate) fn allocate_block(&self, size: usize, align: usize) -> Result<RegionOffset> {
        let pool = self.pool();
        let lock = pool.lock();
        let _guard = lock.lock();
        let class = size_class(size, align).ok().map(|(class, _)| class);
        self.pull_lines(&pool_lines(class, None))?;
        // A reused block's link word is read before the head moves past it.
        if let Some(head) = class.map(|class| pool.free_head(class)).filter(|&head| head != 0) {
            self.invalidate(RegionOffset(head), 8)?;
        }
        let result = pool.allocate_locked(size, align);
        self.push_lines(&pool_lines(class, None));
        result
    }

    pub(crate) fn deallocate_block(&self, offset: RegionOffset, size: usize, align: usize) -> Result<()> {
        let pool = self.pool();
        let lock = pool.lock();
        let _guard = lock.lock();
        let class = size_class(size, align).ok().map(|(class, _)| class);
        self.pull_lines(&pool_lines(class, None))?;
        let result = pool.deallocate_locked(offset, size, align);
        let link = result.is_ok().then_some(offset.get());
        self.push_lines(&pool_lines(class, link));
        result
    }

    /// Pool counters.
    pub fn pool_stats(&self) -> Result<PoolStats> {
        self.pull_lines(&pool_lines(None, None))?;
        Ok(self.pool().stats())
    }

    /// Node-local view of the region.
    pub fn stats(&self) -> Result<RegionStats> {
        let mut pending_writes = 0;
        for core in self.inner.topology.cores() {
            pending_writes += self.inner.logs.pending(core)?;
        }
        Ok(RegionStats {
            node: self.inner.topology.node().0,
            capacity: self.capacity(),
            clock: self.clock(),
            observed_clock: self.observed_clock(),
            pool: self.pool_stats()?,
            pending_writes,
        })
    }

    fn pull_lines(&self, lines: &[RegionOffset]) -> Result<()> {
        for &line in lines {
            self.invalidate(line, CACHE_LINE as u64)?;
        }
        Ok(())
    }

    fn push_lines(&self, lines: &[RegionOffset]) {
        for line in lines {
            self.writeback(line.get() as usize, CACHE_LINE);
        }
    }

    fn pool(&self) -> Pool<'_> {
        let control = self.control();
        unsafe { Pool::new(&control.pool, &control.free_lists, self.base_ptr()) }
    }

    pub(crate) fn barrier_slot(&self, id: u32) -> Result<&BarrierSlot> {
        self.control()
            .barriers
            .get(id as usize)
            .ok_or(RegionError::Invalid("barrier id out of range"))
    }

    fn control(&self) -> &ControlBlock {
        // The mapping is page aligned and at least one header page long.
        unsafe { &*(self.inner.map.as_ptr() as *const ControlBlock) }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("path", &self.inner.path)
            .field("node", &self.inner.topology.node())
            .field("capacity", &self.capacity())
            .field("initializer", &self.is_initializer())
            .finish()
    }
}

impl Drop for RegionInner {
    fn drop(&mut self) {
        debug!(
            path = %self.path.display(),
            node = self.topology.node().0,
            "region.release"
        );
    }
}

/// Cache lines a pool operation shares with other nodes: the control line,
/// the head line of `class`, and the line holding a free block's link word.
fn pool_lines(class: Option<usize>, link: Option<u64>) -> Vec<RegionOffset> {
    let line = |offset: u64| RegionOffset(offset & !(CACHE_LINE as u64 - 1));
    let mut lines = vec![line(POOL_OFFSET)];
    lines.extend(class.map(|class| line(free_list_offset(class))));
    lines.extend(link.map(line));
    lines
}

fn map_file(io: &StdFileIo, size: u64, path: &Path) -> Result<MmapRaw> {
    let len = usize::try_from(size)
        .map_err(|_| RegionError::attach(path, "region larger than the address space"))?;
    MmapOptions::new()
        .len(len)
        .map_raw(io.file())
        .map_err(|err| RegionError::attach(path, format!("mmap failed: {err}")))
}
