#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

use crate::types::{RegionError, Result};

/// Identity token stored in the first word of every region ("GRAPHHEA").
pub const REGION_MAGIC: u64 = 0x4752_4150_4848_4541;
/// Layout version written by this build.
pub const REGION_VERSION: u32 = 1;
/// Cache line size assumed by the layout and the flush primitives.
pub const CACHE_LINE: usize = 64;
/// Size of the descriptor in bytes.
pub const DESCRIPTOR_LEN: usize = 128;
/// Bytes of free-text label the descriptor can hold.
pub const LABEL_LEN: usize = 24;

/// First cache line of the descriptor.
#[repr(C, align(64))]
pub struct DescriptorHead {
    /// [`REGION_MAGIC`] once the initializer has finished writing the header.
    pub magic: AtomicU64,
    /// Layout version.
    pub version: AtomicU32,
    /// Nodes in the job that created the region.
    pub node_count: AtomicU32,
    /// Worker cores per node.
    pub core_count: AtomicU32,
    /// Reserved flag bits.
    pub flags: AtomicU32,
    /// Total region size in bytes.
    pub capacity: AtomicU64,
    /// Offset of the first pool byte.
    pub data_offset: AtomicU64,
    /// Label bytes, packed little-endian into three words.
    pub label: [AtomicU64; 3],
}

/// Second cache line of the descriptor: the global clock.
#[repr(C, align(64))]
pub struct ClockLine {
    /// Tick counter advanced by the clock owner.
    pub value: AtomicU64,
}

/// Fixed header at offset 0 of every region.
#[repr(C)]
pub struct RegionDescriptor {
    /// Identity, topology and capacity.
    pub head: DescriptorHead,
    /// Global clock, kept on its own line so republishing it never
    /// disturbs readers of the head.
    pub clock: ClockLine,
}

const _: () = {
    assert!(std::mem::size_of::<DescriptorHead>() == CACHE_LINE);
    assert!(std::mem::size_of::<RegionDescriptor>() == DESCRIPTOR_LEN);
    assert!(std::mem::offset_of!(RegionDescriptor, clock) == CACHE_LINE);
    assert!(std::mem::offset_of!(DescriptorHead, magic) == 0);
    assert!(std::mem::offset_of!(DescriptorHead, capacity) == 24);
    assert!(std::mem::offset_of!(DescriptorHead, label) == 40);
};

/// Plain copy of the descriptor fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DescriptorSnapshot {
    /// Magic word.
    pub magic: u64,
    /// Layout version.
    pub version: u32,
    /// Nodes in the job.
    pub node_count: u32,
    /// Cores per node.
    pub core_count: u32,
    /// Flag bits.
    pub flags: u32,
    /// Region size in bytes.
    pub capacity: u64,
    /// First pool byte.
    pub data_offset: u64,
    /// Decoded label.
    pub label: String,
    /// Global clock value.
    pub clock: u64,
}

impl RegionDescriptor {
    /// Writes every head field except the magic.
    pub(crate) fn write_head(
        &self,
        node_count: u32,
        core_count: u32,
        capacity: u64,
        data_offset: u64,
        label: &str,
    ) {
        let head = &self.head;
        head.version.store(REGION_VERSION, Ordering::Relaxed);
        head.node_count.store(node_count, Ordering::Relaxed);
        head.core_count.store(core_count, Ordering::Relaxed);
        head.flags.store(0, Ordering::Relaxed);
        head.capacity.store(capacity, Ordering::Relaxed);
        head.data_offset.store(data_offset, Ordering::Relaxed);
        for (slot, word) in head.label.iter().zip(encode_label(label)) {
            slot.store(word, Ordering::Relaxed);
        }
        self.clock.value.store(0, Ordering::Relaxed);
    }

    /// Publishes the magic. Everything written before becomes visible to a
    /// reader that observes it.
    pub(crate) fn publish_magic(&self) {
        self.head.magic.store(REGION_MAGIC, Ordering::Release);
    }

    /// Reads the magic word.
    pub fn magic(&self) -> u64 {
        self.head.magic.load(Ordering::Acquire)
    }

    /// Copies the descriptor out of the region.
    pub fn snapshot(&self) -> DescriptorSnapshot {
        let head = &self.head;
        let words = [
            head.label[0].load(Ordering::Relaxed),
            head.label[1].load(Ordering::Relaxed),
            head.label[2].load(Ordering::Relaxed),
        ];
        DescriptorSnapshot {
            magic: self.magic(),
            version: head.version.load(Ordering::Relaxed),
            node_count: head.node_count.load(Ordering::Relaxed),
            core_count: head.core_count.load(Ordering::Relaxed),
            flags: head.flags.load(Ordering::Relaxed),
            capacity: head.capacity.load(Ordering::Relaxed),
            data_offset: head.data_offset.load(Ordering::Relaxed),
            label: decode_label(words),
            clock: self.clock.value.load(Ordering::Acquire),
        }
    }
}

impl DescriptorSnapshot {
    /// Decodes a descriptor read from the backing file.
    ///
    /// Fields are host-endian, exactly as the mapping stores them.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DESCRIPTOR_LEN {
            return Err(RegionError::Corrupt(format!(
                "descriptor needs {DESCRIPTOR_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let u64_at = |off: usize| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[off..off + 8]);
            u64::from_ne_bytes(word)
        };
        let u32_at = |off: usize| {
            let mut word = [0u8; 4];
            word.copy_from_slice(&bytes[off..off + 4]);
            u32::from_ne_bytes(word)
        };
        Ok(Self {
            magic: u64_at(0),
            version: u32_at(8),
            node_count: u32_at(12),
            core_count: u32_at(16),
            flags: u32_at(20),
            capacity: u64_at(24),
            data_offset: u64_at(32),
            label: decode_label([u64_at(40), u64_at(48), u64_at(56)]),
            clock: u64_at(CACHE_LINE),
        })
    }

    /// True when the magic matches this build.
    pub fn is_valid(&self) -> bool {
        self.magic == REGION_MAGIC
    }
}

/// Packs up to [`LABEL_LEN`] bytes of `label`, cut at a char boundary.
fn encode_label(label: &str) -> [u64; 3] {
    let mut end = label.len().min(LABEL_LEN);
    while !label.is_char_boundary(end) {
        end -= 1;
    }
    let mut bytes = [0u8; LABEL_LEN];
    bytes[..end].copy_from_slice(&label.as_bytes()[..end]);
    let mut words = [0u64; 3];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        *word = u64::from_le_bytes(raw);
    }
    words
}

fn decode_label(words: [u64; 3]) -> String {
    let mut bytes = Vec::with_capacity(LABEL_LEN);
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
