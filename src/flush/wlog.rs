#![forbid(unsafe_code)]

use std::ops::Range;

use parking_lot::Mutex;
use tracing::trace;

use crate::region::descriptor::CACHE_LINE;
use crate::types::{CoreId, RegionError, RegionOffset, Result};

const LINE: u64 = CACHE_LINE as u64;

#[derive(Default)]
struct CoreLog {
    ranges: Vec<Range<u64>>,
    recorded_bytes: u64,
}

/// Per-core record of region ranges written since the last flush.
///
/// Each core appends to its own log, so mutators on different cores never
/// contend; the flush server drains them in turn.
pub struct WriteLogs {
    cores: Vec<Mutex<CoreLog>>,
}

impl WriteLogs {
    /// Creates one empty log per core.
    pub fn new(core_count: u32) -> Self {
        Self {
            cores: (0..core_count).map(|_| Mutex::new(CoreLog::default())).collect(),
        }
    }

    /// Number of logs.
    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    /// Records that `core` dirtied `len` bytes at `offset`.
    pub fn record(&self, core: CoreId, offset: RegionOffset, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let log = self.log(core)?;
        let end = offset
            .get()
            .checked_add(len)
            .ok_or(RegionError::Invalid("write range overflows"))?;
        let mut log = log.lock();
        log.ranges.push(offset.get()..end);
        log.recorded_bytes += len;
        Ok(())
    }

    /// Takes the pending ranges of `core`, widened to whole cache lines,
    /// sorted and merged.
    pub fn drain(&self, core: CoreId) -> Result<Vec<Range<u64>>> {
        let log = self.log(core)?;
        let ranges = std::mem::take(&mut log.lock().ranges);
        let merged = coalesce(ranges);
        trace!(core = core.0, ranges = merged.len(), "flush.wlog.drain");
        Ok(merged)
    }

    /// Ranges waiting in the log of `core`.
    pub fn pending(&self, core: CoreId) -> Result<usize> {
        Ok(self.log(core)?.lock().ranges.len())
    }

    /// Total bytes ever recorded by `core`.
    pub fn recorded_bytes(&self, core: CoreId) -> Result<u64> {
        Ok(self.log(core)?.lock().recorded_bytes)
    }

    fn log(&self, core: CoreId) -> Result<&Mutex<CoreLog>> {
        self.cores
            .get(core.0 as usize)
            .ok_or(RegionError::Invalid("core id outside topology"))
    }
}

fn coalesce(mut ranges: Vec<Range<u64>>) -> Vec<Range<u64>> {
    for range in ranges.iter_mut() {
        range.start &= !(LINE - 1);
        range.end = range.end.div_ceil(LINE) * LINE;
    }
    ranges.sort_unstable_by_key(|range| range.start);
    let mut merged: Vec<Range<u64>> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    merged
}
