#![forbid(unsafe_code)]
//! Startup barriers and the initializer/joiner hand-off.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::region::descriptor::{DescriptorSnapshot, CACHE_LINE};
use crate::region::layout::barrier_offset;
use crate::region::Region;
use crate::types::{RegionError, RegionOffset, Result};

const SIGNALLED: u64 = 1;

impl Region {
    /// Signals barrier `id` and flushes its line.
    pub fn set_barrier(&self, id: u32) -> Result<()> {
        self.barrier_slot(id)?.state.store(SIGNALLED, Ordering::Release);
        self.flush(barrier_line(id), CACHE_LINE as u64)?;
        debug!(id, node = self.topology().node().0, "flush.barrier.set");
        Ok(())
    }

    /// Clears barrier `id` so the id can be used for a later phase.
    pub fn reset_barrier(&self, id: u32) -> Result<()> {
        self.barrier_slot(id)?.state.store(0, Ordering::Release);
        self.flush(barrier_line(id), CACHE_LINE as u64)?;
        debug!(id, node = self.topology().node().0, "flush.barrier.reset");
        Ok(())
    }

    /// Reads barrier `id` from the backing medium.
    pub fn barrier_is_set(&self, id: u32) -> Result<bool> {
        let slot = self.barrier_slot(id)?;
        self.invalidate(barrier_line(id), CACHE_LINE as u64)?;
        Ok(slot.state.load(Ordering::Acquire) == SIGNALLED)
    }

    /// Blocks until barrier `id` is signalled. Never gives up.
    pub fn wait_barrier(&self, id: u32) -> Result<()> {
        self.poll_barrier(id, None).map(|_| ())
    }

    /// Like [`Region::wait_barrier`], but fails with
    /// [`RegionError::BarrierTimeout`] once `timeout` has passed. A timeout
    /// too large to put a deadline on waits without one.
    pub fn wait_barrier_timeout(&self, id: u32, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        if self.poll_barrier(id, started.checked_add(timeout))? {
            Ok(())
        } else {
            Err(RegionError::BarrierTimeout {
                id,
                waited_ms: started.elapsed().as_millis() as u64,
            })
        }
    }

    fn poll_barrier(&self, id: u32, deadline: Option<Instant>) -> Result<bool> {
        let poll = self.config().barrier_poll();
        loop {
            if self.barrier_is_set(id)? {
                return Ok(true);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(false);
            }
            if poll.is_zero() {
                thread::yield_now();
            } else {
                thread::sleep(poll);
            }
        }
    }

    /// Initializer side of the startup hand-off: flush everything written
    /// so far, wait out the grace interval, then signal barrier `id`.
    pub fn publish_startup(&self, id: u32) -> Result<()> {
        self.flush_all()?;
        let grace = self.config().startup_grace();
        if !grace.is_zero() {
            thread::sleep(grace);
        }
        self.set_barrier(id)?;
        info!(
            id,
            grace_ms = grace.as_millis() as u64,
            path = %self.path().display(),
            "flush.barrier.publish_startup"
        );
        Ok(())
    }

    /// Joiner side of the startup hand-off: wait for barrier `id`, drop
    /// every stale line, then validate the descriptor.
    pub fn join_startup(&self, id: u32) -> Result<DescriptorSnapshot> {
        self.wait_barrier(id)?;
        self.finish_join(id)
    }

    /// [`Region::join_startup`] with an upper bound on the wait.
    pub fn join_startup_timeout(&self, id: u32, timeout: Duration) -> Result<DescriptorSnapshot> {
        self.wait_barrier_timeout(id, timeout)?;
        self.finish_join(id)
    }

    fn finish_join(&self, id: u32) -> Result<DescriptorSnapshot> {
        self.invalidate_all()?;
        let snapshot = self.validate_descriptor()?;
        info!(
            id,
            node = self.topology().node().0,
            label = %snapshot.label,
            "flush.barrier.join_startup"
        );
        Ok(snapshot)
    }
}

fn barrier_line(id: u32) -> RegionOffset {
    RegionOffset(barrier_offset(id as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegionConfig;
    use crate::types::{NodeId, Topology};
    use tempfile::tempdir;

    #[test]
    fn set_wait_reset_roundtrip() -> Result<()> {
        let dir = tempdir().unwrap();
        let cfg = RegionConfig::new(dir.path().join("b.region")).with_size(64 * 1024);
        let owner = Region::create(&Topology::new(NodeId(0), 2, 1)?, &cfg)?;
        let peer = Region::attach(&Topology::new(NodeId(1), 2, 1)?, &cfg)?;

        assert!(!peer.barrier_is_set(4)?);
        owner.set_barrier(4)?;
        peer.wait_barrier(4)?;
        peer.reset_barrier(4)?;
        assert!(!owner.barrier_is_set(4)?);
        Ok(())
    }

    #[test]
    fn timeout_reports_barrier_id() -> Result<()> {
        let dir = tempdir().unwrap();
        let cfg = RegionConfig::new(dir.path().join("t.region")).with_size(64 * 1024);
        let region = Region::create(&Topology::single(), &cfg)?;
        let err = region
            .wait_barrier_timeout(7, Duration::from_millis(20))
            .unwrap_err();
        match err {
            RegionError::BarrierTimeout { id, waited_ms } => {
                assert_eq!(id, 7);
                assert!(waited_ms >= 20);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn unbounded_timeout_does_not_overflow() -> Result<()> {
        let dir = tempdir().unwrap();
        let cfg = RegionConfig::new(dir.path().join("m.region")).with_size(64 * 1024);
        let owner = Region::create(&Topology::new(NodeId(0), 2, 1)?, &cfg)?;
        let peer = Region::attach(&Topology::new(NodeId(1), 2, 1)?, &cfg)?;
        owner.set_barrier(3)?;
        peer.wait_barrier_timeout(3, Duration::MAX)?;
        owner.publish_startup(0)?;
        let snapshot = peer.join_startup_timeout(0, Duration::MAX)?;
        assert_eq!(snapshot.node_count, 2);
        Ok(())
    }

    #[test]
    fn out_of_range_id_is_invalid() -> Result<()> {
        let dir = tempdir().unwrap();
        let cfg = RegionConfig::new(dir.path().join("r.region")).with_size(64 * 1024);
        let region = Region::create(&Topology::single(), &cfg)?;
        assert!(matches!(
            region.set_barrier(32),
            Err(RegionError::Invalid(_))
        ));
        assert!(region.wait_barrier_timeout(99, Duration::ZERO).is_err());
        Ok(())
    }
}
