#![forbid(unsafe_code)]
//! Per-node background flush server.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::primitives::concurrency::pin_current_thread;
use crate::region::Region;
use crate::types::{NodeId, RegionError, Result};

/// What the server thread does between polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdleStrategy {
    /// Busy-spin with a CPU pause hint.
    #[default]
    Spin,
    /// Give up the time slice.
    Yield,
    /// Sleep for the given interval.
    Sleep(Duration),
}

/// Flush server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushServerConfig {
    /// Interval between write-log flushes.
    pub flush_period: Duration,
    /// Interval between clock publications.
    pub clock_period: Duration,
    /// Behavior between polls.
    pub idle: IdleStrategy,
    /// CPU to pin the server thread to.
    pub pin_cpu: Option<usize>,
}

impl Default for FlushServerConfig {
    fn default() -> Self {
        Self {
            flush_period: Duration::from_millis(5),
            clock_period: Duration::from_millis(50),
            idle: IdleStrategy::Spin,
            pin_cpu: None,
        }
    }
}

#[derive(Default)]
struct Counters {
    flushes: AtomicU64,
    bytes_flushed: AtomicU64,
    clock_publishes: AtomicU64,
    errors: AtomicU64,
}

/// Counters of a flush server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FlushServerStats {
    /// Write-log flush passes.
    pub flushes: u64,
    /// Bytes written back by those passes.
    pub bytes_flushed: u64,
    /// Clock advances (node 0) or refreshes (other nodes).
    pub clock_publishes: u64,
    /// Failed flushes or clock updates.
    pub errors: u64,
}

impl Counters {
    fn snapshot(&self) -> FlushServerStats {
        FlushServerStats {
            flushes: self.flushes.load(Ordering::Relaxed),
            bytes_flushed: self.bytes_flushed.load(Ordering::Relaxed),
            clock_publishes: self.clock_publishes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a running flush server. Dropping it stops the thread.
pub struct FlushServer {
    region: Region,
    node: NodeId,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    handle: Option<JoinHandle<()>>,
}

impl FlushServer {
    /// Spawns the server thread for `region`'s node.
    ///
    /// A node runs one server at a time; starting a second one while the
    /// first is live fails with [`RegionError::Invalid`].
    pub fn start(region: &Region, config: FlushServerConfig) -> Result<Self> {
        let node = region.topology().node();
        region.claim_server()?;
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(Counters::default());
        let worker = Worker {
            region: region.clone(),
            config: config.clone(),
            running: Arc::clone(&running),
            counters: Arc::clone(&counters),
        };
        let handle = match thread::Builder::new()
            .name(format!("graphheap-flush-{node}"))
            .spawn(move || worker.run())
        {
            Ok(handle) => handle,
            Err(source) => {
                region.release_server();
                return Err(RegionError::Spawn { node, source });
            }
        };
        info!(
            node = node.0,
            flush_period_us = config.flush_period.as_micros() as u64,
            clock_period_ms = config.clock_period.as_millis() as u64,
            idle = ?config.idle,
            "flush.server.start"
        );
        Ok(Self {
            region: region.clone(),
            node,
            running,
            counters,
            handle: Some(handle),
        })
    }

    /// Current counters.
    pub fn stats(&self) -> FlushServerStats {
        self.counters.snapshot()
    }

    /// True until [`FlushServer::stop`] is called.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Clears the running flag and joins the thread. The loop exits within
    /// one poll and issues no flush after seeing the cleared flag, so writes
    /// still in the logs stay there until [`Region::flush_write_logs`].
    pub fn stop(mut self) -> FlushServerStats {
        self.shutdown();
        self.stats()
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(node = self.node.0, "flush.server.panicked");
            }
            self.region.release_server();
            info!(node = self.node.0, stats = ?self.counters.snapshot(), "flush.server.stop");
        }
    }
}

impl Drop for FlushServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    region: Region,
    config: FlushServerConfig,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl Worker {
    fn run(self) {
        if let Some(cpu) = self.config.pin_cpu {
            if let Err(err) = pin_current_thread(cpu) {
                warn!(cpu, error = %err, "flush.server.pin_failed");
            }
        }
        let mut last_flush = Instant::now();
        let mut last_clock = last_flush;
        while self.running.load(Ordering::Acquire) {
            let now = Instant::now();
            if now.duration_since(last_flush) >= self.config.flush_period {
                self.flush_logs();
                last_flush = now;
            }
            if now.duration_since(last_clock) >= self.config.clock_period {
                self.publish_clock();
                last_clock = now;
            }
            self.idle();
        }
        debug!(node = self.region.topology().node().0, "flush.server.exit");
    }

    fn flush_logs(&self) {
        match self.region.flush_write_logs() {
            Ok(bytes) => {
                self.counters.flushes.fetch_add(1, Ordering::Relaxed);
                self.counters.bytes_flushed.fetch_add(bytes, Ordering::Relaxed);
            }
            Err(err) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "flush.server.flush_failed");
            }
        }
    }

    fn publish_clock(&self) {
        let result = if self.region.topology().is_clock_owner() {
            self.region.advance_clock()
        } else {
            self.region.refresh_clock()
        };
        match result {
            Ok(_) => {
                self.counters.clock_publishes.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "flush.server.clock_failed");
            }
        }
    }

    fn idle(&self) {
        match self.config.idle {
            IdleStrategy::Spin => std::hint::spin_loop(),
            IdleStrategy::Yield => thread::yield_now(),
            IdleStrategy::Sleep(interval) => thread::sleep(interval),
        }
    }
}
