#![allow(missing_docs)]
#![allow(unsafe_code)]

use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

use graphheap::config::RegionConfig;
use graphheap::{
    CoreId, FlushServer, FlushServerConfig, IdleStrategy, NodeId, Region, RegionAlloc,
    RegionOffset, RegionPtr, Result, Topology,
};
use tempfile::{tempdir, TempDir};
use tracing_subscriber::EnvFilter;

const PERIOD: Duration = Duration::from_millis(2);

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("graphheap=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn fast_server(idle: IdleStrategy) -> FlushServerConfig {
    FlushServerConfig {
        flush_period: Duration::from_millis(1),
        clock_period: PERIOD,
        idle,
        pin_cpu: None,
    }
}

fn two_nodes(name: &str) -> Result<(TempDir, Region, Region)> {
    init_tracing();
    let dir = tempdir()?;
    let cfg = RegionConfig::new(dir.path().join(name)).with_size(256 * 1024);
    let owner = Region::create(&Topology::new(NodeId(0), 2, 4)?, &cfg)?;
    let peer = Region::attach(&Topology::new(NodeId(1), 2, 4)?, &cfg)?;
    owner.publish_startup(0)?;
    peer.join_startup(0)?;
    Ok((dir, owner, peer))
}

fn wait_until(mut done: impl FnMut() -> Result<bool>) -> Result<bool> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done()? {
            return Ok(true);
        }
        thread::sleep(Duration::from_millis(1));
    }
    done()
}

#[test]
fn servers_on_both_nodes_keep_clock_and_logs_moving() -> Result<()> {
    let (_dir, owner, peer) = two_nodes("liveness.region")?;
    for core in peer.topology().cores() {
        let offset = RegionOffset(8192 + u64::from(core.0) * 256);
        peer.record_write(core, offset, 100)?;
    }
    assert_eq!(peer.pending_writes(CoreId(3))?, 1);

    let owner_server = FlushServer::start(&owner, fast_server(IdleStrategy::Sleep(Duration::from_micros(100))))?;
    let peer_server = FlushServer::start(&peer, fast_server(IdleStrategy::Yield))?;

    assert!(wait_until(|| Ok(peer.observed_clock() >= 5))?);
    assert!(wait_until(|| {
        let mut pending = 0;
        for core in peer.topology().cores() {
            pending += peer.pending_writes(core)?;
        }
        Ok(pending == 0)
    })?);

    let peer_stats = peer_server.stop();
    let owner_stats = owner_server.stop();
    assert!(owner_stats.clock_publishes >= 5);
    assert!(peer_stats.clock_publishes > 0);
    // Four 100-byte writes, each spanning two or three cache lines.
    assert!(peer_stats.bytes_flushed >= 4 * 128);
    assert_eq!(owner_stats.errors + peer_stats.errors, 0);
    assert!(peer.observed_clock() <= owner.clock());
    Ok(())
}

#[test]
fn peer_observes_logged_write_without_manual_flush() -> Result<()> {
    let (_dir, owner, peer) = two_nodes("visibility.region")?;
    let alloc = RegionAlloc::<u64>::new(&owner);
    let slot = alloc.emplace(0)?;
    let offset = owner.offset_of(slot.as_ptr()).expect("slot in region");

    let server = FlushServer::start(&owner, fast_server(IdleStrategy::Yield))?;
    unsafe { slot.as_ptr().write(0xC0FFEE) };
    owner.record_write(CoreId(1), offset, 8)?;
    assert!(wait_until(|| Ok(owner.pending_writes(CoreId(1))? == 0))?);
    thread::sleep(Duration::from_millis(1));

    peer.invalidate(offset, 8)?;
    let seen = peer.resolve(RegionPtr::<u64>::from_offset(offset))?;
    assert_eq!(unsafe { seen.as_ptr().read_volatile() }, 0xC0FFEE);
    server.stop();
    Ok(())
}

#[test]
fn stopped_server_leaves_clock_untouched() -> Result<()> {
    let (_dir, owner, _peer) = two_nodes("shutdown.region")?;
    let server = FlushServer::start(&owner, fast_server(IdleStrategy::Spin))?;
    assert!(wait_until(|| Ok(owner.clock() >= 2))?);

    let stats = server.stop();
    let frozen = owner.clock();
    assert!(stats.clock_publishes >= 2);
    thread::sleep(PERIOD * 10);
    assert_eq!(owner.clock(), frozen);
    assert_eq!(owner.refresh_clock()?, frozen);
    Ok(())
}

#[test]
fn dropping_the_handle_stops_the_thread() -> Result<()> {
    let (_dir, owner, _peer) = two_nodes("drop.region")?;
    {
        let server = FlushServer::start(&owner, fast_server(IdleStrategy::Yield))?;
        assert!(server.is_running());
        assert!(wait_until(|| Ok(owner.clock() >= 1))?);
    }
    let frozen = owner.clock();
    thread::sleep(PERIOD * 10);
    assert_eq!(owner.clock(), frozen);
    Ok(())
}

#[test]
fn stop_issues_no_flush_after_the_flag_clears() -> Result<()> {
    let (_dir, owner, _peer) = two_nodes("final-flush.region")?;
    let slow = FlushServerConfig {
        flush_period: Duration::from_secs(3600),
        clock_period: Duration::from_secs(3600),
        idle: IdleStrategy::Sleep(Duration::from_micros(500)),
        pin_cpu: Some(0),
    };
    let server = FlushServer::start(&owner, slow)?;
    owner.record_write(CoreId(2), RegionOffset(4096), 64)?;
    let before = server.stats();
    let started = Instant::now();
    let stats = server.stop();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(stats, before);
    assert_eq!(stats.flushes, 0);
    assert_eq!(stats.bytes_flushed, 0);
    assert_eq!(stats.clock_publishes, 0);

    // Leftover ranges are the caller's to flush.
    assert_eq!(owner.pending_writes(CoreId(2))?, 1);
    assert_eq!(owner.flush_write_logs()?, 64);
    assert_eq!(owner.pending_writes(CoreId(2))?, 0);
    Ok(())
}
