#![allow(missing_docs)]
#![allow(unsafe_code)]

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use graphheap::config::RegionConfig;
use graphheap::region::descriptor::{DescriptorSnapshot, REGION_MAGIC};
use graphheap::{NodeId, Region, RegionAlloc, RegionError, RegionOffset, RegionPtr, Result, Topology};
use tempfile::tempdir;

const NODES: u32 = 3;
const CORES: u32 = 2;
const VERTICES: usize = 64;

/// Written by node 0 before startup; read by every joiner after it.
#[repr(C)]
struct RankTable {
    len: u64,
    values: u64,
}

fn topology(node: u32) -> Result<Topology> {
    Topology::new(NodeId(node), NODES, CORES)
}

fn publish_ranks(region: &Region) -> Result<()> {
    let alloc = RegionAlloc::<f64>::new(region);
    let values = alloc.allocate(VERTICES)?;
    for i in 0..VERTICES {
        unsafe { values.as_ptr().add(i).write(1.0 / (i + 1) as f64) };
    }
    let values_off = region.offset_of(values.as_ptr()).expect("values live in the region");
    let table = alloc.rebind::<RankTable>().emplace(RankTable {
        len: VERTICES as u64,
        values: values_off.get(),
    })?;
    let table_off = region.offset_of(table.as_ptr()).expect("table lives in the region");
    region.set_root(0, table_off)
}

fn read_ranks(region: &Region) -> Result<Vec<f64>> {
    let table = region.resolve(RegionPtr::<RankTable>::from_offset(region.root(0)?))?;
    let table = unsafe { table.as_ref() };
    let bytes = table.len * std::mem::size_of::<f64>() as u64;
    let values = region.ptr_at(RegionOffset(table.values), bytes)?;
    let values = unsafe { std::slice::from_raw_parts(values.as_ptr() as *const f64, table.len as usize) };
    Ok(values.to_vec())
}

#[test]
fn joiners_see_initializer_writes_after_startup_barrier() -> Result<()> {
    let dir = tempdir()?;
    let cfg = RegionConfig::new(dir.path().join("handoff.region"))
        .with_size(1 << 20)
        .with_label("handoff")
        .with_startup_grace(Duration::from_millis(5));
    let owner = Region::create(&topology(0)?, &cfg)?;

    let (attached_tx, attached_rx) = mpsc::channel();
    let joiners: Vec<_> = (1..NODES)
        .map(|node| {
            let cfg = cfg.clone();
            let attached = attached_tx.clone();
            thread::spawn(move || -> Result<(DescriptorSnapshot, Vec<f64>)> {
                let region = Region::attach(&topology(node)?, &cfg)?;
                attached.send(node).expect("main thread alive");
                let snapshot = region.join_startup_timeout(0, Duration::from_secs(10))?;
                Ok((snapshot, read_ranks(&region)?))
            })
        })
        .collect();
    for _ in 1..NODES {
        attached_rx.recv().expect("joiner attached");
    }

    publish_ranks(&owner)?;
    owner.advance_clock()?;
    owner.advance_clock()?;
    owner.publish_startup(0)?;

    let expected: Vec<f64> = (0..VERTICES).map(|i| 1.0 / (i + 1) as f64).collect();
    for joiner in joiners {
        let (snapshot, ranks) = joiner.join().expect("joiner panicked")?;
        assert_eq!(snapshot.magic, REGION_MAGIC);
        assert_eq!(snapshot.clock, 2);
        assert_eq!(snapshot.label, "handoff");
        assert_eq!(ranks, expected);
    }
    Ok(())
}

#[test]
fn barrier_ids_are_reused_across_phases() -> Result<()> {
    let dir = tempdir()?;
    let cfg = RegionConfig::new(dir.path().join("phases.region")).with_size(64 * 1024);
    let owner = Region::create(&topology(0)?, &cfg)?;
    let peer = Region::attach(&topology(2)?, &cfg)?;

    for phase in 0..3u64 {
        let waiter_peer = peer.clone();
        let waiter = thread::spawn(move || -> Result<u64> {
            waiter_peer.wait_barrier(1)?;
            waiter_peer.refresh_clock()
        });
        owner.advance_clock()?;
        owner.set_barrier(1)?;
        let seen = waiter.join().expect("waiter panicked")?;
        assert_eq!(seen, phase + 1);
        owner.reset_barrier(1)?;
        assert!(!peer.barrier_is_set(1)?);
    }
    Ok(())
}

#[test]
fn joiner_with_wrong_topology_is_fatal() -> Result<()> {
    let dir = tempdir()?;
    let cfg = RegionConfig::new(dir.path().join("mismatch.region")).with_size(64 * 1024);
    let owner = Region::create(&topology(0)?, &cfg)?;
    owner.publish_startup(0)?;

    let stranger = Region::attach(&Topology::new(NodeId(1), NODES, CORES + 1)?, &cfg)?;
    let err = stranger
        .join_startup_timeout(0, Duration::from_secs(1))
        .unwrap_err();
    assert!(matches!(err, RegionError::Attach { .. }), "{err:?}");
    assert!(err.is_fatal());
    Ok(())
}

#[test]
fn nodes_allocate_concurrently_from_one_pool() -> Result<()> {
    let dir = tempdir()?;
    let cfg = RegionConfig::new(dir.path().join("shared-pool.region")).with_size(1 << 20);
    let owner = Region::create(&topology(0)?, &cfg)?;
    let peer = Region::attach(&topology(1)?, &cfg)?;
    owner.publish_startup(0)?;
    peer.join_startup(0)?;

    let workers: Vec<_> = [owner.clone(), peer.clone()]
        .into_iter()
        .map(|region| {
            thread::spawn(move || -> Result<Vec<u64>> {
                let alloc = RegionAlloc::<u64>::new(&region);
                let mut offsets = Vec::new();
                for i in 0..200u64 {
                    let ptr = alloc.allocate(4)?;
                    unsafe { ptr.as_ptr().write(i) };
                    offsets.push(region.offset_of(ptr.as_ptr()).expect("in region").get());
                }
                Ok(offsets)
            })
        })
        .collect();

    let mut all = Vec::new();
    for worker in workers {
        all.extend(worker.join().expect("worker panicked")?);
    }
    let count = all.len();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), count, "two nodes were handed the same block");

    let stats = owner.pool_stats()?;
    assert_eq!(stats.allocations, 400);
    assert_eq!(stats.in_use, 400 * 32);
    Ok(())
}
