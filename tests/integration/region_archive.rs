#![allow(missing_docs)]

use graphheap::archive::{self, Elementwise};
use graphheap::config::RegionConfig;
use graphheap::{Region, RegionError, RegionVec, Result, Topology};
use tempfile::tempdir;

#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(C)]
struct Edge {
    src: u32,
    dst: u32,
    weight: f32,
}
graphheap::plain_archive!(Edge);

fn region(dir: &std::path::Path, name: &str) -> Result<Region> {
    let cfg = RegionConfig::new(dir.join(name)).with_size(4 << 20);
    Region::create(&Topology::single(), &cfg)
}

fn ring(n: u32) -> impl Iterator<Item = Edge> {
    (0..n).map(move |i| Edge {
        src: i,
        dst: (i + 1) % n,
        weight: 1.0 / (i + 1) as f32,
    })
}

#[test]
fn edge_list_moves_between_regions_through_a_file() -> Result<()> {
    let dir = tempdir()?;
    let source = region(dir.path(), "source.region")?;
    let target = region(dir.path(), "target.region")?;
    let snapshot = dir.path().join("edges.bin");

    let mut edges: RegionVec<Edge> = RegionVec::new_in(source.allocator());
    edges.extend(ring(50_000));
    archive::save_to_file(&snapshot, &edges)?;
    assert_eq!(std::fs::metadata(&snapshot)?.len(), 8 + 12 * 50_000);

    let mut loaded: RegionVec<Edge> = RegionVec::new_in(target.allocator());
    archive::load_from_file(&snapshot, &mut loaded)?;
    assert_eq!(loaded.as_slice(), edges.as_slice());
    assert!(target.offset_of(loaded.as_ptr()).is_some());
    assert!(source.offset_of(loaded.as_ptr()).is_none());
    assert!(target.pool_stats()?.in_use >= 12 * 50_000);
    Ok(())
}

#[test]
fn adjacency_lists_keep_their_shape() -> Result<()> {
    let dir = tempdir()?;
    let source = region(dir.path(), "adj-source.region")?;
    let target = region(dir.path(), "adj-target.region")?;

    let mut adjacency: RegionVec<RegionVec<u32>> = RegionVec::new_in(source.allocator());
    for v in 0..300u32 {
        let mut out = RegionVec::new_in(source.allocator());
        // Every seventh vertex is a sink.
        if v % 7 != 0 {
            out.extend((1..=v % 5 + 1).map(|k| (v * k) % 300));
        }
        adjacency.push(out);
    }
    let mut bytes = Vec::new();
    archive::save(&mut bytes, &adjacency)?;

    let mut loaded: RegionVec<RegionVec<u32>> = RegionVec::new_in(target.allocator());
    archive::load(&mut bytes.as_slice(), &mut loaded)?;
    assert_eq!(loaded.len(), adjacency.len());
    for (v, (got, want)) in loaded.iter().zip(adjacency.iter()).enumerate() {
        assert_eq!(got.as_slice(), want.as_slice(), "vertex {v}");
        if !got.is_empty() {
            assert!(target.offset_of(got.as_ptr()).is_some(), "vertex {v}");
        }
    }

    let mut heap: Vec<Vec<u32>> = Vec::new();
    archive::load(&mut bytes.as_slice(), &mut heap)?;
    assert_eq!(heap[1], [1, 2]);
    assert!(heap[0].is_empty() && heap[7].is_empty());
    Ok(())
}

#[test]
fn elementwise_streams_load_into_bulk_region_vectors() -> Result<()> {
    let dir = tempdir()?;
    let target = region(dir.path(), "cross.region")?;

    let wise: Vec<Elementwise<Edge>> = ring(1_000).map(Elementwise).collect();
    let mut bytes = Vec::new();
    archive::save(&mut bytes, &wise)?;

    let mut bulk: RegionVec<Edge> = RegionVec::new_in(target.allocator());
    archive::load(&mut bytes.as_slice(), &mut bulk)?;
    assert!(bulk.iter().copied().eq(ring(1_000)));
    Ok(())
}

#[test]
fn truncated_snapshot_leaves_an_error_not_garbage() -> Result<()> {
    let dir = tempdir()?;
    let source = region(dir.path(), "trunc.region")?;
    let snapshot = dir.path().join("short.bin");

    let mut ranks: RegionVec<f64> = RegionVec::new_in(source.allocator());
    ranks.extend((0..10_000).map(|i| i as f64 * 0.5));
    archive::save_to_file(&snapshot, &ranks)?;
    let file = std::fs::OpenOptions::new().write(true).open(&snapshot)?;
    file.set_len(8 + 8 * 9_999 + 3)?;

    let mut loaded: RegionVec<f64> = RegionVec::new_in(source.allocator());
    let err = archive::load_from_file(&snapshot, &mut loaded).unwrap_err();
    assert!(matches!(err, RegionError::Corrupt(_)), "{err:?}");
    Ok(())
}
