mod utils;

use std::time::Duration;

use utils::*;
use virtual_map::{DataSource, FlushConfig, VirtualMapConfig, VirtualMapError};

const TIMEOUT: Duration = Duration::from_secs(10);

#[test]
fn test_flush_persists_version() {
    let (mut m0, ds) = new_map();
    m0.put(key(1), value("a")).unwrap();
    m0.put(key(2), value("b")).unwrap();
    let m1 = m0.copy().unwrap();

    m0.wait_until_flushed().unwrap();
    assert!(m0.is_flushed());
    assert_eq!(ds.leaf_count(), 2);
    assert_eq!(ds.leaf_range().unwrap().size(), 2);
    let stored = ds.load_leaf_by_key(&key(2)).unwrap().unwrap();
    assert_eq!(stored.path, 3);
    assert_eq!(stored.hash, leaf_hash(2, "b"));
    assert_eq!(ds.load_internal_hash(1).unwrap(), Some(m0.root_hash().unwrap()));

    let stats = m1.statistics();
    assert!(stats.flushes >= 1);
    assert_eq!(stats.flushed_leaves, 2);
}

#[test]
fn test_flush_waits_for_older_readers() {
    let (mut m0, _ds) = new_map();
    m0.put(key(1), value("a")).unwrap();
    let mut m1 = m0.copy().unwrap();
    m1.put(key(2), value("b")).unwrap();
    let m2 = m1.copy().unwrap();

    m0.wait_until_flushed().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    // m0 is still readable, so m1 cannot reach the data source yet
    assert!(!m1.is_flushed());
    assert_eq!(m0.get(&key(2)).unwrap(), None);

    m0.release().unwrap();
    m1.wait_until_flushed().unwrap();
    assert!(eventually(TIMEOUT, || m0.is_destroyed()));
    assert_eq!(m2.get(&key(1)).unwrap(), Some(value("a")));
    assert_eq!(m2.get(&key(2)).unwrap(), Some(value("b")));
}

#[test]
fn test_reads_fall_through_to_data_source() {
    let (mut m0, ds) = new_map();
    for k in 0..3 {
        m0.put(key(k), value("x")).unwrap();
    }
    let mut m1 = m0.copy().unwrap();
    m0.wait_until_flushed().unwrap();
    m0.release().unwrap();
    assert!(m0.is_destroyed());

    m1.put(key(3), value("x")).unwrap();
    for k in 0..4 {
        assert_eq!(m1.get(&key(k)).unwrap(), Some(value("x")));
    }
    let _m2 = m1.copy().unwrap();
    let (mut direct, _ds2) = new_map();
    for k in 0..4 {
        direct.put(key(k), value("x")).unwrap();
    }
    let _next = direct.copy().unwrap();
    assert_eq!(m1.root_hash().unwrap(), direct.root_hash().unwrap());

    m1.wait_until_flushed().unwrap();
    assert_eq!(ds.leaf_count(), 4);
}

#[test]
fn test_skipped_versions_are_merged() {
    let config = VirtualMapConfig::builder()
        .flush(FlushConfig::builder().flush_interval(3).build())
        .build();
    let (mut map, ds) = new_map_with(config);
    let mut frozen = Vec::new();
    for k in 0..4 {
        map.put(key(k), value(&k.to_string())).unwrap();
        let next = map.copy().unwrap();
        frozen.push(std::mem::replace(&mut map, next));
    }
    assert!(matches!(
        frozen[1].wait_until_flushed(),
        Err(VirtualMapError::NotFlushable(1))
    ));

    let v3 = frozen.pop().unwrap();
    frozen.clear();
    v3.wait_until_flushed().unwrap();

    let stats = map.statistics();
    assert_eq!(stats.flushes, 2);
    assert_eq!(stats.merges, 2);
    assert_eq!(ds.leaf_count(), 4);
    for k in 0..4 {
        assert_eq!(map.get(&key(k)).unwrap(), Some(value(&k.to_string())));
    }
}

#[test]
fn test_enable_flush_overrides_interval() {
    let config = VirtualMapConfig::builder()
        .flush(FlushConfig::builder().flush_interval(100).build())
        .build();
    let (mut m0, _ds) = new_map_with(config);
    m0.put(key(1), value("a")).unwrap();
    let mut m1 = m0.copy().unwrap();
    m1.put(key(2), value("b")).unwrap();
    let _m2 = m1.copy().unwrap();

    m0.release().unwrap();
    m1.enable_flush().unwrap();
    m1.wait_until_flushed().unwrap();
    assert!(m1.is_flushed());
}

#[test]
fn test_save_failure_stops_pipeline() {
    let (mut m0, ds) = new_map();
    ds.set_fail_saves(true);
    m0.put(key(1), value("a")).unwrap();
    let mut m1 = m0.copy().unwrap();

    let err = m0.wait_until_flushed().unwrap_err();
    assert!(matches!(err, VirtualMapError::PipelineFailed(_)));
    assert!(!err.is_programming_error());
    assert!(matches!(m1.copy(), Err(VirtualMapError::PipelineFailed(_))));
    // reads still work on what is in memory
    assert_eq!(m1.get(&key(1)).unwrap(), Some(value("a")));
    assert!(eventually(TIMEOUT, || ds.is_closed()));
}

#[test]
fn test_data_source_closed_after_last_release() {
    let (mut m0, ds) = new_map();
    m0.put(key(1), value("a")).unwrap();
    let m1 = m0.copy().unwrap();
    drop(m0);
    assert!(!ds.is_closed());
    drop(m1);
    assert!(ds.is_closed());
    assert_eq!(ds.leaf_count(), 1);
}

#[test]
fn test_terminate() {
    let (mut m0, ds) = new_map();
    m0.put(key(1), value("a")).unwrap();
    let m1 = m0.copy().unwrap();
    m1.terminate();
    assert!(ds.is_closed());
    assert!(matches!(
        m1.wait_until_flushed(),
        Err(VirtualMapError::PipelineTerminated)
    ));
}

#[test]
fn test_concurrent_root_hash() {
    let (mut m0, _ds) = new_map();
    for k in 0..200 {
        m0.put(key(k), value(&format!("value {k}"))).unwrap();
    }
    let _m1 = m0.copy().unwrap();
    let hashes: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8).map(|_| s.spawn(|| m0.root_hash().unwrap())).collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(hashes.iter().all(|h| *h == hashes[0]));
    assert_eq!(m0.root_hash().unwrap(), hashes[0]);
}

#[test]
fn test_flush_statistics_backlog() {
    let (mut map, _ds) = new_map();
    let mut frozen = Vec::new();
    for k in 0..3 {
        map.put(key(k), value("x")).unwrap();
        let next = map.copy().unwrap();
        frozen.push(std::mem::replace(&mut map, next));
    }
    frozen[0].wait_until_flushed().unwrap();
    // the later versions wait behind the unreleased first one
    assert_eq!(map.statistics().backlog, 2);
    frozen.clear();
    assert!(eventually(TIMEOUT, || map.statistics().backlog == 0));
}

#[test]
fn test_terminated_lineage_reclaims_released_versions() {
    let (mut m0, _ds) = new_map();
    m0.put(key(0), value("a")).unwrap();
    let mut m1 = m0.copy().unwrap();
    m1.put(key(1), value("b")).unwrap();
    let mut m2 = m1.copy().unwrap();
    m2.terminate();

    assert!(matches!(m2.copy(), Err(VirtualMapError::PipelineTerminated)));
    assert!(m2.is_mutable());

    m1.release().unwrap();
    assert!(m1.is_destroyed());
    assert_eq!(m2.get(&key(1)).unwrap(), Some(value("b")));
    m0.release().unwrap();
    assert!(m0.is_destroyed());
    assert_eq!(m2.size(), 2);
}
