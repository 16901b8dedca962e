mod utils;

use std::collections::HashMap;

use rand::{rngs::StdRng, Rng, SeedableRng};
use test_case::test_case;
use utils::*;
use virtual_map::{Digester, Keccak256Digester, VirtualMapConfig, VirtualMapError};

#[test]
fn test_copy_isolates_versions() {
    let (mut m0, _ds) = new_map();
    m0.put(key(1), value("v1")).unwrap();
    let mut m1 = m0.copy().unwrap();
    m1.put(key(1), value("v2")).unwrap();

    assert_eq!(m0.get(&key(1)).unwrap(), Some(value("v1")));
    assert_eq!(m1.get(&key(1)).unwrap(), Some(value("v2")));
    assert!(m0.is_immutable());
    assert!(m1.is_mutable());
    assert_eq!(m1.version(), m0.version() + 1);
}

#[test]
fn test_copy_reads_equal() {
    let (mut m0, _ds) = new_map();
    for k in 0..20 {
        m0.put(key(k), value(&format!("{k}"))).unwrap();
    }
    let m1 = m0.copy().unwrap();
    for k in 0..20 {
        assert_eq!(m0.get(&key(k)).unwrap(), m1.get(&key(k)).unwrap());
    }
    assert_eq!(m0.size(), m1.size());
}

#[test]
fn test_remove_sole_key() {
    let (mut map, _ds) = new_map();
    map.put(key(7), value("seven")).unwrap();
    assert_eq!(map.remove(&key(7)).unwrap(), Some(value("seven")));
    assert_eq!(map.size(), 0);
    assert!(map.is_empty());
    assert_eq!(map.get(&key(7)).unwrap(), None);
    assert_eq!(map.remove(&key(7)).unwrap(), None);
}

#[test]
fn test_misuse_is_a_programming_error() {
    let (mut m0, _ds) = new_map();
    let _m1 = m0.copy().unwrap();

    let err = m0.put(key(1), value("x")).unwrap_err();
    assert!(matches!(err, VirtualMapError::Immutable(0)));
    assert!(err.is_programming_error());

    let err = m0.copy().unwrap_err();
    assert!(matches!(err, VirtualMapError::AlreadyCopied(0)));
    assert!(err.is_programming_error());

    assert!(matches!(m0.remove(&key(1)), Err(VirtualMapError::Immutable(0))));
}

#[test]
fn test_double_release() {
    let (mut m0, _ds) = new_map();
    let _m1 = m0.copy().unwrap();
    m0.release().unwrap();
    let err = m0.release().unwrap_err();
    assert!(matches!(err, VirtualMapError::Released(0)));
    assert!(err.is_programming_error());
    assert!(matches!(m0.get(&key(1)), Err(VirtualMapError::Released(0))));
    assert!(m0.is_released());
}

#[test]
fn test_root_hash_requires_frozen_version() {
    let (map, _ds) = new_map();
    assert!(matches!(map.root_hash(), Err(VirtualMapError::Mutable(0))));
}

#[test]
fn test_empty_root_hash() {
    let (mut m0, _ds) = new_map();
    let _m1 = m0.copy().unwrap();
    assert_eq!(m0.root_hash().unwrap(), Keccak256Digester.empty_root());
}

#[test]
fn test_root_hash_matches_layout() {
    let (mut m0, _ds) = new_map();
    m0.put(key(1), value("a")).unwrap();
    m0.put(key(2), value("b")).unwrap();
    m0.put(key(3), value("c")).unwrap();
    let _m1 = m0.copy().unwrap();

    // 2 sits at 3, 1 moved to 4, 3 went to 5
    let expected = internal_hash(
        internal_hash(leaf_hash(1, "a"), leaf_hash(3, "c")),
        leaf_hash(2, "b"),
    );
    assert_eq!(m0.root_hash().unwrap(), expected);
}

#[test]
fn test_single_leaf_root_hash() {
    let (mut m0, _ds) = new_map();
    m0.put(key(1), value("a")).unwrap();
    let _m1 = m0.copy().unwrap();
    let expected = internal_hash(leaf_hash(1, "a"), virtual_map::Hash::NULL);
    assert_eq!(m0.root_hash().unwrap(), expected);
}

fn frozen_root(build: impl FnOnce(&mut TestMap)) -> virtual_map::Hash {
    let (mut m0, _ds) = new_map();
    build(&mut m0);
    let _m1 = m0.copy().unwrap();
    m0.root_hash().unwrap()
}

#[test]
fn test_hash_ignores_overwritten_values() {
    let direct = frozen_root(|m| {
        m.put(key(1), value("a")).unwrap();
        m.put(key(2), value("b")).unwrap();
    });
    let updated = frozen_root(|m| {
        m.put(key(1), value("old")).unwrap();
        m.put(key(2), value("b")).unwrap();
        m.put(key(1), value("a")).unwrap();
    });
    assert_eq!(direct, updated);
}

#[test]
fn test_hash_ignores_transient_keys() {
    let direct = frozen_root(|m| {
        for k in [1, 2, 3] {
            m.put(key(k), value("x")).unwrap();
        }
    });
    // the transient key leaves the other leaves where a direct build puts them
    let transient = frozen_root(|m| {
        m.put(key(1), value("x")).unwrap();
        m.put(key(99), value("gone")).unwrap();
        m.put(key(2), value("x")).unwrap();
        m.remove(&key(99)).unwrap();
        m.put(key(3), value("x")).unwrap();
    });
    assert_eq!(direct, transient);
}

#[test]
fn test_hash_same_across_copies() {
    let (mut single, _ds) = new_map();
    for k in 0..12 {
        single.put(key(k), value(&k.to_string())).unwrap();
    }
    let _next = single.copy().unwrap();

    let (mut m, _ds2) = new_map();
    let mut kept = Vec::new();
    for k in 0..12 {
        m.put(key(k), value(&k.to_string())).unwrap();
        if k % 4 == 3 {
            let next = m.copy().unwrap();
            kept.push(std::mem::replace(&mut m, next));
        }
    }
    let _last = m.copy().unwrap();
    assert_eq!(single.root_hash().unwrap(), m.root_hash().unwrap());
    // older versions hash to their own content
    assert_ne!(kept[0].root_hash().unwrap(), m.root_hash().unwrap());
}

#[test]
fn test_hash_changes_with_value() {
    let a = frozen_root(|m| m.put(key(1), value("a")).unwrap());
    let b = frozen_root(|m| m.put(key(1), value("b")).unwrap());
    assert_ne!(a, b);
}

#[test_case(1; "one seed")]
#[test_case(7; "another seed")]
#[test_case(42; "third seed")]
fn test_size_tracks_live_keys(seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let (mut map, _ds) = new_map();
    let mut model = HashMap::new();
    for step in 0..600 {
        let k = rng.gen_range(0..60);
        if rng.gen_bool(0.6) {
            let v = format!("{step}");
            map.put(key(k), value(&v)).unwrap();
            model.insert(k, v);
        } else {
            let removed = map.remove(&key(k)).unwrap();
            assert_eq!(removed.map(|v| v.0), model.remove(&k));
        }
        if step % 50 == 49 {
            let next = map.copy().unwrap();
            drop(std::mem::replace(&mut map, next));
        }
        assert_eq!(map.size(), model.len() as u64);
    }
    for k in 0..60 {
        assert_eq!(map.get(&key(k)).unwrap().map(|v| v.0), model.get(&k).cloned());
    }
}

#[test]
fn test_replace_and_contains() {
    let (mut map, _ds) = new_map();
    assert!(matches!(
        map.replace(key(1), value("a")),
        Err(VirtualMapError::KeyNotFound)
    ));
    map.put(key(1), value("a")).unwrap();
    assert!(map.contains_key(&key(1)).unwrap());
    assert!(!map.contains_key(&key(2)).unwrap());
    assert_eq!(map.replace(key(1), value("b")).unwrap(), value("a"));
    assert_eq!(map.get(&key(1)).unwrap(), Some(value("b")));
    assert_eq!(map.size(), 1);
}

#[test]
fn test_get_for_modify_leaves_older_version_alone() {
    let (mut m0, _ds) = new_map();
    m0.put(key(1), value("a")).unwrap();
    let mut m1 = m0.copy().unwrap();

    assert!(m1.get_for_modify(&key(1), |v| v.0.push('!')).unwrap());
    assert!(!m1.get_for_modify(&key(2), |v| v.0.push('!')).unwrap());
    assert_eq!(m1.get(&key(1)).unwrap(), Some(value("a!")));
    assert_eq!(m0.get(&key(1)).unwrap(), Some(value("a")));
}

#[test]
fn test_maximum_size() {
    let config = VirtualMapConfig::builder().maximum_size(3).size_warning_threshold(2).build();
    let (mut map, _ds) = new_map_with(config);
    for k in 0..3 {
        map.put(key(k), value("x")).unwrap();
    }
    assert!(matches!(map.put(key(3), value("x")), Err(VirtualMapError::Full(3))));
    // overwriting does not grow the map
    map.put(key(0), value("y")).unwrap();
    map.remove(&key(1)).unwrap();
    map.put(key(3), value("x")).unwrap();
    assert_eq!(map.size(), 3);
}

#[test]
fn test_reserve_keeps_version_alive() {
    let (mut m0, _ds) = new_map();
    m0.put(key(1), value("a")).unwrap();
    let m1 = m0.copy().unwrap();
    let reader = m0.reserve().unwrap();
    m0.release().unwrap();
    assert!(!reader.is_destroyed());
    assert_eq!(reader.get(&key(1)).unwrap(), Some(value("a")));
    reader.release().unwrap();
    assert!(eventually(std::time::Duration::from_secs(5), || reader.is_destroyed()));
    assert_eq!(m1.get(&key(1)).unwrap(), Some(value("a")));
}

#[test]
fn test_label_and_debug() {
    let (map, _ds) = new_map();
    assert_eq!(map.label(), "test");
    let dbg = format!("{map:?}");
    assert!(dbg.contains("test"));
}

#[test]
fn test_load_failures_reach_the_caller() {
    let (mut m0, ds) = new_map();
    m0.put(key(1), value("a")).unwrap();
    m0.put(key(2), value("b")).unwrap();
    let mut m1 = m0.copy().unwrap();
    m0.wait_until_flushed().unwrap();
    m0.release().unwrap();
    assert!(m0.is_destroyed());

    ds.set_fail_loads(true);
    assert!(matches!(m1.get(&key(1)), Err(VirtualMapError::DataSource(_))));
    assert!(matches!(m1.remove(&key(1)), Err(VirtualMapError::DataSource(_))));
    assert!(matches!(m1.put(key(3), value("c")), Err(VirtualMapError::DataSource(_))));
    assert_eq!(m1.size(), 2);

    ds.set_fail_loads(false);
    assert_eq!(m1.get(&key(1)).unwrap(), Some(value("a")));
    assert_eq!(m1.get(&key(2)).unwrap(), Some(value("b")));
    assert_eq!(m1.get(&key(3)).unwrap(), None);
    assert!(!m1.is_empty());
}
