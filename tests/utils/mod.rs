#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use virtual_map::{
    DataSource, Digester, Hash, Keccak256Digester, MemDataSource, SelfSerializable, VirtualKey, VirtualMap,
    VirtualMapConfig, VirtualValue,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestKey(pub u64);

impl SelfSerializable for TestKey {
    const CLASS_ID: u64 = 0x7e57_0001;
}

impl VirtualKey for TestKey {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestValue(pub String);

impl SelfSerializable for TestValue {
    const CLASS_ID: u64 = 0x7e57_0002;
}

impl VirtualValue for TestValue {}

pub fn key(k: u64) -> TestKey {
    TestKey(k)
}

pub fn value(v: &str) -> TestValue {
    TestValue(v.to_string())
}

pub type TestMap = VirtualMap<TestKey, TestValue>;

pub fn new_map() -> (TestMap, Arc<MemDataSource<TestKey, TestValue>>) {
    new_map_with(VirtualMapConfig::builder().label("test").build())
}

pub fn new_map_with(config: VirtualMapConfig) -> (TestMap, Arc<MemDataSource<TestKey, TestValue>>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let ds = Arc::new(MemDataSource::new());
    let map = VirtualMap::new(ds.clone() as Arc<dyn DataSource<_, _>>, config).unwrap();
    (map, ds)
}

/// Hash of a leaf as the map computes it.
pub fn leaf_hash(k: u64, v: &str) -> Hash {
    Keccak256Digester.digest_leaf(&key(k).to_bytes().unwrap(), &value(v).to_bytes().unwrap())
}

pub fn internal_hash(left: Hash, right: Hash) -> Hash {
    Keccak256Digester.digest_internal(&left, &right)
}

/// Polls `cond` until it holds or `timeout` expires.
pub fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
