// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! The durable store behind a map lineage.
//!
//! A [`DataSource`] holds the state of the newest flushed version. Everything
//! newer lives in the in-memory version chain, so the map only asks the data
//! source for positions and keys no retained version has touched.

use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;
use thiserror::Error;

use crate::codec::{read_framed, write_framed, CodecError};
use crate::logger::{debug, trace};
use crate::path::{LeafRange, Path};
use crate::record::{Hash, InternalRecord, LeafRecord, VirtualKey, VirtualValue, HASH_LEN};

#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error("data source is closed")]
    Closed,
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("inconsistent data source: {0}")]
    Corrupted(String),
}

/// Everything a flushed version changed, applied to the store as one unit.
#[derive(Debug)]
pub struct FlushBatch<K, V> {
    /// Leaf range after the batch is applied.
    pub range: LeafRange,
    pub dirty_leaves: Vec<LeafRecord<K, V>>,
    pub deleted_keys: Vec<K>,
    pub dirty_internal: Vec<InternalRecord>,
}

impl<K, V> FlushBatch<K, V> {
    pub fn is_empty(&self) -> bool {
        self.dirty_leaves.is_empty() && self.deleted_keys.is_empty() && self.dirty_internal.is_empty()
    }
}

pub trait DataSource<K, V>: Send + Sync {
    /// Leaf range of the last saved state.
    fn leaf_range(&self) -> Result<LeafRange, DataSourceError>;

    fn load_leaf_by_path(&self, path: Path) -> Result<Option<LeafRecord<K, V>>, DataSourceError>;

    fn load_leaf_by_key(&self, key: &K) -> Result<Option<LeafRecord<K, V>>, DataSourceError>;

    fn load_internal_hash(&self, path: Path) -> Result<Option<Hash>, DataSourceError>;

    /// Applies `batch` atomically: either every change is visible afterwards
    /// or none is. Positions outside the new leaf range, and internal hashes
    /// at positions that are now leaves, are dropped.
    fn save_changes(&self, batch: FlushBatch<K, V>) -> Result<(), DataSourceError>;

    fn close(&self) -> Result<(), DataSourceError>;
}

struct StoredLeaf<K> {
    key: K,
    encoded: Vec<u8>,
}

struct MemState<K> {
    range: LeafRange,
    leaves: BTreeMap<Path, StoredLeaf<K>>,
    keys: HashMap<K, Path>,
    internal: BTreeMap<Path, Hash>,
}

/// A data source keeping its records encoded in memory.
///
/// Records go through the same key/value encoding a persistent store would
/// use. It can also be told to fail its saves, to exercise the error paths of
/// the flush pipeline.
pub struct MemDataSource<K, V> {
    state: RwLock<MemState<K>>,
    closed: AtomicBool,
    fail_saves: AtomicBool,
    fail_loads: AtomicBool,
    saves: AtomicUsize,
    _value: PhantomData<fn() -> V>,
}

impl<K: VirtualKey, V: VirtualValue> Default for MemDataSource<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: VirtualKey, V: VirtualValue> MemDataSource<K, V> {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemState {
                range: LeafRange::empty(),
                leaves: BTreeMap::new(),
                keys: HashMap::new(),
                internal: BTreeMap::new(),
            }),
            closed: AtomicBool::new(false),
            fail_saves: AtomicBool::new(false),
            fail_loads: AtomicBool::new(false),
            saves: AtomicUsize::new(0),
            _value: PhantomData,
        }
    }

    /// Makes every following [`DataSource::save_changes`] fail until reset.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst)
    }

    /// Makes every following load fail until reset.
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of batches applied so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn leaf_count(&self) -> usize {
        self.state.read().leaves.len()
    }

    fn check_open(&self) -> Result<(), DataSourceError> {
        if self.is_closed() {
            return Err(DataSourceError::Closed)
        }
        Ok(())
    }

    fn check_load(&self) -> Result<(), DataSourceError> {
        self.check_open()?;
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(DataSourceError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected load failure",
            )))
        }
        Ok(())
    }

    fn encode(record: &LeafRecord<K, V>) -> Result<Vec<u8>, DataSourceError> {
        let mut encoded = Vec::new();
        write_framed(&mut encoded, &record.key.to_bytes()?)?;
        write_framed(&mut encoded, &record.value.to_bytes()?)?;
        encoded.extend_from_slice(&record.hash.0);
        Ok(encoded)
    }

    fn decode(path: Path, encoded: &[u8]) -> Result<LeafRecord<K, V>, DataSourceError> {
        let (key, rest) = read_framed(encoded)?;
        let (value, rest) = read_framed(rest)?;
        let hash: [u8; HASH_LEN] = rest
            .try_into()
            .map_err(|_| DataSourceError::Corrupted(format!("bad leaf hash at path {path}")))?;
        Ok(LeafRecord {
            path,
            key: K::deserialize_from(key, K::CLASS_VERSION)?,
            value: V::deserialize_from(value, V::CLASS_VERSION)?,
            hash: Hash(hash),
        })
    }
}

impl<K: VirtualKey, V: VirtualValue> DataSource<K, V> for MemDataSource<K, V> {
    fn leaf_range(&self) -> Result<LeafRange, DataSourceError> {
        self.check_open()?;
        Ok(self.state.read().range)
    }

    fn load_leaf_by_path(&self, path: Path) -> Result<Option<LeafRecord<K, V>>, DataSourceError> {
        self.check_load()?;
        let state = self.state.read();
        state
            .leaves
            .get(&path)
            .map(|leaf| Self::decode(path, &leaf.encoded))
            .transpose()
    }

    fn load_leaf_by_key(&self, key: &K) -> Result<Option<LeafRecord<K, V>>, DataSourceError> {
        self.check_load()?;
        let state = self.state.read();
        let Some(&path) = state.keys.get(key) else {
            return Ok(None)
        };
        let leaf = state
            .leaves
            .get(&path)
            .ok_or_else(|| DataSourceError::Corrupted(format!("key {key:?} points at empty path {path}")))?;
        Self::decode(path, &leaf.encoded).map(Some)
    }

    fn load_internal_hash(&self, path: Path) -> Result<Option<Hash>, DataSourceError> {
        self.check_load()?;
        Ok(self.state.read().internal.get(&path).copied())
    }

    fn save_changes(&self, batch: FlushBatch<K, V>) -> Result<(), DataSourceError> {
        self.check_open()?;
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(DataSourceError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected save failure",
            )))
        }
        // encode up front so a codec failure leaves the state untouched
        let encoded = batch
            .dirty_leaves
            .iter()
            .map(Self::encode)
            .collect::<Result<Vec<_>, _>>()?;

        let mut state = self.state.write();
        let MemState {
            range,
            leaves,
            keys,
            internal,
        } = &mut *state;

        for key in batch.deleted_keys {
            if let Some(path) = keys.remove(&key) {
                if leaves.get(&path).is_some_and(|leaf| leaf.key == key) {
                    leaves.remove(&path);
                }
            }
        }
        for (record, encoded) in batch.dirty_leaves.into_iter().zip(encoded) {
            if let Some(old) = keys.insert(record.key.clone(), record.path) {
                if old != record.path && leaves.get(&old).is_some_and(|leaf| leaf.key == record.key) {
                    leaves.remove(&old);
                }
            }
            leaves.insert(
                record.path,
                StoredLeaf {
                    key: record.key,
                    encoded,
                },
            );
        }
        for InternalRecord { path, hash } in batch.dirty_internal {
            internal.insert(path, hash);
        }

        *range = batch.range;
        let new_range = batch.range;
        leaves.retain(|path, leaf| {
            let keep = new_range.is_leaf(*path);
            if !keep && keys.get(&leaf.key) == Some(path) {
                keys.remove(&leaf.key);
            }
            keep
        });
        internal.retain(|path, _| new_range.is_internal(*path));

        self.saves.fetch_add(1, Ordering::SeqCst);
        trace!(
            "saved batch, range {:?}, {} leaves stored",
            new_range,
            leaves.len()
        );
        Ok(())
    }

    fn close(&self) -> Result<(), DataSourceError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("closing in-memory data source");
        }
        Ok(())
    }
}
