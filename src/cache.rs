// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! Per-version dirty state.
//!
//! A [`VersionCache`] records what one version changed relative to its
//! parent: leaves by key (or their deletion), which key sits at each position
//! it touched, and the hashes computed for it. Anything it does not know is
//! looked up in older versions and finally in the data source.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::RwLock;

use crate::path::{LeafRange, Path};
use crate::record::{Hash, VirtualKey, VirtualValue};

/// Result of asking one version about a key or position.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Lookup<T> {
    Found(T),
    /// The version removed it, older versions must not be consulted.
    Deleted,
    /// The version never touched it.
    Unknown,
}

#[derive(Debug, Clone)]
pub(crate) struct DirtyLeaf<V> {
    pub path: Path,
    pub value: V,
}

struct CacheState<K, V> {
    range: LeafRange,
    /// `None` marks a key this version removed.
    leaves: HashMap<K, Option<DirtyLeaf<V>>>,
    /// `None` marks a position this version emptied.
    paths: HashMap<Path, Option<K>>,
    hashes: HashMap<Path, Hash>,
    dirty: BTreeSet<Path>,
}

pub(crate) struct VersionCache<K, V> {
    state: RwLock<CacheState<K, V>>,
}

impl<K: VirtualKey, V: VirtualValue> VersionCache<K, V> {
    pub fn new(range: LeafRange) -> Self {
        Self {
            state: RwLock::new(CacheState {
                range,
                leaves: HashMap::new(),
                paths: HashMap::new(),
                hashes: HashMap::new(),
                dirty: BTreeSet::new(),
            }),
        }
    }

    pub fn range(&self) -> LeafRange {
        self.state.read().range
    }

    pub fn set_range(&self, range: LeafRange) {
        self.state.write().range = range
    }

    pub fn leaf(&self, key: &K) -> Lookup<DirtyLeaf<V>> {
        match self.state.read().leaves.get(key) {
            Some(Some(leaf)) => Lookup::Found(leaf.clone()),
            Some(None) => Lookup::Deleted,
            None => Lookup::Unknown,
        }
    }

    pub fn key_at(&self, path: Path) -> Lookup<K> {
        match self.state.read().paths.get(&path) {
            Some(Some(key)) => Lookup::Found(key.clone()),
            Some(None) => Lookup::Deleted,
            None => Lookup::Unknown,
        }
    }

    pub fn hash(&self, path: Path) -> Option<Hash> {
        self.state.read().hashes.get(&path).copied()
    }

    /// Places `key` at `path` with `value`, replacing whatever was there. A
    /// value this version held for `key` before is released.
    pub fn put_leaf(&self, key: K, path: Path, value: V) {
        let mut state = self.state.write();
        state.paths.insert(path, Some(key.clone()));
        if let Some(Some(mut replaced)) = state.leaves.insert(key, Some(DirtyLeaf { path, value })) {
            replaced.value.release();
        }
        state.dirty.insert(path);
    }

    pub fn delete_leaf(&self, key: K) {
        self.state.write().leaves.insert(key, None);
    }

    /// Marks `path` as no longer holding a leaf.
    pub fn clear_path(&self, path: Path) {
        let mut state = self.state.write();
        state.paths.insert(path, None);
        state.dirty.insert(path);
    }

    /// Leaves this version wrote that are still in its leaf range, keyed by
    /// path.
    pub fn dirty_leaves(&self) -> BTreeMap<Path, (K, V)> {
        let state = self.state.read();
        state
            .leaves
            .iter()
            .filter_map(|(key, leaf)| leaf.as_ref().map(|leaf| (key, leaf)))
            .filter(|(_, leaf)| state.range.is_leaf(leaf.path))
            .map(|(key, leaf)| (leaf.path, (key.clone(), leaf.value.clone())))
            .collect()
    }

    pub fn deleted_keys(&self) -> Vec<K> {
        let state = self.state.read();
        state
            .leaves
            .iter()
            .filter(|(_, leaf)| leaf.is_none())
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn dirty_paths(&self) -> BTreeSet<Path> {
        self.state.read().dirty.clone()
    }

    pub fn store_hashes(&self, hashes: impl IntoIterator<Item = (Path, Hash)>) {
        self.state.write().hashes.extend(hashes)
    }

    /// Internal hashes held for positions above the leaf range.
    pub fn internal_hashes(&self) -> Vec<(Path, Hash)> {
        let state = self.state.read();
        let mut hashes: Vec<_> = state
            .hashes
            .iter()
            .filter(|(path, _)| state.range.is_internal(**path))
            .map(|(path, hash)| (*path, *hash))
            .collect();
        hashes.sort_unstable_by_key(|(path, _)| *path);
        hashes
    }

    /// Folds the changes of the version right below this one into this
    /// version, so that the older one can be dropped. Entries this version
    /// already has win.
    ///
    /// Values move over and are owned by this version from then on. The older
    /// cache keeps only the values this version overrides.
    pub fn absorb(&self, older: &VersionCache<K, V>) {
        let mut older = older.state.write();
        let mut state = self.state.write();
        for (key, leaf) in std::mem::take(&mut older.leaves) {
            match state.leaves.entry(key) {
                Entry::Vacant(entry) => {
                    entry.insert(leaf);
                }
                Entry::Occupied(entry) => {
                    older.leaves.insert(entry.key().clone(), leaf);
                }
            }
        }
        for (path, key) in older.paths.iter() {
            state.paths.entry(*path).or_insert_with(|| key.clone());
        }
        for (path, hash) in older.hashes.iter() {
            state.hashes.entry(*path).or_insert(*hash);
        }
        state.dirty.extend(older.dirty.iter().copied());
    }

    /// Drops every value this version owns, calling their release hook.
    pub fn release_values(&self) {
        let mut state = self.state.write();
        for (_, leaf) in state.leaves.drain() {
            if let Some(mut leaf) = leaf {
                leaf.value.release();
            }
        }
        state.paths.clear();
        state.hashes.clear();
        state.dirty.clear();
    }
}
