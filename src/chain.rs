// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! The versions of one map lineage and everything that moves them through
//! their lifecycle.
//!
//! Versions live in an arena keyed by their number. The newest one is the
//! only mutable version; every read walks from the requested version down to
//! the oldest retained one and then falls through to the data source, which
//! holds the state of the newest flushed version.
//!
//! A version is flushed only once it is frozen and hashed and every older
//! version has been released and flushed (or merged into a newer one). The
//! data source therefore never moves past a version somebody can still read
//! through the chain.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::cache::{Lookup, VersionCache};
use crate::datasource::{DataSource, FlushBatch};
use crate::hasher::{self, Digester, HashJob, HashLookupError};
use crate::logger::{debug, error, info, trace, warn};
use crate::map::{VirtualMapConfig, VirtualMapError};
use crate::path::{LeafRange, Path, ROOT_PATH};
use crate::pipeline::{FlushConfig, FlushCounters, FlushStatistics, PipelineRequester};
use crate::record::{Hash, InternalRecord, LeafRecord, VirtualKey, VirtualValue};

const PROGRESS_POLL: Duration = Duration::from_millis(50);

pub(crate) struct Version<K, V> {
    id: u64,
    cache: VersionCache<K, V>,
    /// Leaf range of the parent version when this one was created.
    prev_range: LeafRange,
    root_hash: OnceLock<Hash>,
    reservations: AtomicUsize,
    immutable: AtomicBool,
    should_flush: AtomicBool,
    flushed: AtomicBool,
    merged: AtomicBool,
    released: AtomicBool,
    destroyed: AtomicBool,
}

impl<K: VirtualKey, V: VirtualValue> Version<K, V> {
    fn new(id: u64, range: LeafRange, should_flush: bool) -> Self {
        Self {
            id,
            cache: VersionCache::new(range),
            prev_range: range,
            root_hash: OnceLock::new(),
            reservations: AtomicUsize::new(1),
            immutable: AtomicBool::new(false),
            should_flush: AtomicBool::new(should_flush),
            flushed: AtomicBool::new(false),
            merged: AtomicBool::new(false),
            released: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn range(&self) -> LeafRange {
        self.cache.range()
    }

    pub fn is_immutable(&self) -> bool {
        self.immutable.load(Ordering::SeqCst)
    }

    pub fn should_flush(&self) -> bool {
        self.should_flush.load(Ordering::SeqCst)
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Whether the pipeline is done with this version.
    fn is_retired(&self) -> bool {
        self.is_flushed() || self.merged.load(Ordering::SeqCst)
    }

    fn is_hashed(&self) -> bool {
        self.root_hash.get().is_some()
    }
}

struct SizeLimits {
    maximum: u64,
    warning_threshold: u64,
    warning_interval: u64,
}

pub(crate) struct VersionChain<K, V> {
    label: String,
    versions: RwLock<BTreeMap<u64, Arc<Version<K, V>>>>,
    data_source: Arc<dyn DataSource<K, V>>,
    digester: Arc<dyn Digester>,
    flush: FlushConfig,
    limits: SizeLimits,
    requester: PipelineRequester,
    next_id: AtomicU64,
    /// Serializes hashing so versions are hashed strictly in order.
    hash_lock: Mutex<()>,
    /// Set once the mutable version was released without being copied.
    lineage_ended: AtomicBool,
    finished: AtomicBool,
    failure: Mutex<Option<String>>,
    progress: Mutex<()>,
    progress_cv: Condvar,
    counters: FlushCounters,
}

impl<K: VirtualKey, V: VirtualValue> VersionChain<K, V> {
    /// Builds a lineage on top of `data_source`, returning it with its first
    /// mutable version.
    pub fn new(
        config: &VirtualMapConfig,
        data_source: Arc<dyn DataSource<K, V>>,
        requester: PipelineRequester,
    ) -> Result<(Self, Arc<Version<K, V>>), VirtualMapError> {
        let range = data_source.leaf_range()?;
        let first = Arc::new(Version::new(0, range, config.flush.selects(0)));
        let chain = Self {
            label: config.label.clone(),
            versions: RwLock::new([(0, first.clone())].into()),
            data_source,
            digester: config.digester.clone(),
            flush: config.flush.clone(),
            limits: SizeLimits {
                maximum: config.maximum_size,
                warning_threshold: config.size_warning_threshold,
                warning_interval: config.size_warning_interval.max(1),
            },
            requester,
            next_id: AtomicU64::new(1),
            hash_lock: Mutex::new(()),
            lineage_ended: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            failure: Mutex::new(None),
            progress: Mutex::new(()),
            progress_cv: Condvar::new(),
            counters: FlushCounters::default(),
        };
        debug!("[{}] opened with {} leaves", chain.label, range.size());
        Ok((chain, first))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Asks the versions `id` and older, newest first, until one of them
    /// knows the answer.
    fn walk<T>(&self, id: u64, mut probe: impl FnMut(&VersionCache<K, V>) -> Lookup<T>) -> Lookup<T> {
        let versions = self.versions.read();
        for (_, version) in versions.range(..=id).rev() {
            match probe(&version.cache) {
                Lookup::Unknown => continue,
                known => return known,
            }
        }
        Lookup::Unknown
    }

    pub fn find_leaf(&self, id: u64, key: &K) -> Result<Option<(Path, V)>, VirtualMapError> {
        match self.walk(id, |cache| cache.leaf(key)) {
            Lookup::Found(leaf) => Ok(Some((leaf.path, leaf.value))),
            Lookup::Deleted => Ok(None),
            Lookup::Unknown => Ok(self
                .data_source
                .load_leaf_by_key(key)?
                .map(|record| (record.path, record.value))),
        }
    }

    pub fn leaf_at(&self, id: u64, path: Path) -> Result<Option<(K, V)>, VirtualMapError> {
        match self.walk(id, |cache| cache.key_at(path)) {
            Lookup::Found(key) => match self.find_leaf(id, &key)? {
                Some((found, value)) if found == path => Ok(Some((key, value))),
                _ => Err(VirtualMapError::Inconsistent(format!(
                    "version {id} maps path {path} to {key:?}, which is not there"
                ))),
            },
            Lookup::Deleted => Ok(None),
            Lookup::Unknown => Ok(self
                .data_source
                .load_leaf_by_path(path)?
                .map(|record| (record.key, record.value))),
        }
    }

    fn hash_at(&self, id: u64, path: Path, is_leaf: bool) -> Result<Option<Hash>, VirtualMapError> {
        let cached = self.walk(id, |cache| match cache.hash(path) {
            Some(hash) => Lookup::Found(hash),
            None => Lookup::Unknown,
        });
        if let Lookup::Found(hash) = cached {
            return Ok(Some(hash))
        }
        Ok(if is_leaf {
            self.data_source
                .load_leaf_by_path(path)?
                .map(|record| record.hash)
        } else {
            self.data_source.load_internal_hash(path)?
        })
    }

    fn leaf_at_or_fail(&self, id: u64, path: Path) -> Result<(K, V), VirtualMapError> {
        self.leaf_at(id, path)?.ok_or_else(|| {
            VirtualMapError::Inconsistent(format!("version {id} has no leaf at path {path}"))
        })
    }

    pub fn put(&self, version: &Version<K, V>, key: K, value: V) -> Result<(), VirtualMapError> {
        let id = version.id;
        if let Some((path, _)) = self.find_leaf(id, &key)? {
            version.cache.put_leaf(key, path, value);
            return Ok(())
        }

        let mut range = version.range();
        self.check_capacity(range.size())?;
        let growth = range.grow();
        if let Some((from, to)) = growth.moved {
            let (moved_key, moved_value) = self.leaf_at_or_fail(id, from)?;
            version.cache.put_leaf(moved_key, to, moved_value.copy());
            version.cache.clear_path(from);
        }
        version.cache.put_leaf(key, growth.new_leaf, value);
        version.cache.set_range(range);
        Ok(())
    }

    fn check_capacity(&self, size: u64) -> Result<(), VirtualMapError> {
        if size >= self.limits.maximum {
            return Err(VirtualMapError::Full(size))
        }
        let remaining = self.limits.maximum - size;
        if remaining <= self.limits.warning_threshold && remaining % self.limits.warning_interval == 0 {
            warn!(
                "[{}] only {remaining} leaves left before reaching the maximum size of {}",
                self.label, self.limits.maximum
            );
        }
        Ok(())
    }

    /// Overwrites the value of an existing key with a copy of its current
    /// value changed by `modify`. Returns whether the key existed.
    pub fn modify(
        &self,
        version: &Version<K, V>,
        key: &K,
        modify: impl FnOnce(&mut V),
    ) -> Result<bool, VirtualMapError> {
        let Some((path, current)) = self.find_leaf(version.id, key)? else {
            return Ok(false)
        };
        let mut value = current.copy();
        modify(&mut value);
        version.cache.put_leaf(key.clone(), path, value);
        Ok(true)
    }

    pub fn remove(&self, version: &Version<K, V>, key: &K) -> Result<Option<V>, VirtualMapError> {
        let id = version.id;
        let Some((path, value)) = self.find_leaf(id, key)? else {
            return Ok(None)
        };

        let mut range = version.range();
        let last = range.last();
        version.cache.delete_leaf(key.clone());
        if path != last {
            let (last_key, last_value) = self.leaf_at_or_fail(id, last)?;
            version.cache.put_leaf(last_key, path, last_value.copy());
        }
        let shrink = range.shrink();
        version.cache.clear_path(shrink.vacated);
        if let Some((from, to)) = shrink.moved {
            let (moved_key, moved_value) = self.leaf_at_or_fail(id, from)?;
            version.cache.put_leaf(moved_key, to, moved_value.copy());
            version.cache.clear_path(from);
        }
        version.cache.set_range(range);
        Ok(Some(value))
    }

    /// Freezes `version` and chains a new mutable version on top of it.
    pub fn copy(&self, version: &Version<K, V>) -> Result<Arc<Version<K, V>>, VirtualMapError> {
        self.check_failure()?;
        if self.is_finished() {
            return Err(VirtualMapError::PipelineTerminated)
        }
        if version.immutable.swap(true, Ordering::SeqCst) {
            return Err(VirtualMapError::AlreadyCopied(version.id))
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let next = Arc::new(Version::new(id, version.range(), self.flush.selects(id)));
        self.versions.write().insert(id, next.clone());
        trace!("[{}] version {} frozen, version {id} created", self.label, version.id);
        self.requester.wake();

        if let Some(delay) = self.flush.throttle_delay(self.backlog()) {
            debug!("[{}] flush backlog too large, throttling copy for {delay:?}", self.label);
            std::thread::sleep(delay);
        }
        Ok(next)
    }

    pub fn reserve(&self, version: &Version<K, V>) {
        version.reservations.fetch_add(1, Ordering::SeqCst);
    }

    /// Drops one reservation of `version`, reclaiming it when nothing else
    /// needs it anymore.
    pub fn release(&self, version: &Version<K, V>) {
        if version.reservations.fetch_sub(1, Ordering::SeqCst) != 1 {
            return
        }
        version.released.store(true, Ordering::SeqCst);
        if !version.is_immutable() {
            // the lineage cannot grow anymore
            self.lineage_ended.store(true, Ordering::SeqCst);
            self.reclaim(version);
        } else if version.is_retired() {
            self.reclaim(version);
        } else if self.is_stopped() {
            self.collapse_released();
        }
        self.requester.wake();
    }

    /// Without a pipeline nothing retires frozen versions anymore. Folds each
    /// released one into its successor, or drops it when it has none, so that
    /// the versions still reachable keep reading the same content.
    fn collapse_released(&self) {
        let _hashing = self.hash_lock.lock();
        loop {
            let (older, newer) = {
                let versions = self.versions.read();
                let mut iter = versions.values().skip_while(|v| !v.is_released());
                (iter.next().cloned(), iter.next().cloned())
            };
            let Some(older) = older else {
                return
            };
            if let Some(newer) = newer {
                self.merge(&older, &newer);
            }
            self.reclaim(&older);
        }
    }

    fn is_stopped(&self) -> bool {
        self.is_finished() || self.failure.lock().is_some()
    }

    fn reclaim(&self, version: &Version<K, V>) {
        {
            let mut versions = self.versions.write();
            if version.destroyed.swap(true, Ordering::SeqCst) {
                return
            }
            versions.remove(&version.id);
        }
        version.cache.release_values();
        trace!("[{}] version {} destroyed", self.label, version.id);
        self.notify_progress();
    }

    pub fn enable_flush(&self, version: &Version<K, V>) {
        version.should_flush.store(true, Ordering::SeqCst);
        self.requester.wake();
    }

    /// Returns the root hash of `version`, hashing it and any older unhashed
    /// version first.
    pub fn root_hash(&self, version: &Version<K, V>) -> Result<Hash, VirtualMapError> {
        if let Some(hash) = version.root_hash.get() {
            return Ok(*hash)
        }
        if !version.is_immutable() {
            return Err(VirtualMapError::Mutable(version.id))
        }
        let _hashing = self.hash_lock.lock();
        let pending: Vec<_> = self
            .versions
            .read()
            .range(..=version.id)
            .map(|(_, v)| v.clone())
            .filter(|v| !v.is_hashed())
            .collect();
        for v in pending {
            self.hash_one(&v)?;
        }
        version
            .root_hash
            .get()
            .copied()
            .ok_or(VirtualMapError::HashInconsistency {
                version: version.id,
                path: ROOT_PATH,
            })
    }

    fn hash_one(&self, version: &Version<K, V>) -> Result<(), VirtualMapError> {
        let id = version.id;
        let parent_hashed = self
            .versions
            .read()
            .range(..id)
            .next_back()
            .map_or(true, |(_, parent)| parent.is_hashed());
        if !parent_hashed {
            return Err(VirtualMapError::HashInconsistency {
                version: id,
                path: ROOT_PATH,
            })
        }

        let mut dirty_leaves = BTreeMap::new();
        for (path, (key, value)) in version.cache.dirty_leaves() {
            let hash = self.digester.digest_leaf(&key.to_bytes()?, &value.to_bytes()?);
            dirty_leaves.insert(path, hash);
        }
        let dirty_paths = version.cache.dirty_paths();
        let job = HashJob {
            range: version.range(),
            prev_range: version.prev_range,
            dirty_leaves: &dirty_leaves,
            dirty_paths: &dirty_paths,
        };
        let outcome = hasher::hash_version(self.digester.as_ref(), &job, |path, is_leaf| {
            self.hash_at(id, path, is_leaf)
        })
        .map_err(|e| match e {
            HashLookupError::Missing(path) => VirtualMapError::HashInconsistency { version: id, path },
            HashLookupError::Source(e) => e,
        })?;

        trace!(
            "[{}] version {id} hashed, {} leaves and {} internal nodes rehashed",
            self.label,
            dirty_leaves.len(),
            outcome.internal.len()
        );
        version
            .cache
            .store_hashes(dirty_leaves.into_iter().chain(outcome.internal));
        version.root_hash.set(outcome.root).ok();
        Ok(())
    }

    /// Does all the work currently possible on the oldest versions: hashing,
    /// flushing or merging, and reclaiming.
    pub fn advance(&self) -> Result<(), VirtualMapError> {
        loop {
            let (oldest, next) = {
                let versions = self.versions.read();
                let mut iter = versions.values();
                (iter.next().cloned(), iter.next().cloned())
            };
            let Some(oldest) = oldest else {
                return Ok(())
            };
            if !oldest.is_immutable() {
                return Ok(())
            }
            self.root_hash(&oldest)?;

            if !oldest.is_retired() {
                if oldest.should_flush() {
                    self.flush_version(&oldest)?;
                } else if !oldest.is_released() {
                    return Ok(())
                } else {
                    match next {
                        Some(next) if next.is_immutable() => {
                            self.root_hash(&next)?;
                            self.merge(&oldest, &next);
                        }
                        _ if self.lineage_ended.load(Ordering::SeqCst) => {
                            debug!("[{}] discarding unflushed version {}", self.label, oldest.id);
                            self.reclaim(&oldest);
                            continue
                        }
                        _ => return Ok(()),
                    }
                }
            }

            if !oldest.is_released() {
                return Ok(())
            }
            self.reclaim(&oldest);
        }
    }

    fn flush_version(&self, version: &Version<K, V>) -> Result<(), VirtualMapError> {
        let started = Instant::now();
        let mut dirty_leaves = Vec::new();
        for (path, (key, value)) in version.cache.dirty_leaves() {
            let hash = version
                .cache
                .hash(path)
                .ok_or(VirtualMapError::HashInconsistency {
                    version: version.id,
                    path,
                })?;
            dirty_leaves.push(LeafRecord {
                path,
                key,
                value,
                hash,
            });
        }
        let batch = FlushBatch {
            range: version.range(),
            dirty_leaves,
            deleted_keys: version.cache.deleted_keys(),
            dirty_internal: version
                .cache
                .internal_hashes()
                .into_iter()
                .map(|(path, hash)| InternalRecord { path, hash })
                .collect(),
        };
        let leaves = batch.dirty_leaves.len();
        self.data_source.save_changes(batch)?;

        let latency = started.elapsed();
        self.counters.record_flush(leaves, latency);
        version.flushed.store(true, Ordering::SeqCst);
        debug!(
            "[{}] version {} flushed, {leaves} leaves in {latency:?}",
            self.label, version.id
        );
        self.notify_progress();
        Ok(())
    }

    fn merge(&self, older: &Version<K, V>, newer: &Version<K, V>) {
        {
            // readers walking both versions must see the entries in one of them
            let _versions = self.versions.write();
            newer.cache.absorb(&older.cache);
        }
        older.merged.store(true, Ordering::SeqCst);
        self.counters.record_merge();
        trace!("[{}] version {} merged into {}", self.label, older.id, newer.id);
    }

    /// Frozen versions the pipeline has not flushed or merged yet.
    pub fn backlog(&self) -> usize {
        self.versions
            .read()
            .values()
            .filter(|v| v.is_immutable() && !v.is_retired())
            .count()
    }

    pub fn statistics(&self) -> FlushStatistics {
        self.counters.snapshot(self.backlog())
    }

    pub fn is_drained(&self) -> bool {
        self.lineage_ended.load(Ordering::SeqCst) && self.versions.read().is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn check_failure(&self) -> Result<(), VirtualMapError> {
        match self.failure.lock().as_ref() {
            Some(failure) => Err(VirtualMapError::PipelineFailed(failure.clone())),
            None => Ok(()),
        }
    }

    /// Records a fatal pipeline error. Nothing the lineage does afterwards can
    /// be persisted.
    pub fn fail(&self, e: &VirtualMapError) {
        error!("[{}] flush pipeline failed: {e}", self.label);
        *self.failure.lock() = Some(e.to_string());
        self.notify_progress();
    }

    /// Called by the pipeline on its way out.
    pub fn finish(&self) {
        if let Err(_e) = self.data_source.close() {
            error!("[{}] failed to close the data source: {_e}", self.label);
        }
        self.finished.store(true, Ordering::SeqCst);
        info!("[{}] data source closed", self.label);
        self.collapse_released();
        self.notify_progress();
    }

    fn notify_progress(&self) {
        let _progress = self.progress.lock();
        self.progress_cv.notify_all();
    }

    pub fn wait_until_flushed(&self, version: &Version<K, V>) -> Result<(), VirtualMapError> {
        if !version.should_flush() {
            return Err(VirtualMapError::NotFlushable(version.id))
        }
        let mut progress = self.progress.lock();
        loop {
            if version.is_flushed() {
                return Ok(())
            }
            self.check_failure()?;
            if version.merged.load(Ordering::SeqCst) || version.is_destroyed() {
                return Err(VirtualMapError::NotFlushable(version.id))
            }
            if self.is_finished() {
                return Err(VirtualMapError::PipelineTerminated)
            }
            self.progress_cv.wait_for(&mut progress, PROGRESS_POLL);
        }
    }
}
