// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use thiserror::Error;
use typed_builder::TypedBuilder;

use crate::chain::{Version, VersionChain};
use crate::codec::CodecError;
use crate::datasource::{DataSource, DataSourceError};
use crate::hasher::{Digester, Keccak256Digester};
use crate::logger::{debug, error};
use crate::path::Path;
use crate::pipeline::{self, FlushConfig, FlushPipeline, FlushStatistics, PipelineRequester};
use crate::record::{Hash, VirtualKey, VirtualValue};

#[derive(Debug, Error)]
pub enum VirtualMapError {
    #[error("version {0} is immutable")]
    Immutable(u64),
    #[error("version {0} was already copied")]
    AlreadyCopied(u64),
    #[error("handle on version {0} was already released")]
    Released(u64),
    #[error("version {0} is still mutable")]
    Mutable(u64),
    #[error("version {0} will never be flushed")]
    NotFlushable(u64),
    #[error("key not found")]
    KeyNotFound,
    #[error("map is full with {0} leaves")]
    Full(u64),
    #[error("data source error: {0}")]
    DataSource(#[from] DataSourceError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("no hash for path {path} while hashing version {version}")]
    HashInconsistency { version: u64, path: Path },
    #[error("inconsistent map state: {0}")]
    Inconsistent(String),
    #[error("flush pipeline failed: {0}")]
    PipelineFailed(String),
    #[error("flush pipeline was terminated")]
    PipelineTerminated,
    #[error("failed to start the flush pipeline: {0}")]
    Spawn(std::io::Error),
}

impl VirtualMapError {
    /// Misuse of the API by the caller, as opposed to a failure of the map.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Self::Immutable(_) | Self::AlreadyCopied(_) | Self::Released(_) | Self::Mutable(_) | Self::NotFlushable(_)
        )
    }
}

#[derive(TypedBuilder)]
pub struct VirtualMapConfig {
    /// Prefixes log lines and names the pipeline thread.
    #[builder(default = String::from("virtual-map"), setter(into))]
    pub(crate) label: String,
    #[builder(default = i32::MAX as u64)]
    pub(crate) maximum_size: u64,
    /// Remaining capacity below which growing the map logs warnings.
    #[builder(default = 5_000_000)]
    pub(crate) size_warning_threshold: u64,
    #[builder(default = 100_000)]
    pub(crate) size_warning_interval: u64,
    #[builder(default = Arc::new(Keccak256Digester))]
    pub(crate) digester: Arc<dyn Digester>,
    #[builder(default = FlushConfig::builder().build())]
    pub(crate) flush: FlushConfig,
}

struct PipelineHandle {
    requester: PipelineRequester,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PipelineHandle {
    fn terminate(&self) {
        self.requester.terminate();
        self.join();
    }

    fn join(&self) {
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!("flush pipeline thread panicked");
            }
        }
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        // every version is released by now, the pipeline stops on its own
        self.join();
    }
}

/// A handle on one version of a copy-on-write key/value map whose leaves form
/// a Merkle tree.
///
/// The newest version of a lineage is mutable. [`VirtualMap::copy`] freezes it
/// and returns the next mutable version; frozen versions stay readable from
/// any thread until every handle on them is released. A background thread
/// hashes frozen versions and persists them to the [`DataSource`] in order.
///
/// Dropping a handle releases it.
pub struct VirtualMap<K: VirtualKey, V: VirtualValue> {
    version: Arc<Version<K, V>>,
    chain: Arc<VersionChain<K, V>>,
    pipeline: Arc<PipelineHandle>,
    released: AtomicBool,
}

impl<K: VirtualKey, V: VirtualValue> VirtualMap<K, V> {
    /// Opens a lineage on the state currently held by `data_source` and
    /// starts its flush pipeline.
    pub fn new(data_source: Arc<dyn DataSource<K, V>>, config: VirtualMapConfig) -> Result<Self, VirtualMapError> {
        let (requester, inbound) = pipeline::channel();
        let (chain, version) = VersionChain::new(&config, data_source, requester.clone())?;
        let chain = Arc::new(chain);

        let worker = FlushPipeline::new(chain.clone(), inbound);
        let thread = std::thread::Builder::new()
            .name(format!("{}-flush", config.label))
            .spawn(move || worker.run())
            .map_err(VirtualMapError::Spawn)?;

        Ok(Self {
            version,
            chain,
            pipeline: Arc::new(PipelineHandle {
                requester,
                thread: Mutex::new(Some(thread)),
            }),
            released: AtomicBool::new(false),
        })
    }

    fn check_live(&self) -> Result<(), VirtualMapError> {
        if self.is_released() {
            return Err(VirtualMapError::Released(self.version.id()))
        }
        Ok(())
    }

    fn check_mutable(&self) -> Result<(), VirtualMapError> {
        self.check_live()?;
        if self.version.is_immutable() {
            return Err(VirtualMapError::Immutable(self.version.id()))
        }
        Ok(())
    }

    pub fn get(&self, key: &K) -> Result<Option<V>, VirtualMapError> {
        self.check_live()?;
        Ok(self
            .chain
            .find_leaf(self.version.id(), key)?
            .map(|(_, value)| value))
    }

    pub fn contains_key(&self, key: &K) -> Result<bool, VirtualMapError> {
        self.check_live()?;
        Ok(self.chain.find_leaf(self.version.id(), key)?.is_some())
    }

    /// Inserts `key` or overwrites its value.
    pub fn put(&mut self, key: K, value: V) -> Result<(), VirtualMapError> {
        self.check_mutable()?;
        self.chain.put(&self.version, key, value)
    }

    /// Overwrites the value of an existing key, returning the previous value.
    pub fn replace(&mut self, key: K, value: V) -> Result<V, VirtualMapError> {
        self.check_mutable()?;
        let previous = self
            .chain
            .find_leaf(self.version.id(), &key)?
            .ok_or(VirtualMapError::KeyNotFound)?
            .1;
        self.chain.put(&self.version, key, value)?;
        Ok(previous)
    }

    /// Applies `modify` to this version's own copy of the value under `key`.
    /// Returns `false` when the key is absent.
    pub fn get_for_modify(&mut self, key: &K, modify: impl FnOnce(&mut V)) -> Result<bool, VirtualMapError> {
        self.check_mutable()?;
        self.chain.modify(&self.version, key, modify)
    }

    /// Removes `key`, returning its value if it was present.
    pub fn remove(&mut self, key: &K) -> Result<Option<V>, VirtualMapError> {
        self.check_mutable()?;
        self.chain.remove(&self.version, key)
    }

    /// Freezes this version and returns the next mutable one.
    ///
    /// May block for a while when the pipeline has fallen behind.
    pub fn copy(&mut self) -> Result<Self, VirtualMapError> {
        self.check_live()?;
        let version = self.chain.copy(&self.version)?;
        Ok(Self {
            version,
            chain: self.chain.clone(),
            pipeline: self.pipeline.clone(),
            released: AtomicBool::new(false),
        })
    }

    /// Returns another handle on this version, keeping it alive until both
    /// are released.
    pub fn reserve(&self) -> Result<Self, VirtualMapError> {
        self.check_live()?;
        self.chain.reserve(&self.version);
        Ok(Self {
            version: self.version.clone(),
            chain: self.chain.clone(),
            pipeline: self.pipeline.clone(),
            released: AtomicBool::new(false),
        })
    }

    pub fn release(&self) -> Result<(), VirtualMapError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Err(VirtualMapError::Released(self.version.id()))
        }
        self.chain.release(&self.version);
        Ok(())
    }

    /// Merkle root of this version. Only frozen versions have one.
    pub fn root_hash(&self) -> Result<Hash, VirtualMapError> {
        self.check_live()?;
        self.chain.root_hash(&self.version)
    }

    /// Blocks until the pipeline has persisted this version.
    pub fn wait_until_flushed(&self) -> Result<(), VirtualMapError> {
        self.check_live()?;
        self.chain.wait_until_flushed(&self.version)
    }

    /// Selects this version for flushing even if the flush interval skips it.
    pub fn enable_flush(&self) -> Result<(), VirtualMapError> {
        self.check_live()?;
        if self.version.is_flushed() {
            return Ok(())
        }
        self.chain.enable_flush(&self.version);
        Ok(())
    }

    /// Stops the flush pipeline once its current job is done and closes the
    /// data source. Later flushes never happen.
    pub fn terminate(&self) {
        debug!("[{}] terminating", self.chain.label());
        self.pipeline.terminate();
    }

    pub fn size(&self) -> u64 {
        self.version.range().size()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_mutable(&self) -> bool {
        !self.version.is_immutable()
    }

    pub fn is_immutable(&self) -> bool {
        self.version.is_immutable()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.version.is_destroyed()
    }

    pub fn is_flushed(&self) -> bool {
        self.version.is_flushed()
    }

    pub fn version(&self) -> u64 {
        self.version.id()
    }

    pub fn label(&self) -> &str {
        self.chain.label()
    }

    pub fn statistics(&self) -> FlushStatistics {
        self.chain.statistics()
    }
}

impl<K: VirtualKey, V: VirtualValue> fmt::Debug for VirtualMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualMap")
            .field("label", &self.label())
            .field("version", &self.version())
            .field("size", &self.size())
            .field("mutable", &self.is_mutable())
            .finish()
    }
}

impl<K: VirtualKey, V: VirtualValue> Drop for VirtualMap<K, V> {
    fn drop(&mut self) {
        if !self.is_released() {
            self.release().ok();
        }
    }
}
