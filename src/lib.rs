// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! # Virtual Map: a versioned, copy-on-write, Merkle-hashed key/value store.
//!
//! A [`VirtualMap`] is one version of a map whose leaves are laid out as the
//! leaves of a complete binary tree. Every version has a Merkle root hash
//! computed from the serialized keys and values and from the positions of the
//! leaves, so two maps holding the same entries in the same positions hash to
//! the same root.
//!
//! # Versions
//!
//! A lineage has exactly one mutable version. Calling [`VirtualMap::copy`]
//! freezes it and hands out the next mutable version, in constant time: a
//! version only records what it changed relative to its parent, and reads walk
//! down the chain of older versions until one of them knows the answer. What no
//! version in memory knows is read from the [`DataSource`], a pluggable durable
//! store holding the state of the newest persisted version.
//!
//! Frozen versions can be read from any number of threads. Each handle holds
//! a reservation on its version; [`VirtualMap::reserve`] adds one and
//! [`VirtualMap::release`] (or dropping the handle) gives it back. A version
//! whose reservations are all gone is reclaimed as soon as the pipeline no
//! longer needs it.
//!
//! # Flush pipeline
//!
//! Each lineage runs a background thread that takes frozen versions oldest
//! first, hashes them and persists them to the data source in a single atomic
//! [`DataSource::save_changes`] call. Versions skipped by the configured flush
//! interval are merged into the version after them instead. A version is only
//! persisted after every older version has been released, which keeps the data
//! source from running ahead of any live reader. When the pipeline falls
//! behind, [`VirtualMap::copy`] is throttled.
//!
//! # Tree layout
//!
//! Positions are numbered from the root (1), and the children of `p` are `2p`
//! and `2p + 1`. The leaves always occupy a contiguous range of positions, see
//! [`LeafRange`] for how it grows and shrinks.

pub mod codec;
pub mod datasource;
pub mod hasher;
pub(crate) mod logger;
pub mod map;
pub mod path;
pub mod pipeline;
pub mod record;

pub(crate) mod cache;
pub(crate) mod chain;

pub use datasource::{DataSource, DataSourceError, FlushBatch, MemDataSource};
pub use hasher::{Digester, Keccak256Digester};
pub use map::{VirtualMap, VirtualMapConfig, VirtualMapError};
pub use path::{LeafRange, Path};
pub use pipeline::{FlushConfig, FlushStatistics};
pub use record::{Hash, InternalRecord, LeafRecord, SelfSerializable, VirtualKey, VirtualValue};
