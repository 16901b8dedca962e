// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! Incremental Merkle hashing of one frozen version.
//!
//! A version only knows which positions it touched. Leaves among them are
//! rehashed from their content, every other touched position contributes the
//! nearest internal node above it, and the walk goes up one parent at a time in
//! descending path order. Positions outside the touched set keep the hash the
//! parent version had for them.

use std::collections::{BTreeMap, BTreeSet};

use sha3::{Digest, Keccak256};

use crate::logger::trace;
use crate::path::{self, LeafRange, Path, ROOT_PATH};
use crate::record::Hash;

const LEAF_DOMAIN: u8 = 0x00;
const INTERNAL_DOMAIN: u8 = 0x01;

/// The digest function of the tree.
pub trait Digester: Send + Sync {
    /// Hash of a leaf whose key and value serialize to `key` and `value`.
    fn digest_leaf(&self, key: &[u8], value: &[u8]) -> Hash;

    fn digest_internal(&self, left: &Hash, right: &Hash) -> Hash;

    /// Root hash of a map without leaves.
    fn empty_root(&self) -> Hash {
        self.digest_internal(&Hash::NULL, &Hash::NULL)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Keccak256Digester;

impl Digester for Keccak256Digester {
    fn digest_leaf(&self, key: &[u8], value: &[u8]) -> Hash {
        let mut hasher = Keccak256::new();
        hasher.update([LEAF_DOMAIN]);
        hasher.update((key.len() as u64).to_le_bytes());
        hasher.update(key);
        hasher.update((value.len() as u64).to_le_bytes());
        hasher.update(value);
        Hash(hasher.finalize().into())
    }

    fn digest_internal(&self, left: &Hash, right: &Hash) -> Hash {
        let mut hasher = Keccak256::new();
        hasher.update([INTERNAL_DOMAIN]);
        hasher.update(left.as_slice());
        hasher.update(right.as_slice());
        Hash(hasher.finalize().into())
    }
}

/// What the hasher needs to know about a frozen version.
pub(crate) struct HashJob<'a> {
    pub range: LeafRange,
    /// Leaf range of the parent version, used to decide which unchanged
    /// internal hashes can end a walk early.
    pub prev_range: LeafRange,
    /// Hashes of the leaves written by this version, keyed by path.
    pub dirty_leaves: &'a BTreeMap<Path, Hash>,
    /// Every position this version wrote or vacated.
    pub dirty_paths: &'a BTreeSet<Path>,
}

pub(crate) struct HashOutcome {
    pub root: Hash,
    /// Internal hashes that differ from the parent version.
    pub internal: Vec<(Path, Hash)>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum HashLookupError<E> {
    /// A clean position had no hash anywhere.
    Missing(Path),
    Source(E),
}

/// Hashes a frozen version.
///
/// `clean_hash(path, is_leaf)` returns the hash the parent version holds for
/// `path`; the job never asks for positions it is about to rewrite, so that
/// lookup is also the "previous" hash used to stop a walk early.
pub(crate) fn hash_version<D, F, E>(
    digester: &D,
    job: &HashJob<'_>,
    mut clean_hash: F,
) -> Result<HashOutcome, HashLookupError<E>>
where
    D: Digester + ?Sized,
    F: FnMut(Path, bool) -> Result<Option<Hash>, E>,
{
    let range = job.range;
    if range.is_empty() {
        return Ok(HashOutcome {
            root: digester.empty_root(),
            internal: Vec::new(),
        })
    }

    let mut computed: BTreeMap<Path, Hash> = BTreeMap::new();
    let mut pending: BTreeSet<Path> = BTreeSet::new();
    for (&leaf, &hash) in job.dirty_leaves.range(range.first()..=range.last()) {
        computed.insert(leaf, hash);
        pending.insert(path::parent(leaf));
    }
    for &dirty in job.dirty_paths {
        if range.is_internal(dirty) {
            pending.insert(dirty);
        } else if dirty > range.last() {
            // a vacated position, rehash the nearest internal ancestor
            let mut ancestor = path::parent(dirty);
            while ancestor >= range.first() {
                ancestor = path::parent(ancestor);
            }
            pending.insert(ancestor);
        }
    }
    pending.remove(&path::INVALID_PATH);

    let mut internal = Vec::new();
    while let Some(node) = pending.pop_last() {
        let mut child_hash = |child: Path| -> Result<Hash, HashLookupError<E>> {
            if let Some(hash) = computed.get(&child) {
                return Ok(*hash)
            }
            if child > range.last() {
                return Ok(Hash::NULL)
            }
            clean_hash(child, range.is_leaf(child))
                .map_err(HashLookupError::Source)?
                .ok_or(HashLookupError::Missing(child))
        };
        let left = child_hash(path::left_child(node))?;
        let right = child_hash(path::right_child(node))?;
        let hash = digester.digest_internal(&left, &right);

        if node != ROOT_PATH && job.prev_range.is_internal(node) {
            let previous = clean_hash(node, false).map_err(HashLookupError::Source)?;
            if previous == Some(hash) {
                trace!("hash of {node} unchanged, stopping walk");
                continue
            }
        }
        computed.insert(node, hash);
        internal.push((node, hash));
        if node != ROOT_PATH {
            pending.insert(path::parent(node));
        }
    }

    let root = match computed.get(&ROOT_PATH) {
        Some(root) => *root,
        None => clean_hash(ROOT_PATH, false)
            .map_err(HashLookupError::Source)?
            .ok_or(HashLookupError::Missing(ROOT_PATH))?,
    };
    Ok(HashOutcome { root, internal })
}
