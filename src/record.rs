// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

use std::fmt::{self, Debug};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::codec::{BinarySerde, Bincode, CodecError};
use crate::path::Path;

pub const HASH_LEN: usize = 32;

#[derive(PartialEq, Eq, Clone, Copy, Hash, Default, Serialize, Deserialize)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Hash {
    /// Stands in for the hash of a child that does not exist.
    pub const NULL: Self = Self([0; HASH_LEN]);
}

impl std::ops::Deref for Hash {
    type Target = [u8; HASH_LEN];
    fn deref(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Types that carry a stable class id and format version next to their
/// binary encoding.
///
/// The default encoding is varint bincode of the serde representation. A type
/// that changes its layout bumps `CLASS_VERSION` and overrides
/// [`SelfSerializable::deserialize_from`] to keep reading the older versions.
pub trait SelfSerializable: Serialize + DeserializeOwned {
    const CLASS_ID: u64;
    const CLASS_VERSION: u32 = 1;

    fn serialize_into(&self, sink: &mut Vec<u8>) -> Result<(), CodecError> {
        Bincode::serialize_into(sink, self)
    }

    fn deserialize_from(source: &[u8], version: u32) -> Result<Self, CodecError> {
        if version == 0 || version > Self::CLASS_VERSION {
            return Err(CodecError::UnsupportedVersion {
                class_id: Self::CLASS_ID,
                found: version,
                newest: Self::CLASS_VERSION,
            })
        }
        Ok(Bincode::deserialize(source)?)
    }

    fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf)?;
        Ok(buf)
    }
}

/// Key of a map leaf. Keys are immutable once stored, and equality and
/// hashing must depend on content only.
pub trait VirtualKey: SelfSerializable + Clone + Eq + std::hash::Hash + Debug + Send + Sync + 'static {}

/// Value of a map leaf.
///
/// A value is owned by exactly one version. When a newer version needs to
/// change a value it got from an older one, it works on the result of
/// [`VirtualValue::copy`] and the older instance stays untouched.
pub trait VirtualValue: SelfSerializable + Clone + Debug + Send + Sync + 'static {
    /// Produces an independent instance for the next mutable version.
    fn copy(&self) -> Self {
        self.clone()
    }

    /// Called once the version owning this instance has been reclaimed.
    fn release(&mut self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafRecord<K, V> {
    pub path: Path,
    pub key: K,
    pub value: V,
    pub hash: Hash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalRecord {
    pub path: Path,
    pub hash: Hash,
}
