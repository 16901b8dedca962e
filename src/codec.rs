// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

use std::fmt::Debug;

use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MIN_BYTES_LEN: usize = 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("bincode error")]
    BincodeError(#[from] bincode::Error),
    #[error("unexpected end of input")]
    UnexpectedEOFError,
    #[error("class {class_id:#x} has no format version {found} (newest is {newest})")]
    UnsupportedVersion {
        class_id: u64,
        found: u32,
        newest: u32,
    },
}

pub trait BinarySerde {
    type SerializeError: serde::ser::Error;
    type DeserializeError: serde::de::Error;

    fn new() -> Self;

    fn serialize<T: Serialize>(t: &T) -> Result<Vec<u8>, Self::SerializeError>
    where
        Self: Sized,
    {
        Self::new().serialize_impl(t)
    }

    fn deserialize<'de, T: Deserialize<'de>>(bytes: &'de [u8]) -> Result<T, Self::DeserializeError>
    where
        Self: Sized,
    {
        Self::new().deserialize_impl(bytes)
    }

    fn serialize_impl<T: Serialize>(&self, t: &T) -> Result<Vec<u8>, Self::SerializeError>;
    fn deserialize_impl<'de, T: Deserialize<'de>>(
        &self,
        bytes: &'de [u8],
    ) -> Result<T, Self::DeserializeError>;
}

/// Varint bincode, the encoding used for every key and value payload.
#[derive(Default)]
pub struct Bincode(pub bincode::DefaultOptions);

impl Debug for Bincode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "[bincode::DefaultOptions]")
    }
}

impl BinarySerde for Bincode {
    type SerializeError = bincode::Error;
    type DeserializeError = Self::SerializeError;

    fn new() -> Self {
        Self(bincode::DefaultOptions::new())
    }

    fn serialize_impl<T: Serialize>(&self, t: &T) -> Result<Vec<u8>, Self::SerializeError> {
        self.0.serialize(t)
    }

    fn deserialize_impl<'de, T: Deserialize<'de>>(
        &self,
        bytes: &'de [u8],
    ) -> Result<T, Self::DeserializeError> {
        self.0.deserialize(bytes)
    }
}

impl Bincode {
    /// Appends the encoding of `t` to `sink`.
    pub fn serialize_into<T: Serialize>(sink: &mut Vec<u8>, t: &T) -> Result<(), CodecError> {
        Ok(Self::new().0.serialize_into(sink, t)?)
    }
}

pub fn encode_len(len: usize) -> Result<Vec<u8>, CodecError> {
    Ok(bincode::DefaultOptions::new().serialize(&(len as u64))?)
}

/// Decodes a length prefix written by [`encode_len`], returning the length
/// and the number of bytes the prefix occupied.
pub fn decode_len(src: &[u8]) -> Result<(usize, usize), CodecError> {
    if src.len() < MIN_BYTES_LEN {
        return Err(CodecError::UnexpectedEOFError)
    }
    let mut cursor = src;
    let len: u64 = bincode::DefaultOptions::new().deserialize_from(&mut cursor)?;
    Ok((len as usize, src.len() - cursor.len()))
}

/// Appends `bytes` to `sink` behind a length prefix, so that concatenated
/// frames can never be confused with one another.
pub fn write_framed(sink: &mut Vec<u8>, bytes: &[u8]) -> Result<(), CodecError> {
    sink.extend(encode_len(bytes.len())?);
    sink.extend_from_slice(bytes);
    Ok(())
}

/// Splits the first frame off `src`, returning it and the rest of the input.
pub fn read_framed(src: &[u8]) -> Result<(&[u8], &[u8]), CodecError> {
    let (len, used) = decode_len(src)?;
    let rest = &src[used..];
    if len > rest.len() {
        return Err(CodecError::UnexpectedEOFError)
    }
    Ok(rest.split_at(len))
}
