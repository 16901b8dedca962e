// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! Integer addressing of positions in the virtual binary tree.
//!
//! The root lives at [`ROOT_PATH`] and the children of `p` are `2p` and
//! `2p + 1`, so every rank `r` occupies `[2^r, 2^(r+1))`. A larger path is
//! therefore never shallower than a smaller one, which is what lets the hasher
//! walk dirty paths in descending order and always see children before their
//! parent.

/// Position of a node in the virtual tree.
pub type Path = u64;

/// Marker for "no path", used by an empty map's leaf range.
pub const INVALID_PATH: Path = 0;

pub const ROOT_PATH: Path = 1;

/// Path of the only leaf of a single-entry map.
pub const FIRST_LEAF_PATH: Path = 2;

#[inline(always)]
pub const fn left_child(path: Path) -> Path {
    path << 1
}

#[inline(always)]
pub const fn right_child(path: Path) -> Path {
    (path << 1) | 1
}

/// Parent of `path`. The root and the invalid path have no parent and map to
/// [`INVALID_PATH`].
#[inline(always)]
pub const fn parent(path: Path) -> Path {
    path >> 1
}

#[inline(always)]
pub const fn is_left(path: Path) -> bool {
    path & 1 == 0
}

pub const fn sibling(path: Path) -> Path {
    path ^ 1
}

/// Depth of `path`, the root being rank 0.
pub const fn rank(path: Path) -> u32 {
    Path::BITS - 1 - path.leading_zeros()
}

/// The leaf range `[first_leaf_path, last_leaf_path]` of a map version.
///
/// Every operation on the range keeps it contiguous: adding a leaf splits the
/// first leaf into two children, removing one collapses the last pair back
/// into its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafRange {
    first: Path,
    last: Path,
}

impl Default for LeafRange {
    fn default() -> Self {
        Self::empty()
    }
}

impl LeafRange {
    pub const fn empty() -> Self {
        Self {
            first: INVALID_PATH,
            last: INVALID_PATH,
        }
    }

    /// Builds a range from the bounds persisted by a data source. Both bounds
    /// must be invalid, or form a valid range.
    pub fn new(first: Path, last: Path) -> Option<Self> {
        let range = Self { first, last };
        range.is_valid().then_some(range)
    }

    /// Range of a map holding exactly `size` leaves.
    pub fn with_size(size: u64) -> Self {
        match size {
            0 => Self::empty(),
            1 => Self {
                first: FIRST_LEAF_PATH,
                last: FIRST_LEAF_PATH,
            },
            n => Self {
                first: n,
                last: 2 * n - 1,
            },
        }
    }

    fn is_valid(&self) -> bool {
        if self.first == INVALID_PATH || self.last == INVALID_PATH {
            return self.first == self.last
        }
        self.first <= self.last && *self == Self::with_size(self.last - self.first + 1)
    }

    pub const fn first(&self) -> Path {
        self.first
    }

    pub const fn last(&self) -> Path {
        self.last
    }

    pub const fn is_empty(&self) -> bool {
        self.first == INVALID_PATH
    }

    pub const fn size(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.last - self.first + 1
        }
    }

    pub const fn is_leaf(&self, path: Path) -> bool {
        !self.is_empty() && path >= self.first && path <= self.last
    }

    /// Whether `path` is an internal node of a tree with this range.
    pub const fn is_internal(&self, path: Path) -> bool {
        !self.is_empty() && path >= ROOT_PATH && path < self.first
    }

    /// Grows the range by one leaf and describes where leaves go.
    pub fn grow(&mut self) -> Growth {
        match self.size() {
            0 => {
                self.first = FIRST_LEAF_PATH;
                self.last = FIRST_LEAF_PATH;
                Growth {
                    moved: None,
                    new_leaf: FIRST_LEAF_PATH,
                }
            }
            1 => {
                self.last = FIRST_LEAF_PATH + 1;
                Growth {
                    moved: None,
                    new_leaf: self.last,
                }
            }
            _ => {
                let split = self.first;
                self.first += 1;
                self.last = right_child(split);
                Growth {
                    moved: Some((split, left_child(split))),
                    new_leaf: self.last,
                }
            }
        }
    }

    /// Shrinks the range by one leaf once the leaf at `last` has been vacated
    /// and describes which leaf has to move up.
    pub fn shrink(&mut self) -> Shrink {
        let vacated = self.last;
        if parent(vacated) == ROOT_PATH {
            if self.first == self.last {
                *self = Self::empty();
            } else {
                self.last = FIRST_LEAF_PATH;
            }
            return Shrink { vacated, moved: None }
        }
        let from = vacated - 1;
        let to = parent(vacated);
        self.first = to;
        self.last = vacated - 2;
        Shrink {
            vacated,
            moved: Some((from, to)),
        }
    }
}

/// Outcome of [`LeafRange::grow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Growth {
    /// `(from, to)` when an existing leaf is pushed one rank down.
    pub moved: Option<(Path, Path)>,
    pub new_leaf: Path,
}

/// Outcome of [`LeafRange::shrink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shrink {
    /// The former last leaf position, no longer part of the tree.
    pub vacated: Path,
    /// `(from, to)` when the sibling of the vacated leaf moves up to their
    /// parent. `from` is no longer part of the tree either.
    pub moved: Option<(Path, Path)>,
}
